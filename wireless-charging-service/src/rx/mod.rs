//! Receive path state machine
//!
//! The machine tracks three slots. `target` is requested by events and handlers,
//! `next` is the state being entered and `current` the active one. A transition runs the
//! exit of `current`, then the enter of `next` until it completes, and only then makes
//! `next` current.
use embassy_futures::select::select;
use embassy_time::{Duration, Timer};
use embedded_services::power::wireless::{Error, FastChargeController, NormalCharger, RxController};
use embedded_services::{debug, error, info, warn};

use crate::Service;

pub mod fast;
pub mod normal;
pub mod special;

/// Receive path states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxState {
    /// Negotiation
    #[default]
    Default,
    /// Baseline power profile
    Bpp,
    /// Extended power profile
    Epp,
    /// Extended power profile plus
    EppPlus,
    /// Fast charge
    Fast,
    /// Full fast charge
    Ffc,
    /// Charge complete
    Done,
    /// Quiet mode
    Quiet,
    /// Charging stopped for temperature
    Stop,
    /// Forced output
    Debug,
    /// Factory test mode
    Ftm,
    /// Unrecoverable until disconnect
    Error,
}

/// Result of an enter handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Enter {
    /// The state is entered, run its handler after the delay
    Done(Duration),
    /// Run the enter handler again after the delay
    Pending(Duration),
}

const IMMEDIATE: Duration = Duration::from_ticks(0);

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    /// Request a state
    ///
    /// If the exit of the current state already ran, the state being entered follows the
    /// new target so the slots stay consistent.
    pub(crate) fn set_target(&self, target: RxState) {
        let slots = self.status.rx.update(|s| {
            if s.target == RxState::Error && target != RxState::Error {
                return;
            }
            if s.current != s.next {
                s.next = target;
            }
            s.target = target;
        });
        if slots.target == target {
            debug!("RX target {:?}", target);
        } else {
            warn!("Ignoring RX target {:?} in error state", target);
        }
        self.rx_wake.signal(());
    }

    async fn rx_enter(&self, state: RxState) -> Result<Enter, Error> {
        match state {
            RxState::Default => self.enter_default().await,
            RxState::Bpp | RxState::Epp | RxState::EppPlus => self.enter_base(state).await,
            RxState::Fast => self.enter_fast().await,
            RxState::Ffc => self.enter_ffc().await,
            RxState::Done => self.enter_done().await,
            RxState::Quiet => self.enter_quiet().await,
            RxState::Stop => self.enter_stop().await,
            RxState::Debug => self.enter_debug().await,
            RxState::Ftm => self.enter_ftm().await,
            RxState::Error => self.enter_error().await,
        }
    }

    async fn rx_handle(&self, state: RxState) -> Result<Duration, Error> {
        match state {
            RxState::Default => Ok(self.config.rx_poll_interval),
            RxState::Bpp | RxState::Epp | RxState::EppPlus => self.handle_base(state).await,
            RxState::Fast => self.handle_fast().await,
            RxState::Ffc => self.handle_ffc().await,
            RxState::Done => self.handle_done().await,
            RxState::Quiet => self.handle_quiet().await,
            RxState::Stop => self.handle_stop().await,
            RxState::Debug => self.handle_debug().await,
            RxState::Ftm => self.handle_ftm().await,
            RxState::Error => Ok(self.config.rx_poll_interval),
        }
    }

    async fn rx_exit(&self, state: RxState) {
        match state {
            RxState::Fast => self.exit_fast().await,
            RxState::Ffc => self.exit_ffc().await,
            RxState::Done => self.exit_done().await,
            RxState::Quiet => self.exit_quiet().await,
            RxState::Stop => self.exit_stop().await,
            RxState::Debug => self.exit_debug().await,
            RxState::Ftm => self.exit_ftm().await,
            RxState::Default | RxState::Bpp | RxState::Epp | RxState::EppPlus | RxState::Error => (),
        }
    }

    /// Run one step of the state machine and return the delay until the next one
    pub(crate) async fn rx_step(&self) -> Duration {
        let slots = self.status.rx.get();

        let result = if slots.current != slots.target {
            if slots.current == slots.next {
                if slots.entered {
                    debug!("RX exit {:?}", slots.current);
                    self.rx_exit(slots.current).await;
                }
                self.status.rx.update(|s| {
                    s.next = s.target;
                    s.entered = false;
                });
                Ok(IMMEDIATE)
            } else {
                match self.rx_enter(slots.next).await {
                    Ok(Enter::Done(delay)) => {
                        let entered = self.status.rx.update(|s| {
                            // The target may have moved while entering
                            if s.next == slots.next {
                                s.current = s.next;
                                s.entered = true;
                            }
                        });
                        if entered.current == slots.next {
                            info!("RX state {:?}", slots.next);
                        }
                        Ok(delay)
                    }
                    Ok(Enter::Pending(delay)) => Ok(delay),
                    Err(e) => Err(e),
                }
            }
        } else if !slots.entered {
            match self.rx_enter(slots.current).await {
                Ok(Enter::Done(delay)) => {
                    self.status.rx.update(|s| {
                        if s.current == slots.current {
                            s.entered = true;
                        }
                    });
                    info!("RX state {:?}", slots.current);
                    Ok(delay)
                }
                Ok(Enter::Pending(delay)) => Ok(delay),
                Err(e) => Err(e),
            }
        } else {
            self.rx_handle(slots.current).await
        };

        match result {
            Ok(delay) => {
                self.status.rx.update(|s| s.errors = 0);
                delay
            }
            Err(e) => {
                if !self.status.online() {
                    return self.config.rx_poll_interval;
                }
                let slots = self.status.rx.update(|s| s.errors = s.errors.saturating_add(1));
                warn!("RX {:?} failed: {:?}", slots.current, e);
                if slots.errors >= self.config.rx_err_max && slots.target != RxState::Error {
                    error!("RX failing repeatedly, giving up");
                    self.set_target(RxState::Error);
                }
                self.config.rx_poll_interval
            }
        }
    }

    /// Receive path state machine loop
    pub async fn run_rx(&self) {
        loop {
            if !self.status.online() {
                self.rx_wake.wait().await;
                continue;
            }

            let delay = self.rx_step().await;
            if delay > IMMEDIATE {
                select(Timer::after(delay), self.rx_wake.wait()).await;
            }
        }
    }
}
