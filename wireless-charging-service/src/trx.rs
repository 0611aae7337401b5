//! Transmit path, the device charging an accessory
use embassy_futures::select::select;
use embassy_time::{Instant, Timer};
use embedded_services::power::wireless::{Error, FastChargeController, NormalCharger, RxController, TrxError, TrxStatus};
use embedded_services::{debug, error, info, warn};

use crate::topic::{DiagEvent, WlsItem};
use crate::voter::{Vote, Voter};
use crate::Service;

/// Transmit path states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrxState {
    /// Enabled, status not read yet
    #[default]
    Default,
    /// Ready to ping
    Ready,
    /// Pinging for a receiver
    WaitPing,
    /// Transferring power
    Transfer,
    /// Powered down after a fault
    Off,
}

/// Transmit session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrxSession {
    /// Current state
    pub state: TrxState,
    /// Transmitting was requested
    pub enabled: bool,
    /// Restarts after faults since enabled
    pub retries: u8,
    /// Start of the current power transfer
    pub transfer_since: Option<Instant>,
    /// Restart after a retryable fault at this instant
    pub retry_at: Option<Instant>,
    /// Output voltage sampled during transfer
    pub vout_mv: u32,
    /// Output current sampled during transfer
    pub iout_ma: u32,
}

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    /// Power the transmitter and start or stop pinging
    async fn trx_power(&self, on: bool) -> Result<(), Error> {
        let mut rx = self.rx_ic.lock().await;
        let r = if on {
            match rx.set_trx_enable(true).await {
                Ok(()) => rx.set_trx_start(true).await,
                Err(e) => Err(e),
            }
        } else {
            match rx.set_trx_start(false).await {
                Ok(()) => rx.set_trx_enable(false).await,
                Err(e) => Err(e),
            }
        };
        drop(rx);
        self.bus(r)
    }

    /// Enable or disable transmitting
    ///
    /// Transmitting is refused while receiving or while a wired charger is attached.
    pub async fn set_trx_enable(&self, enable: bool) -> Result<(), Error> {
        let _lifecycle = self.lifecycle.lock().await;
        let session = self.status.trx.get();
        if enable == session.enabled {
            return Ok(());
        }

        if enable {
            let conn = self.status.conn.get();
            if conn.online || conn.present || conn.usb_present {
                warn!("Transmit refused, receive path busy");
                return Err(Error::InvalidState);
            }
            info!("Transmit path on");
            self.vote(Vote::InsertDisable, Voter::Trx, true, 1, false).await;
            if let Err(e) = self.trx_power(true).await {
                self.vote(Vote::InsertDisable, Voter::Trx, false, 0, false).await;
                return Err(e);
            }
            self.status.trx.set(TrxSession {
                enabled: true,
                ..TrxSession::default()
            });
            self.wireless.publish(WlsItem::TrxOnline(true));
        } else {
            self.trx_stop().await;
        }

        self.trx_kick.signal(());
        Ok(())
    }

    /// Power down and forget the session
    pub(crate) async fn trx_stop(&self) {
        let session = self.status.trx.get();
        if !session.enabled {
            return;
        }
        info!("Transmit path off");
        self.trx_usage(session, Instant::now());
        if self.trx_power(false).await.is_err() {
            error!("Failed to stop transmit path");
        }
        self.status.trx.set(TrxSession::default());
        self.vote(Vote::InsertDisable, Voter::Trx, false, 0, false).await;
        self.wireless.publish(WlsItem::TrxOnline(false));
        self.wireless.publish(WlsItem::TrxStatus(TrxStatus::Off));
    }

    /// Report a long transfer
    fn trx_usage(&self, session: TrxSession, now: Instant) {
        if let Some(since) = session.transfer_since {
            let duration = now - since;
            if duration >= self.config.trx_usage_threshold {
                self.diag.publish(DiagEvent::TrxUsage {
                    duration_s: duration.as_secs(),
                });
            }
        }
    }

    /// One poll of the transmit path
    pub(crate) async fn trx_cycle(&self) -> Result<(), Error> {
        let mut session = self.status.trx.get();
        if !session.enabled {
            return Ok(());
        }
        let now = Instant::now();

        if session.state == TrxState::Off {
            if session.retry_at.is_some_and(|at| now >= at) {
                info!("Restarting transmit path, attempt {}", session.retries);
                self.trx_power(true).await?;
                session.state = TrxState::Default;
                session.retry_at = None;
                self.status.trx.set(session);
            }
            return Ok(());
        }

        let mut rx = self.rx_ic.lock().await;
        let err = rx.get_trx_err().await;
        let status = rx.get_trx_status().await;
        drop(rx);
        let err: TrxError = self.bus(err)?;
        let status = self.bus(status)?;

        if err.wired_attached() {
            warn!("Wired input attached, stopping transmit path");
            self.trx_stop().await;
            return Ok(());
        }

        if err.is_fault() {
            error!("Transmit fault {:#x}", err.0);
            self.trx_usage(session, now);
            self.diag.publish(DiagEvent::TrxFault(err.0));
            self.trx_power(false).await?;
            self.wireless.publish(WlsItem::TrxStatus(TrxStatus::Off));
            session.state = TrxState::Off;
            session.transfer_since = None;
            if err.is_retryable() && session.retries < self.config.trx_retry_max {
                session.retries += 1;
                session.retry_at = Some(now + self.config.trx_retry_delay);
                self.status.trx.set(session);
            } else {
                self.status.trx.set(session);
                warn!("Transmit fault not recoverable");
                self.trx_stop().await;
            }
            return Ok(());
        }

        let state = match status {
            TrxStatus::Off => TrxState::Default,
            TrxStatus::Ready => TrxState::Ready,
            TrxStatus::DigitalPing => TrxState::WaitPing,
            TrxStatus::Transfer => TrxState::Transfer,
        };
        if state == TrxState::Transfer {
            let mut rx = self.rx_ic.lock().await;
            let vout = rx.get_trx_vol().await;
            let iout = rx.get_trx_curr().await;
            drop(rx);
            session.vout_mv = self.bus(vout)?;
            session.iout_ma = self.bus(iout)?;
        }
        if state != session.state {
            debug!("Transmit state {:?}", state);
            if state == TrxState::Transfer {
                session.transfer_since = Some(now);
            } else if session.state == TrxState::Transfer {
                self.trx_usage(session, now);
                session.transfer_since = None;
                session.vout_mv = 0;
                session.iout_ma = 0;
            }
            session.state = state;
            self.wireless.publish(WlsItem::TrxStatus(status));
        }
        self.status.trx.set(session);
        Ok(())
    }

    /// Transmit path loop
    pub async fn run_trx(&self) {
        loop {
            if !self.status.trx.get().enabled {
                self.trx_kick.wait().await;
                continue;
            }
            if let Err(e) = self.trx_cycle().await {
                warn!("Transmit poll failed: {:?}", e);
            }
            select(Timer::after(self.config.trx_poll_interval), self.trx_kick.wait()).await;
        }
    }
}

#[cfg(test)]
mod test {
    use embassy_futures::block_on;
    use embassy_time::Duration;

    use super::*;
    use crate::config::Config;
    use crate::test_util::*;
    use crate::topic::WlsItemId;

    #[test]
    fn test_refused_while_receiving() {
        let hw = Hw::new();
        let service = service(&hw);
        connect(&service, &hw);
        assert_eq!(block_on(service.set_trx_enable(true)), Err(Error::InvalidState));
        assert!(!hw.trx_enabled.get());
    }

    #[test]
    fn test_transfer_tracking() {
        let hw = Hw::new();
        let service = service(&hw);
        let mut sub = service.subscribe_wireless().unwrap();
        block_on(async {
            service.set_trx_enable(true).await.unwrap();
            assert!(hw.trx_enabled.get());
            assert!(service.is_set(Vote::InsertDisable));

            hw.trx_status.set(TrxStatus::Transfer);
            hw.trx_vol_mv.set(5200);
            hw.trx_curr_ma.set(650);
            service.trx_cycle().await.unwrap();
            let session = service.status.trx.get();
            assert_eq!(session.state, TrxState::Transfer);
            assert!(session.transfer_since.is_some());
            assert_eq!(service.item(WlsItemId::TrxVout), WlsItem::TrxVout(5200));
            assert_eq!(service.item(WlsItemId::TrxIout), WlsItem::TrxIout(650));

            service.set_trx_enable(false).await.unwrap();
        });
        assert!(!hw.trx_enabled.get());
        assert!(!service.is_set(Vote::InsertDisable));
        assert_eq!(sub.try_next_message_pure(), Some(WlsItem::TrxOnline(true)));
        assert_eq!(sub.try_next_message_pure(), Some(WlsItem::TrxStatus(TrxStatus::Transfer)));
    }

    #[test]
    fn test_long_transfer_reports_usage() {
        let hw = Hw::new();
        let service = service_with(
            &hw,
            Config {
                trx_usage_threshold: Duration::from_millis(30),
                ..test_config()
            },
        );
        let mut diag = service.subscribe_diag().unwrap();
        block_on(async {
            service.set_trx_enable(true).await.unwrap();
            hw.trx_status.set(TrxStatus::Transfer);
            service.trx_cycle().await.unwrap();

            // A short transfer is not reported
            hw.trx_status.set(TrxStatus::DigitalPing);
            service.trx_cycle().await.unwrap();
            assert_eq!(diag.try_next_message_pure(), None);

            hw.trx_status.set(TrxStatus::Transfer);
            service.trx_cycle().await.unwrap();
            Timer::after_millis(40).await;
            hw.trx_status.set(TrxStatus::Ready);
            service.trx_cycle().await.unwrap();
        });
        assert!(matches!(diag.try_next_message_pure(), Some(DiagEvent::TrxUsage { .. })));
        let session = service.status.trx.get();
        assert_eq!(session.state, TrxState::Ready);
        assert_eq!(session.iout_ma, 0);
    }

    #[test]
    fn test_retryable_fault_restarts() {
        let hw = Hw::new();
        let service = service(&hw);
        let mut diag = service.subscribe_diag().unwrap();
        block_on(async {
            service.set_trx_enable(true).await.unwrap();
            hw.trx_err.set(TrxError::CEP_TIMEOUT);
            service.trx_cycle().await.unwrap();
            assert!(!hw.trx_enabled.get());
            let session = service.status.trx.get();
            assert_eq!(session.state, TrxState::Off);
            assert_eq!(session.retries, 1);

            hw.trx_err.set(TrxError::NONE);
            Timer::after(service.config.trx_retry_delay).await;
            service.trx_cycle().await.unwrap();
        });
        assert!(hw.trx_enabled.get());
        assert_eq!(service.status.trx.get().state, TrxState::Default);
        assert_eq!(
            diag.try_next_message_pure(),
            Some(DiagEvent::TrxFault(TrxError::CEP_TIMEOUT.0))
        );
    }

    #[test]
    fn test_hard_fault_disables() {
        let hw = Hw::new();
        let service = service(&hw);
        block_on(async {
            service.set_trx_enable(true).await.unwrap();
            hw.trx_err.set(TrxError::OTP);
            service.trx_cycle().await.unwrap();
        });
        assert!(!service.status.trx.get().enabled);
        assert!(!hw.trx_enabled.get());
        assert!(!service.is_set(Vote::InsertDisable));
    }

    #[test]
    fn test_wired_attach_stops() {
        let hw = Hw::new();
        let service = service(&hw);
        block_on(async {
            service.set_trx_enable(true).await.unwrap();
            hw.trx_err.set(TrxError::RXAC);
            service.trx_cycle().await.unwrap();
        });
        assert!(!service.status.trx.get().enabled);
    }
}
