//! Quiet, stop, debug, factory test and error states
use embassy_time::{Duration, Timer};
use embedded_services::power::wireless::{Error, FastChargeController, NormalCharger, RxController};
use embedded_services::{error, info, warn};

use crate::protocol::{Command, Message, Wait};
use crate::rx::{Enter, RxState};
use crate::voter::{Vote, Voter};
use crate::Service;

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    /// Retarget if the override that selected `state` changed
    fn check_override(&self, state: RxState) -> bool {
        match self.override_state() {
            Some(target) if target == state => false,
            Some(target) => {
                self.set_target(target);
                true
            }
            None => {
                self.set_target(self.negotiated_target());
                true
            }
        }
    }

    /// Enter quiet mode
    pub(crate) async fn enter_quiet(&self) -> Result<Enter, Error> {
        self.leave_fast_path().await;
        match self.send(Message::new(Command::SetQuietMode), Wait::Resend).await {
            // A request still waiting for its ack, retried by the handler
            Ok(_) | Err(Error::Busy) => (),
            Err(e) => return Err(e),
        }
        self.set_vout(self.config.quiet.vout_mv).await?;
        self.vote(Vote::NorIcl, Voter::Quiet, true, self.config.quiet.icl_ma, false)
            .await;
        Ok(Enter::Done(self.config.rx_poll_interval))
    }

    /// Quiet handler
    pub(crate) async fn handle_quiet(&self) -> Result<Duration, Error> {
        self.sample_rx().await?;
        if self.check_override(RxState::Quiet) {
            return Ok(self.config.rx_poll_interval);
        }
        if !self.status.link.get().tx_quiet && !self.transport.is_pending() {
            warn!("Transmitter not quiet yet");
            match self.send(Message::new(Command::SetQuietMode), Wait::Resend).await {
                Ok(_) | Err(Error::Busy) => (),
                Err(e) => return Err(e),
            }
        }
        Ok(self.config.rx_poll_interval)
    }

    /// Leave quiet mode
    ///
    /// An unconfirmed quiet request is dropped first so it is not resent afterwards.
    pub(crate) async fn exit_quiet(&self) {
        if self.status.online() {
            self.transport.abandon(Command::SetQuietMode);
            let mut busy = 0;
            loop {
                match self
                    .send(Message::new(Command::SetNormalMode), Wait::Timeout(self.config.msg_wait))
                    .await
                {
                    Ok(_) => break,
                    Err(Error::Busy) if busy < self.config.resend_max => {
                        busy += 1;
                        Timer::after(self.config.resend_interval).await;
                    }
                    Err(e) => {
                        warn!("Failed to leave quiet mode: {:?}", e);
                        break;
                    }
                }
            }
        }
        self.vote(Vote::NorIcl, Voter::Quiet, false, 0, false).await;
    }

    /// Stop charging until the battery temperature recovers
    pub(crate) async fn enter_stop(&self) -> Result<Enter, Error> {
        self.leave_fast_path().await;
        warn!("Battery temperature out of range, charging stopped");
        self.vote(Vote::NorOutDisable, Voter::Stop, true, 1, false).await;
        Ok(Enter::Done(self.config.rx_poll_interval))
    }

    pub(crate) async fn handle_stop(&self) -> Result<Duration, Error> {
        self.sample_rx().await?;
        if let Some(state) = self.override_state() {
            self.set_target(state);
        } else if !self.temp_out_of_window(self.config.charge_temp_recover_dc) {
            info!("Battery temperature recovered");
            self.set_target(self.negotiated_target());
        }
        Ok(self.config.rx_poll_interval)
    }

    pub(crate) async fn exit_stop(&self) {
        self.vote(Vote::NorOutDisable, Voter::Stop, false, 0, false).await;
    }

    /// Apply the forced output
    pub(crate) async fn enter_debug(&self) -> Result<Enter, Error> {
        self.leave_fast_path().await;
        let Some(debug) = self.status.settings.get().debug else {
            self.set_target(self.negotiated_target());
            return Ok(Enter::Done(Duration::from_ticks(0)));
        };
        self.set_vout(debug.vout_mv).await?;
        self.vote(Vote::NorIcl, Voter::Debug, true, debug.icl_ma, false).await;
        Ok(Enter::Done(self.config.rx_poll_interval))
    }

    /// Debug handler, follows changes to the forced output
    pub(crate) async fn handle_debug(&self) -> Result<Duration, Error> {
        self.sample_rx().await?;
        if self.check_override(RxState::Debug) {
            return Ok(self.config.rx_poll_interval);
        }
        if let Some(debug) = self.status.settings.get().debug {
            if self.status.fast.get().vout_set_mv != debug.vout_mv {
                self.set_vout(debug.vout_mv).await?;
            }
            self.vote(Vote::NorIcl, Voter::Debug, true, debug.icl_ma, false).await;
        }
        Ok(self.config.rx_poll_interval)
    }

    pub(crate) async fn exit_debug(&self) {
        self.vote(Vote::NorIcl, Voter::Debug, false, 0, false).await;
    }

    /// Factory test, fixed output and no messages to the transmitter
    pub(crate) async fn enter_ftm(&self) -> Result<Enter, Error> {
        self.leave_fast_path().await;
        self.set_vout(self.config.ftm.vout_mv).await?;
        self.vote(Vote::NorIcl, Voter::Ftm, true, self.config.ftm.icl_ma, false)
            .await;
        Ok(Enter::Done(self.config.rx_poll_interval))
    }

    pub(crate) async fn handle_ftm(&self) -> Result<Duration, Error> {
        self.sample_rx().await?;
        if !self.status.settings.get().ftm_mode {
            // Negotiation was skipped, run it now
            self.set_target(RxState::Default);
        }
        Ok(self.config.rx_poll_interval)
    }

    pub(crate) async fn exit_ftm(&self) {
        self.vote(Vote::NorIcl, Voter::Ftm, false, 0, false).await;
    }

    /// Park the receive path until disconnect
    pub(crate) async fn enter_error(&self) -> Result<Enter, Error> {
        error!("RX entering error state");
        self.leave_fast_path().await;
        self.vote(Vote::NorOutDisable, Voter::Error, true, 1, false).await;
        let r = self.rx_ic.lock().await.set_dcdc_enable(false).await;
        self.bus(r)?;
        Ok(Enter::Done(self.config.rx_poll_interval))
    }
}
