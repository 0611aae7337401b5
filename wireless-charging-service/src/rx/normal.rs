//! Baseline, extended, FFC and done states
use embassy_time::{Duration, Instant};
use embedded_services::power::wireless::{Error, FastChargeController, NormalCharger, RxController};
use embedded_services::{debug, info};

use crate::config::Profile;
use crate::rx::{Enter, RxState};
use crate::status::RxTelemetry;
use crate::topic::WlsItem;
use crate::voter::{Vote, Voter};
use crate::Service;

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    fn base_profile(&self, state: RxState) -> Profile {
        match state {
            RxState::Bpp => self.config.bpp,
            RxState::EppPlus => self.config.epp_plus,
            _ => self.config.epp,
        }
    }

    /// Read and publish receiver measurements
    pub(crate) async fn sample_rx(&self) -> Result<RxTelemetry, Error> {
        let mut rx = self.rx_ic.lock().await;
        let iout_ma = rx.get_iout().await;
        let vout_mv = rx.get_vout().await;
        let vrect_mv = rx.get_vrect().await;
        let cep = rx.get_cep().await;
        drop(rx);

        let telemetry = RxTelemetry {
            iout_ma: self.bus(iout_ma)?,
            vout_mv: self.bus(vout_mv)?,
            vrect_mv: self.bus(vrect_mv)?,
            cep: self.bus(cep)?,
        };
        let previous = self.status.rx_telemetry.get();
        self.status.rx_telemetry.set(telemetry);
        if previous.iout_ma != telemetry.iout_ma {
            self.wireless.publish(WlsItem::Iout(telemetry.iout_ma));
        }
        if previous.vout_mv != telemetry.vout_mv {
            self.wireless.publish(WlsItem::Vout(telemetry.vout_mv));
        }
        Ok(telemetry)
    }

    /// Enter a fixed power profile
    pub(crate) async fn enter_base(&self, state: RxState) -> Result<Enter, Error> {
        self.leave_fast_path().await;
        let profile = self.base_profile(state);
        self.set_vout(profile.vout_mv).await?;
        self.vote(Vote::NorFcc, Voter::Base, true, self.config.nor_fcc_ma, false)
            .await;
        self.vote(Vote::NorFv, Voter::Base, true, self.config.nor_fv_mv, false).await;
        self.vote(Vote::NorIcl, Voter::Base, true, profile.icl_ma, true).await;
        Ok(Enter::Done(self.config.rx_poll_interval))
    }

    /// Fixed profile handler, watches for reasons to move on
    pub(crate) async fn handle_base(&self, state: RxState) -> Result<Duration, Error> {
        self.sample_rx().await?;

        let target = if let Some(state) = self.override_state() {
            Some(state)
        } else if self.temp_out_of_window(0) {
            Some(RxState::Stop)
        } else if self.status.battery.get().soc >= 100 {
            Some(RxState::Done)
        } else if self.fast_allowed() {
            Some(RxState::Fast)
        } else {
            None
        };

        if let Some(target) = target.filter(|t| *t != state) {
            debug!("{:?} moving to {:?}", state, target);
            self.set_target(target);
        }
        Ok(self.config.rx_poll_interval)
    }

    /// Enter full fast charge
    pub(crate) async fn enter_ffc(&self) -> Result<Enter, Error> {
        self.leave_fast_path().await;
        self.vote(Vote::NorFcc, Voter::Ffc, true, self.config.ffc_fcc_ma, false)
            .await;
        self.vote(Vote::NorFv, Voter::Ffc, true, self.config.ffc_fv_mv, false).await;
        self.status.fast.update(|f| f.ffc_since = Some(Instant::now()));
        Ok(Enter::Done(self.config.rx_poll_interval))
    }

    /// FFC handler, ends on taper current or timeout
    pub(crate) async fn handle_ffc(&self) -> Result<Duration, Error> {
        self.sample_rx().await?;
        if let Some(state) = self.override_state() {
            self.set_target(state);
            return Ok(self.config.rx_poll_interval);
        }

        let battery = self.status.battery.get();
        let timed_out = self
            .status
            .fast
            .get()
            .ffc_since
            .is_some_and(|since| Instant::now() - since >= self.config.ffc_timeout);
        if battery.ibat_ma < self.config.ffc_cutoff_ma as i32 || timed_out {
            info!("FFC complete, ibat {} mA", battery.ibat_ma);
            self.set_target(RxState::Done);
        } else if self.temp_out_of_window(0) {
            self.set_target(RxState::Stop);
        }
        Ok(self.config.rx_poll_interval)
    }

    pub(crate) async fn exit_ffc(&self) {
        self.status.fast.update(|f| f.ffc_since = None);
        self.vote(Vote::NorFcc, Voter::Ffc, false, 0, false).await;
        self.vote(Vote::NorFv, Voter::Ffc, false, 0, false).await;
    }

    /// Enter charge done
    pub(crate) async fn enter_done(&self) -> Result<Enter, Error> {
        self.leave_fast_path().await;
        self.vote(Vote::NorIcl, Voter::Done, true, self.config.done_icl_ma, false)
            .await;
        if !self.status.charge_done.get() {
            self.status.charge_done.set(true);
            self.wireless.publish(WlsItem::ChargeDone(true));
        }
        Ok(Enter::Done(self.config.rx_poll_interval))
    }

    /// Done handler, recharges once the soc drops
    pub(crate) async fn handle_done(&self) -> Result<Duration, Error> {
        self.sample_rx().await?;
        if let Some(state) = self.override_state() {
            self.set_target(state);
        } else if self.status.battery.get().soc < self.config.recharge_soc {
            info!("Recharging");
            self.status.charge_done.set(false);
            self.wireless.publish(WlsItem::ChargeDone(false));
            self.set_target(self.negotiated_target());
        }
        Ok(self.config.rx_poll_interval)
    }

    pub(crate) async fn exit_done(&self) {
        self.vote(Vote::NorIcl, Voter::Done, false, 0, false).await;
    }
}

#[cfg(test)]
mod test {
    use embassy_futures::block_on;
    use embedded_services::power::wireless::RxMode;

    use super::*;
    use crate::test_util::*;

    async fn settle(service: &TestService<'_>, hw: &Hw, state: RxState) {
        for _ in 0..200 {
            step(service, hw).await;
            let slots = service.status.rx.get();
            if slots.current == state && slots.target == state && slots.entered {
                return;
            }
        }
        panic!("{:?} not reached: {:?}", state, service.status.rx.get());
    }

    #[test]
    fn test_bpp_profile() {
        let hw = Hw::new();
        hw.rx_mode.set(RxMode::Bpp);
        let service = service(&hw);
        connect(&service, &hw);
        block_on(settle(&service, &hw, RxState::Bpp));

        assert_eq!(hw.vout_mv.get(), service.config.bpp.vout_mv);
        assert_eq!(hw.icl_history.borrow().last().copied(), Some(service.config.bpp.icl_ma));
        assert_eq!(hw.fcc_ma.get(), service.config.nor_fcc_ma);
    }

    #[test]
    fn test_full_battery_is_done_then_recharges() {
        let hw = Hw::new();
        hw.rx_mode.set(RxMode::Epp);
        let service = service(&hw);
        connect(&service, &hw);
        let mut sub = service.subscribe_wireless().unwrap();

        block_on(async {
            settle(&service, &hw, RxState::Epp).await;
            service.status.battery.update(|b| b.soc = 100);
            settle(&service, &hw, RxState::Done).await;
            assert!(service.status.charge_done.get());
            assert_eq!(service.effective(Vote::NorIcl), Some(service.config.done_icl_ma));

            service.status.battery.update(|b| b.soc = 90);
            settle(&service, &hw, RxState::Epp).await;
        });

        assert!(!service.status.charge_done.get());
        assert_eq!(service.client_vote(Vote::NorIcl, Voter::Done), None);
        let mut saw_done = false;
        while let Some(item) = sub.try_next_message_pure() {
            if item == WlsItem::ChargeDone(true) {
                saw_done = true;
            }
        }
        assert!(saw_done);
    }

    #[test]
    fn test_ffc_ends_on_taper() {
        let hw = Hw::new();
        hw.rx_mode.set(RxMode::Epp);
        let service = service(&hw);
        connect(&service, &hw);
        service.status.battery.update(|b| b.ibat_ma = 1500);
        service.set_target(RxState::Ffc);

        block_on(async {
            settle(&service, &hw, RxState::Ffc).await;
            assert_eq!(hw.fv_mv.get(), service.config.ffc_fv_mv);
            service.status.battery.update(|b| b.ibat_ma = 300);
            settle(&service, &hw, RxState::Done).await;
        });
        assert_eq!(service.client_vote(Vote::NorFcc, Voter::Ffc), None);
    }
}
