//! Transmitter negotiation
use embassy_time::{Duration, Instant};
use embedded_services::power::wireless::{
    AdapterType, Error, FastChargeController, FodMode, NormalCharger, PowerCapability, RxController, RxMode, WlsType,
};
use embedded_services::{debug, info, warn};

use crate::config::{FodEntry, PowerEntry};
use crate::curve::TempRegion;
use crate::protocol::{Command, Message, Wait};
use crate::rx::{Enter, RxState};
use crate::topic::WlsItem;
use crate::voter::{Vote, Voter};
use crate::Service;

/// Look up the power for a code
pub fn lookup_power(table: &[PowerEntry], code: u8) -> Option<u32> {
    table.iter().find(|e| e.code == code).map(|e| e.power_mw)
}

/// Find the FOD entry for a transmitter, falling back to the default entry
pub fn lookup_fod(table: &'static [FodEntry], tx_id: Option<u16>) -> Option<&'static FodEntry> {
    tx_id
        .and_then(|id| table.iter().find(|e| e.tx_id == Some(id)))
        .or_else(|| table.iter().find(|e| e.tx_id.is_none()))
}

/// Charging mode for an adapter and receiver mode
pub fn classify(adapter_type: AdapterType, rx_mode: RxMode) -> WlsType {
    adapter_type.wls_type().unwrap_or(match rx_mode {
        RxMode::Bpp => WlsType::Bpp,
        RxMode::Epp | RxMode::Epp5w => WlsType::Epp,
        RxMode::EppPlus => WlsType::EppPlus,
    })
}

/// Receiver mode refined by the EPP power capability the receiver reported
pub fn epp_rx_mode(rx_mode: RxMode, epp_power_mw: Option<u32>, plus_min_mw: u32, min_mw: u32) -> RxMode {
    match (rx_mode, epp_power_mw) {
        (RxMode::Bpp, _) | (_, None) => rx_mode,
        (_, Some(power_mw)) if power_mw >= plus_min_mw => RxMode::EppPlus,
        (_, Some(power_mw)) if power_mw < min_mw => RxMode::Epp5w,
        _ => RxMode::Epp,
    }
}

/// Base state for a receiver mode
pub fn base_state(rx_mode: RxMode) -> RxState {
    match rx_mode {
        RxMode::Bpp => RxState::Bpp,
        RxMode::Epp | RxMode::Epp5w => RxState::Epp,
        RxMode::EppPlus => RxState::EppPlus,
    }
}

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    /// Battery temperature region
    pub(crate) fn temp_region(&self) -> TempRegion {
        TempRegion::classify(self.status.battery.get().tbatt_dc, &self.config.temp_bounds_dc)
    }

    /// Returns true if the battery temperature is outside the charge window
    pub(crate) fn temp_out_of_window(&self, margin_dc: i32) -> bool {
        let tbatt_dc = self.status.battery.get().tbatt_dc;
        let (low, high) = self.config.charge_temp_window_dc;
        tbatt_dc < low + margin_dc || tbatt_dc > high - margin_dc
    }

    /// Fast charge current cap from the thermal cool down level
    pub(crate) fn cool_down_cap(&self) -> Option<u32> {
        let level = self.status.battery.get().cool_down as usize;
        if level == 0 {
            return None;
        }
        let table = self.config.cool_down_curr_ma;
        table.get(level).or(table.last()).copied().filter(|cap| *cap > 0)
    }

    /// Returns true if fast charge may be entered now
    pub(crate) fn fast_allowed(&self) -> bool {
        let link = self.status.link.get();
        let battery = self.status.battery.get();
        let fast = self.status.fast.get();

        link.wls_type.is_fast()
            && !self.is_set(Vote::FastDisable)
            && !self.status.charge_done.get()
            && fast.retry_after.is_none_or(|at| Instant::now() >= at)
            && self.temp_region().fast_index().is_some()
            && battery.soc < self.config.fast_max_soc
            && battery.vbat_mv < self.config.fast_vbat_max_mv
            && self
                .cool_down_cap()
                .is_none_or(|cap| cap >= self.config.fast_min_curr_ma)
    }

    /// State requested by the control surface, if any
    pub(crate) fn override_state(&self) -> Option<RxState> {
        let settings = self.status.settings.get();
        if settings.debug.is_some() {
            Some(RxState::Debug)
        } else if settings.ftm_mode {
            Some(RxState::Ftm)
        } else if settings.quiet_mode {
            Some(RxState::Quiet)
        } else {
            None
        }
    }

    /// State charging falls back to when fast charge is not possible
    pub(crate) fn fallback_state(&self) -> RxState {
        let link = self.status.link.get();
        match link.wls_type {
            WlsType::Bpp => RxState::Bpp,
            WlsType::Epp => RxState::Epp,
            WlsType::EppPlus => RxState::EppPlus,
            _ => base_state(link.rx_mode),
        }
    }

    /// Destination state for the negotiated link
    pub(crate) fn negotiated_target(&self) -> RxState {
        if let Some(state) = self.override_state() {
            state
        } else if self.temp_out_of_window(0) {
            RxState::Stop
        } else if self.fast_allowed() {
            RxState::Fast
        } else {
            self.fallback_state()
        }
    }

    /// Vote the current ceiling for the negotiated power
    pub(crate) async fn update_power_cap(&self) {
        let link = self.status.link.get();
        let base = lookup_power(self.config.base_power, link.adapter_id).unwrap_or(self.config.default_power_mw);
        let mut power_mw = match link.f2_code.and_then(|code| lookup_power(self.config.f2_power, code)) {
            Some(f2) => base.min(f2),
            None => base,
        };
        if let (false, Some(epp_mw)) = (link.wls_type.is_fast(), link.epp_power_mw) {
            power_mw = power_mw.min(epp_mw);
        }
        self.status.link.update(|l| l.adapter_power_mw = power_mw);

        let cap = PowerCapability::from_power(power_mw, self.config.nominal_mv);
        debug!("Power {} mW, current cap {} mA", power_mw, cap.current_ma);
        self.vote(Vote::FastCurr, Voter::Max, true, cap.current_ma, false).await;
    }

    /// Load FOD parameters for the connected transmitter
    pub(crate) async fn apply_fod(&self, mode: FodMode) -> Result<(), Error> {
        let link = self.status.link.get();
        let Some(entry) = lookup_fod(self.config.fod, link.tx_id) else {
            return Ok(());
        };
        let parm = match mode {
            FodMode::Fast => &entry.fast_parm,
            FodMode::Bpp | FodMode::Epp => &entry.parm,
        };
        let mag_cover = self.status.settings.get().mag_cover;
        let r = self.rx_ic.lock().await.set_fod_parm(parm, mode, mag_cover).await;
        self.bus(r)?;
        let r = self.rx_ic.lock().await.send_match_q(entry.match_q).await;
        self.bus(r)
    }

    /// Identify the adapter, retrying on timeouts
    async fn identify_adapter(&self) -> Result<bool, Error> {
        for attempt in 0..self.config.identify_retry {
            match self
                .send(Message::new(Command::IdentifyAdapter), Wait::Timeout(self.config.msg_wait))
                .await
            {
                Ok(_) => return Ok(true),
                Err(e @ (Error::Offline | Error::Cancelled)) => return Err(e),
                Err(e) => warn!("Identify attempt {} failed: {:?}", attempt, e),
            }
        }
        Ok(false)
    }

    /// Send a query whose failure does not stop negotiation
    async fn query(&self, cmd: Command) -> Result<(), Error> {
        match self.send(Message::new(cmd), Wait::Timeout(self.config.msg_wait)).await {
            Ok(_) => Ok(()),
            Err(e @ (Error::Offline | Error::Cancelled)) => Err(e),
            Err(e) => {
                debug!("{:?} failed: {:?}", cmd, e);
                Ok(())
            }
        }
    }

    /// Negotiate with the transmitter and pick the destination state
    pub(crate) async fn enter_default(&self) -> Result<Enter, Error> {
        self.leave_fast_path().await;

        let r = self.rx_ic.lock().await.get_rx_mode().await;
        let reported = self.bus(r)?;
        let rx_mode = epp_rx_mode(
            reported,
            self.status.link.get().epp_power_mw,
            self.config.epp_plus_min_mw,
            self.config.epp_min_mw,
        );
        if rx_mode != reported {
            debug!("Receiver mode {:?} switched to {:?}", reported, rx_mode);
            let r = self.rx_ic.lock().await.set_rx_mode(rx_mode).await;
            self.bus(r)?;
        }
        let r = self.rx_ic.lock().await.get_rx_version().await;
        let rx_version = self.bus(r)?;
        self.status.link.update(|l| {
            l.rx_mode = rx_mode;
            l.rx_version = Some(rx_version);
        });

        if self.status.settings.get().ftm_mode {
            // Factory test stays silent on the link
            self.set_target(RxState::Ftm);
            return Ok(Enter::Done(Duration::from_ticks(0)));
        }

        if !self.identify_adapter().await? {
            warn!("Adapter not identified");
        }
        self.query(Command::GetTxId).await?;
        self.query(Command::GetFwVersion).await?;

        let link = self.status.link.get();
        let wls_type = classify(link.adapter_type, rx_mode);
        self.status.link.update(|l| l.wls_type = wls_type);
        self.wireless.publish(WlsItem::WlsType(wls_type));

        let fod_mode = match rx_mode {
            RxMode::Bpp => FodMode::Bpp,
            _ => FodMode::Epp,
        };
        self.apply_fod(fod_mode).await?;
        self.update_power_cap().await;
        self.vote(Vote::RxComu, Voter::Base, true, u32::from(self.config.rx_comu_base), false)
            .await;
        self.kick_verity();

        let target = self.negotiated_target();
        info!(
            "Negotiated {:?}, adapter {:?} id {}, target {:?}",
            wls_type, link.adapter_type, link.adapter_id, target
        );
        self.set_target(target);
        Ok(Enter::Done(Duration::from_ticks(0)))
    }
}
