//! Closed-loop output control while fast charging
//!
//! Every period the controller nudges the receiver output voltage toward the current the
//! charge pump needs. Control error packets decide whether a sample is trusted. Runs of
//! untrusted samples tighten a current cap one notch at a time, runs of trusted samples
//! relax it again.
use embassy_futures::select::{select, Either};
use embassy_time::{Instant, Timer};
use embedded_services::power::wireless::{Error, FastChargeController, NormalCharger, RxController};
use embedded_services::{debug, info, trace, warn};

use crate::config::{Config, VoutStep};
use crate::protocol::{Command, Message, Wait};
use crate::topic::{DiagEvent, FastExit};
use crate::voter::{Vote, Voter};
use crate::Service;

/// Output voltage step scaling for the transmitter's protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StepFactor {
    /// Older transmitters overshoot, use half steps
    Half,
    /// Configured steps
    Normal,
    /// Newer transmitters settle quickly, use double steps
    Double,
}

impl StepFactor {
    /// Factor for a protocol version
    pub fn from_protocol_version(version: u8) -> Self {
        match version {
            0..=1 => StepFactor::Half,
            2..=3 => StepFactor::Normal,
            _ => StepFactor::Double,
        }
    }

    fn scale(self, step_mv: u32) -> u32 {
        match self {
            StepFactor::Half => step_mv / 2,
            StepFactor::Normal => step_mv,
            StepFactor::Double => step_mv * 2,
        }
    }
}

/// Output voltage change for a current error, positive when more current is needed
pub fn vout_correction(error_ma: i32, steps: &[VoutStep; 4], factor: StepFactor) -> i32 {
    let magnitude = error_ma.unsigned_abs();
    let Some(step) = steps.iter().find(|s| magnitude >= s.error_ma) else {
        return 0;
    };
    let step_mv = factor.scale(step.step_mv).min(i32::MAX as u32) as i32;
    if error_ma > 0 {
        step_mv
    } else {
        -step_mv
    }
}

/// What the stability monitor wants done
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SkewAction {
    /// Nothing
    None,
    /// Relax the cap, `None` clears it
    Relax(Option<u32>),
    /// Tighten the cap
    Tighten(u32),
    /// The strictest cap is not enough at this ramp level
    ExitFast,
    /// Control error packets never recovered
    CepFail,
}

/// Link stability monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SkewMonitor {
    /// Active notch into the cap table
    pub notch: Option<usize>,
    ok: u8,
    bad: u8,
    cep_err: u8,
    last_change: Option<Instant>,
}

impl SkewMonitor {
    /// Cap of the active notch
    pub fn cap(&self, config: &Config) -> Option<u32> {
        self.notch.and_then(|n| config.skew_curr_ma.get(n).copied())
    }

    /// Feed one sample
    pub fn sample(&mut self, cep_ok: bool, now: Instant, config: &Config, level: usize) -> SkewAction {
        if cep_ok {
            self.bad = 0;
            self.cep_err = 0;
            self.ok = self.ok.saturating_add(1);

            let Some(notch) = self.notch else {
                return SkewAction::None;
            };
            let cooled = self.last_change.is_none_or(|at| now - at >= config.skew_cool_off);
            if self.ok < config.skew_ok_max || !cooled {
                return SkewAction::None;
            }
            self.ok = 0;
            self.last_change = Some(now);
            self.notch = notch.checked_sub(1);
            return SkewAction::Relax(self.cap(config));
        }

        self.ok = 0;
        self.bad = self.bad.saturating_add(1);
        self.cep_err = self.cep_err.saturating_add(1);
        if self.cep_err >= config.cep_err_max {
            return SkewAction::CepFail;
        }
        if self.bad < config.skew_bad_max {
            return SkewAction::None;
        }
        self.bad = 0;

        let next = self.notch.map_or(0, |n| n + 1);
        if next < config.skew_curr_ma.len() {
            self.notch = Some(next);
            self.last_change = Some(now);
            return self.cap(config).map_or(SkewAction::None, SkewAction::Tighten);
        }
        if level < u32::BITS as usize && config.skew_exit_levels & (1 << level) != 0 {
            SkewAction::ExitFast
        } else {
            SkewAction::None
        }
    }
}

/// Anomaly counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Watchdog {
    discharge: u8,
    low_iout: u8,
}

impl Watchdog {
    /// Feed one sample, returns a reason to leave fast charge
    pub fn sample(&mut self, ibat_ma: i32, iout_ma: u32, config: &Config) -> Option<FastExit> {
        if ibat_ma < -(config.discharge_threshold_ma.min(i32::MAX as u32) as i32) {
            self.discharge = self.discharge.saturating_add(1);
        } else {
            self.discharge = 0;
        }
        if iout_ma < config.low_iout_ma {
            self.low_iout = self.low_iout.saturating_add(1);
        } else {
            self.low_iout = 0;
        }

        if self.discharge >= config.discharge_cycles {
            Some(FastExit::Discharge)
        } else if self.low_iout >= config.low_iout_cycles {
            Some(FastExit::LowOutput)
        } else {
            None
        }
    }
}

/// Controller state for one fast charge run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Controller {
    /// Stability monitor
    pub skew: SkewMonitor,
    /// Anomaly counters
    pub watchdog: Watchdog,
}

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    async fn send_batt_info(&self, now: Instant) {
        let fast = self.status.fast.get();
        if fast
            .batt_info_at
            .is_some_and(|at| now - at < self.config.batt_info_interval)
        {
            return;
        }
        let battery = self.status.battery.get();
        let temp_c = (battery.tbatt_dc / 10).clamp(0, u8::MAX as i32) as u8;
        let vbat = (battery.vbat_mv / 100).min(u8::MAX as u32) as u8;
        let msg = Message::with_data(Command::SendBattInfo, [battery.soc, temp_c, vbat]);
        match self.send(msg, Wait::NoWait).await {
            Ok(_) => {
                self.status.fast.update(|f| f.batt_info_at = Some(now));
            }
            Err(e) => trace!("Battery report deferred: {:?}", e),
        }
    }

    /// One controller period
    pub(crate) async fn control_cycle(&self, ctrl: &mut Controller) -> Result<(), Error> {
        if !self.status.fast.get().running {
            return Ok(());
        }
        let telemetry = self.sample_rx().await?;
        let battery = self.status.battery.get();
        let now = Instant::now();

        if let Some(reason) = ctrl.watchdog.sample(battery.ibat_ma, telemetry.iout_ma, &self.config) {
            warn!("Fast charge anomaly: {:?}", reason);
            self.request_fast_exit(reason);
            return Ok(());
        }

        let cep_ok = telemetry.cep.unsigned_abs() < self.config.cep_tolerance;
        let level = self.status.fast.get().ramp.map_or(0, |r| r.level);
        match ctrl.skew.sample(cep_ok, now, &self.config, level) {
            SkewAction::None => (),
            SkewAction::Tighten(cap) => {
                info!("Link unstable, capping fast charge at {} mA", cap);
                self.vote(Vote::FastCurr, Voter::Skew, true, cap, false).await;
                self.diag.publish(DiagEvent::SkewTightened(cap));
            }
            SkewAction::Relax(cap) => {
                info!("Link recovered, cap {:?}", cap);
                self.vote(Vote::FastCurr, Voter::Skew, cap.is_some(), cap.unwrap_or(0), false)
                    .await;
                self.diag.publish(DiagEvent::SkewRecovered(cap));
            }
            SkewAction::ExitFast => {
                self.request_fast_exit(FastExit::SkewFloor);
                return Ok(());
            }
            SkewAction::CepFail => {
                self.request_fast_exit(FastExit::Cep);
                return Ok(());
            }
        }

        if cep_ok {
            let fast = self.status.fast.get();
            let ibat_target = fast
                .target_curr_ma
                .min(self.config.batt_max_curr_ma.saturating_sub(self.config.batt_curr_margin_ma));
            let iout_target = ibat_target / self.config.cp_ratio.max(1);
            let error_ma = iout_target as i32 - telemetry.iout_ma as i32;
            let factor = StepFactor::from_protocol_version(self.status.link.get().protocol_version);
            let delta = vout_correction(error_ma, &self.config.vout_steps, factor);
            if delta != 0 {
                let base = if fast.vout_set_mv == 0 {
                    telemetry.vout_mv
                } else {
                    fast.vout_set_mv
                };
                let (min, max) = self.config.fast_vout_window_mv;
                let vout_mv = (base as i32 + delta).clamp(min as i32, max as i32) as u32;
                if vout_mv != fast.vout_set_mv {
                    trace!("Iout error {} mA, vout {} mV", error_ma, vout_mv);
                    self.set_vout(vout_mv).await?;
                }
            }
        }

        self.send_batt_info(now).await;
        Ok(())
    }

    /// Controller loop, active while the charge pump runs
    pub async fn run_control(&self) {
        loop {
            self.ctrl_start.wait().await;
            self.ctrl_stop.reset();
            debug!("Controller started");
            let mut ctrl = Controller::default();

            loop {
                if let Either::Second(()) = select(Timer::after(self.config.ctrl_period), self.ctrl_stop.wait()).await {
                    break;
                }
                if !self.status.fast.get().running {
                    break;
                }
                if let Err(e) = self.control_cycle(&mut ctrl).await {
                    warn!("Control cycle failed: {:?}", e);
                }
            }
            debug!("Controller stopped");
        }
    }
}
