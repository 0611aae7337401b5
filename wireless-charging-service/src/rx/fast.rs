//! Fast charge state
use embassy_time::{Duration, Instant};
use embedded_services::power::wireless::{Error, FastChargeController, FodMode, NormalCharger, RxController, WlsType};
use embedded_services::{debug, error, info, trace, warn};

use crate::curve::{should_reselect, CurveKind, CurveSel, Ramp, RampInput, RampOutcome, SocBucket};
use crate::protocol::{Command, Message, Wait};
use crate::rx::{Enter, RxState};
use crate::topic::{DiagEvent, FastExit};
use crate::voter::{Vote, Voter};
use crate::Service;

/// Fast charge entry sub-steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FastEnterStep {
    /// Ask the transmitter to switch to fast charge
    #[default]
    Init,
    /// Wait for the rectifier voltage to rise
    WaitFast,
    /// Wait for output current
    WaitIout,
    /// Ramp the output voltage to the charge pump input target
    WaitVout,
    /// Check the output current headroom
    CheckIout,
    /// Start the charge pump
    Start,
}

/// Fast charge entry progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FastEnter {
    /// Current sub-step
    pub step: FastEnterStep,
    /// Attempts made in the current sub-step
    pub retry: u8,
    /// Deadline of the current sub-step
    pub deadline: Option<Instant>,
    /// Output voltage target
    pub vout_target_mv: u32,
    /// Offset added to the charge pump input voltage
    pub offset_mv: u32,
}

impl<R: RxController, F: FastChargeController, C: NormalCharger> Service<R, F, C> {
    /// Battery current limit of the adapter class
    fn class_max_curr(&self) -> u32 {
        let limit = match self.status.link.get().wls_type {
            WlsType::Vooc => self.config.vooc_max_curr_ma,
            WlsType::Svooc => self.config.svooc_max_curr_ma,
            WlsType::Pd65w => self.config.pd65w_max_curr_ma,
            _ => self.config.fast_min_curr_ma,
        };
        limit.min(self.config.batt_max_curr_ma)
    }

    /// Charge pump input voltage target
    fn fast_vout_target(&self, offset_mv: u32) -> u32 {
        let vbat_mv = self.status.battery.get().vbat_mv;
        let (min, max) = self.config.fast_vout_window_mv;
        (vbat_mv * self.config.cp_ratio + offset_mv).clamp(min, max)
    }

    fn curve_sel(&self) -> CurveSel {
        let link = self.status.link.get();
        let settings = self.status.settings.get();
        CurveSel {
            kind: CurveKind::select(
                link.vendor_id,
                settings.mag_cover,
                link.adapter_power_mw,
                self.config.high_power_threshold_mw,
            ),
            bucket: SocBucket::classify(self.status.battery.get().soc, self.config.soc_bounds),
            region: self.temp_region(),
        }
    }

    pub(crate) async fn set_vout(&self, vout_mv: u32) -> Result<(), Error> {
        let r = self.rx_ic.lock().await.set_vout(vout_mv).await;
        self.bus(r)?;
        self.status.fast.update(|f| f.vout_set_mv = vout_mv);
        Ok(())
    }

    /// Tear down the fast charge path
    ///
    /// Safe to call when fast charge is not active.
    pub(crate) async fn leave_fast_path(&self) {
        let fast = self.status.fast.get();
        if fast.running || fast.enter.step != FastEnterStep::Init {
            self.ctrl_stop.signal(());
            let mut cp = self.fast_ic.lock().await;
            if cp.start(false).await.is_err() || cp.set_enable(false).await.is_err() {
                error!("Failed to stop charge pump");
                self.diag.publish(DiagEvent::IcError);
            }
        }
        self.status.fast.update(|f| {
            f.running = false;
            f.ramp = None;
            f.observed_region = None;
            f.enter = FastEnter::default();
        });
        self.vote(Vote::FastCurr, Voter::Step, false, 0, false).await;
        self.vote(Vote::FastCurr, Voter::Fast, false, 0, false).await;
        self.vote(Vote::FastCurr, Voter::Skew, false, 0, false).await;
        self.vote(Vote::NorIcl, Voter::Fast, false, 0, false).await;
        self.vote(Vote::RxComu, Voter::Fast, false, 0, false).await;
    }

    /// Give up on fast charge entry and fall back
    ///
    /// Once the transmitter accepted the fast charge request it is told to return to
    /// normal charging.
    async fn fail_fast_entry(&self, why: &'static str) -> Result<Enter, Error> {
        warn!("Fast charge entry failed: {}", why);
        let accepted = self.status.fast.get().enter.step != FastEnterStep::Init;
        self.leave_fast_path().await;
        if accepted && self.status.online() {
            if let Err(e) = self
                .send(Message::new(Command::IntoNormalCharge), Wait::Timeout(self.config.msg_wait))
                .await
            {
                warn!("Transmitter did not leave fast charge: {:?}", e);
            }
        }

        let fast = self.status.fast.update(|f| {
            f.fail_count = f.fail_count.saturating_add(1);
            f.retry_after = Some(Instant::now() + self.config.fast_retry_holdoff);
        });
        self.diag.publish(DiagEvent::FastExit(FastExit::EntryFailed));
        if fast.fail_count >= self.config.fast_fail_max {
            error!("Fast charge disabled after {} failed entries", fast.fail_count);
            self.vote(Vote::FastDisable, Voter::Exit, true, 1, false).await;
        }

        self.set_target(self.fallback_state());
        Ok(Enter::Pending(Duration::from_ticks(0)))
    }

    fn save_enter(&self, enter: FastEnter) {
        trace!("Fast enter step {:?}", enter.step);
        self.status.fast.update(|f| f.enter = enter);
    }

    /// Enter fast charge, one sub-step per call
    pub(crate) async fn enter_fast(&self) -> Result<Enter, Error> {
        let mut enter = self.status.fast.get().enter;
        let interval = self.config.fast_enter_interval;
        let now = Instant::now();

        match enter.step {
            FastEnterStep::Init => {
                self.status.fast.update(|f| f.exit = None);
                match self
                    .send(Message::new(Command::IntoFastcharge), Wait::Timeout(self.config.msg_wait))
                    .await
                {
                    Ok(_) => (),
                    Err(e @ (Error::Offline | Error::Cancelled)) => return Err(e),
                    // Another request holds the link, try again next tick
                    Err(Error::Busy) => return Ok(Enter::Pending(interval)),
                    Err(_) => return self.fail_fast_entry("no response to fast charge request").await,
                }
                // The response carries the receive power code
                self.update_power_cap().await;
                self.apply_fod(FodMode::Fast).await?;
                enter = FastEnter {
                    step: FastEnterStep::WaitFast,
                    retry: 0,
                    deadline: Some(now + self.config.wait_fast_timeout),
                    vout_target_mv: 0,
                    offset_mv: self.config.vout_offset_mv,
                };
            }
            FastEnterStep::WaitFast => {
                let r = self.rx_ic.lock().await.get_vrect().await;
                let vrect_mv = self.bus(r)?;
                if vrect_mv >= self.config.fast_vrect_min_mv {
                    enter.step = FastEnterStep::WaitIout;
                    enter.retry = 0;
                } else if enter.deadline.is_some_and(|d| now >= d) {
                    return self.fail_fast_entry("transmitter did not switch").await;
                }
            }
            FastEnterStep::WaitIout => {
                let r = self.rx_ic.lock().await.get_iout().await;
                let iout_ma = self.bus(r)?;
                if iout_ma >= self.config.wait_iout_min_ma {
                    enter.step = FastEnterStep::WaitVout;
                    enter.retry = 0;
                    enter.vout_target_mv = self.fast_vout_target(enter.offset_mv);
                    enter.deadline = Some(now + self.config.wait_vout_timeout);
                } else {
                    enter.retry += 1;
                    if enter.retry >= self.config.wait_iout_retry {
                        return self.fail_fast_entry("no output current").await;
                    }
                    if enter.retry == self.config.wait_iout_retry / 2 {
                        debug!("Rerunning AICL");
                        let r = self.charger.lock().await.rerun_aicl().await;
                        self.bus(r)?;
                    }
                }
            }
            FastEnterStep::WaitVout => {
                let r = self.rx_ic.lock().await.get_vout().await;
                let vout_mv = self.bus(r)?;
                let target_mv = enter.vout_target_mv;
                if vout_mv.abs_diff(target_mv) <= self.config.vout_tolerance_mv {
                    enter.step = FastEnterStep::CheckIout;
                } else if enter.deadline.is_some_and(|d| now >= d) {
                    return self.fail_fast_entry("output voltage did not settle").await;
                } else {
                    let step_mv = self.config.vout_ramp_step_mv.min(vout_mv.abs_diff(target_mv));
                    let next_mv = if vout_mv < target_mv {
                        vout_mv + step_mv
                    } else {
                        vout_mv - step_mv
                    };
                    self.set_vout(next_mv).await?;
                }
            }
            FastEnterStep::CheckIout => {
                let r = self.rx_ic.lock().await.get_iout().await;
                let iout_ma = self.bus(r)?;
                if iout_ma >= self.config.fast_check_iout_ma {
                    enter.step = FastEnterStep::Start;
                } else {
                    enter.offset_mv += self.config.vout_offset_step_mv;
                    if enter.offset_mv > self.config.vout_offset_max_mv {
                        return self.fail_fast_entry("not enough output current headroom").await;
                    }
                    enter.step = FastEnterStep::WaitVout;
                    enter.vout_target_mv = self.fast_vout_target(enter.offset_mv);
                    enter.deadline = Some(now + self.config.wait_vout_timeout);
                }
            }
            FastEnterStep::Start => return self.start_fast(enter).await,
        }

        self.save_enter(enter);
        Ok(Enter::Pending(interval))
    }

    async fn start_fast(&self, enter: FastEnter) -> Result<Enter, Error> {
        let sel = self.curve_sel();
        let Some(curve) = self.config.curves.curve(sel) else {
            return self.fail_fast_entry("no curve for battery temperature").await;
        };

        {
            let mut cp = self.fast_ic.lock().await;
            let started = match cp.set_enable(true).await {
                Ok(()) => match cp.start(true).await {
                    Ok(()) => cp.is_started().await.unwrap_or(false),
                    Err(_) => false,
                },
                Err(_) => false,
            };
            drop(cp);
            if !started {
                self.diag.publish(DiagEvent::IcError);
                self.save_enter(enter);
                return self.fail_fast_entry("charge pump did not start").await;
            }
        }

        let vbat_mv = self.status.battery.get().vbat_mv;
        let ramp = Ramp::start(sel, curve, vbat_mv);
        let step_curr = ramp.curr_ma(curve).unwrap_or(self.config.fast_min_curr_ma);

        self.vote(Vote::NorIcl, Voter::Fast, true, self.config.fast_nor_icl_ma, false)
            .await;
        self.vote(Vote::FastCurr, Voter::Fast, true, self.class_max_curr(), false)
            .await;
        self.vote(Vote::FastCurr, Voter::Step, true, step_curr, false).await;
        self.vote(Vote::RxComu, Voter::Fast, true, u32::from(self.config.rx_comu_fast), false)
            .await;

        let now = Instant::now();
        self.status.fast.update(|f| {
            f.enter = FastEnter::default();
            f.running = true;
            f.ramp = Some(ramp);
            f.observed_region = Some(sel.region);
            f.exit = None;
            f.fail_count = 0;
            f.batt_info_at = Some(now);
        });
        self.ctrl_start.signal(());
        info!(
            "Fast charge started: {:?} level {} at {} mA",
            sel, ramp.level, step_curr
        );
        Ok(Enter::Done(self.config.fast_poll_interval))
    }

    /// Reason to leave fast charge, checked in priority order
    fn fast_exit_reason(&self) -> Option<FastExit> {
        let battery = self.status.battery.get();
        let fast = self.status.fast.get();

        if self.is_set(Vote::FastDisable) {
            Some(FastExit::Disabled)
        } else if self.status.settings.get().quiet_mode {
            Some(FastExit::Quiet)
        } else if self.temp_region().fast_index().is_none() {
            Some(FastExit::Temperature)
        } else if battery.vbat_mv >= self.config.fast_vbat_max_mv {
            Some(FastExit::Voltage)
        } else if let Some(exit) = fast.exit {
            Some(exit)
        } else if self
            .cool_down_cap()
            .is_some_and(|cap| cap < self.config.fast_min_curr_ma)
        {
            Some(FastExit::CoolDown)
        } else {
            None
        }
    }

    /// Ask the fast charge state to leave, used by the controller and message handlers
    pub(crate) fn request_fast_exit(&self, reason: FastExit) {
        let fast = self.status.fast.update(|f| {
            if f.running && f.exit.is_none() {
                f.exit = Some(reason);
            }
        });
        if fast.exit == Some(reason) {
            self.rx_wake.signal(());
        }
    }

    async fn leave_fast(&self, reason: FastExit) {
        let target = match reason {
            FastExit::Quiet => RxState::Quiet,
            FastExit::Ffc => RxState::Ffc,
            FastExit::Done => RxState::Done,
            FastExit::Temperature if self.temp_out_of_window(0) => RxState::Stop,
            _ => self.fallback_state(),
        };
        match reason {
            FastExit::Ffc | FastExit::Done | FastExit::Quiet | FastExit::Disabled => (),
            _ => {
                self.status.fast.update(|f| {
                    f.retry_after = Some(Instant::now() + self.config.fast_retry_holdoff);
                });
            }
        }
        info!("Leaving fast charge: {:?}", reason);
        self.status.fast.update(|f| f.exit = Some(reason));
        self.diag.publish(DiagEvent::FastExit(reason));
        self.set_target(target);
    }

    /// Fast charge handler, runs the exit checks and the current ramp
    pub(crate) async fn handle_fast(&self) -> Result<Duration, Error> {
        let poll = self.config.fast_poll_interval;
        if let Some(reason) = self.fast_exit_reason() {
            self.leave_fast(reason).await;
            return Ok(poll);
        }

        let fast = self.status.fast.get();
        let Some(mut ramp) = fast.ramp else {
            self.leave_fast(FastExit::Disabled).await;
            return Ok(poll);
        };
        let battery = self.status.battery.get();
        let region = self.temp_region();

        if let Some(previous) = fast.observed_region {
            if previous != region && should_reselect(previous, region) {
                let sel = self.curve_sel();
                if let Some(curve) = self.config.curves.curve(sel) {
                    ramp = Ramp::start(sel, curve, battery.vbat_mv);
                    info!("Curve reselected for {:?}, level {}", region, ramp.level);
                }
            }
        }

        let Some(curve) = self.config.curves.curve(ramp.sel) else {
            self.leave_fast(FastExit::Temperature).await;
            return Ok(poll);
        };
        let input = RampInput {
            vbat_mv: battery.vbat_mv,
            tbatt_dc: battery.tbatt_dc,
            soc: battery.soc,
        };
        let outcome = ramp.step(curve, input, self.config.fast_max_soc, self.config.need_wait_cycles);
        self.status.fast.update(|f| {
            f.ramp = Some(ramp);
            f.observed_region = Some(region);
        });

        let exit = match outcome {
            RampOutcome::Hold => None,
            RampOutcome::Advanced | RampOutcome::FellBack => {
                debug!("Ramp {:?} to level {}", outcome, ramp.level);
                None
            }
            RampOutcome::Ffc => Some(FastExit::Ffc),
            RampOutcome::Done => Some(FastExit::Done),
            RampOutcome::TooHot => Some(FastExit::Temperature),
        };
        if let Some(reason) = exit {
            self.leave_fast(reason).await;
        } else if let Some(curr_ma) = ramp.curr_ma(curve) {
            self.vote(Vote::FastCurr, Voter::Step, true, curr_ma, false).await;
        }
        Ok(poll)
    }

    /// Leave fast charge
    pub(crate) async fn exit_fast(&self) {
        self.leave_fast_path().await;
        if self.status.online() {
            if let Err(e) = self
                .send(Message::new(Command::IntoNormalCharge), Wait::Timeout(self.config.msg_wait))
                .await
            {
                warn!("Transmitter did not leave fast charge: {:?}", e);
            }
        }
    }
}
