//! Fast charge curve selection and ramp progression
use crate::config::{CurveSet, FastChargeStep, MAX_STEPS};

/// Battery temperature region
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TempRegion {
    /// Below the charge window, no fast charge
    Cold,
    /// Little cold
    LittleCold,
    /// Cool
    Cool,
    /// Little cool
    LittleCool,
    /// Just below normal
    PreNormal,
    /// Normal
    Normal,
    /// Little warm
    LittleWarm,
    /// Warm
    Warm,
    /// Above the fast charge range
    Hot,
}

impl TempRegion {
    const ALL: [TempRegion; 9] = [
        TempRegion::Cold,
        TempRegion::LittleCold,
        TempRegion::Cool,
        TempRegion::LittleCool,
        TempRegion::PreNormal,
        TempRegion::Normal,
        TempRegion::LittleWarm,
        TempRegion::Warm,
        TempRegion::Hot,
    ];

    /// Classify a battery temperature, each bound is the lower edge of the next region
    pub fn classify(temp_dc: i32, bounds: &[i32; 8]) -> Self {
        let index = bounds.iter().take_while(|bound| temp_dc >= **bound).count();
        Self::ALL[index]
    }

    /// Column in a curve table, `None` if fast charge is not allowed in this region
    pub fn fast_index(self) -> Option<usize> {
        match self {
            TempRegion::Cold | TempRegion::Hot => None,
            region => Some(region as usize - 1),
        }
    }
}

/// Returns true if moving between two regions while fast charging selects a new curve
///
/// Only these two boundaries trigger reselection, any other crossing keeps the running
/// curve until the ramp advances on its own.
pub fn should_reselect(from: TempRegion, to: TempRegion) -> bool {
    matches!(
        (from, to),
        (TempRegion::LittleCool, TempRegion::PreNormal)
            | (TempRegion::PreNormal, TempRegion::LittleCool)
            | (TempRegion::LittleWarm, TempRegion::Warm)
            | (TempRegion::Warm, TempRegion::LittleWarm)
    )
}

/// State of charge bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SocBucket {
    /// Below the first bound
    Low,
    /// Between the bounds
    Mid,
    /// At or above the second bound
    High,
}

impl SocBucket {
    /// Classify a state of charge
    pub fn classify(soc: u8, bounds: [u8; 2]) -> Self {
        if soc < bounds[0] {
            SocBucket::Low
        } else if soc < bounds[1] {
            SocBucket::Mid
        } else {
            SocBucket::High
        }
    }
}

/// Curve family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CurveKind {
    /// First party transmitter
    Standard,
    /// First party transmitter at or above the high power threshold
    HighPower,
    /// Magnetic cover attached
    MagCover,
    /// Transmitter from another vendor
    ThirdParty,
}

impl CurveKind {
    /// Pick the curve family for a transmitter
    pub fn select(vendor_id: Option<u8>, mag_cover: bool, adapter_power_mw: u32, high_power_threshold_mw: u32) -> Self {
        if vendor_id.is_some_and(|vendor| vendor != 0) {
            CurveKind::ThirdParty
        } else if mag_cover {
            CurveKind::MagCover
        } else if adapter_power_mw >= high_power_threshold_mw {
            CurveKind::HighPower
        } else {
            CurveKind::Standard
        }
    }
}

/// Identifies one curve in a [`CurveSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CurveSel {
    /// Family
    pub kind: CurveKind,
    /// Soc bucket at selection
    pub bucket: SocBucket,
    /// Temperature region at selection
    pub region: TempRegion,
}

impl CurveSet {
    /// Look up a curve, `None` if fast charge is not allowed in the region
    pub fn curve(&self, sel: CurveSel) -> Option<&'static [FastChargeStep]> {
        let table = match sel.kind {
            CurveKind::Standard => &self.standard,
            CurveKind::HighPower => &self.high_power,
            CurveKind::MagCover => &self.mag_cover,
            CurveKind::ThirdParty => &self.third_party,
        };
        let column = sel.region.fast_index()?;
        let curve = table[sel.bucket as usize][column];
        if curve.is_empty() {
            None
        } else {
            Some(&curve[..curve.len().min(MAX_STEPS)])
        }
    }
}

/// Battery readings consumed by the ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RampInput {
    /// Battery voltage
    pub vbat_mv: u32,
    /// Battery temperature
    pub tbatt_dc: i32,
    /// State of charge
    pub soc: u8,
}

/// Result of one ramp cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RampOutcome {
    /// Level unchanged
    Hold,
    /// Moved to the next level
    Advanced,
    /// Returned to the previous level
    FellBack,
    /// Voltage ceiling of the last step reached
    Ffc,
    /// Soc limit reached
    Done,
    /// Too hot for the last step
    TooHot,
}

/// Working state of the fast charge current ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ramp {
    /// Selected curve
    pub sel: CurveSel,
    /// Index into the curve
    pub level: usize,
    /// Levels entered because of temperature, those may fall back
    pub allow_fallback: [bool; MAX_STEPS],
    /// Cycles spent above the voltage ceiling of a step that needs to wait
    pub wait_count: u8,
}

impl Ramp {
    /// Start a ramp at the first step whose ceiling is above the battery voltage
    pub fn start(sel: CurveSel, curve: &[FastChargeStep], vbat_mv: u32) -> Self {
        let last = curve.len().saturating_sub(1);
        let level = curve
            .iter()
            .position(|step| step.vol_max_mv > vbat_mv)
            .unwrap_or(last);
        Self {
            sel,
            level,
            allow_fallback: [false; MAX_STEPS],
            wait_count: 0,
        }
    }

    /// Run one cycle of the ramp
    pub fn step(
        &mut self,
        curve: &[FastChargeStep],
        input: RampInput,
        max_soc: u8,
        need_wait_cycles: u8,
    ) -> RampOutcome {
        if input.soc >= max_soc {
            return RampOutcome::Done;
        }

        let Some(step) = curve.get(self.level) else {
            return RampOutcome::TooHot;
        };
        let last = self.level + 1 >= curve.len();

        if input.tbatt_dc > step.high_threshold_dc {
            self.wait_count = 0;
            if last {
                return RampOutcome::TooHot;
            }
            self.level += 1;
            self.allow_fallback[self.level] = true;
            return RampOutcome::Advanced;
        }

        if input.vbat_mv >= step.vol_max_mv {
            if step.need_wait && self.wait_count < need_wait_cycles {
                self.wait_count += 1;
                return RampOutcome::Hold;
            }
            self.wait_count = 0;
            if last {
                return RampOutcome::Ffc;
            }
            self.level += 1;
            self.allow_fallback[self.level] = false;
            return RampOutcome::Advanced;
        }

        self.wait_count = 0;
        if input.tbatt_dc < step.low_threshold_dc && self.level > 0 && self.allow_fallback[self.level] {
            self.allow_fallback[self.level] = false;
            self.level -= 1;
            return RampOutcome::FellBack;
        }

        RampOutcome::Hold
    }

    /// Battery current for the current level
    pub fn curr_ma(&self, curve: &[FastChargeStep]) -> Option<u32> {
        curve.get(self.level).map(|step| step.curr_ma)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;

    const CURVE: &[FastChargeStep] = &[
        FastChargeStep {
            low_threshold_dc: 0,
            high_threshold_dc: 390,
            curr_ma: 5000,
            vol_max_mv: 8300,
            need_wait: false,
        },
        FastChargeStep {
            low_threshold_dc: 360,
            high_threshold_dc: 400,
            curr_ma: 4000,
            vol_max_mv: 8500,
            need_wait: false,
        },
        FastChargeStep {
            low_threshold_dc: 370,
            high_threshold_dc: 410,
            curr_ma: 3000,
            vol_max_mv: 8700,
            need_wait: true,
        },
    ];

    fn sel() -> CurveSel {
        CurveSel {
            kind: CurveKind::Standard,
            bucket: SocBucket::Low,
            region: TempRegion::Normal,
        }
    }

    fn input(vbat_mv: u32, tbatt_dc: i32) -> RampInput {
        RampInput {
            vbat_mv,
            tbatt_dc,
            soc: 40,
        }
    }

    #[test]
    fn test_classify_regions() {
        let bounds = Config::default().temp_bounds_dc;
        assert_eq!(TempRegion::classify(-10, &bounds), TempRegion::Cold);
        assert_eq!(TempRegion::classify(0, &bounds), TempRegion::LittleCold);
        assert_eq!(TempRegion::classify(150, &bounds), TempRegion::LittleCool);
        assert_eq!(TempRegion::classify(160, &bounds), TempRegion::PreNormal);
        assert_eq!(TempRegion::classify(250, &bounds), TempRegion::Normal);
        assert_eq!(TempRegion::classify(400, &bounds), TempRegion::Warm);
        assert_eq!(TempRegion::classify(450, &bounds), TempRegion::Hot);
        assert_eq!(TempRegion::Cold.fast_index(), None);
        assert_eq!(TempRegion::LittleCold.fast_index(), Some(0));
        assert_eq!(TempRegion::Warm.fast_index(), Some(6));
    }

    #[test]
    fn test_soc_buckets() {
        assert_eq!(SocBucket::classify(29, [30, 70]), SocBucket::Low);
        assert_eq!(SocBucket::classify(30, [30, 70]), SocBucket::Mid);
        assert_eq!(SocBucket::classify(95, [30, 70]), SocBucket::High);
    }

    #[test]
    fn test_reselect_whitelist() {
        assert!(should_reselect(TempRegion::LittleCool, TempRegion::PreNormal));
        assert!(should_reselect(TempRegion::PreNormal, TempRegion::LittleCool));
        assert!(should_reselect(TempRegion::LittleWarm, TempRegion::Warm));
        assert!(should_reselect(TempRegion::Warm, TempRegion::LittleWarm));
        assert!(!should_reselect(TempRegion::PreNormal, TempRegion::Normal));
        assert!(!should_reselect(TempRegion::Cool, TempRegion::LittleCool));
        assert!(!should_reselect(TempRegion::Normal, TempRegion::LittleWarm));
    }

    #[test]
    fn test_curve_lookup() {
        let curves = Config::default().curves;
        let mut sel = sel();
        assert!(curves.curve(sel).is_some());
        sel.region = TempRegion::Hot;
        assert!(curves.curve(sel).is_none());
    }

    #[test]
    fn test_start_skips_completed_steps() {
        assert_eq!(Ramp::start(sel(), CURVE, 8000).level, 0);
        assert_eq!(Ramp::start(sel(), CURVE, 8400).level, 1);
        assert_eq!(Ramp::start(sel(), CURVE, 9000).level, 2);
    }

    #[test]
    fn test_voltage_advance_does_not_fall_back() {
        let mut ramp = Ramp::start(sel(), CURVE, 8000);
        assert_eq!(ramp.step(CURVE, input(8300, 250), 90, 3), RampOutcome::Advanced);
        assert_eq!(ramp.level, 1);
        // Cold enough to fall back, but the advance was not caused by temperature
        assert_eq!(ramp.step(CURVE, input(8300, 100), 90, 3), RampOutcome::Hold);
        assert_eq!(ramp.level, 1);
    }

    #[test]
    fn test_temperature_advance_falls_back() {
        let mut ramp = Ramp::start(sel(), CURVE, 8000);
        assert_eq!(ramp.step(CURVE, input(8000, 395), 90, 3), RampOutcome::Advanced);
        assert_eq!(ramp.level, 1);
        assert!(ramp.allow_fallback[1]);
        assert_eq!(ramp.step(CURVE, input(8000, 350), 90, 3), RampOutcome::FellBack);
        assert_eq!(ramp.level, 0);
        // Only once per temperature advance
        assert_eq!(ramp.step(CURVE, input(8000, 350), 90, 3), RampOutcome::Hold);
    }

    #[test]
    fn test_level_only_drops_through_fallback() {
        let mut ramp = Ramp::start(sel(), CURVE, 8000);
        let readings = [
            (8100, 250),
            (8300, 395),
            (8300, 100),
            (8600, 405),
            (8600, 300),
            (8700, 300),
            (8700, 300),
            (8700, 300),
            (8700, 300),
        ];
        for (vbat, temp) in readings {
            let before = ramp.level;
            let allowed = ramp.allow_fallback[before];
            let outcome = ramp.step(CURVE, input(vbat, temp), 90, 3);
            if ramp.level < before {
                assert_eq!(outcome, RampOutcome::FellBack);
                assert!(allowed);
            }
        }
    }

    #[test]
    fn test_last_step_routes_to_ffc_or_done() {
        let mut ramp = Ramp::start(sel(), CURVE, 8600);
        assert_eq!(ramp.level, 2);
        // Needs to wait before advancing past a waiting step
        for _ in 0..3 {
            assert_eq!(ramp.step(CURVE, input(8700, 300), 90, 3), RampOutcome::Hold);
        }
        assert_eq!(ramp.step(CURVE, input(8700, 300), 90, 3), RampOutcome::Ffc);

        let mut ramp = Ramp::start(sel(), CURVE, 8600);
        let full = RampInput {
            vbat_mv: 8600,
            tbatt_dc: 300,
            soc: 90,
        };
        assert_eq!(ramp.step(CURVE, full, 90, 3), RampOutcome::Done);

        let mut ramp = Ramp::start(sel(), CURVE, 8600);
        assert_eq!(ramp.step(CURVE, input(8600, 420), 90, 3), RampOutcome::TooHot);
    }

    #[test]
    fn test_curve_kind_selection() {
        assert_eq!(CurveKind::select(Some(3), false, 65000, 50000), CurveKind::ThirdParty);
        assert_eq!(CurveKind::select(Some(0), true, 65000, 50000), CurveKind::MagCover);
        assert_eq!(CurveKind::select(None, false, 65000, 50000), CurveKind::HighPower);
        assert_eq!(CurveKind::select(None, false, 30000, 50000), CurveKind::Standard);
    }
}
