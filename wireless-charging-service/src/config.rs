//! Configuration types for the wireless charging service
//!
//! Numeric defaults are placeholders for product calibration data. Temperatures are in
//! tenths of a degree Celsius, voltages in mV and currents in mA.
use embassy_time::Duration;

/// Number of temperature regions fast charge is allowed in
pub const FAST_TEMP_REGIONS: usize = 7;
/// Number of state of charge buckets
pub const SOC_BUCKETS: usize = 3;
/// Maximum number of steps in a fast charge curve
pub const MAX_STEPS: usize = 8;

/// One stage of the fast charge current ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FastChargeStep {
    /// Below this battery temperature a temperature triggered advance may be undone
    pub low_threshold_dc: i32,
    /// Above this battery temperature the ramp advances to the next step
    pub high_threshold_dc: i32,
    /// Battery current for this step
    pub curr_ma: u32,
    /// Battery voltage at which this step is complete
    pub vol_max_mv: u32,
    /// Require the voltage to stay above `vol_max_mv` for several cycles before advancing
    pub need_wait: bool,
}

const fn step(
    low_threshold_dc: i32,
    high_threshold_dc: i32,
    curr_ma: u32,
    vol_max_mv: u32,
    need_wait: bool,
) -> FastChargeStep {
    FastChargeStep {
        low_threshold_dc,
        high_threshold_dc,
        curr_ma,
        vol_max_mv,
        need_wait,
    }
}

/// A fast charge curve
pub type Curve = &'static [FastChargeStep];

/// Curves indexed by soc bucket, then by fast charge temperature region
pub type CurveTable = [[Curve; FAST_TEMP_REGIONS]; SOC_BUCKETS];

/// Curve tables for each adapter generation
#[derive(Debug)]
pub struct CurveSet {
    /// First party adapters below the high power threshold
    pub standard: CurveTable,
    /// First party adapters at or above the high power threshold
    pub high_power: CurveTable,
    /// Magnetic cover attached
    pub mag_cover: CurveTable,
    /// Third party transmitters
    pub third_party: CurveTable,
}

/// Power lookup entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerEntry {
    /// Code reported by the transmitter
    pub code: u8,
    /// Power in mW
    pub power_mw: u32,
}

/// Foreign object detection calibration for a transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FodEntry {
    /// Transmitter id, `None` for the default entry
    pub tx_id: Option<u16>,
    /// Parameters for baseline and extended power
    pub parm: [u8; 12],
    /// Parameters for fast charge
    pub fast_parm: [u8; 12],
    /// Q factor calibration
    pub match_q: [u8; 2],
}

/// Output voltage correction step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VoutStep {
    /// Minimum absolute current error for this step size
    pub error_ma: u32,
    /// Voltage step
    pub step_mv: u32,
}

/// Fixed output profile used by a charging state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Profile {
    /// Receiver output voltage
    pub vout_mv: u32,
    /// Normal charger input current limit
    pub icl_ma: u32,
}

/// Wireless charging service configuration
#[derive(Clone, Copy)]
pub struct Config {
    /// Bounds between the nine temperature regions, ascending
    pub temp_bounds_dc: [i32; 8],
    /// Bounds between the three soc buckets, ascending
    pub soc_bounds: [u8; 2],
    /// Charging stops outside of this battery temperature window
    pub charge_temp_window_dc: (i32, i32),
    /// Margin inside the window required to resume charging
    pub charge_temp_recover_dc: i32,

    /// Attempts to identify the adapter
    pub identify_retry: u8,
    /// Wait for a response to a blocking command
    pub msg_wait: Duration,
    /// Interval between resends of an unacknowledged message
    pub resend_interval: Duration,
    /// Maximum number of resends
    pub resend_max: u8,

    /// Power of adapters by adapter id
    pub base_power: &'static [PowerEntry],
    /// Receive power by the code in the fast charge entry response
    pub f2_power: &'static [PowerEntry],
    /// Power assumed when the adapter id is unknown
    pub default_power_mw: u32,
    /// Adapters at or above this power use the high power curves
    pub high_power_threshold_mw: u32,
    /// Nominal battery voltage used to turn power into a current cap
    pub nominal_mv: u32,
    /// EPP power capability at or above which the link runs as EPP plus
    pub epp_plus_min_mw: u32,
    /// EPP power capability below which the link runs as 5 W EPP
    pub epp_min_mw: u32,
    /// Receiver communication capability during normal charging
    pub rx_comu_base: u8,
    /// Receiver communication capability while the charge pump runs
    pub rx_comu_fast: u8,
    /// FOD calibration, the entry without a transmitter id is the default
    pub fod: &'static [FodEntry],
    /// Curve tables
    pub curves: &'static CurveSet,

    /// Baseline power profile
    pub bpp: Profile,
    /// Extended power profile
    pub epp: Profile,
    /// Extended power profile plus
    pub epp_plus: Profile,
    /// Quiet mode profile
    pub quiet: Profile,
    /// Factory test profile
    pub ftm: Profile,
    /// Normal charger charge current
    pub nor_fcc_ma: u32,
    /// Normal charger float voltage
    pub nor_fv_mv: u32,
    /// Input current limit ramp step
    pub nor_icl_step_ma: u32,
    /// Delay between normal charger input current steps
    pub nor_icl_step_delay: Duration,
    /// Poll interval of the normal charging states
    pub rx_poll_interval: Duration,
    /// Consecutive state handler failures before the error state
    pub rx_err_max: u8,

    /// FFC charge current
    pub ffc_fcc_ma: u32,
    /// FFC float voltage
    pub ffc_fv_mv: u32,
    /// FFC ends below this battery current
    pub ffc_cutoff_ma: u32,
    /// FFC ends after this long regardless of current
    pub ffc_timeout: Duration,
    /// Input current limit once charging is done
    pub done_icl_ma: u32,
    /// Recharge below this soc
    pub recharge_soc: u8,

    /// No fast charge at or above this soc
    pub fast_max_soc: u8,
    /// No fast charge above this battery voltage
    pub fast_vbat_max_mv: u32,
    /// Leave fast charge when other limits allow less than this current
    pub fast_min_curr_ma: u32,
    /// Charge pump division ratio
    pub cp_ratio: u32,
    /// Fast charge output voltage window
    pub fast_vout_window_mv: (u32, u32),
    /// Rectifier voltage confirming the transmitter switched to fast mode
    pub fast_vrect_min_mv: u32,
    /// Time allowed for the transmitter to switch to fast mode
    pub wait_fast_timeout: Duration,
    /// Output current confirming power flows
    pub wait_iout_min_ma: u32,
    /// Attempts to see output current, AICL is rerun halfway through
    pub wait_iout_retry: u8,
    /// Largest output voltage change per step while ramping up
    pub vout_ramp_step_mv: u32,
    /// Output voltage considered on target
    pub vout_tolerance_mv: u32,
    /// Time allowed to reach the target output voltage
    pub wait_vout_timeout: Duration,
    /// Initial offset above the charge pump input voltage
    pub vout_offset_mv: u32,
    /// Offset bump when the output current is insufficient
    pub vout_offset_step_mv: u32,
    /// Largest offset
    pub vout_offset_max_mv: u32,
    /// Output current required before starting the charge pump
    pub fast_check_iout_ma: u32,
    /// Interval between fast charge entry steps
    pub fast_enter_interval: Duration,
    /// Poll interval while fast charging
    pub fast_poll_interval: Duration,
    /// Normal charger input current limit while the charge pump runs
    pub fast_nor_icl_ma: u32,
    /// Cycles `vol_max_mv` has to be exceeded for steps that need to wait
    pub need_wait_cycles: u8,
    /// Delay before fast charge may be retried after leaving it
    pub fast_retry_holdoff: Duration,
    /// Fast charge is disabled for the session after this many failed attempts
    pub fast_fail_max: u8,
    /// Battery current limit for VOOC adapters
    pub vooc_max_curr_ma: u32,
    /// Battery current limit for SVOOC adapters
    pub svooc_max_curr_ma: u32,
    /// Battery current limit for PD 65W adapters
    pub pd65w_max_curr_ma: u32,
    /// Battery current limit
    pub batt_max_curr_ma: u32,
    /// Margin kept below the battery current limit
    pub batt_curr_margin_ma: u32,
    /// Fast charge current cap for each cool down level, level 0 is uncapped
    pub cool_down_curr_ma: &'static [u32],
    /// Interval between battery reports to the transmitter
    pub batt_info_interval: Duration,

    /// Controller period
    pub ctrl_period: Duration,
    /// A control error packet within this magnitude is trusted
    pub cep_tolerance: u32,
    /// Output voltage correction steps, largest error first
    pub vout_steps: [VoutStep; 4],
    /// Consecutive untrusted samples before fast charge is abandoned
    pub cep_err_max: u8,
    /// Current cap for each skew notch, strictest last
    pub skew_curr_ma: &'static [u32],
    /// Consecutive trusted samples before a notch is relaxed
    pub skew_ok_max: u8,
    /// Consecutive untrusted samples before a notch is tightened
    pub skew_bad_max: u8,
    /// Minimum time between notch changes before relaxing
    pub skew_cool_off: Duration,
    /// Ramp levels that leave fast charge when the strictest notch is not enough, one bit per level
    pub skew_exit_levels: u32,
    /// Discharge current considered an anomaly
    pub discharge_threshold_ma: u32,
    /// Consecutive discharge samples tolerated
    pub discharge_cycles: u8,
    /// Output current considered too low
    pub low_iout_ma: u32,
    /// Consecutive low output samples tolerated
    pub low_iout_cycles: u8,

    /// Overall authentication deadline
    pub verity_deadline: Duration,
    /// Requests for authentication input data
    pub verity_data_retry: u8,
    /// Wait for authentication input data
    pub verity_data_wait: Duration,
    /// Attempts per authentication chunk
    pub verity_chunk_retry: u8,
    /// Wait for a chunk acknowledgement
    pub verity_chunk_wait: Duration,
    /// Delay before retrying a chunk
    pub verity_backoff: Duration,
    /// Fast charge current cap after a failed authentication
    pub verity_fail_curr_ma: u32,
    /// Receive path power cycle after a failed authentication
    pub verity_power_cycle: Duration,
    /// Delay before the connection keep-alive is cleared
    pub verity_keep_clear_delay: Duration,

    /// Transmit path poll interval
    pub trx_poll_interval: Duration,
    /// Delay before restarting the transmitter after a retryable fault
    pub trx_retry_delay: Duration,
    /// Maximum restarts per enable
    pub trx_retry_max: u8,
    /// Transfers longer than this are reported
    pub trx_usage_threshold: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_bounds_dc: [0, 50, 120, 160, 220, 340, 380, 430],
            soc_bounds: [30, 70],
            charge_temp_window_dc: (-100, 530),
            charge_temp_recover_dc: 20,

            identify_retry: 3,
            msg_wait: Duration::from_secs(2),
            resend_interval: Duration::from_secs(1),
            resend_max: 10,

            base_power: BASE_POWER,
            f2_power: F2_POWER,
            default_power_mw: 20000,
            high_power_threshold_mw: 50000,
            nominal_mv: 7600,
            epp_plus_min_mw: 11000,
            epp_min_mw: 10000,
            rx_comu_base: 1,
            rx_comu_fast: 2,
            fod: FOD,
            curves: &CURVES,

            bpp: Profile {
                vout_mv: 5000,
                icl_ma: 1000,
            },
            epp: Profile {
                vout_mv: 9000,
                icl_ma: 1100,
            },
            epp_plus: Profile {
                vout_mv: 12000,
                icl_ma: 1250,
            },
            quiet: Profile {
                vout_mv: 9000,
                icl_ma: 800,
            },
            ftm: Profile {
                vout_mv: 5000,
                icl_ma: 500,
            },
            nor_fcc_ma: 2000,
            nor_fv_mv: 8900,
            nor_icl_step_ma: 100,
            nor_icl_step_delay: Duration::from_millis(50),
            rx_poll_interval: Duration::from_secs(1),
            rx_err_max: 5,

            ffc_fcc_ma: 1000,
            ffc_fv_mv: 8960,
            ffc_cutoff_ma: 600,
            ffc_timeout: Duration::from_secs(30 * 60),
            done_icl_ma: 300,
            recharge_soc: 98,

            fast_max_soc: 90,
            fast_vbat_max_mv: 8900,
            fast_min_curr_ma: 1000,
            cp_ratio: 2,
            fast_vout_window_mv: (10000, 20000),
            fast_vrect_min_mv: 9500,
            wait_fast_timeout: Duration::from_secs(3),
            wait_iout_min_ma: 200,
            wait_iout_retry: 10,
            vout_ramp_step_mv: 1000,
            vout_tolerance_mv: 200,
            wait_vout_timeout: Duration::from_secs(10),
            vout_offset_mv: 300,
            vout_offset_step_mv: 200,
            vout_offset_max_mv: 1000,
            fast_check_iout_ma: 300,
            fast_enter_interval: Duration::from_millis(100),
            fast_poll_interval: Duration::from_millis(500),
            fast_nor_icl_ma: 100,
            need_wait_cycles: 3,
            fast_retry_holdoff: Duration::from_secs(10),
            fast_fail_max: 3,
            vooc_max_curr_ma: 2000,
            svooc_max_curr_ma: 5000,
            pd65w_max_curr_ma: 6000,
            batt_max_curr_ma: 6000,
            batt_curr_margin_ma: 200,
            cool_down_curr_ma: COOL_DOWN,
            batt_info_interval: Duration::from_secs(5),

            ctrl_period: Duration::from_millis(500),
            cep_tolerance: 3,
            vout_steps: [
                VoutStep {
                    error_ma: 1000,
                    step_mv: 400,
                },
                VoutStep {
                    error_ma: 500,
                    step_mv: 200,
                },
                VoutStep {
                    error_ma: 200,
                    step_mv: 100,
                },
                VoutStep {
                    error_ma: 50,
                    step_mv: 20,
                },
            ],
            cep_err_max: 12,
            skew_curr_ma: SKEW,
            skew_ok_max: 10,
            skew_bad_max: 3,
            skew_cool_off: Duration::from_secs(30),
            skew_exit_levels: 0b1000,
            discharge_threshold_ma: 500,
            discharge_cycles: 3,
            low_iout_ma: 100,
            low_iout_cycles: 10,

            verity_deadline: Duration::from_secs(40),
            verity_data_retry: 3,
            verity_data_wait: Duration::from_secs(2),
            verity_chunk_retry: 5,
            verity_chunk_wait: Duration::from_secs(1),
            verity_backoff: Duration::from_millis(500),
            verity_fail_curr_ma: 1500,
            verity_power_cycle: Duration::from_millis(500),
            verity_keep_clear_delay: Duration::from_secs(5),

            trx_poll_interval: Duration::from_millis(500),
            trx_retry_delay: Duration::from_secs(2),
            trx_retry_max: 3,
            trx_usage_threshold: Duration::from_secs(120),
        }
    }
}

const BASE_POWER: &[PowerEntry] = &[
    PowerEntry {
        code: 0x00,
        power_mw: 20000,
    },
    PowerEntry {
        code: 0x01,
        power_mw: 30000,
    },
    PowerEntry {
        code: 0x02,
        power_mw: 40000,
    },
    PowerEntry {
        code: 0x03,
        power_mw: 50000,
    },
    PowerEntry {
        code: 0x04,
        power_mw: 65000,
    },
];

const F2_POWER: &[PowerEntry] = &[
    PowerEntry {
        code: 0x01,
        power_mw: 30000,
    },
    PowerEntry {
        code: 0x02,
        power_mw: 40000,
    },
    PowerEntry {
        code: 0x03,
        power_mw: 50000,
    },
];

const FOD: &[FodEntry] = &[
    FodEntry {
        tx_id: None,
        parm: [0xa0, 0x64, 0xa0, 0x5a, 0x96, 0x5f, 0x96, 0x60, 0x8c, 0x64, 0x8c, 0x6e],
        fast_parm: [0xa0, 0x78, 0xa0, 0x78, 0x96, 0x6e, 0x96, 0x78, 0x8c, 0x78, 0x8c, 0x82],
        match_q: [0x38, 0x30],
    },
    FodEntry {
        tx_id: Some(0x0301),
        parm: [0xa0, 0x5a, 0xa0, 0x50, 0x96, 0x55, 0x96, 0x58, 0x8c, 0x5a, 0x8c, 0x64],
        fast_parm: [0xa0, 0x6e, 0xa0, 0x6e, 0x96, 0x64, 0x96, 0x6e, 0x8c, 0x6e, 0x8c, 0x78],
        match_q: [0x44, 0x30],
    },
];

const COOL_DOWN: &[u32] = &[0, 5000, 4000, 3000, 2000, 1500, 1000, 500];

const SKEW: &[u32] = &[3000, 2000, 1500];

const COLD: &[FastChargeStep] = &[step(0, 120, 1500, 8700, false), step(0, 160, 1000, 8800, true)];

const COOL: &[FastChargeStep] = &[
    step(0, 200, 3000, 8400, false),
    step(100, 220, 2000, 8700, true),
    step(120, 240, 1000, 8850, true),
];

const NORMAL: &[FastChargeStep] = &[
    step(0, 390, 5000, 8300, false),
    step(360, 400, 4000, 8500, false),
    step(370, 410, 3000, 8700, true),
    step(380, 420, 2000, 8850, true),
    step(390, 430, 1000, 8900, true),
];

const NORMAL_HIGH: &[FastChargeStep] = &[
    step(0, 390, 6000, 8200, false),
    step(360, 400, 5000, 8400, false),
    step(370, 410, 4000, 8600, true),
    step(380, 420, 2500, 8800, true),
    step(390, 430, 1000, 8900, true),
];

const WARM: &[FastChargeStep] = &[step(0, 420, 2000, 8600, false), step(400, 430, 1000, 8800, true)];

const LATE: &[FastChargeStep] = &[step(0, 400, 2000, 8800, true), step(380, 430, 1000, 8900, true)];

const MAG_COVER: &[FastChargeStep] = &[
    step(0, 380, 3000, 8500, false),
    step(360, 400, 2000, 8800, true),
    step(380, 420, 1000, 8900, true),
];

const THIRD_PARTY: &[FastChargeStep] = &[step(0, 400, 2000, 8700, false), step(380, 420, 1000, 8900, true)];

/// Rows run little cold, cool, little cool, pre normal, normal, little warm, warm
const fn table(cold: Curve, cool: Curve, normal: Curve, warm: Curve, late: Curve) -> CurveTable {
    [
        [cold, cool, cool, normal, normal, normal, warm],
        [cold, cool, cool, normal, normal, warm, warm],
        [late, late, late, late, late, late, late],
    ]
}

static CURVES: CurveSet = CurveSet {
    standard: table(COLD, COOL, NORMAL, WARM, LATE),
    high_power: table(COLD, COOL, NORMAL_HIGH, WARM, LATE),
    mag_cover: table(COLD, MAG_COVER, MAG_COVER, WARM, LATE),
    third_party: table(COLD, THIRD_PARTY, THIRD_PARTY, THIRD_PARTY, LATE),
};
