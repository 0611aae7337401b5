//! Device status shared by the service components
//!
//! Each field group is owned by one lock domain and can be read without waiting.
//! Groups are not updated transactionally with respect to each other, components
//! re-validate what they read before acting on it.
use core::cell::Cell;

use embassy_time::Instant;
use embedded_services::power::wireless::{AdapterType, RxMode, WlsType};

use crate::curve::{Ramp, TempRegion};
use crate::rx::fast::FastEnter;
use crate::rx::RxState;
use crate::topic::FastExit;
use crate::trx::TrxSession;
use crate::verity::VerityStatus;

/// Copyable status cell
pub struct Shared<T: Copy>(Cell<T>);

impl<T: Copy> Shared<T> {
    /// Create a new cell
    pub const fn new(value: T) -> Self {
        Self(Cell::new(value))
    }

    /// Current value
    pub fn get(&self) -> T {
        self.0.get()
    }

    /// Replace the value
    pub fn set(&self, value: T) {
        self.0.set(value)
    }

    /// Modify the value in place and return the result
    pub fn update(&self, f: impl FnOnce(&mut T)) -> T {
        let mut value = self.0.get();
        f(&mut value);
        self.0.set(value);
        value
    }
}

/// Connection lifecycle flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Connection {
    /// Receiver coil is powered
    pub present: bool,
    /// Charging session is established
    pub online: bool,
    /// Wired charger attached
    pub usb_present: bool,
    /// Receiver firmware is being upgraded
    pub fw_upgrading: bool,
    /// A receive path power cycle must not end the session
    pub keep_alive: bool,
}

/// What was learned about the transmitter during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Link {
    /// Negotiated charging mode
    pub wls_type: WlsType,
    /// Receiver mode
    pub rx_mode: RxMode,
    /// Adapter type reported by the transmitter
    pub adapter_type: AdapterType,
    /// Adapter id reported by the transmitter
    pub adapter_id: u8,
    /// Maximum negotiable power
    pub adapter_power_mw: u32,
    /// Receive power code from the fast charge entry response
    pub f2_code: Option<u8>,
    /// Transmitter id
    pub tx_id: Option<u16>,
    /// Transmitter vendor
    pub vendor_id: Option<u8>,
    /// Transmitter protocol version
    pub protocol_version: u8,
    /// Dock product id
    pub product_id: Option<u16>,
    /// Power the transmitter reports it can deliver
    pub tx_power_mw: Option<u32>,
    /// EPP power capability reported by the receiver
    pub epp_power_mw: Option<u32>,
    /// Receiver firmware version
    pub rx_version: Option<u32>,
    /// Transmitter confirmed quiet mode
    pub tx_quiet: bool,
}

/// Receiver measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxTelemetry {
    /// Output current
    pub iout_ma: u32,
    /// Output voltage
    pub vout_mv: u32,
    /// Rectifier voltage
    pub vrect_mv: u32,
    /// Last control error packet
    pub cep: i32,
}

/// Battery data received from peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Battery {
    /// Battery voltage
    pub vbat_mv: u32,
    /// Battery current, positive while charging
    pub ibat_ma: i32,
    /// Battery temperature
    pub tbatt_dc: i32,
    /// State of charge
    pub soc: u8,
    /// State of charge shown to the user
    pub ui_soc: u8,
    /// Thermal cool down level, 0 when not cooling down
    pub cool_down: u8,
}

impl Default for Battery {
    fn default() -> Self {
        Self {
            vbat_mv: 7600,
            ibat_ma: 0,
            tbatt_dc: 250,
            soc: 50,
            ui_soc: 50,
            cool_down: 0,
        }
    }
}

/// Forced output for the debug state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DebugSettings {
    /// Receiver output voltage
    pub vout_mv: u32,
    /// Normal charger input current limit
    pub icl_ma: u32,
}

/// Settings from the control surface, kept across sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Settings {
    /// Quiet mode requested
    pub quiet_mode: bool,
    /// Factory test mode
    pub ftm_mode: bool,
    /// Debug output override
    pub debug: Option<DebugSettings>,
    /// Magnetic cover attached
    pub mag_cover: bool,
}

/// RX state machine slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RxSlots {
    /// Active state
    pub current: RxState,
    /// State being entered, equal to `current` until its exit ran
    pub next: RxState,
    /// Requested state
    pub target: RxState,
    /// The state in `current` finished entering
    pub entered: bool,
    /// Consecutive handler failures
    pub errors: u8,
}

impl RxSlots {
    /// Returns true if the slots are stable or mid-transition in a valid way
    pub fn is_consistent(&self) -> bool {
        self.current == self.target || ((self.current == self.next) != (self.next == self.target))
    }
}

/// Fast charge working state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FastStatus {
    /// Entry sub-step progress
    pub enter: FastEnter,
    /// Charge pump running and the controller active
    pub running: bool,
    /// Current ramp
    pub ramp: Option<Ramp>,
    /// Temperature region observed in the previous cycle
    pub observed_region: Option<TempRegion>,
    /// Elected fast charge current
    pub target_curr_ma: u32,
    /// Last commanded output voltage
    pub vout_set_mv: u32,
    /// Exit requested by the controller or a message handler
    pub exit: Option<FastExit>,
    /// Fast charge may not be re-entered before this instant
    pub retry_after: Option<Instant>,
    /// Failed entries this session
    pub fail_count: u8,
    /// FFC start
    pub ffc_since: Option<Instant>,
    /// Last battery report sent to the transmitter
    pub batt_info_at: Option<Instant>,
}

/// Device status
pub struct DeviceStatus {
    /// Connection lifecycle
    pub conn: Shared<Connection>,
    /// Transmitter information
    pub link: Shared<Link>,
    /// Receiver measurements
    pub rx_telemetry: Shared<RxTelemetry>,
    /// Battery data
    pub battery: Shared<Battery>,
    /// Control surface settings
    pub settings: Shared<Settings>,
    /// Charge completed this session
    pub charge_done: Shared<bool>,
    /// Authentication
    pub verity: Shared<VerityStatus>,
    /// RX state machine
    pub rx: Shared<RxSlots>,
    /// Fast charge
    pub fast: Shared<FastStatus>,
    /// Transmit path
    pub trx: Shared<TrxSession>,
}

impl DeviceStatus {
    /// Create a new status
    pub fn new() -> Self {
        Self {
            conn: Shared::new(Connection::default()),
            link: Shared::new(Link::default()),
            rx_telemetry: Shared::new(RxTelemetry::default()),
            battery: Shared::new(Battery::default()),
            settings: Shared::new(Settings::default()),
            charge_done: Shared::new(false),
            verity: Shared::new(VerityStatus::default()),
            rx: Shared::new(RxSlots::default()),
            fast: Shared::new(FastStatus::default()),
            trx: Shared::new(TrxSession::default()),
        }
    }

    /// Reset everything scoped to a charging session
    ///
    /// Battery data, settings and the transmit path survive. The authentication outcome
    /// survives while the connection is kept alive.
    pub fn reset_session(&self) {
        let keep_alive = self.conn.get().keep_alive;
        self.link.set(Link::default());
        self.rx_telemetry.set(RxTelemetry::default());
        self.charge_done.set(false);
        self.rx.set(RxSlots::default());
        self.fast.set(FastStatus::default());
        if !keep_alive {
            self.verity.set(VerityStatus::default());
        }
    }

    /// Returns true if a charging session is established
    pub fn online(&self) -> bool {
        self.conn.get().online
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::new()
    }
}
