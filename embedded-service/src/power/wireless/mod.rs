//! Wireless charging related data structures and hardware interfaces
pub mod charger;
pub mod rx;
pub mod trx;

pub use charger::{FastChargeController, NormalCharger};
pub use rx::RxController;
pub use trx::{TrxError, TrxStatus};

/// Error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Bus error
    Bus,
    /// Timeout
    Timeout,
    /// Another request is already pending
    Busy,
    /// The operation was cancelled by a disconnect
    Cancelled,
    /// The receiver is not online
    Offline,
    /// Invalid response
    InvalidResponse,
    /// The operation is not valid in the current state
    InvalidState,
}

/// Negotiated charging mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WlsType {
    /// Not negotiated yet
    #[default]
    Unknown,
    /// Qi baseline power profile
    Bpp,
    /// Qi extended power profile
    Epp,
    /// Qi extended power profile plus
    EppPlus,
    /// Proprietary fast charge
    Vooc,
    /// Proprietary super fast charge
    Svooc,
    /// 65W PD based fast charge
    Pd65w,
    /// Acting as a transmitter
    Trx,
}

impl WlsType {
    /// Returns true if the mode supports the fast charge path
    pub fn is_fast(self) -> bool {
        matches!(self, WlsType::Vooc | WlsType::Svooc | WlsType::Pd65w)
    }
}

/// Receiver mode reported by the RX IC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RxMode {
    /// Baseline power profile
    #[default]
    Bpp,
    /// Extended power profile
    Epp,
    /// Extended power profile limited to 5W
    Epp5w,
    /// Extended power profile plus
    EppPlus,
}

/// Adapter type reported by the transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AdapterType {
    /// Unknown adapter
    #[default]
    Unknown,
    /// VOOC adapter
    Vooc,
    /// SVOOC adapter
    Svooc,
    /// Plain USB adapter
    Usb,
    /// Normal adapter
    Normal,
    /// EPP adapter
    Epp,
    /// 50W SVOOC adapter
    Svooc50w,
    /// 65W PD adapter
    Pd65w,
}

impl From<u8> for AdapterType {
    fn from(value: u8) -> Self {
        match value & 0x07 {
            1 => AdapterType::Vooc,
            2 => AdapterType::Svooc,
            3 => AdapterType::Usb,
            4 => AdapterType::Normal,
            5 => AdapterType::Epp,
            6 => AdapterType::Svooc50w,
            7 => AdapterType::Pd65w,
            _ => AdapterType::Unknown,
        }
    }
}

impl AdapterType {
    /// Charging mode this adapter negotiates, `None` if it depends on the receiver mode
    pub fn wls_type(self) -> Option<WlsType> {
        match self {
            AdapterType::Vooc => Some(WlsType::Vooc),
            AdapterType::Svooc | AdapterType::Svooc50w => Some(WlsType::Svooc),
            AdapterType::Pd65w => Some(WlsType::Pd65w),
            AdapterType::Unknown | AdapterType::Usb | AdapterType::Normal | AdapterType::Epp => None,
        }
    }
}

/// Foreign object detection parameter set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FodMode {
    /// Parameters for baseline power
    Bpp,
    /// Parameters for extended power
    Epp,
    /// Parameters for fast charge
    Fast,
}

/// Amount of power negotiated with a transmitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerCapability {
    /// Voltage in mV
    pub voltage_mv: u32,
    /// Max current in mA
    pub current_ma: u32,
}

impl PowerCapability {
    /// Calculate maximum power
    pub fn max_power_mw(&self) -> u32 {
        self.voltage_mv * self.current_ma / 1000
    }

    /// Current that `power_mw` allows at `voltage_mv`
    pub fn from_power(power_mw: u32, voltage_mv: u32) -> Self {
        let current_ma = if voltage_mv == 0 {
            0
        } else {
            power_mw.saturating_mul(1000) / voltage_mv
        };
        Self { voltage_mv, current_ma }
    }
}

/// Events reported by the RX IC driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IcEvent {
    /// Receiver powered by a transmitter
    Online,
    /// Receiver lost power
    Offline,
    /// Data packet received from the transmitter
    Message([u8; 6]),
    /// EPP power capability negotiated, in mW
    EppCapability(u32),
    /// IC status changed, the service should re-read it
    Changed,
}
