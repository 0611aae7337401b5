//! Items exchanged with the rest of the system
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embedded_services::mms::{Subscription, Topic};
use embedded_services::power::wireless::{TrxStatus, WlsType};

use crate::protocol::message::TxErrorCode;

/// Queue depth of each topic
pub const TOPIC_CAP: usize = 8;
/// Subscribers per topic
pub const TOPIC_SUBS: usize = 4;

/// Topic carrying [`WlsItem`] changes
pub type WirelessTopic = Topic<NoopRawMutex, WlsItem, TOPIC_CAP, TOPIC_SUBS>;
/// Topic carrying [`DiagEvent`]s
pub type DiagTopic = Topic<NoopRawMutex, DiagEvent, TOPIC_CAP, TOPIC_SUBS>;
/// Subscription to the wireless topic
pub type WirelessSubscription<'a> = Subscription<'a, NoopRawMutex, WlsItem, TOPIC_CAP, TOPIC_SUBS>;
/// Subscription to the diagnostics topic
pub type DiagSubscription<'a> = Subscription<'a, NoopRawMutex, DiagEvent, TOPIC_CAP, TOPIC_SUBS>;

/// Items published by the wireless service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WlsItem {
    /// Receiver coil is powered
    Present(bool),
    /// Charging session is established
    Online(bool),
    /// Negotiated charging mode
    WlsType(WlsType),
    /// Receiver output current
    Iout(u32),
    /// Receiver output voltage
    Vout(u32),
    /// Receiver firmware upgrade in progress
    FwUpgrading(bool),
    /// Transmit path is on
    TrxOnline(bool),
    /// Transmit path status
    TrxStatus(TrxStatus),
    /// Charge completed
    ChargeDone(bool),
    /// Transmitter passed authentication
    VerityPass(bool),
    /// Receiver firmware version, `None` before negotiation
    RxVersion(Option<u32>),
    /// Transmit output voltage
    TrxVout(u32),
    /// Transmit output current
    TrxIout(u32),
}

/// Identifies a [`WlsItem`] for pull-style reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WlsItemId {
    /// [`WlsItem::Present`]
    Present,
    /// [`WlsItem::Online`]
    Online,
    /// [`WlsItem::WlsType`]
    WlsType,
    /// [`WlsItem::Iout`]
    Iout,
    /// [`WlsItem::Vout`]
    Vout,
    /// [`WlsItem::FwUpgrading`]
    FwUpgrading,
    /// [`WlsItem::TrxOnline`]
    TrxOnline,
    /// [`WlsItem::TrxStatus`]
    TrxStatus,
    /// [`WlsItem::ChargeDone`]
    ChargeDone,
    /// [`WlsItem::VerityPass`]
    VerityPass,
    /// [`WlsItem::RxVersion`]
    RxVersion,
    /// [`WlsItem::TrxVout`]
    TrxVout,
    /// [`WlsItem::TrxIout`]
    TrxIout,
}

/// Updates received from peer services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PeerEvent {
    /// Fuel gauge readings
    Gauge {
        /// Battery voltage
        vbat_mv: u32,
        /// Battery current, positive while charging
        ibat_ma: i32,
        /// Battery temperature in 0.1 C
        tbatt_dc: i32,
        /// State of charge
        soc: u8,
    },
    /// Wired charger presence
    Wired {
        /// A wired charger is attached
        present: bool,
    },
    /// Common charging state
    Common {
        /// Thermal cool down level
        cool_down: u8,
        /// State of charge shown to the user
        ui_soc: u8,
    },
    /// Battery balancing limit
    BattBal {
        /// Current limit, `None` when balancing does not restrict charging
        limit_ma: Option<u32>,
    },
}

/// Reason for leaving fast charge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FastExit {
    /// Disabled by a vote
    #[default]
    Disabled,
    /// Quiet mode requested
    Quiet,
    /// Battery temperature outside the fast charge range
    Temperature,
    /// Battery voltage above the fast charge ceiling
    Voltage,
    /// Control error packets persistently out of tolerance
    Cep,
    /// Battery discharging while fast charging
    Discharge,
    /// Output current stayed too low
    LowOutput,
    /// Cool down limit below the fast charge minimum
    CoolDown,
    /// Handoff to full fast charge
    Ffc,
    /// Charge complete
    Done,
    /// Transmitter reported an error
    TxError,
    /// Strictest stability notch was not enough
    SkewFloor,
    /// Fast charge entry failed
    EntryFailed,
}

/// Diagnostic events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiagEvent {
    /// An IC operation failed
    IcError,
    /// A request to the transmitter timed out
    TransportTimeout,
    /// Authentication failed
    VerityFail,
    /// Fast charge was left
    FastExit(FastExit),
    /// Transmitter reported an error
    TxError(TxErrorCode),
    /// Stability current cap tightened, carries the new cap
    SkewTightened(u32),
    /// Stability current cap relaxed, carries the new cap or `None` when cleared
    SkewRecovered(Option<u32>),
    /// Transmit path fault
    TrxFault(u32),
    /// Long transmit session finished
    TrxUsage {
        /// Session length in seconds
        duration_s: u64,
    },
}
