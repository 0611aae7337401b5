//! Receiver IC interface
use core::future::Future;

use super::{FodMode, RxMode, TrxError, TrxStatus};

/// Maximum length of an outbound message
pub const MAX_MSG_LEN: usize = 5;

/// Receiver IC operations
///
/// Implemented once per physical IC family. The same IC also drives the transmit path
/// when the device charges another device.
pub trait RxController {
    /// Type of error returned by the bus
    type BusError;

    /// Returns true if the receiver is powered by a transmitter
    fn is_connected(&mut self) -> impl Future<Output = Result<bool, Self::BusError>>;
    /// Enable or disable the receive path
    fn set_rx_enable(&mut self, enable: bool) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Output voltage in mV
    fn get_vout(&mut self) -> impl Future<Output = Result<u32, Self::BusError>>;
    /// Request an output voltage in mV
    fn set_vout(&mut self, vout_mv: u32) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Rectifier voltage in mV
    fn get_vrect(&mut self) -> impl Future<Output = Result<u32, Self::BusError>>;
    /// Output current in mA
    fn get_iout(&mut self) -> impl Future<Output = Result<u32, Self::BusError>>;
    /// Last control error packet value
    fn get_cep(&mut self) -> impl Future<Output = Result<i32, Self::BusError>>;
    /// Negotiated receiver mode
    fn get_rx_mode(&mut self) -> impl Future<Output = Result<RxMode, Self::BusError>>;
    /// Switch the receiver mode
    fn set_rx_mode(&mut self, mode: RxMode) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Enable or disable the output DC/DC
    fn set_dcdc_enable(&mut self, enable: bool) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Send up to [`MAX_MSG_LEN`] bytes, `raw` bypasses the IC's own packet header
    fn send_msg(&mut self, msg: &[u8], raw: bool) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Load a foreign object detection parameter set
    fn set_fod_parm(
        &mut self,
        parm: &[u8],
        mode: FodMode,
        magcvr: bool,
    ) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Send the Q factor calibration
    fn send_match_q(&mut self, q: [u8; 2]) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Select the communication capability
    fn set_rx_comu(&mut self, comu: u8) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Block new insertions from being reported
    fn set_insert_disable(&mut self, disable: bool) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Receiver firmware version
    fn get_rx_version(&mut self) -> impl Future<Output = Result<u32, Self::BusError>>;

    /// Transmitter status
    fn get_trx_status(&mut self) -> impl Future<Output = Result<TrxStatus, Self::BusError>>;
    /// Transmitter error flags
    fn get_trx_err(&mut self) -> impl Future<Output = Result<TrxError, Self::BusError>>;
    /// Transmitter output voltage in mV
    fn get_trx_vol(&mut self) -> impl Future<Output = Result<u32, Self::BusError>>;
    /// Transmitter output current in mA
    fn get_trx_curr(&mut self) -> impl Future<Output = Result<u32, Self::BusError>>;
    /// Power the transmit path
    fn set_trx_enable(&mut self, enable: bool) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Start or stop pinging for a receiver
    fn set_trx_start(&mut self, start: bool) -> impl Future<Output = Result<(), Self::BusError>>;
}
