//! Charger interfaces driven by the wireless path
use core::future::Future;

/// Charge pump used for fast charge
pub trait FastChargeController {
    /// Type of error returned by the bus
    type BusError;

    /// Enable or disable the charge pump
    fn set_enable(&mut self, enable: bool) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Start or stop switching
    fn start(&mut self, start: bool) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Returns true if the charge pump is switching
    fn is_started(&mut self) -> impl Future<Output = Result<bool, Self::BusError>>;
}

/// Buck charger used outside of fast charge
pub trait NormalCharger {
    /// Type of error returned by the bus
    type BusError;

    /// Input current limit in mA
    fn set_icl(&mut self, icl_ma: u32) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Fast charge current in mA
    fn set_fcc(&mut self, fcc_ma: u32) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Float voltage in mV
    fn set_fv(&mut self, fv_mv: u32) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Suspend the charger input
    fn set_input_suspend(&mut self, suspend: bool) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Enable or disable charging
    fn set_charge_enable(&mut self, enable: bool) -> impl Future<Output = Result<(), Self::BusError>>;
    /// Rerun input current limit detection
    fn rerun_aicl(&mut self) -> impl Future<Output = Result<(), Self::BusError>>;
}
