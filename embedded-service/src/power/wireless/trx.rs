//! Transmit path status definitions
use bitflags::bitflags;

/// Transmitter status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TrxStatus {
    /// Transmit path is off
    #[default]
    Off,
    /// Ready to ping
    Ready,
    /// Digital ping in progress
    DigitalPing,
    /// Power transfer in progress
    Transfer,
}

/// Transmitter error flags
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrxError(pub u32);

bitflags! {
    impl TrxError: u32 {
        /// None
        const NONE = 0;
        /// Wired input attached while transmitting
        const RXAC = (1 << 0);
        /// Over current
        const OCP = (1 << 1);
        /// Over voltage
        const OVP = (1 << 2);
        /// Input voltage too low
        const LVP = (1 << 3);
        /// Foreign object detected
        const FOD = (1 << 4);
        /// Over temperature
        const OTP = (1 << 5);
        /// Receiver stopped sending control error packets
        const CEP_TIMEOUT = (1 << 6);
        /// Receiver ended the power transfer
        const RX_EPT = (1 << 7);
        /// Rectifier over voltage
        const VRECT_OVP = (1 << 8);
    }
}

impl TrxError {
    /// Flags that force the transmitter off
    pub const FAULTS: TrxError = TrxError(
        TrxError::OCP.0
            | TrxError::OVP.0
            | TrxError::LVP.0
            | TrxError::FOD.0
            | TrxError::OTP.0
            | TrxError::CEP_TIMEOUT.0
            | TrxError::RX_EPT.0
            | TrxError::VRECT_OVP.0,
    );

    /// Returns true if any fault flag is set
    pub fn is_fault(self) -> bool {
        self.intersects(Self::FAULTS)
    }

    /// Returns true if the fault allows the transmitter to restart
    pub fn is_retryable(self) -> bool {
        let retryable = Self::CEP_TIMEOUT | Self::RX_EPT;
        self.is_fault() && (self & Self::FAULTS).difference(retryable).is_empty()
    }

    /// Returns true if a wired input was attached
    pub fn wired_attached(self) -> bool {
        self.contains(Self::RXAC)
    }
}
