//! Frame encoding and decoding

/// Head byte of standard outbound frames
pub const HEAD_STANDARD_OUT: u8 = 0x48;
/// Head byte of transmitter queries
pub const HEAD_QUERY_OUT: u8 = 0x18;

/// Head byte of inbound standard frames
pub const HEAD_STANDARD: u8 = 0x1f;
/// Head byte of inbound extended frames
pub const HEAD_EXTENDED: u8 = 0x5f;
/// Head byte of inbound transmitter error frames
pub const HEAD_TX_ERROR: u8 = 0x3f;
/// Head byte of inbound transmitter query responses
pub const HEAD_TX_RESPONSE: u8 = 0x2f;

/// Extended code carrying the transmitter vendor and id
pub const EXT_VENDOR_INFO: u8 = 0x01;

/// Number of authentication chunks
pub const VERITY_CHUNKS: u8 = 6;

/// Outbound commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// Read adapter type and id
    IdentifyAdapter,
    /// Switch the transmitter to fast charge
    IntoFastcharge,
    /// Switch the transmitter to USB charge
    IntoUsbCharge,
    /// Switch the transmitter to normal charge
    IntoNormalCharge,
    /// Leave quiet mode
    SetNormalMode,
    /// Enter quiet mode
    SetQuietMode,
    /// Read transmitter firmware version
    GetFwVersion,
    /// Configure the control error packet timeout
    SetCepTimeout,
    /// Set dock LED brightness
    SetLedBrightness,
    /// Set dock fan speed
    SetFanSpeed,
    /// Read dock product id
    GetProductId,
    /// Report battery state to the dock
    SendBattInfo,
    /// Legacy authentication chunk, 1 to 6
    EncryptData(u8),
    /// AES authentication chunk, 1 to 6
    AesData(u8),
    /// Read transmitter id
    GetTxId,
    /// Read transmitter power
    GetTxPwr,
}

/// Expected acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Ack {
    /// Standard frame with this code
    Standard(u8),
    /// Transmitter response to this query
    TxResponse(u8),
}

impl Command {
    /// Command code on the wire
    pub fn code(self) -> u8 {
        match self {
            Command::IdentifyAdapter => 0xa1,
            Command::IntoFastcharge => 0xa2,
            Command::IntoUsbCharge => 0xa3,
            Command::IntoNormalCharge => 0xa4,
            Command::SetNormalMode => 0xa5,
            Command::SetQuietMode => 0xa6,
            Command::GetFwVersion => 0xa8,
            Command::SetCepTimeout => 0xa9,
            Command::SetLedBrightness => 0xab,
            Command::SetFanSpeed => 0xac,
            Command::GetProductId => 0xae,
            Command::SendBattInfo => 0xaf,
            Command::EncryptData(n) => 0xb0 + n,
            Command::AesData(n) => 0xd0 + n,
            Command::GetTxId => 0x5f,
            Command::GetTxPwr => 0x4a,
        }
    }

    /// Acknowledgement that completes this command, `None` for fire-and-forget commands
    pub fn ack(self) -> Option<Ack> {
        match self {
            Command::SendBattInfo => None,
            Command::EncryptData(n) => Some(Ack::Standard(0xc0 + n)),
            Command::AesData(n) => Some(Ack::Standard(0xe0 + n)),
            Command::GetTxId | Command::GetTxPwr => Some(Ack::TxResponse(self.code())),
            // Remaining standard commands are acknowledged with the high nibble set
            _ => Some(Ack::Standard(self.code() | 0xf0)),
        }
    }

    /// Returns true if the command is sent as raw bytes
    pub fn is_raw(self) -> bool {
        matches!(self, Command::AesData(_))
    }
}

/// Outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    /// Command
    pub cmd: Command,
    /// Payload
    pub data: [u8; 3],
}

/// Encoded frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame {
    /// Frame bytes, only the first `len` are valid
    pub bytes: [u8; 5],
    /// Frame length
    pub len: usize,
    /// Send without IC side framing
    pub raw: bool,
}

impl Frame {
    /// Valid frame bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Message {
    /// Create a message without payload
    pub fn new(cmd: Command) -> Self {
        Self { cmd, data: [0; 3] }
    }

    /// Create a message with payload
    pub fn with_data(cmd: Command, data: [u8; 3]) -> Self {
        Self { cmd, data }
    }

    /// Encode to a frame
    pub fn encode(&self) -> Frame {
        let code = self.cmd.code();
        let [d0, d1, d2] = self.data;
        let (bytes, raw) = match self.cmd {
            Command::GetTxPwr => ([HEAD_QUERY_OUT, code, !code, 0xff, 0x00], false),
            Command::GetTxId => ([HEAD_QUERY_OUT, code, 0x00, 0x00, 0x00], false),
            Command::AesData(_) => ([code, d0, d1, d2, code ^ d0 ^ d1 ^ d2], true),
            _ => ([HEAD_STANDARD_OUT, code, d0, d1, d2], false),
        };
        Frame { bytes, len: 5, raw }
    }
}

/// Inbound frame decode errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DecodeError {
    /// Standard frame complement check failed
    BadComplement,
    /// Unknown head byte
    UnknownHead(u8),
}

/// Decoded inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Inbound {
    /// Acknowledgement or short data
    Standard {
        /// Code
        code: u8,
        /// Payload
        data: [u8; 3],
    },
    /// Transmitter initiated multi-byte data
    Extended {
        /// Code
        code: u8,
        /// Payload
        data: [u8; 4],
    },
    /// Transmitter error
    TxError(u8),
    /// Response to a transmitter query
    TxResponse {
        /// Query being answered
        query: u8,
        /// Payload
        data: [u8; 4],
    },
}

impl Inbound {
    /// Decode a received frame
    pub fn decode(frame: &[u8; 6]) -> Result<Self, DecodeError> {
        let [head, code, b2, b3, b4, b5] = *frame;
        match head {
            HEAD_STANDARD => {
                if b2 != !code {
                    return Err(DecodeError::BadComplement);
                }
                Ok(Inbound::Standard {
                    code,
                    data: [b3, b4, b5],
                })
            }
            HEAD_EXTENDED => Ok(Inbound::Extended {
                code,
                data: [b2, b3, b4, b5],
            }),
            HEAD_TX_ERROR => Ok(Inbound::TxError(code)),
            HEAD_TX_RESPONSE => Ok(Inbound::TxResponse {
                query: code,
                data: [b2, b3, b4, b5],
            }),
            other => Err(DecodeError::UnknownHead(other)),
        }
    }

    /// Acknowledgement carried by this frame, if it can complete a request
    pub fn ack(&self) -> Option<(Ack, [u8; 4])> {
        match *self {
            Inbound::Standard { code, data: [d0, d1, d2] } => Some((Ack::Standard(code), [d0, d1, d2, 0])),
            Inbound::TxResponse { query, data } => Some((Ack::TxResponse(query), data)),
            Inbound::Extended { .. } | Inbound::TxError(_) => None,
        }
    }
}

/// Transmitter error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxErrorCode {
    /// Over temperature
    OverTemperature,
    /// Over current
    OverCurrent,
    /// Over voltage
    OverVoltage,
    /// Foreign object detected
    ForeignObject,
    /// Unknown code
    Unknown(u8),
}

impl From<u8> for TxErrorCode {
    fn from(code: u8) -> Self {
        match code {
            0x01 => TxErrorCode::OverTemperature,
            0x02 => TxErrorCode::OverCurrent,
            0x03 => TxErrorCode::OverVoltage,
            0x04 => TxErrorCode::ForeignObject,
            other => TxErrorCode::Unknown(other),
        }
    }
}

/// Response that completed a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Response {
    /// Acknowledgement
    pub ack: Ack,
    /// Payload
    pub data: [u8; 4],
}
