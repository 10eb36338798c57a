use bytes::Bytes;

/// Control value: the central is ready to stream.
pub const START_TRANSMISSION: u8 = 0x01;
/// Control value: the peripheral is ending the session.
pub const SESSION_TERMINATION: u8 = 0x02;

/// Single-byte sentinel carried on the Control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlValue {
    /// Central to peripheral, by write.
    StartTransmission,
    /// Peripheral to central, by notification.
    SessionTermination,
}

impl ControlValue {
    /// Parse a Control channel value. Anything but a single known byte is `None`.
    pub fn from_bytes(value: &[u8]) -> Option<Self> {
        match value {
            [START_TRANSMISSION] => Some(Self::StartTransmission),
            [SESSION_TERMINATION] => Some(Self::SessionTermination),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::StartTransmission => START_TRANSMISSION,
            Self::SessionTermination => SESSION_TERMINATION,
        }
    }

    pub fn to_bytes(self) -> Bytes {
        Bytes::copy_from_slice(&[self.as_byte()])
    }
}
