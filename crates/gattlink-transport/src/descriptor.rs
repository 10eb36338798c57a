use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TransportError};

/// Descriptor scheme served by the in-process simulated radio.
pub const SIM_SCHEME: &str = "sim";

/// Schemes recognised in descriptors. Only [`SIM_SCHEME`] has a built-in radio.
pub const KNOWN_SCHEMES: &[&str] = &[
    SIM_SCHEME,
    "usb",
    "serial",
    "tcp-client",
    "tcp-server",
    "udp",
    "hci-socket",
    "android-netsim",
];

/// A parsed `<scheme>:<target>` transport descriptor, e.g. `usb:0`,
/// `serial:/dev/ttyUSB0` or `tcp-client:127.0.0.1:1234`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportDescriptor {
    scheme: String,
    target: String,
}

impl TransportDescriptor {
    /// Parse a descriptor string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (scheme, target) = input
            .split_once(':')
            .ok_or_else(|| TransportError::InvalidDescriptor(input.to_string()))?;
        if scheme.is_empty() {
            return Err(TransportError::InvalidDescriptor(input.to_string()));
        }
        if !KNOWN_SCHEMES.contains(&scheme) {
            return Err(TransportError::UnsupportedScheme(scheme.to_string()));
        }
        Ok(Self {
            scheme: scheme.to_string(),
            target: target.to_string(),
        })
    }

    /// Descriptor for a named simulated air.
    pub fn sim(air: &str) -> Self {
        Self {
            scheme: SIM_SCHEME.to_string(),
            target: air.to_string(),
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_sim(&self) -> bool {
        self.scheme == SIM_SCHEME
    }
}

impl FromStr for TransportDescriptor {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TransportDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.target)
    }
}
