//! GATT value types shared by the host-stack abstraction and its users.

use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client Characteristic Configuration Descriptor (0x2902) in 128-bit form.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// CCCD bit enabling notifications.
pub const CCCD_NOTIFY: u16 = 0x0001;
/// CCCD bit enabling indications.
pub const CCCD_INDICATE: u16 = 0x0002;

/// ATT MTU every link starts with before an exchange.
pub const DEFAULT_ATT_MTU: u16 = 23;

/// Opaque reference to an attribute in a GATT database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttributeHandle(pub u16);

impl fmt::Display for AttributeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Identifier of one link-layer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A 48-bit Bluetooth device address, displayed most significant byte first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; 6]);

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in out.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("invalid address '{s}': expected 6 octets"))?;
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid address '{s}': bad octet '{part}'"))?;
        }
        if parts.next().is_some() {
            return Err(format!("invalid address '{s}': expected 6 octets"));
        }
        Ok(Self(out))
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

/// Characteristic property bits as advertised in the characteristic declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties(u8);

impl CharacteristicProperties {
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if either write flavour is allowed.
    pub const fn is_writable(self) -> bool {
        self.0 & (Self::WRITE.0 | Self::WRITE_WITHOUT_RESPONSE.0) != 0
    }

    /// True if the characteristic can push values (and therefore carries a CCCD).
    pub const fn can_push(self) -> bool {
        self.0 & (Self::NOTIFY.0 | Self::INDICATE.0) != 0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Attribute access permissions on the server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributePermissions(u8);

impl AttributePermissions {
    pub const READABLE: Self = Self(0x01);
    pub const WRITEABLE: Self = Self(0x02);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AttributePermissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Invoked on the stack's execution context when a client writes a value.
pub type WriteHandler = Arc<dyn Fn(ConnectionId, Bytes) + Send + Sync>;
/// Invoked on each client read; the returned bytes are the attribute value.
pub type ReadHandler = Arc<dyn Fn(ConnectionId) -> Bytes + Send + Sync>;
/// Receives notified or indicated values on the client side.
pub type ValueSubscriber = Arc<dyn Fn(Bytes) + Send + Sync>;

/// A characteristic to publish in a local GATT server.
#[derive(Clone)]
pub struct CharacteristicDefinition {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    pub on_read: Option<ReadHandler>,
    pub on_write: Option<WriteHandler>,
}

impl CharacteristicDefinition {
    pub fn new(
        uuid: Uuid,
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
    ) -> Self {
        Self {
            uuid,
            properties,
            permissions,
            on_read: None,
            on_write: None,
        }
    }

    pub fn with_read(mut self, handler: ReadHandler) -> Self {
        self.on_read = Some(handler);
        self
    }

    pub fn with_write(mut self, handler: WriteHandler) -> Self {
        self.on_write = Some(handler);
        self
    }
}

impl fmt::Debug for CharacteristicDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CharacteristicDefinition")
            .field("uuid", &self.uuid)
            .field("properties", &self.properties)
            .field("permissions", &self.permissions)
            .field("on_read", &self.on_read.is_some())
            .field("on_write", &self.on_write.is_some())
            .finish()
    }
}

/// A primary service to publish in a local GATT server.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDefinition>,
}

/// Handles assigned to a published service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedService {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
    /// Value handle of each characteristic, in definition order.
    pub characteristics: Vec<(Uuid, AttributeHandle)>,
}

impl PublishedService {
    /// Value handle of the characteristic with `uuid`, if published.
    pub fn handle_for(&self, uuid: &Uuid) -> Option<AttributeHandle> {
        self.characteristics
            .iter()
            .find(|(candidate, _)| candidate == uuid)
            .map(|(_, handle)| *handle)
    }
}

/// Advertising payload fields the core cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdvertisingData {
    pub complete_local_name: Option<String>,
    pub shortened_local_name: Option<String>,
    pub complete_service_uuids: Vec<Uuid>,
    pub incomplete_service_uuids: Vec<Uuid>,
}

impl AdvertisingData {
    /// Payload carrying a complete list of 128-bit service UUIDs.
    pub fn with_services(uuids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            complete_service_uuids: uuids.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Complete local name, falling back to the shortened one.
    pub fn local_name(&self) -> Option<&str> {
        self.complete_local_name
            .as_deref()
            .or(self.shortened_local_name.as_deref())
    }

    /// Complete and incomplete service UUID lists, concatenated.
    pub fn service_uuids(&self) -> impl Iterator<Item = &Uuid> {
        self.complete_service_uuids
            .iter()
            .chain(self.incomplete_service_uuids.iter())
    }
}

/// One received advertising report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: Address,
    pub data: AdvertisingData,
    pub rssi: i8,
}

/// A service found by client-side discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteService {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
}

/// A characteristic found by client-side discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCharacteristic {
    pub uuid: Uuid,
    /// Value handle.
    pub handle: AttributeHandle,
    pub properties: CharacteristicProperties,
}

/// A descriptor found by client-side discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDescriptor {
    pub uuid: Uuid,
    pub handle: AttributeHandle,
}

/// Delivery flavour of a server-pushed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Notification,
    Indication,
}
