//! BLE radio transport and host-stack abstraction for gattlink.
//!
//! Defines the capability interface the session layer drives:
//! - [`RadioTransport`] opens a radio from a `<scheme>:<target>` descriptor
//! - [`RadioLink`] is the open radio, onto which a [`BleHost`] is attached
//! - [`BleHost`] covers GATT server, advertising, scanning and GATT client
//!
//! The only radio shipped here is the in-process simulator behind `sim:<air>`.
//! This is the lowest layer of gattlink. Everything else builds on top of it.

pub mod config;
pub mod descriptor;
pub mod error;
pub mod gatt;
pub mod sim;
pub mod traits;

pub use config::DeviceConfig;
pub use descriptor::{TransportDescriptor, KNOWN_SCHEMES, SIM_SCHEME};
pub use error::{Result, TransportError};
pub use gatt::{
    AdvertisingData, Advertisement, Address, AttributeHandle, AttributePermissions,
    CharacteristicDefinition, CharacteristicProperties, ConnectionId, PublishedService,
    ReadHandler, RemoteCharacteristic, RemoteDescriptor, RemoteService, ServiceDefinition,
    ValueKind, ValueSubscriber, WriteHandler, CCCD_INDICATE, CCCD_NOTIFY, CCCD_UUID,
    DEFAULT_ATT_MTU,
};
pub use sim::{SimOptions, SimTransport};
pub use traits::{BleHost, DeviceListener, RadioLink, RadioTransport};
