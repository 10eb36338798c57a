use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::DeviceConfig;
use crate::descriptor::TransportDescriptor;
use crate::error::Result;
use crate::gatt::{
    AdvertisingData, Advertisement, Address, AttributeHandle, ConnectionId, PublishedService,
    RemoteCharacteristic, RemoteDescriptor, RemoteService, ServiceDefinition, ValueKind,
    ValueSubscriber,
};

/// Opens radio transports from descriptors.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Open the radio behind `descriptor`.
    async fn open(&self, descriptor: &TransportDescriptor) -> Result<Arc<dyn RadioLink>>;
}

/// An open radio transport (the HCI source/sink pair).
#[async_trait]
pub trait RadioLink: Send + Sync + fmt::Debug {
    /// The descriptor this link was opened from.
    fn descriptor(&self) -> &TransportDescriptor;

    /// Bind a host stack to this link's source/sink using `config`.
    async fn attach(&self, config: &DeviceConfig) -> Result<Arc<dyn BleHost>>;

    /// Resolve once the link's source has terminated.
    async fn wait_for_termination(&self);

    /// Close the link. Closing twice is a no-op.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Device-level events delivered by the host stack on its execution context.
///
/// Implementations must not block; long-running reactions belong in a spawned task.
pub trait DeviceListener: Send + Sync {
    fn on_connection(&self, _connection: ConnectionId, _peer: Address) {}

    fn on_disconnection(&self, _connection: ConnectionId, _reason: u8) {}

    fn on_advertisement(&self, _advertisement: &Advertisement) {}

    fn on_subscription(
        &self,
        _connection: ConnectionId,
        _handle: AttributeHandle,
        _notify: bool,
        _indicate: bool,
    ) {
    }
}

/// Capability interface over a BLE host stack: GATT server publication,
/// advertising, scanning, connection management and GATT client operations.
///
/// Every method must be called from the stack's own execution context.
#[async_trait]
pub trait BleHost: Send + Sync {
    fn address(&self) -> Address;

    /// Install (or clear) the device listener.
    fn set_listener(&self, listener: Option<Arc<dyn DeviceListener>>);

    async fn power_on(&self) -> Result<()>;

    // -- GATT server -------------------------------------------------------

    fn add_service(&self, service: ServiceDefinition) -> Result<PublishedService>;

    fn remove_service(&self, handle: AttributeHandle) -> Result<()>;

    /// Set the attribute value and push it to every subscribed client.
    /// Returns the number of clients the value was delivered to.
    async fn notify_subscribers(&self, handle: AttributeHandle, value: Bytes) -> Result<usize>;

    // -- advertising -------------------------------------------------------

    fn set_advertising_data(&self, data: AdvertisingData);

    /// Start advertising; with `auto_restart` advertising resumes after a disconnection.
    async fn start_advertising(&self, auto_restart: bool) -> Result<()>;

    async fn stop_advertising(&self) -> Result<()>;

    fn is_advertising(&self) -> bool;

    // -- scanning ----------------------------------------------------------

    async fn start_scanning(&self, active: bool) -> Result<()>;

    async fn stop_scanning(&self) -> Result<()>;

    fn is_scanning(&self) -> bool;

    // -- connections -------------------------------------------------------

    async fn connect(&self, peer: Address) -> Result<ConnectionId>;

    async fn disconnect(&self, connection: ConnectionId) -> Result<()>;

    /// Negotiated ATT MTU of an active connection.
    fn mtu(&self, connection: ConnectionId) -> Option<u16>;

    // -- GATT client -------------------------------------------------------

    /// Request a larger ATT MTU; returns the negotiated value.
    async fn request_mtu(&self, connection: ConnectionId, mtu: u16) -> Result<u16>;

    async fn discover_services(&self, connection: ConnectionId) -> Result<Vec<RemoteService>>;

    async fn discover_characteristics(
        &self,
        connection: ConnectionId,
        service: &RemoteService,
    ) -> Result<Vec<RemoteCharacteristic>>;

    async fn discover_descriptors(
        &self,
        connection: ConnectionId,
        characteristic: &RemoteCharacteristic,
    ) -> Result<Vec<RemoteDescriptor>>;

    async fn read_value(&self, connection: ConnectionId, handle: AttributeHandle) -> Result<Bytes>;

    async fn write_value(
        &self,
        connection: ConnectionId,
        handle: AttributeHandle,
        value: Bytes,
        with_response: bool,
    ) -> Result<()>;

    /// Register a local subscriber for pushed values without touching the CCCD.
    fn add_value_subscriber(
        &self,
        connection: ConnectionId,
        handle: AttributeHandle,
        kind: ValueKind,
        subscriber: ValueSubscriber,
    );

    /// Write the CCCD and register `subscriber` in one step.
    async fn subscribe(
        &self,
        connection: ConnectionId,
        characteristic: &RemoteCharacteristic,
        prefer_notify: bool,
        subscriber: ValueSubscriber,
    ) -> Result<()>;
}
