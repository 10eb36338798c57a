//! In-process simulated radio.
//!
//! Devices attached to links opened with the same `sim:<air>` descriptor share
//! one "air": they see each other's advertisements, can connect, and talk GATT
//! to each other. Everything runs on the caller's tokio runtime; listener and
//! characteristic callbacks are invoked inline from whichever task drove the
//! operation, never while an internal lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::descriptor::TransportDescriptor;
use crate::error::{Result, TransportError};
use crate::gatt::{
    AdvertisingData, Advertisement, Address, AttributeHandle, CharacteristicDefinition,
    CharacteristicProperties, ConnectionId, PublishedService, RemoteCharacteristic,
    RemoteDescriptor, RemoteService, ServiceDefinition, ValueKind, ValueSubscriber, CCCD_INDICATE,
    CCCD_NOTIFY, CCCD_UUID, DEFAULT_ATT_MTU,
};
use crate::traits::{BleHost, DeviceListener, RadioLink, RadioTransport};

/// Largest ATT MTU a simulated device accepts by default.
pub const DEFAULT_SIM_MAX_MTU: u16 = 517;

/// HCI reason reported to the side that requested a disconnection.
pub const REASON_LOCAL_HOST_TERMINATED: u8 = 0x16;
/// HCI reason reported to the remote side of a disconnection.
pub const REASON_REMOTE_USER_TERMINATED: u8 = 0x13;

const RSSI: i8 = -42;

/// Behaviour knobs for simulated devices.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Upper bound for MTU exchange.
    pub max_mtu: u16,
    /// Reject CCCD writes that enable indications.
    pub reject_indicate: bool,
    /// Fail every MTU exchange targeting this device.
    pub fail_mtu_exchange: bool,
    /// Period between advertisement reports delivered to scanners.
    pub advertising_interval: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            max_mtu: DEFAULT_SIM_MAX_MTU,
            reject_indicate: false,
            fail_mtu_exchange: false,
            advertising_interval: Duration::from_millis(20),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

static AIRS: OnceLock<Mutex<HashMap<String, Weak<SimAir>>>> = OnceLock::new();

fn air_named(name: &str) -> Arc<SimAir> {
    let registry = AIRS.get_or_init(Default::default);
    let mut airs = lock(registry);
    if let Some(air) = airs.get(name).and_then(Weak::upgrade) {
        return air;
    }
    let air = Arc::new(SimAir {
        name: name.to_string(),
        state: Mutex::new(AirState::default()),
    });
    airs.insert(name.to_string(), Arc::downgrade(&air));
    debug!(air = name, "created simulated air");
    air
}

#[derive(Debug, Clone, Copy)]
struct SimConnection {
    central: Address,
    peripheral: Address,
    mtu: u16,
}

impl SimConnection {
    fn other(&self, me: Address) -> Address {
        if me == self.central {
            self.peripheral
        } else {
            self.central
        }
    }

    fn involves(&self, address: Address) -> bool {
        self.central == address || self.peripheral == address
    }
}

#[derive(Default)]
struct AirState {
    devices: HashMap<Address, Weak<SimDevice>>,
    connections: HashMap<ConnectionId, SimConnection>,
    next_connection: u64,
    next_address: u32,
}

/// Shared medium for simulated devices.
pub struct SimAir {
    name: String,
    state: Mutex<AirState>,
}

impl SimAir {
    fn device(&self, address: Address) -> Option<Arc<SimDevice>> {
        lock(&self.state)
            .devices
            .get(&address)
            .and_then(Weak::upgrade)
    }

    fn devices(&self) -> Vec<Arc<SimDevice>> {
        lock(&self.state)
            .devices
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn allocate_address(&self) -> Address {
        let mut state = lock(&self.state);
        loop {
            state.next_address = state.next_address.wrapping_add(1);
            let n = state.next_address.to_be_bytes();
            // Static random addresses carry 0b11 in the two top bits.
            let address = Address([0xC0, 0x5A, n[0], n[1], n[2], n[3]]);
            if !state.devices.contains_key(&address) {
                return address;
            }
        }
    }

    fn register(&self, device: &Arc<SimDevice>) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(existing) = state.devices.get(&device.address) {
            if existing.upgrade().is_some() {
                return Err(TransportError::Open {
                    descriptor: format!("sim:{}", self.name),
                    reason: format!("address {} already in use", device.address),
                });
            }
        }
        state.devices.insert(device.address, Arc::downgrade(device));
        Ok(())
    }

    fn unregister(&self, address: Address) {
        lock(&self.state).devices.remove(&address);
    }

    fn open_connection(&self, central: Address, peripheral: Address) -> ConnectionId {
        let mut state = lock(&self.state);
        state.next_connection += 1;
        let id = ConnectionId(state.next_connection);
        state.connections.insert(
            id,
            SimConnection {
                central,
                peripheral,
                mtu: DEFAULT_ATT_MTU,
            },
        );
        id
    }

    fn connection(&self, id: ConnectionId) -> Option<SimConnection> {
        lock(&self.state).connections.get(&id).copied()
    }

    fn set_mtu(&self, id: ConnectionId, mtu: u16) {
        if let Some(conn) = lock(&self.state).connections.get_mut(&id) {
            conn.mtu = mtu;
        }
    }

    fn connections_of(&self, address: Address) -> Vec<ConnectionId> {
        lock(&self.state)
            .connections
            .iter()
            .filter(|(_, conn)| conn.involves(address))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Tear down `id`, notifying both ends. `initiator` gets the local reason.
    fn close_connection(&self, id: ConnectionId, initiator: Address) -> Result<()> {
        let conn = lock(&self.state)
            .connections
            .remove(&id)
            .ok_or(TransportError::NotConnected(id))?;
        let remote = conn.other(initiator);
        info!(air = %self.name, connection = %id, %initiator, %remote, "simulated link down");

        if let Some(device) = self.device(initiator) {
            device.on_link_lost(id, REASON_LOCAL_HOST_TERMINATED);
        }
        if let Some(device) = self.device(remote) {
            device.on_link_lost(id, REASON_REMOTE_USER_TERMINATED);
        }
        Ok(())
    }
}

/// [`RadioTransport`] serving `sim:<air>` descriptors.
#[derive(Debug, Clone, Default)]
pub struct SimTransport {
    options: SimOptions,
}

impl SimTransport {
    pub fn new(options: SimOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl RadioTransport for SimTransport {
    async fn open(&self, descriptor: &TransportDescriptor) -> Result<Arc<dyn RadioLink>> {
        if !descriptor.is_sim() {
            return Err(TransportError::UnsupportedScheme(
                descriptor.scheme().to_string(),
            ));
        }
        if descriptor.target().is_empty() {
            return Err(TransportError::Open {
                descriptor: descriptor.to_string(),
                reason: "simulated air name must not be empty".to_string(),
            });
        }
        info!(%descriptor, "opening simulated radio");
        Ok(Arc::new(SimLink {
            descriptor: descriptor.clone(),
            air: air_named(descriptor.target()),
            options: self.options.clone(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            devices: Mutex::new(Vec::new()),
        }))
    }
}

/// One open simulated radio.
pub struct SimLink {
    descriptor: TransportDescriptor,
    air: Arc<SimAir>,
    options: SimOptions,
    closed: AtomicBool,
    shutdown: CancellationToken,
    devices: Mutex<Vec<Arc<SimDevice>>>,
}

impl std::fmt::Debug for SimLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimLink")
            .field("descriptor", &self.descriptor)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl RadioLink for SimLink {
    fn descriptor(&self) -> &TransportDescriptor {
        &self.descriptor
    }

    async fn attach(&self, config: &DeviceConfig) -> Result<Arc<dyn BleHost>> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let address = config
            .address
            .unwrap_or_else(|| self.air.allocate_address());
        let device = Arc::new_cyclic(|me| SimDevice {
            me: me.clone(),
            air: Arc::clone(&self.air),
            address,
            name: config.name.clone(),
            options: self.options.clone(),
            shutdown: self.shutdown.child_token(),
            state: Mutex::new(DeviceState::default()),
        });
        self.air.register(&device)?;
        debug!(%address, name = %config.name, "attached simulated device");
        lock(&self.devices).push(Arc::clone(&device));
        Ok(device)
    }

    async fn wait_for_termination(&self) {
        self.shutdown.cancelled().await;
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let devices = std::mem::take(&mut *lock(&self.devices));
        for device in devices {
            device.detach();
        }
        self.shutdown.cancel();
        info!(descriptor = %self.descriptor, "simulated radio closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct SimCharacteristic {
    definition: CharacteristicDefinition,
    value_handle: AttributeHandle,
    cccd_handle: Option<AttributeHandle>,
}

struct SimService {
    uuid: uuid::Uuid,
    handle: AttributeHandle,
    characteristics: Vec<SimCharacteristic>,
}

#[derive(Default)]
struct DeviceState {
    powered: bool,
    listener: Option<Arc<dyn DeviceListener>>,
    services: Vec<SimService>,
    next_handle: u16,
    advertising_data: AdvertisingData,
    advertising: bool,
    auto_restart: bool,
    scan: Option<CancellationToken>,
    /// Server side: CCCD bits per (connection, value handle).
    subscriptions: HashMap<(ConnectionId, AttributeHandle), u16>,
    values: HashMap<AttributeHandle, Bytes>,
    /// Client side: pushed-value subscribers.
    subscribers: HashMap<(ConnectionId, AttributeHandle, ValueKind), Vec<ValueSubscriber>>,
}

impl DeviceState {
    fn allocate_handle(&mut self) -> AttributeHandle {
        self.next_handle += 1;
        AttributeHandle(self.next_handle)
    }

    fn characteristic(&self, value_handle: AttributeHandle) -> Option<&SimCharacteristic> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|c| c.value_handle == value_handle)
    }

    fn characteristic_by_cccd(&self, cccd: AttributeHandle) -> Option<&SimCharacteristic> {
        self.services
            .iter()
            .flat_map(|service| service.characteristics.iter())
            .find(|c| c.cccd_handle == Some(cccd))
    }
}

/// A simulated device bound to a [`SimLink`].
pub struct SimDevice {
    me: Weak<SimDevice>,
    air: Arc<SimAir>,
    address: Address,
    name: String,
    options: SimOptions,
    shutdown: CancellationToken,
    state: Mutex<DeviceState>,
}

impl SimDevice {
    fn ensure_open(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn ensure_powered(&self) -> Result<()> {
        self.ensure_open()?;
        if !lock(&self.state).powered {
            return Err(TransportError::NotPowered);
        }
        Ok(())
    }

    fn listener(&self) -> Option<Arc<dyn DeviceListener>> {
        lock(&self.state).listener.clone()
    }

    fn advertisement(&self) -> Option<Advertisement> {
        let state = lock(&self.state);
        if !state.powered || !state.advertising {
            return None;
        }
        Some(Advertisement {
            address: self.address,
            data: state.advertising_data.clone(),
            rssi: RSSI,
        })
    }

    fn remote(&self, connection: ConnectionId) -> Result<Arc<SimDevice>> {
        let conn = self
            .air
            .connection(connection)
            .filter(|conn| conn.involves(self.address))
            .ok_or(TransportError::NotConnected(connection))?;
        let remote = conn.other(self.address);
        self.air
            .device(remote)
            .ok_or(TransportError::UnknownPeer(remote))
    }

    fn on_link_lost(&self, connection: ConnectionId, reason: u8) {
        let listener = {
            let mut state = lock(&self.state);
            state.subscriptions.retain(|(conn, _), _| *conn != connection);
            state.subscribers.retain(|(conn, _, _), _| *conn != connection);
            if state.auto_restart && state.powered && !self.shutdown.is_cancelled() {
                debug!(address = %self.address, "advertising restarted after disconnection");
                state.advertising = true;
            }
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_disconnection(connection, reason);
        }
    }

    fn detach(&self) {
        {
            let mut state = lock(&self.state);
            if let Some(scan) = state.scan.take() {
                scan.cancel();
            }
            state.advertising = false;
            state.auto_restart = false;
        }
        for connection in self.air.connections_of(self.address) {
            let _ = self.air.close_connection(connection, self.address);
        }
        {
            let mut state = lock(&self.state);
            state.powered = false;
            state.listener = None;
        }
        self.air.unregister(self.address);
        self.shutdown.cancel();
    }

    fn serve_read(&self, connection: ConnectionId, handle: AttributeHandle) -> Result<Bytes> {
        let (handler, stored) = {
            let state = lock(&self.state);
            let characteristic = state
                .characteristic(handle)
                .ok_or(TransportError::UnknownHandle(handle))?;
            if !characteristic
                .definition
                .properties
                .contains(CharacteristicProperties::READ)
            {
                return Err(TransportError::Rejected(format!(
                    "read not permitted on {handle}"
                )));
            }
            (
                characteristic.definition.on_read.clone(),
                state.values.get(&handle).cloned().unwrap_or_default(),
            )
        };
        Ok(match handler {
            Some(handler) => handler(connection),
            None => stored,
        })
    }

    fn serve_write(
        &self,
        connection: ConnectionId,
        handle: AttributeHandle,
        value: Bytes,
    ) -> Result<()> {
        let mut state = lock(&self.state);

        if let Some(value_handle) = state
            .characteristic_by_cccd(handle)
            .map(|c| c.value_handle)
        {
            if value.len() != 2 {
                return Err(TransportError::Rejected(format!(
                    "invalid CCCD value length {}",
                    value.len()
                )));
            }
            let bits = u16::from_le_bytes([value[0], value[1]]);
            if bits & CCCD_INDICATE != 0 && self.options.reject_indicate {
                return Err(TransportError::Rejected(
                    "indications not supported".to_string(),
                ));
            }
            state.subscriptions.insert((connection, value_handle), bits);
            let listener = state.listener.clone();
            drop(state);
            if let Some(listener) = listener {
                listener.on_subscription(
                    connection,
                    value_handle,
                    bits & CCCD_NOTIFY != 0,
                    bits & CCCD_INDICATE != 0,
                );
            }
            return Ok(());
        }

        let characteristic = state
            .characteristic(handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        if !characteristic.definition.properties.is_writable() {
            return Err(TransportError::Rejected(format!(
                "write not permitted on {handle}"
            )));
        }
        let handler = characteristic.definition.on_write.clone();
        state.values.insert(handle, value.clone());
        drop(state);

        if let Some(handler) = handler {
            handler(connection, value);
        }
        Ok(())
    }

    fn deliver(
        &self,
        connection: ConnectionId,
        handle: AttributeHandle,
        kind: ValueKind,
        value: &Bytes,
    ) {
        let subscribers = lock(&self.state)
            .subscribers
            .get(&(connection, handle, kind))
            .cloned()
            .unwrap_or_default();
        if subscribers.is_empty() {
            debug!(%connection, %handle, ?kind, "pushed value has no local subscriber");
        }
        for subscriber in subscribers {
            subscriber(value.clone());
        }
    }

    fn cccd_of(&self, value_handle: AttributeHandle) -> Option<AttributeHandle> {
        lock(&self.state)
            .characteristic(value_handle)
            .and_then(|c| c.cccd_handle)
    }
}

#[async_trait]
impl BleHost for SimDevice {
    fn address(&self) -> Address {
        self.address
    }

    fn set_listener(&self, listener: Option<Arc<dyn DeviceListener>>) {
        lock(&self.state).listener = listener;
    }

    async fn power_on(&self) -> Result<()> {
        self.ensure_open()?;
        lock(&self.state).powered = true;
        debug!(address = %self.address, name = %self.name, "simulated device powered on");
        Ok(())
    }

    fn add_service(&self, service: ServiceDefinition) -> Result<PublishedService> {
        self.ensure_open()?;
        let mut state = lock(&self.state);
        let handle = state.allocate_handle();
        let mut characteristics = Vec::with_capacity(service.characteristics.len());
        let mut published = Vec::with_capacity(service.characteristics.len());
        for definition in service.characteristics {
            let _declaration = state.allocate_handle();
            let value_handle = state.allocate_handle();
            let cccd_handle = definition
                .properties
                .can_push()
                .then(|| state.allocate_handle());
            published.push((definition.uuid, value_handle));
            characteristics.push(SimCharacteristic {
                definition,
                value_handle,
                cccd_handle,
            });
        }
        state.services.push(SimService {
            uuid: service.uuid,
            handle,
            characteristics,
        });
        Ok(PublishedService {
            uuid: service.uuid,
            handle,
            characteristics: published,
        })
    }

    fn remove_service(&self, handle: AttributeHandle) -> Result<()> {
        let mut state = lock(&self.state);
        let index = state
            .services
            .iter()
            .position(|service| service.handle == handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        let removed = state.services.remove(index);
        for characteristic in &removed.characteristics {
            state.values.remove(&characteristic.value_handle);
            state
                .subscriptions
                .retain(|(_, h), _| *h != characteristic.value_handle);
        }
        Ok(())
    }

    async fn notify_subscribers(&self, handle: AttributeHandle, value: Bytes) -> Result<usize> {
        self.ensure_powered()?;
        let targets: Vec<(ConnectionId, ValueKind)> = {
            let mut state = lock(&self.state);
            if state.characteristic(handle).is_none() {
                return Err(TransportError::UnknownHandle(handle));
            }
            state.values.insert(handle, value.clone());
            state
                .subscriptions
                .iter()
                .filter(|((_, h), bits)| *h == handle && **bits != 0)
                .map(|((conn, _), bits)| {
                    let kind = if bits & CCCD_NOTIFY != 0 {
                        ValueKind::Notification
                    } else {
                        ValueKind::Indication
                    };
                    (*conn, kind)
                })
                .collect()
        };

        let mut delivered = 0;
        for (connection, kind) in targets {
            match self.remote(connection) {
                Ok(client) => {
                    client.deliver(connection, handle, kind, &value);
                    delivered += 1;
                    if kind == ValueKind::Indication {
                        // Indications wait for the client's confirmation.
                        tokio::task::yield_now().await;
                    }
                }
                Err(err) => warn!(%connection, %err, "dropping push to vanished client"),
            }
        }
        Ok(delivered)
    }

    fn set_advertising_data(&self, data: AdvertisingData) {
        lock(&self.state).advertising_data = data;
    }

    async fn start_advertising(&self, auto_restart: bool) -> Result<()> {
        self.ensure_powered()?;
        let mut state = lock(&self.state);
        state.advertising = true;
        state.auto_restart = auto_restart;
        info!(address = %self.address, auto_restart, "simulated advertising started");
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        let mut state = lock(&self.state);
        state.advertising = false;
        state.auto_restart = false;
        Ok(())
    }

    fn is_advertising(&self) -> bool {
        lock(&self.state).advertising
    }

    async fn start_scanning(&self, active: bool) -> Result<()> {
        self.ensure_powered()?;
        let token = self.shutdown.child_token();
        if let Some(previous) = lock(&self.state).scan.replace(token.clone()) {
            previous.cancel();
        }
        debug!(address = %self.address, active, "simulated scanning started");

        let me = self.me.clone();
        let interval = self.options.advertising_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let Some(device) = me.upgrade() else { break };
                let reports: Vec<Advertisement> = device
                    .air
                    .devices()
                    .iter()
                    .filter(|other| other.address != device.address)
                    .filter_map(|other| other.advertisement())
                    .collect();
                let Some(listener) = device.listener() else {
                    continue;
                };
                for report in &reports {
                    if token.is_cancelled() {
                        break;
                    }
                    listener.on_advertisement(report);
                }
            }
        });
        Ok(())
    }

    async fn stop_scanning(&self) -> Result<()> {
        if let Some(scan) = lock(&self.state).scan.take() {
            scan.cancel();
            debug!(address = %self.address, "simulated scanning stopped");
        }
        Ok(())
    }

    fn is_scanning(&self) -> bool {
        lock(&self.state).scan.is_some()
    }

    async fn connect(&self, peer: Address) -> Result<ConnectionId> {
        self.ensure_powered()?;
        let remote = self
            .air
            .device(peer)
            .ok_or(TransportError::UnknownPeer(peer))?;
        {
            let mut remote_state = lock(&remote.state);
            if !remote_state.powered || !remote_state.advertising {
                return Err(TransportError::NotConnectable(peer));
            }
            remote_state.advertising = false;
        }
        let connection = self.air.open_connection(self.address, peer);
        info!(%connection, central = %self.address, peripheral = %peer, "simulated link up");

        if let Some(listener) = remote.listener() {
            listener.on_connection(connection, self.address);
        }
        if let Some(listener) = self.listener() {
            listener.on_connection(connection, peer);
        }
        Ok(connection)
    }

    async fn disconnect(&self, connection: ConnectionId) -> Result<()> {
        match self.air.connection(connection) {
            Some(conn) if conn.involves(self.address) => {
                self.air.close_connection(connection, self.address)
            }
            _ => Err(TransportError::NotConnected(connection)),
        }
    }

    fn mtu(&self, connection: ConnectionId) -> Option<u16> {
        self.air
            .connection(connection)
            .filter(|conn| conn.involves(self.address))
            .map(|conn| conn.mtu)
    }

    async fn request_mtu(&self, connection: ConnectionId, mtu: u16) -> Result<u16> {
        let remote = self.remote(connection)?;
        if remote.options.fail_mtu_exchange {
            return Err(TransportError::MtuExchange(
                "peer did not respond to exchange".to_string(),
            ));
        }
        let negotiated = mtu
            .min(remote.options.max_mtu)
            .min(self.options.max_mtu)
            .max(DEFAULT_ATT_MTU);
        self.air.set_mtu(connection, negotiated);
        Ok(negotiated)
    }

    async fn discover_services(&self, connection: ConnectionId) -> Result<Vec<RemoteService>> {
        let remote = self.remote(connection)?;
        let state = lock(&remote.state);
        Ok(state
            .services
            .iter()
            .map(|service| RemoteService {
                uuid: service.uuid,
                handle: service.handle,
            })
            .collect())
    }

    async fn discover_characteristics(
        &self,
        connection: ConnectionId,
        service: &RemoteService,
    ) -> Result<Vec<RemoteCharacteristic>> {
        let remote = self.remote(connection)?;
        let state = lock(&remote.state);
        let found = state
            .services
            .iter()
            .find(|candidate| candidate.handle == service.handle)
            .ok_or(TransportError::UnknownHandle(service.handle))?;
        Ok(found
            .characteristics
            .iter()
            .map(|c| RemoteCharacteristic {
                uuid: c.definition.uuid,
                handle: c.value_handle,
                properties: c.definition.properties,
            })
            .collect())
    }

    async fn discover_descriptors(
        &self,
        connection: ConnectionId,
        characteristic: &RemoteCharacteristic,
    ) -> Result<Vec<RemoteDescriptor>> {
        let remote = self.remote(connection)?;
        let state = lock(&remote.state);
        let found = state
            .characteristic(characteristic.handle)
            .ok_or(TransportError::UnknownHandle(characteristic.handle))?;
        Ok(found
            .cccd_handle
            .map(|handle| RemoteDescriptor {
                uuid: CCCD_UUID,
                handle,
            })
            .into_iter()
            .collect())
    }

    async fn read_value(&self, connection: ConnectionId, handle: AttributeHandle) -> Result<Bytes> {
        self.remote(connection)?.serve_read(connection, handle)
    }

    async fn write_value(
        &self,
        connection: ConnectionId,
        handle: AttributeHandle,
        value: Bytes,
        with_response: bool,
    ) -> Result<()> {
        debug!(%connection, %handle, with_response, len = value.len(), "simulated write");
        self.remote(connection)?
            .serve_write(connection, handle, value)
    }

    fn add_value_subscriber(
        &self,
        connection: ConnectionId,
        handle: AttributeHandle,
        kind: ValueKind,
        subscriber: ValueSubscriber,
    ) {
        lock(&self.state)
            .subscribers
            .entry((connection, handle, kind))
            .or_default()
            .push(subscriber);
    }

    async fn subscribe(
        &self,
        connection: ConnectionId,
        characteristic: &RemoteCharacteristic,
        prefer_notify: bool,
        subscriber: ValueSubscriber,
    ) -> Result<()> {
        let props = characteristic.properties;
        let can_notify = props.contains(CharacteristicProperties::NOTIFY);
        let can_indicate = props.contains(CharacteristicProperties::INDICATE);
        let (bits, kind) = if can_notify && (prefer_notify || !can_indicate) {
            (CCCD_NOTIFY, ValueKind::Notification)
        } else if can_indicate {
            (CCCD_INDICATE, ValueKind::Indication)
        } else {
            return Err(TransportError::Rejected(format!(
                "characteristic {} cannot notify or indicate",
                characteristic.uuid
            )));
        };
        let cccd = self
            .remote(connection)?
            .cccd_of(characteristic.handle)
            .ok_or_else(|| {
                TransportError::Rejected(format!("no CCCD on {}", characteristic.handle))
            })?;
        self.write_value(
            connection,
            cccd,
            Bytes::copy_from_slice(&bits.to_le_bytes()),
            true,
        )
        .await?;
        self.add_value_subscriber(connection, characteristic.handle, kind, subscriber);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::gatt::AttributePermissions;

    fn unique_air(tag: &str) -> TransportDescriptor {
        TransportDescriptor::sim(&format!(
            "{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    async fn pair(
        tag: &str,
        peripheral_options: SimOptions,
    ) -> (Arc<dyn RadioLink>, Arc<dyn BleHost>, Arc<dyn BleHost>) {
        let descriptor = unique_air(tag);
        let link = SimTransport::new(peripheral_options)
            .open(&descriptor)
            .await
            .unwrap();
        let peripheral = link.attach(&DeviceConfig::default()).await.unwrap();
        let central_link = SimTransport::default().open(&descriptor).await.unwrap();
        let central = central_link.attach(&DeviceConfig::default()).await.unwrap();
        peripheral.power_on().await.unwrap();
        central.power_on().await.unwrap();
        (link, peripheral, central)
    }

    fn notify_service(writes: Arc<Mutex<Vec<Bytes>>>) -> ServiceDefinition {
        ServiceDefinition {
            uuid: uuid::Uuid::from_u128(0x100),
            characteristics: vec![
                CharacteristicDefinition::new(
                    uuid::Uuid::from_u128(0x101),
                    CharacteristicProperties::WRITE,
                    AttributePermissions::WRITEABLE,
                )
                .with_write(Arc::new(move |_: ConnectionId, value: Bytes| {
                    lock(&writes).push(value)
                })),
                CharacteristicDefinition::new(
                    uuid::Uuid::from_u128(0x102),
                    CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                    AttributePermissions::READABLE,
                ),
            ],
        }
    }

    #[derive(Default)]
    struct Recorder {
        connections: AtomicUsize,
        disconnections: AtomicUsize,
        adverts: Mutex<Vec<Address>>,
    }

    impl DeviceListener for Recorder {
        fn on_connection(&self, _connection: ConnectionId, _peer: Address) {
            self.connections.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnection(&self, _connection: ConnectionId, _reason: u8) {
            self.disconnections.fetch_add(1, Ordering::SeqCst);
        }

        fn on_advertisement(&self, advertisement: &Advertisement) {
            lock(&self.adverts).push(advertisement.address);
        }
    }

    #[tokio::test]
    async fn rejects_non_sim_descriptor() {
        let descriptor = TransportDescriptor::parse("usb:0").unwrap();
        let err = SimTransport::default().open(&descriptor).await.unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn scanner_sees_advertiser() {
        let (_link, peripheral, central) = pair("scan", SimOptions::default()).await;
        let recorder = Arc::new(Recorder::default());
        central.set_listener(Some(recorder.clone()));

        peripheral.set_advertising_data(AdvertisingData::with_services([uuid::Uuid::from_u128(
            0x100,
        )]));
        peripheral.start_advertising(true).await.unwrap();
        central.start_scanning(true).await.unwrap();
        assert!(central.is_scanning());

        tokio::time::sleep(Duration::from_millis(100)).await;
        central.stop_scanning().await.unwrap();
        assert!(!central.is_scanning());

        let seen = lock(&recorder.adverts).clone();
        assert!(seen.contains(&peripheral.address()));
    }

    #[tokio::test]
    async fn connect_requires_advertising() {
        let (_link, peripheral, central) = pair("noadv", SimOptions::default()).await;
        let err = central.connect(peripheral.address()).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnectable(_)));
    }

    #[tokio::test]
    async fn write_and_notify_roundtrip() {
        let (_link, peripheral, central) = pair("gatt", SimOptions::default()).await;
        let writes = Arc::new(Mutex::new(Vec::new()));
        let published = peripheral.add_service(notify_service(writes.clone())).unwrap();
        peripheral.start_advertising(true).await.unwrap();

        let conn = central.connect(peripheral.address()).await.unwrap();
        assert!(!peripheral.is_advertising());

        let services = central.discover_services(conn).await.unwrap();
        assert_eq!(services.len(), 1);
        let chars = central
            .discover_characteristics(conn, &services[0])
            .await
            .unwrap();
        assert_eq!(chars.len(), 2);

        central
            .write_value(conn, chars[0].handle, Bytes::from_static(b"hi"), false)
            .await
            .unwrap();
        assert_eq!(lock(&writes).as_slice(), &[Bytes::from_static(b"hi")]);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        central
            .subscribe(
                conn,
                &chars[1],
                true,
                Arc::new(move |value: Bytes| lock(&sink).push(value)),
            )
            .await
            .unwrap();

        let notify_handle = published.characteristics[1].1;
        let count = peripheral
            .notify_subscribers(notify_handle, Bytes::from_static(b"yo"))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(lock(&received).as_slice(), &[Bytes::from_static(b"yo")]);

        let read = central.read_value(conn, chars[1].handle).await.unwrap();
        assert_eq!(read.as_ref(), b"yo");
    }

    #[tokio::test]
    async fn notify_without_subscriber_reaches_nobody() {
        let (_link, peripheral, _central) = pair("nosub", SimOptions::default()).await;
        let published = peripheral
            .add_service(notify_service(Arc::new(Mutex::new(Vec::new()))))
            .unwrap();
        let count = peripheral
            .notify_subscribers(published.characteristics[1].1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn indicate_rejection_is_reported() {
        let options = SimOptions {
            reject_indicate: true,
            ..SimOptions::default()
        };
        let (_link, peripheral, central) = pair("reject", options).await;
        peripheral
            .add_service(notify_service(Arc::new(Mutex::new(Vec::new()))))
            .unwrap();
        peripheral.start_advertising(false).await.unwrap();
        let conn = central.connect(peripheral.address()).await.unwrap();
        let services = central.discover_services(conn).await.unwrap();
        let chars = central
            .discover_characteristics(conn, &services[0])
            .await
            .unwrap();
        let descriptors = central.discover_descriptors(conn, &chars[1]).await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].uuid, CCCD_UUID);

        let err = central
            .write_value(
                conn,
                descriptors[0].handle,
                Bytes::from_static(&[0x03, 0x00]),
                true,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));
    }

    #[tokio::test]
    async fn mtu_exchange_is_clamped_or_fails() {
        let options = SimOptions {
            max_mtu: 100,
            ..SimOptions::default()
        };
        let (_link, peripheral, central) = pair("mtu", options).await;
        peripheral.start_advertising(false).await.unwrap();
        let conn = central.connect(peripheral.address()).await.unwrap();
        assert_eq!(central.mtu(conn), Some(DEFAULT_ATT_MTU));
        assert_eq!(central.request_mtu(conn, 515).await.unwrap(), 100);
        assert_eq!(peripheral.mtu(conn), Some(100));

        let options = SimOptions {
            fail_mtu_exchange: true,
            ..SimOptions::default()
        };
        let (_link, peripheral, central) = pair("mtu-fail", options).await;
        peripheral.start_advertising(false).await.unwrap();
        let conn = central.connect(peripheral.address()).await.unwrap();
        assert!(matches!(
            central.request_mtu(conn, 515).await,
            Err(TransportError::MtuExchange(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_restarts_advertising_when_requested() {
        let (_link, peripheral, central) = pair("restart", SimOptions::default()).await;
        let recorder = Arc::new(Recorder::default());
        peripheral.set_listener(Some(recorder.clone()));
        peripheral.start_advertising(true).await.unwrap();

        let conn = central.connect(peripheral.address()).await.unwrap();
        assert_eq!(recorder.connections.load(Ordering::SeqCst), 1);
        central.disconnect(conn).await.unwrap();
        assert_eq!(recorder.disconnections.load(Ordering::SeqCst), 1);
        assert!(peripheral.is_advertising());
        assert!(matches!(
            central.disconnect(conn).await,
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn close_terminates_link_and_drops_connections() {
        let (link, peripheral, central) = pair("close", SimOptions::default()).await;
        peripheral.start_advertising(true).await.unwrap();
        let conn = central.connect(peripheral.address()).await.unwrap();

        link.close().await.unwrap();
        link.close().await.unwrap();
        link.wait_for_termination().await;
        assert!(link.is_closed());
        assert_eq!(central.mtu(conn), None);
        assert!(matches!(
            peripheral.power_on().await,
            Err(TransportError::Closed)
        ));
    }
}
