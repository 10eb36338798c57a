//! Central role: scan for the target service, connect, discover the
//! channels, subscribe to the peripheral's pushes, then stream.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use gattlink_frame::{chunk_size_for_mtu, encode_message, ChannelRegistry, ChannelRole, Side};
use gattlink_transport::{
    Address, Advertisement, BleHost, ConnectionId, DeviceListener, RadioTransport,
    RemoteCharacteristic, TransportError, ValueKind, ValueSubscriber, CCCD_INDICATE, CCCD_NOTIFY,
    CCCD_UUID, DEFAULT_ATT_MTU,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callbacks::HostCallbacks;
use crate::config::SessionConfig;
use crate::control::ControlValue;
use crate::error::{Result, SessionError};
use crate::inbound::InboundPipeline;
use crate::radio::Radio;
use crate::signal::Deferred;

/// CCCD value enabling notifications and indications at once.
const ENABLE_NOTIFY_AND_INDICATE: [u8; 2] = (CCCD_NOTIFY | CCCD_INDICATE).to_le_bytes();

/// Channels the central cannot stream without.
const REQUIRED_ROLES: [ChannelRole; 3] = [
    ChannelRole::Control,
    ChannelRole::Outbound,
    ChannelRole::Inbound,
];

/// Lifecycle of a [`CentralSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CentralState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Subscribing,
    Streaming,
    Disconnected,
}

impl CentralState {
    pub fn as_str(self) -> &'static str {
        match self {
            CentralState::Idle => "idle",
            CentralState::Scanning => "scanning",
            CentralState::Connecting => "connecting",
            CentralState::Discovering => "discovering",
            CentralState::Subscribing => "subscribing",
            CentralState::Streaming => "streaming",
            CentralState::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for CentralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The peripheral a successful `scan_and_connect` ended up streaming with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    pub connection: ConnectionId,
    pub peer: Address,
    pub service: Uuid,
    /// ATT MTU in effect after the exchange (or the default when it failed).
    pub mtu: u16,
}

/// How the setup of one connection ended.
#[derive(Debug, Clone)]
enum SetupOutcome {
    Ready(DiscoveredService),
    /// The peer lacks the target service or one of the required channels.
    NotFound,
    Dropped { peer: Address, reason: u8 },
    Failed { peer: Address, cause: Arc<SessionError> },
}

type ServiceFound = Deferred<SetupOutcome>;

#[derive(Default)]
struct Shared {
    state: CentralState,
    radio: Option<Radio>,
    target: Option<Uuid>,
    found: Option<ServiceFound>,
    connection: Option<(ConnectionId, Address)>,
    channels: ChannelRegistry,
    peer_terminated: bool,
}

impl Shared {
    fn host(&self) -> Result<Arc<dyn BleHost>> {
        self.radio
            .as_ref()
            .map(|radio| Arc::clone(&radio.host))
            .ok_or(SessionError::InvalidState {
                operation: "use the radio",
                state: self.state.as_str(),
            })
    }

    fn is_current(&self, connection: ConnectionId) -> bool {
        self.connection.map(|(current, _)| current) == Some(connection)
    }
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn RadioTransport>,
    callbacks: Arc<HostCallbacks>,
    inbound: InboundPipeline,
    send_lock: tokio::sync::Mutex<()>,
    shared: Mutex<Shared>,
}

/// GATT-client side of a session. Cheap to clone; clones share state.
///
/// All async methods must run on the worker that owns the radio.
#[derive(Clone)]
pub struct CentralSession {
    inner: Arc<Inner>,
}

impl CentralSession {
    pub fn new(
        config: SessionConfig,
        transport: Arc<dyn RadioTransport>,
        callbacks: Arc<HostCallbacks>,
    ) -> Self {
        let inbound = InboundPipeline::new(&config.frame_config(), Arc::clone(&callbacks));
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                callbacks,
                inbound,
                send_lock: tokio::sync::Mutex::new(()),
                shared: Mutex::new(Shared::default()),
            }),
        }
    }

    pub fn state(&self) -> CentralState {
        self.inner.shared().state
    }

    pub fn connection(&self) -> Option<(ConnectionId, Address)> {
        self.inner.shared().connection
    }

    /// Bindings discovered on the current peer.
    pub fn channels(&self) -> ChannelRegistry {
        self.inner.shared().channels.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner
            .shared()
            .radio
            .as_ref()
            .is_some_and(|radio| radio.host.is_scanning())
    }

    /// True once the peripheral pushed the termination sentinel.
    pub fn peer_terminated(&self) -> bool {
        self.inner.shared().peer_terminated
    }

    /// Scan for a peripheral advertising `target` (or a name of the expected
    /// length), connect, discover and subscribe. Waits up to `timeout`.
    ///
    /// A still-active peer from an earlier call is disconnected first.
    /// Scanning is always stopped before returning.
    pub async fn scan_and_connect(
        &self,
        target: Uuid,
        timeout: Duration,
    ) -> Result<DiscoveredService> {
        let radio = self.inner.ensure_radio().await?;
        let host = Arc::clone(&radio.host);
        self.inner.reset_for_scan(&host).await;

        let found = ServiceFound::new();
        {
            let mut shared = self.inner.shared();
            shared.target = Some(target);
            shared.found = Some(found.clone());
            shared.peer_terminated = false;
            shared.state = CentralState::Scanning;
        }
        host.set_listener(Some(Arc::new(CentralListener {
            inner: Arc::downgrade(&self.inner),
        })));
        if let Err(err) = host.start_scanning(true).await {
            self.inner.shared().state = CentralState::Idle;
            return Err(err.into());
        }
        info!(target = %target, "scanning");

        let outcome = tokio::time::timeout(timeout, found.wait()).await;
        if let Err(err) = host.stop_scanning().await {
            debug!(%err, "stop scanning failed");
        }

        match outcome {
            Ok(SetupOutcome::Ready(service)) => {
                info!(
                    peer = %service.peer,
                    connection = %service.connection,
                    mtu = service.mtu,
                    "service found; streaming"
                );
                Ok(service)
            }
            Ok(SetupOutcome::NotFound) => Err(SessionError::ServiceNotFound(target)),
            Ok(SetupOutcome::Dropped { peer, reason }) => {
                warn!(%peer, reason, "peer dropped during setup");
                Err(SessionError::PeerDisconnected { peer, reason })
            }
            Ok(SetupOutcome::Failed { peer, cause }) => Err(SessionError::SetupFailed { peer, cause }),
            Err(_) => {
                let mut shared = self.inner.shared();
                if shared.state == CentralState::Scanning {
                    shared.state = CentralState::Idle;
                }
                warn!(?timeout, state = %shared.state, "scan timed out");
                Err(SessionError::ScanTimeout(timeout))
            }
        }
    }

    /// Frame `message` and write every frame to the Outbound channel without response.
    pub async fn send_message(&self, message: Bytes) -> Result<()> {
        let _writer = self.inner.send_lock.lock().await;
        let (host, handle, connection) = {
            let shared = self.inner.shared();
            if shared.state != CentralState::Streaming {
                return Err(SessionError::InvalidState {
                    operation: "send a message",
                    state: shared.state.as_str(),
                });
            }
            let (connection, _) = shared.connection.ok_or(SessionError::NoActivePeer)?;
            (
                shared.host()?,
                shared.channels.resolve(ChannelRole::Outbound)?,
                connection,
            )
        };

        let mtu = host.mtu(connection).unwrap_or(DEFAULT_ATT_MTU);
        let frames = encode_message(message, chunk_size_for_mtu(mtu))?;
        debug!(frames = frames.len(), mtu, "sending message");
        for frame in frames {
            host.write_value(connection, handle, frame.to_bytes(), false)
                .await?;
        }
        Ok(())
    }

    /// Read the peripheral's identity blob.
    pub async fn read_identity(&self) -> Result<Bytes> {
        let (host, connection, handle) = {
            let shared = self.inner.shared();
            let (connection, _) = shared.connection.ok_or(SessionError::NoActivePeer)?;
            (
                shared.host()?,
                connection,
                shared.channels.resolve(ChannelRole::Identity)?,
            )
        };
        let identity = host.read_value(connection, handle).await?;
        debug!(identity = %hex::encode(&identity), "identity read");
        Ok(identity)
    }

    /// Drop the peer link. Fails with `NoActivePeer` when there is none.
    pub async fn disconnect(&self) -> Result<()> {
        let (host, connection, peer) = {
            let mut shared = self.inner.shared();
            let host = shared.host();
            let Some((connection, peer)) = shared.connection.take() else {
                return Err(SessionError::NoActivePeer);
            };
            shared.state = CentralState::Disconnected;
            shared.channels.clear();
            (host?, connection, peer)
        };
        self.inner.inbound.reset();
        match host.disconnect(connection).await {
            Ok(()) | Err(TransportError::NotConnected(_)) => {
                info!(%connection, %peer, "disconnected from peripheral");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Disconnect, stop scanning and close the radio. Safe to call repeatedly.
    pub async fn close(&self) -> Result<()> {
        let (radio, connection) = {
            let mut shared = self.inner.shared();
            shared.state = CentralState::Disconnected;
            shared.channels.clear();
            shared.target = None;
            shared.found = None;
            (shared.radio.take(), shared.connection.take())
        };
        self.inner.inbound.reset();
        let Some(radio) = radio else {
            return Ok(());
        };

        radio.host.set_listener(None);
        if let Err(err) = radio.host.stop_scanning().await {
            debug!(%err, "stop scanning during close failed");
        }
        if let Some((connection, _)) = connection {
            if let Err(err) = radio.host.disconnect(connection).await {
                debug!(%connection, %err, "disconnect during close failed");
            }
        }
        radio.close(self.inner.config.call_timeout).await;
        info!("central session closed");
        Ok(())
    }
}

impl fmt::Debug for CentralSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CentralSession")
            .field("state", &self.state())
            .field("connection", &self.connection())
            .finish()
    }
}

fn spawn_detached(task: &'static str, future: impl Future<Output = ()> + Send + 'static) -> bool {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
            true
        }
        Err(_) => {
            warn!(task, "no runtime to run task on");
            false
        }
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn ensure_radio(&self) -> Result<Radio> {
        let existing = self
            .shared()
            .radio
            .clone()
            .filter(|radio| radio.is_open());
        if let Some(radio) = existing {
            return Ok(radio);
        }
        let radio = Radio::open(self.transport.as_ref(), &self.config).await?;
        self.shared().radio = Some(radio.clone());
        Ok(radio)
    }

    async fn reset_for_scan(&self, host: &Arc<dyn BleHost>) {
        if host.is_scanning() {
            if let Err(err) = host.stop_scanning().await {
                debug!(%err, "stop scanning failed");
            }
        }
        let previous = {
            let mut shared = self.shared();
            shared.channels.clear();
            shared.found = None;
            shared.connection.take()
        };
        if let Some((connection, peer)) = previous {
            info!(%connection, %peer, "disconnecting previous peer before scanning");
            if let Err(err) = host.disconnect(connection).await {
                debug!(%connection, %err, "disconnect failed");
            }
        }
        self.inbound.reset();
    }

    fn matches(&self, advertisement: &Advertisement, target: Uuid) -> bool {
        let by_name = advertisement
            .data
            .local_name()
            .is_some_and(|name| name.chars().count() == self.config.expected_name_len);
        by_name || advertisement.data.service_uuids().any(|uuid| *uuid == target)
    }

    /// Move to `next` only if `connection` is still the session's peer.
    fn advance(&self, connection: ConnectionId, next: CentralState) -> bool {
        let mut shared = self.shared();
        if !shared.is_current(connection) {
            return false;
        }
        shared.state = next;
        true
    }

    fn on_advertisement(self: &Arc<Self>, advertisement: &Advertisement) {
        let host = {
            let mut shared = self.shared();
            if shared.state != CentralState::Scanning {
                return;
            }
            let Some(target) = shared.target else {
                return;
            };
            if !self.matches(advertisement, target) {
                return;
            }
            let Ok(host) = shared.host() else {
                return;
            };
            shared.state = CentralState::Connecting;
            host
        };

        let peer = advertisement.address;
        info!(
            %peer,
            rssi = advertisement.rssi,
            name = ?advertisement.data.local_name(),
            "matching advertisement; connecting"
        );
        let inner = Arc::clone(self);
        if !spawn_detached("connect", async move { inner.connect(host, peer).await }) {
            self.shared().state = CentralState::Scanning;
        }
    }

    async fn connect(self: Arc<Self>, host: Arc<dyn BleHost>, peer: Address) {
        if let Err(err) = host.stop_scanning().await {
            debug!(%err, "stop scanning before connect failed");
        }
        match host.connect(peer).await {
            Ok(connection) => debug!(%connection, %peer, "connect completed"),
            Err(err) => {
                warn!(%peer, %err, "connect failed; resuming scan");
                let resume = {
                    let mut shared = self.shared();
                    if shared.state == CentralState::Connecting {
                        shared.state = CentralState::Scanning;
                        true
                    } else {
                        false
                    }
                };
                if resume {
                    if let Err(err) = host.start_scanning(true).await {
                        warn!(%err, "failed to resume scanning");
                    }
                }
            }
        }
    }

    fn on_connection(self: &Arc<Self>, connection: ConnectionId, peer: Address) {
        let (host, target, found) = {
            let mut shared = self.shared();
            if shared.state != CentralState::Connecting {
                warn!(%connection, %peer, state = %shared.state, "ignoring connection");
                return;
            }
            let (Ok(host), Some(target), Some(found)) =
                (shared.host(), shared.target, shared.found.clone())
            else {
                return;
            };
            shared.connection = Some((connection, peer));
            shared.state = CentralState::Discovering;
            (host, target, found)
        };
        info!(%connection, %peer, "connected to peripheral");
        self.callbacks.connection_init_started();

        let inner = Arc::clone(self);
        spawn_detached("establish", async move {
            let outcome = inner
                .establish(&host, connection, peer, target)
                .await;
            let outcome = match outcome {
                Ok(Some(service)) => SetupOutcome::Ready(service),
                Ok(None) => SetupOutcome::NotFound,
                Err(err) => {
                    warn!(%connection, %err, "service setup failed");
                    SetupOutcome::Failed {
                        peer,
                        cause: Arc::new(err),
                    }
                }
            };
            // A disconnection seen first has already resolved the wait.
            found.set(outcome);
        });
    }

    async fn establish(
        self: &Arc<Self>,
        host: &Arc<dyn BleHost>,
        connection: ConnectionId,
        peer: Address,
        target: Uuid,
    ) -> Result<Option<DiscoveredService>> {
        let mtu = match host.request_mtu(connection, self.config.preferred_mtu).await {
            Ok(mtu) => {
                info!(%connection, mtu, "MTU negotiated");
                mtu
            }
            Err(err) => {
                let mtu = host.mtu(connection).unwrap_or(DEFAULT_ATT_MTU);
                warn!(%connection, %err, mtu, "MTU exchange failed; keeping current MTU");
                mtu
            }
        };

        let services = host.discover_services(connection).await?;
        let Some(service) = services.into_iter().find(|service| service.uuid == target) else {
            warn!(%connection, %target, "target service not found on peer");
            return Ok(None);
        };
        let characteristics = host.discover_characteristics(connection, &service).await?;

        let mut channels = ChannelRegistry::new();
        let mut control = None;
        let mut inbound = None;
        for characteristic in &characteristics {
            let Some(role) = self
                .config
                .channels
                .role_of(&characteristic.uuid, Side::Central)
            else {
                continue;
            };
            if let Err(err) = channels.bind(role, characteristic.handle) {
                warn!(%err, uuid = %characteristic.uuid, "duplicate channel characteristic ignored");
                continue;
            }
            match role {
                ChannelRole::Control => control = Some(characteristic.clone()),
                ChannelRole::Inbound => inbound = Some(characteristic.clone()),
                _ => {}
            }
        }

        if let Some(control) = &control {
            let start = ControlValue::StartTransmission.to_bytes();
            match host.write_value(connection, control.handle, start, false).await {
                Ok(()) => debug!(%connection, "start transmission sent"),
                Err(err) => warn!(%connection, %err, "start transmission write failed"),
            }
        }

        let Some(inbound) = inbound.filter(|_| channels.has_all(&REQUIRED_ROLES)) else {
            let missing: Vec<&str> = REQUIRED_ROLES
                .iter()
                .filter(|role| !channels.is_bound(**role))
                .map(|role| role.name())
                .collect();
            warn!(%connection, ?missing, "required channels missing on peer");
            return Ok(None);
        };

        if !self.advance(connection, CentralState::Subscribing) {
            return Err(SessionError::OperationAborted);
        }
        self.subscribe_inbound(host, connection, &inbound).await?;
        if let Some(control) = &control {
            self.subscribe_control(host, connection, control).await;
        }
        if !self.config.subscribe_grace.is_zero() {
            tokio::time::sleep(self.config.subscribe_grace).await;
        }

        {
            let mut shared = self.shared();
            if !shared.is_current(connection) {
                return Err(SessionError::OperationAborted);
            }
            shared.channels = channels;
            shared.state = CentralState::Streaming;
        }
        Ok(Some(DiscoveredService {
            connection,
            peer,
            service: target,
            mtu,
        }))
    }

    /// Enable both push kinds through the CCCD; fall back to the stack's
    /// subscribe primitive, preferring notifications.
    async fn subscribe_inbound(
        self: &Arc<Self>,
        host: &Arc<dyn BleHost>,
        connection: ConnectionId,
        inbound: &RemoteCharacteristic,
    ) -> Result<()> {
        let sink = Arc::downgrade(self);
        let subscriber: ValueSubscriber = Arc::new(move |value: Bytes| {
            if let Some(inner) = sink.upgrade() {
                inner.inbound.on_value(value);
            }
        });

        match enable_both(host, connection, inbound, Arc::clone(&subscriber)).await {
            Ok(()) => info!(%connection, "notifications and indications enabled"),
            Err(err) => {
                warn!(%connection, %err, "CCCD write failed; falling back to subscribe");
                host.subscribe(connection, inbound, true, subscriber).await?;
                info!(%connection, "subscribed, notify preferred");
            }
        }
        Ok(())
    }

    async fn subscribe_control(
        self: &Arc<Self>,
        host: &Arc<dyn BleHost>,
        connection: ConnectionId,
        control: &RemoteCharacteristic,
    ) {
        let sink = Arc::downgrade(self);
        let subscriber: ValueSubscriber = Arc::new(move |value: Bytes| {
            if ControlValue::from_bytes(&value) != Some(ControlValue::SessionTermination) {
                debug!(value = %hex::encode(&value), "ignoring control notification");
                return;
            }
            if let Some(inner) = sink.upgrade() {
                inner.shared().peer_terminated = true;
                info!("peripheral requested session termination");
            }
        });
        if let Err(err) = host.subscribe(connection, control, true, subscriber).await {
            debug!(%connection, %err, "control notifications unavailable");
        }
    }

    fn on_disconnection(&self, connection: ConnectionId, reason: u8) {
        let pending = {
            let mut shared = self.shared();
            if !shared.is_current(connection) {
                debug!(%connection, reason, "disconnection of unknown connection");
                return;
            }
            let setting_up = matches!(
                shared.state,
                CentralState::Discovering | CentralState::Subscribing
            );
            let peer = shared.connection.take().map(|(_, peer)| peer);
            shared.channels.clear();
            shared.state = CentralState::Disconnected;
            match (setting_up, shared.found.clone(), peer) {
                (true, Some(found), Some(peer)) => Some((found, peer)),
                _ => None,
            }
        };
        info!(%connection, reason = format_args!("0x{reason:02x}"), "peripheral disconnected");
        self.inbound.reset();
        if let Some((found, peer)) = pending {
            found.set(SetupOutcome::Dropped { peer, reason });
        }
    }
}

async fn enable_both(
    host: &Arc<dyn BleHost>,
    connection: ConnectionId,
    inbound: &RemoteCharacteristic,
    subscriber: ValueSubscriber,
) -> std::result::Result<(), TransportError> {
    let descriptors = host.discover_descriptors(connection, inbound).await?;
    let cccd = descriptors
        .iter()
        .find(|descriptor| descriptor.uuid == CCCD_UUID)
        .ok_or_else(|| TransportError::Rejected("inbound characteristic has no CCCD".to_string()))?;
    host.write_value(
        connection,
        cccd.handle,
        Bytes::copy_from_slice(&ENABLE_NOTIFY_AND_INDICATE),
        true,
    )
    .await?;
    host.add_value_subscriber(
        connection,
        inbound.handle,
        ValueKind::Notification,
        Arc::clone(&subscriber),
    );
    host.add_value_subscriber(connection, inbound.handle, ValueKind::Indication, subscriber);
    Ok(())
}

struct CentralListener {
    inner: Weak<Inner>,
}

impl DeviceListener for CentralListener {
    fn on_connection(&self, connection: ConnectionId, peer: Address) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_connection(connection, peer);
        }
    }

    fn on_disconnection(&self, connection: ConnectionId, reason: u8) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_disconnection(connection, reason);
        }
    }

    fn on_advertisement(&self, advertisement: &Advertisement) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_advertisement(advertisement);
        }
    }
}
