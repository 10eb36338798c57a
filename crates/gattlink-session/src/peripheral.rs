//! Peripheral role: advertise, publish the four channels, wait for the
//! central's start signal, then stream.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use gattlink_frame::{chunk_size_for_mtu, encode_message, ChannelRegistry, ChannelRole, Side};
use gattlink_transport::{
    AdvertisingData, Address, AttributeHandle, AttributePermissions, BleHost,
    CharacteristicDefinition, CharacteristicProperties, ConnectionId, DeviceListener,
    PublishedService, RadioTransport, ServiceDefinition, DEFAULT_ATT_MTU,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::callbacks::HostCallbacks;
use crate::config::SessionConfig;
use crate::control::ControlValue;
use crate::error::{Result, SessionError};
use crate::inbound::InboundPipeline;
use crate::radio::Radio;
use crate::signal::StartSignal;

/// Lifecycle of a [`PeripheralSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeripheralState {
    #[default]
    Idle,
    Advertising,
    Connected,
    AwaitingStart,
    Streaming,
    Terminating,
    Disconnected,
}

impl PeripheralState {
    pub fn as_str(self) -> &'static str {
        match self {
            PeripheralState::Idle => "idle",
            PeripheralState::Advertising => "advertising",
            PeripheralState::Connected => "connected",
            PeripheralState::AwaitingStart => "awaiting-start",
            PeripheralState::Streaming => "streaming",
            PeripheralState::Terminating => "terminating",
            PeripheralState::Disconnected => "disconnected",
        }
    }

    /// True while a central holds the link.
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            PeripheralState::Connected
                | PeripheralState::AwaitingStart
                | PeripheralState::Streaming
                | PeripheralState::Terminating
        )
    }
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Default)]
struct Shared {
    state: PeripheralState,
    radio: Option<Radio>,
    service: Option<PublishedService>,
    channels: ChannelRegistry,
    start: StartSignal,
    connection: Option<(ConnectionId, Address)>,
    keepalive: Option<CancellationToken>,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn RadioTransport>,
    callbacks: Arc<HostCallbacks>,
    inbound: InboundPipeline,
    send_lock: tokio::sync::Mutex<()>,
    shared: Mutex<Shared>,
}

/// GATT-server side of a session. Cheap to clone; clones share state.
///
/// All async methods must run on the worker that owns the radio.
#[derive(Clone)]
pub struct PeripheralSession {
    inner: Arc<Inner>,
}

impl PeripheralSession {
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

    pub fn state(&self) -> PeripheralState {
        self.inner.shared().state
    }

    /// Bindings of the most recent publication.
    pub fn channels(&self) -> ChannelRegistry {
        self.inner.shared().channels.clone()
    }

    pub fn connection(&self) -> Option<(ConnectionId, Address)> {
        self.inner.shared().connection
    }

    pub fn start_signal(&self) -> StartSignal {
        self.inner.shared().start.clone()
    }

    pub fn is_advertising(&self) -> bool {
        self.inner
            .shared()
            .radio
            .as_ref()
            .is_some_and(|radio| radio.host.is_advertising())
    }

    /// Open the radio (or reuse the open one), publish the channels under
    /// `service`, advertise it, and wait up to `timeout` for the start signal.
    ///
    /// Calling again replaces the previous publication. On timeout the session
    /// stays advertising (or connected); retrying or tearing down is up to the
    /// caller.
    pub async fn begin_advertising(
        &self,
        identity: Bytes,
        service: Uuid,
        timeout: Duration,
    ) -> Result<()> {
        let state = self.state();
        if matches!(
            state,
            PeripheralState::Streaming | PeripheralState::Terminating
        ) {
            return Err(SessionError::InvalidState {
                operation: "begin advertising",
                state: state.as_str(),
            });
        }

        let radio = self.inner.ensure_radio().await?;
        let host = Arc::clone(&radio.host);
        self.inner.retire_publication(&host).await;
        self.inner.inbound.reset();

        let published = host.add_service(self.inner.service_definition(service, identity))?;
        let mut channels = ChannelRegistry::new();
        for role in ChannelRole::ALL {
            let uuid = self.inner.config.channels.uuid_for(role, Side::Peripheral);
            let handle = published.handle_for(&uuid).ok_or_else(|| {
                SessionError::ChannelUnavailable(format!("{role} characteristic was not published"))
            })?;
            channels.bind(role, handle)?;
        }
        debug!(service = %service, handle = %published.handle, "channels published");

        host.set_listener(Some(Arc::new(PeripheralListener {
            inner: Arc::downgrade(&self.inner),
        })));
        if !self.inner.config.publish_settle.is_zero() {
            tokio::time::sleep(self.inner.config.publish_settle).await;
        }
        host.set_advertising_data(AdvertisingData {
            complete_local_name: Some(self.inner.config.device.name.clone()),
            complete_service_uuids: vec![service],
            ..AdvertisingData::default()
        });

        let start = StartSignal::new();
        {
            let mut shared = self.inner.shared();
            shared.service = Some(published);
            shared.channels = channels;
            shared.start = start.clone();
            shared.connection = None;
            shared.state = PeripheralState::Advertising;
        }
        if let Err(err) = host.start_advertising(true).await {
            self.inner.shared().state = PeripheralState::Idle;
            return Err(err.into());
        }
        info!(service = %service, address = %host.address(), "advertising");
        self.inner.spawn_keepalive(&radio);

        match tokio::time::timeout(timeout, start.wait()).await {
            Ok(_) => {
                self.inner.promote_to_streaming();
                info!(state = %self.state(), "start signal received");
                Ok(())
            }
            Err(_) => {
                warn!(?timeout, state = %self.state(), "no start signal before setup timeout");
                Err(SessionError::SetupTimeout(timeout))
            }
        }
    }

    /// Frame `message` and push every frame on the Outbound channel.
    ///
    /// Fails with `ChannelUnavailable` when no central is subscribed.
    pub async fn send_message(&self, message: Bytes) -> Result<()> {
        let _writer = self.inner.send_lock.lock().await;
        let (host, handle, connection) = {
            let shared = self.inner.shared();
            if shared.state != PeripheralState::Streaming {
                return Err(SessionError::InvalidState {
                    operation: "send a message",
                    state: shared.state.as_str(),
                });
            }
            (
                shared.host()?,
                shared.channels.resolve(ChannelRole::Outbound)?,
                shared.connection.map(|(connection, _)| connection),
            )
        };

        let mtu = connection
            .and_then(|connection| host.mtu(connection))
            .unwrap_or(DEFAULT_ATT_MTU);
        let frames = encode_message(message, chunk_size_for_mtu(mtu))?;
        debug!(frames = frames.len(), mtu, "sending message");
        for frame in frames {
            let delivered = host.notify_subscribers(handle, frame.to_bytes()).await?;
            if delivered == 0 {
                warn!(%handle, "no central subscribed to the outbound channel");
                return Err(SessionError::ChannelUnavailable(
                    "no central subscribed to the outbound channel".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Push the termination sentinel on the Control channel. The link stays open.
    pub async fn send_termination(&self) -> Result<()> {
        let _writer = self.inner.send_lock.lock().await;
        let (host, handle) = {
            let shared = self.inner.shared();
            if !shared.state.is_connected() {
                return Err(SessionError::InvalidState {
                    operation: "send termination",
                    state: shared.state.as_str(),
                });
            }
            (shared.host()?, shared.channels.resolve(ChannelRole::Control)?)
        };

        let bound = self.inner.config.termination_timeout;
        let push = host.notify_subscribers(handle, ControlValue::SessionTermination.to_bytes());
        match tokio::time::timeout(bound, push).await {
            Ok(Ok(0)) => warn!("no central subscribed to the control channel"),
            Ok(Ok(delivered)) => info!(delivered, "termination sent"),
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(SessionError::Timeout(bound)),
        }
        self.inner.shared().state = PeripheralState::Terminating;
        Ok(())
    }

    /// Release the publication and close the radio. Safe to call repeatedly.
    pub async fn teardown(&self) -> Result<()> {
        let (radio, service, connection, keepalive) = {
            let mut shared = self.inner.shared();
            shared.state = PeripheralState::Disconnected;
            shared.channels.clear();
            (
                shared.radio.take(),
                shared.service.take(),
                shared.connection.take(),
                shared.keepalive.take(),
            )
        };
        self.inner.inbound.reset();
        if let Some(keepalive) = keepalive {
            keepalive.cancel();
        }
        let Some(radio) = radio else {
            debug!("peripheral teardown: nothing to release");
            return Ok(());
        };

        radio.host.set_listener(None);
        if let Some((connection, peer)) = connection {
            if let Err(err) = radio.host.disconnect(connection).await {
                debug!(%connection, %peer, %err, "disconnect during teardown failed");
            }
        }
        if let Err(err) = radio.host.stop_advertising().await {
            debug!(%err, "stop advertising during teardown failed");
        }
        if let Some(service) = service {
            if let Err(err) = radio.host.remove_service(service.handle) {
                debug!(%err, "service removal during teardown failed");
            }
        }
        radio.close(self.inner.config.call_timeout).await;
        info!("peripheral session torn down");
        Ok(())
    }
}

impl fmt::Debug for PeripheralSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralSession")
            .field("state", &self.state())
            .field("connection", &self.connection())
            .finish()
    }
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

    /// Drop the previous publication, its peer and its bindings.
    async fn retire_publication(&self, host: &Arc<dyn BleHost>) {
        let (service, connection) = {
            let mut shared = self.shared();
            shared.channels.clear();
            (shared.service.take(), shared.connection.take())
        };
        if let Some((connection, peer)) = connection {
            info!(%connection, %peer, "dropping previous central before republishing");
            if let Err(err) = host.disconnect(connection).await {
                debug!(%connection, %err, "disconnect failed");
            }
        }
        if host.is_advertising() {
            if let Err(err) = host.stop_advertising().await {
                warn!(%err, "failed to stop advertising");
            }
        }
        if let Some(service) = service {
            if let Err(err) = host.remove_service(service.handle) {
                warn!(%err, handle = %service.handle, "failed to remove previous service");
            }
        }
    }

    fn service_definition(self: &Arc<Self>, service: Uuid, identity: Bytes) -> ServiceDefinition {
        let scheme = &self.config.channels;
        let uuid = |role| scheme.uuid_for(role, Side::Peripheral);

        let control_sink = Arc::downgrade(self);
        let control = CharacteristicDefinition::new(
            uuid(ChannelRole::Control),
            CharacteristicProperties::NOTIFY | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            AttributePermissions::READABLE | AttributePermissions::WRITEABLE,
        )
        .with_write(Arc::new(move |connection: ConnectionId, value: Bytes| {
            if let Some(inner) = control_sink.upgrade() {
                inner.on_control_write(connection, value);
            }
        }));

        let inbound_sink = Arc::downgrade(self);
        let inbound = CharacteristicDefinition::new(
            uuid(ChannelRole::Inbound),
            CharacteristicProperties::WRITE | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            AttributePermissions::WRITEABLE,
        )
        .with_write(Arc::new(move |_: ConnectionId, value: Bytes| {
            if let Some(inner) = inbound_sink.upgrade() {
                inner.inbound.on_value(value);
            }
        }));

        let outbound = CharacteristicDefinition::new(
            uuid(ChannelRole::Outbound),
            CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
            AttributePermissions::READABLE,
        );

        let identity_blob = CharacteristicDefinition::new(
            uuid(ChannelRole::Identity),
            CharacteristicProperties::READ,
            AttributePermissions::READABLE,
        )
        .with_read(Arc::new(move |connection: ConnectionId| {
            debug!(%connection, identity = %hex::encode(&identity), "identity read");
            identity.clone()
        }));

        ServiceDefinition {
            uuid: service,
            characteristics: vec![control, inbound, outbound, identity_blob],
        }
    }

    fn spawn_keepalive(&self, radio: &Radio) {
        let token = CancellationToken::new();
        if let Some(previous) = self.shared().keepalive.replace(token.clone()) {
            previous.cancel();
        }
        let link = Arc::clone(&radio.link);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = link.wait_for_termination() => {
                    info!(descriptor = %link.descriptor(), "radio link terminated");
                }
            }
        });
    }

    fn promote_to_streaming(&self) {
        let mut shared = self.shared();
        if matches!(
            shared.state,
            PeripheralState::Connected | PeripheralState::AwaitingStart
        ) {
            shared.state = PeripheralState::Streaming;
        }
    }

    fn on_control_write(&self, connection: ConnectionId, value: Bytes) {
        match ControlValue::from_bytes(&value) {
            Some(ControlValue::StartTransmission) => {
                let start = self.shared().start.clone();
                if start.set(true) {
                    info!(%connection, "start transmission received");
                    self.promote_to_streaming();
                } else {
                    debug!(%connection, "start transmission repeated; already resolved");
                }
            }
            Some(other) => debug!(%connection, ?other, "ignoring control value from central"),
            None => warn!(%connection, value = %hex::encode(&value), "unknown control value"),
        }
    }

    fn on_connection(&self, connection: ConnectionId, peer: Address) {
        {
            let mut shared = self.shared();
            if shared.state != PeripheralState::Advertising {
                warn!(%connection, %peer, state = %shared.state, "ignoring connection");
                return;
            }
            shared.connection = Some((connection, peer));
            shared.state = PeripheralState::Connected;
        }
        info!(%connection, %peer, "central connected");
        self.callbacks.connection_init_started();

        let mut shared = self.shared();
        if shared.state == PeripheralState::Connected {
            shared.state = if shared.start.is_set() {
                PeripheralState::Streaming
            } else {
                PeripheralState::AwaitingStart
            };
        }
    }

    fn on_disconnection(&self, connection: ConnectionId, reason: u8) {
        {
            let mut shared = self.shared();
            if shared.connection.map(|(current, _)| current) != Some(connection) {
                debug!(%connection, reason, "disconnection of unknown connection");
                return;
            }
            shared.connection = None;
            if !matches!(
                shared.state,
                PeripheralState::Idle | PeripheralState::Disconnected
            ) {
                shared.state = PeripheralState::Advertising;
            }
        }
        info!(%connection, reason = format_args!("0x{reason:02x}"), "central disconnected");
        self.inbound.reset();
    }
}

struct PeripheralListener {
    inner: Weak<Inner>,
}

impl DeviceListener for PeripheralListener {
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

    fn on_subscription(
        &self,
        connection: ConnectionId,
        handle: AttributeHandle,
        notify: bool,
        indicate: bool,
    ) {
        info!(%connection, %handle, notify, indicate, "subscription changed");
    }
}
