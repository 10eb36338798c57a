//! The process-wide session manager.
//!
//! [`GattLink`] owns the single current session and exposes every operation
//! as a blocking call routed through the [`EventLoopBridge`]. Host threads
//! never touch session state directly.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use gattlink_transport::{Address, RadioTransport};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::EventLoopBridge;
use crate::callbacks::{EventCallback, HostCallbacks, MessageCallback};
use crate::central::{CentralSession, DiscoveredService};
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::peripheral::PeripheralSession;

/// Which role the current session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Peripheral,
    Central,
}

impl LinkRole {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkRole::Peripheral => "peripheral",
            LinkRole::Central => "central",
        }
    }
}

impl fmt::Display for LinkRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the current session, taken on the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    /// `None` while no session exists.
    pub role: Option<LinkRole>,
    pub state: &'static str,
    pub connected: bool,
    pub peer: Option<Address>,
    pub scanning: bool,
    pub advertising: bool,
    /// Central only: the peripheral pushed the termination sentinel.
    pub peer_terminated: bool,
}

#[derive(Clone, Default)]
enum SessionSlot {
    #[default]
    Idle,
    Peripheral(PeripheralSession),
    Central(CentralSession),
}

struct LinkInner {
    config: SessionConfig,
    transport: Arc<dyn RadioTransport>,
    callbacks: Arc<HostCallbacks>,
    slot: Mutex<SessionSlot>,
}

/// Blocking, thread-safe front end over one peripheral or central session.
///
/// Starting a session of the other role closes the current one first.
pub struct GattLink {
    bridge: Arc<EventLoopBridge>,
    inner: Arc<LinkInner>,
}

impl GattLink {
    /// A manager driven by the process-wide bridge.
    pub fn new(config: SessionConfig, transport: Arc<dyn RadioTransport>) -> Self {
        Self::with_bridge(config, transport, EventLoopBridge::global())
    }

    pub fn with_bridge(
        config: SessionConfig,
        transport: Arc<dyn RadioTransport>,
        bridge: Arc<EventLoopBridge>,
    ) -> Self {
        Self {
            bridge,
            inner: Arc::new(LinkInner {
                config,
                transport,
                callbacks: Arc::new(HostCallbacks::new()),
                slot: Mutex::new(SessionSlot::Idle),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn bridge(&self) -> &Arc<EventLoopBridge> {
        &self.bridge
    }

    pub fn callbacks(&self) -> &Arc<HostCallbacks> {
        &self.inner.callbacks
    }

    /// Start the worker. Does nothing when it is already running.
    pub fn start(&self) -> Result<()> {
        self.bridge.start(self.inner.config.bridge_ready_timeout)
    }

    /// Tear down the current session, then stop the worker.
    ///
    /// Returns `false` when the worker did not exit in time.
    pub fn stop(&self) -> bool {
        if self.bridge.is_running() {
            if let Err(err) = self.teardown() {
                warn!(%err, "teardown before stop failed");
            }
        }
        self.bridge.stop(self.inner.config.bridge_stop_timeout)
    }

    pub fn on_connection_init_started(&self, callback: Option<EventCallback>) {
        self.inner.callbacks.set_connection_init_started(callback);
    }

    pub fn on_message_start_received(&self, callback: Option<EventCallback>) {
        self.inner.callbacks.set_message_start_received(callback);
    }

    pub fn on_message_received(&self, callback: Option<MessageCallback>) {
        self.inner.callbacks.set_message_received(callback);
    }

    /// Run the peripheral role: publish the channels under `service`,
    /// advertise, and block until the central sends the start signal.
    pub fn begin_advertising(
        &self,
        identity: impl Into<Bytes>,
        service: Uuid,
        timeout: Duration,
    ) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let identity = identity.into();
        self.bridge.submit(
            async move {
                inner
                    .peripheral()
                    .await
                    .begin_advertising(identity, service, timeout)
                    .await
            },
            timeout + self.inner.config.bridge_margin,
        )
    }

    /// Run the central role: scan for `target`, connect, subscribe, and block
    /// until the session streams.
    pub fn scan_and_connect(&self, target: Uuid, timeout: Duration) -> Result<DiscoveredService> {
        let inner = Arc::clone(&self.inner);
        self.bridge.submit(
            async move {
                inner
                    .central()
                    .await
                    .scan_and_connect(target, timeout)
                    .await
            },
            timeout + self.inner.config.bridge_margin,
        )
    }

    /// Send one message on the current session's outbound channel.
    pub fn send_message(&self, message: impl Into<Bytes>) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let message = message.into();
        self.call(async move {
            match inner.current() {
                SessionSlot::Peripheral(session) => session.send_message(message).await,
                SessionSlot::Central(session) => session.send_message(message).await,
                SessionSlot::Idle => Err(SessionError::InvalidState {
                    operation: "send a message",
                    state: "idle",
                }),
            }
        })
    }

    /// Peripheral only: push the termination sentinel to the central.
    pub fn send_termination(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.call(async move {
            match inner.current() {
                SessionSlot::Peripheral(session) => session.send_termination().await,
                SessionSlot::Central(session) => Err(SessionError::InvalidState {
                    operation: "send termination",
                    state: session.state().as_str(),
                }),
                SessionSlot::Idle => Err(SessionError::InvalidState {
                    operation: "send termination",
                    state: "idle",
                }),
            }
        })
    }

    /// Central only: drop the peer link.
    pub fn disconnect(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.call(async move {
            match inner.current() {
                SessionSlot::Central(session) => session.disconnect().await,
                SessionSlot::Peripheral(session) => Err(SessionError::InvalidState {
                    operation: "disconnect",
                    state: session.state().as_str(),
                }),
                SessionSlot::Idle => Err(SessionError::NoActivePeer),
            }
        })
    }

    /// Central only: read the peer's identity blob.
    pub fn read_identity(&self) -> Result<Bytes> {
        let inner = Arc::clone(&self.inner);
        self.call(async move {
            match inner.current() {
                SessionSlot::Central(session) => session.read_identity().await,
                SessionSlot::Peripheral(session) => Err(SessionError::InvalidState {
                    operation: "read the peer identity",
                    state: session.state().as_str(),
                }),
                SessionSlot::Idle => Err(SessionError::NoActivePeer),
            }
        })
    }

    /// Close the current session and release the radio. Safe to call repeatedly.
    pub fn teardown(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.bridge.submit(
            async move { inner.close_current().await },
            self.inner.config.call_timeout + self.inner.config.bridge_margin,
        )
    }

    pub fn snapshot(&self) -> Result<LinkSnapshot> {
        let inner = Arc::clone(&self.inner);
        self.call(async move { Ok(inner.snapshot()) })
    }

    fn call<F, T>(&self, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.bridge.submit(operation, self.inner.config.call_timeout)
    }
}

impl fmt::Debug for GattLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattLink")
            .field("bridge", &self.bridge)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl LinkInner {
    fn slot(&self) -> MutexGuard<'_, SessionSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current(&self) -> SessionSlot {
        self.slot().clone()
    }

    async fn peripheral(&self) -> PeripheralSession {
        let previous = {
            let mut slot = self.slot();
            if let SessionSlot::Peripheral(session) = &*slot {
                return session.clone();
            }
            std::mem::take(&mut *slot)
        };
        close_session(previous).await;

        let session = PeripheralSession::new(
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.callbacks),
        );
        *self.slot() = SessionSlot::Peripheral(session.clone());
        debug!("peripheral session created");
        session
    }

    async fn central(&self) -> CentralSession {
        let previous = {
            let mut slot = self.slot();
            if let SessionSlot::Central(session) = &*slot {
                return session.clone();
            }
            std::mem::take(&mut *slot)
        };
        close_session(previous).await;

        let session = CentralSession::new(
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.callbacks),
        );
        *self.slot() = SessionSlot::Central(session.clone());
        debug!("central session created");
        session
    }

    async fn close_current(&self) -> Result<()> {
        let previous = std::mem::take(&mut *self.slot());
        close_session(previous).await;
        Ok(())
    }

    fn snapshot(&self) -> LinkSnapshot {
        match self.current() {
            SessionSlot::Idle => LinkSnapshot {
                role: None,
                state: "idle",
                connected: false,
                peer: None,
                scanning: false,
                advertising: false,
                peer_terminated: false,
            },
            SessionSlot::Peripheral(session) => {
                let state = session.state();
                LinkSnapshot {
                    role: Some(LinkRole::Peripheral),
                    state: state.as_str(),
                    connected: state.is_connected(),
                    peer: session.connection().map(|(_, peer)| peer),
                    scanning: false,
                    advertising: session.is_advertising(),
                    peer_terminated: false,
                }
            }
            SessionSlot::Central(session) => {
                let connection = session.connection();
                LinkSnapshot {
                    role: Some(LinkRole::Central),
                    state: session.state().as_str(),
                    connected: connection.is_some(),
                    peer: connection.map(|(_, peer)| peer),
                    scanning: session.is_scanning(),
                    advertising: false,
                    peer_terminated: session.peer_terminated(),
                }
            }
        }
    }
}

async fn close_session(slot: SessionSlot) {
    let outcome = match slot {
        SessionSlot::Idle => return,
        SessionSlot::Peripheral(session) => session.teardown().await,
        SessionSlot::Central(session) => session.close().await,
    };
    match outcome {
        Ok(()) => info!("previous session closed"),
        Err(err) => warn!(%err, "closing previous session failed"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gattlink_transport::{DeviceConfig, SimOptions, SimTransport, TransportDescriptor};

    use super::*;

    const SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

    fn air(tag: &str) -> TransportDescriptor {
        TransportDescriptor::sim(&format!(
            "manager-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    fn link(
        tag: &str,
        descriptor: &TransportDescriptor,
        name: &str,
        options: SimOptions,
    ) -> GattLink {
        let config = SessionConfig::default()
            .with_descriptor(descriptor.clone())
            .with_device(DeviceConfig {
                name: name.to_string(),
                ..DeviceConfig::default()
            })
            .with_subscribe_grace(Duration::from_millis(20));
        let link = GattLink::with_bridge(
            config,
            Arc::new(SimTransport::new(options)),
            Arc::new(EventLoopBridge::new(format!("test-{tag}"))),
        );
        link.start().unwrap();
        link
    }

    fn collect_messages(link: &GattLink) -> Arc<Mutex<Vec<Bytes>>> {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        link.on_message_received(Some(Arc::new(move |message: Bytes| {
            sink.lock().unwrap().push(message);
        })));
        received
    }

    fn wait_for(what: &str, check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timed out waiting for {what}");
    }

    #[test]
    fn calls_fail_before_start() {
        let link = GattLink::with_bridge(
            SessionConfig::default().with_descriptor(air("unstarted")),
            Arc::new(SimTransport::default()),
            Arc::new(EventLoopBridge::new("test-unstarted")),
        );
        assert!(matches!(
            link.snapshot(),
            Err(SessionError::BridgeNotRunning)
        ));
        assert!(link.stop());
    }

    #[test]
    fn idle_link_reports_nothing_active() {
        let descriptor = air("idle");
        let link = link("idle", &descriptor, "idle", SimOptions::default());
        let snapshot = link.snapshot().unwrap();
        assert_eq!(snapshot.role, None);
        assert!(!snapshot.connected);
        assert!(matches!(link.disconnect(), Err(SessionError::NoActivePeer)));
        assert!(matches!(
            link.send_message(Bytes::from_static(b"x")),
            Err(SessionError::InvalidState { .. })
        ));
        assert!(link.stop());
    }

    #[test]
    fn setup_timeout_leaves_session_advertising() {
        let descriptor = air("setup");
        let link = link("setup", &descriptor, "GLNK", SimOptions::default());
        let err = link
            .begin_advertising(Bytes::new(), SERVICE, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, SessionError::SetupTimeout(_)));

        let snapshot = link.snapshot().unwrap();
        assert_eq!(snapshot.role, Some(LinkRole::Peripheral));
        assert_eq!(snapshot.state, "advertising");
        assert!(snapshot.advertising);

        link.teardown().unwrap();
        link.teardown().unwrap();
        assert_eq!(link.snapshot().unwrap().role, None);
        assert!(link.stop());
    }

    #[test]
    fn scan_timeout_stops_scanning_and_switches_role() {
        let descriptor = air("scan");
        let link = link("scan", &descriptor, "central", SimOptions::default());
        let _ = link.begin_advertising(Bytes::new(), SERVICE, Duration::from_millis(50));

        let err = link
            .scan_and_connect(SERVICE, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, SessionError::ScanTimeout(_)));
        let snapshot = link.snapshot().unwrap();
        assert_eq!(snapshot.role, Some(LinkRole::Central));
        assert!(!snapshot.scanning);
        assert!(!snapshot.advertising);
        assert!(link.stop());
    }

    #[test]
    fn peripheral_and_central_exchange_messages() {
        let descriptor = air("exchange");
        let peripheral = Arc::new(link(
            "exchange-peripheral",
            &descriptor,
            "GLNK",
            SimOptions::default(),
        ));
        let central = link("exchange-central", &descriptor, "central", SimOptions::default());
        let at_peripheral = collect_messages(&peripheral);
        let at_central = collect_messages(&central);

        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);
        peripheral.on_connection_init_started(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        central.on_message_start_received(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        let advertiser = {
            let peripheral = Arc::clone(&peripheral);
            std::thread::spawn(move || {
                peripheral.begin_advertising(
                    Bytes::from_static(b"device-1"),
                    SERVICE,
                    Duration::from_secs(5),
                )
            })
        };
        let service = central
            .scan_and_connect(SERVICE, Duration::from_secs(5))
            .unwrap();
        advertiser.join().unwrap().unwrap();
        assert_eq!(service.service, SERVICE);
        assert_eq!(connections.load(Ordering::SeqCst), 1);

        let upstream = vec![0x5a; 2000];
        central.send_message(upstream.clone()).unwrap();
        wait_for("upstream message", || !at_peripheral.lock().unwrap().is_empty());
        assert_eq!(
            at_peripheral.lock().unwrap().as_slice(),
            &[Bytes::from(upstream)]
        );

        peripheral.send_message(&b"one frame"[..]).unwrap();
        peripheral.send_message(vec![7u8; 1500]).unwrap();
        wait_for("downstream messages", || at_central.lock().unwrap().len() == 2);
        assert_eq!(at_central.lock().unwrap()[0].as_ref(), b"one frame");
        assert_eq!(at_central.lock().unwrap()[1].len(), 1500);
        // Only the multi-frame message announces its start.
        assert_eq!(starts.load(Ordering::SeqCst), 1);

        assert_eq!(central.read_identity().unwrap().as_ref(), b"device-1");

        peripheral.send_termination().unwrap();
        wait_for("termination", || central.snapshot().unwrap().peer_terminated);
        assert_eq!(peripheral.snapshot().unwrap().state, "terminating");

        central.disconnect().unwrap();
        assert!(matches!(central.disconnect(), Err(SessionError::NoActivePeer)));
        wait_for("peripheral to readvertise", || {
            peripheral.snapshot().unwrap().advertising
        });

        assert!(central.stop());
        assert!(peripheral.stop());
    }

    #[test]
    fn degraded_peer_still_streams() {
        let descriptor = air("degraded");
        let peripheral = Arc::new(link(
            "degraded-peripheral",
            &descriptor,
            "GLNK",
            SimOptions {
                reject_indicate: true,
                fail_mtu_exchange: true,
                ..SimOptions::default()
            },
        ));
        let central = link("degraded-central", &descriptor, "central", SimOptions::default());
        let at_central = collect_messages(&central);

        let advertiser = {
            let peripheral = Arc::clone(&peripheral);
            std::thread::spawn(move || {
                peripheral.begin_advertising(Bytes::new(), SERVICE, Duration::from_secs(5))
            })
        };
        let service = central
            .scan_and_connect(SERVICE, Duration::from_secs(5))
            .unwrap();
        advertiser.join().unwrap().unwrap();
        assert_eq!(service.mtu, 23);

        let message: Vec<u8> = (0..100u8).collect();
        peripheral.send_message(message.clone()).unwrap();
        wait_for("message", || !at_central.lock().unwrap().is_empty());
        assert_eq!(at_central.lock().unwrap().as_slice(), &[Bytes::from(message)]);

        assert!(central.stop());
        assert!(peripheral.stop());
    }
}
