use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use tracing::{debug, error};

/// Host hook without arguments.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;
/// Host hook receiving a complete inbound message.
pub type MessageCallback = Arc<dyn Fn(Bytes) + Send + Sync>;

/// Event kinds a host can hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    ConnectionInitStarted,
    MessageStartReceived,
    MessageReceived,
}

impl HostEvent {
    pub fn name(self) -> &'static str {
        match self {
            HostEvent::ConnectionInitStarted => "connection_init_started",
            HostEvent::MessageStartReceived => "message_start_received",
            HostEvent::MessageReceived => "message_received",
        }
    }
}

/// Registration table for host callbacks.
///
/// Each slot holds at most one callback; registering again replaces it.
/// Callbacks run on the worker thread. A panicking callback is logged and
/// swallowed.
#[derive(Default)]
pub struct HostCallbacks {
    connection_init_started: RwLock<Option<EventCallback>>,
    message_start_received: RwLock<Option<EventCallback>>,
    message_received: RwLock<Option<MessageCallback>>,
}

fn replace<T>(slot: &RwLock<Option<T>>, value: Option<T>) {
    *slot.write().unwrap_or_else(PoisonError::into_inner) = value;
}

fn current<T: Clone>(slot: &RwLock<Option<T>>) -> Option<T> {
    slot.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn guarded(event: HostEvent, f: impl FnOnce()) {
    if std::panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = event.name(), "host callback panicked");
    }
}

impl HostCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_connection_init_started(&self, callback: Option<EventCallback>) {
        replace(&self.connection_init_started, callback);
    }

    pub fn set_message_start_received(&self, callback: Option<EventCallback>) {
        replace(&self.message_start_received, callback);
    }

    pub fn set_message_received(&self, callback: Option<MessageCallback>) {
        replace(&self.message_received, callback);
    }

    pub fn is_registered(&self, event: HostEvent) -> bool {
        match event {
            HostEvent::ConnectionInitStarted => current(&self.connection_init_started).is_some(),
            HostEvent::MessageStartReceived => current(&self.message_start_received).is_some(),
            HostEvent::MessageReceived => current(&self.message_received).is_some(),
        }
    }

    pub fn clear(&self) {
        self.set_connection_init_started(None);
        self.set_message_start_received(None);
        self.set_message_received(None);
    }

    pub(crate) fn connection_init_started(&self) {
        self.fire(HostEvent::ConnectionInitStarted, &self.connection_init_started);
    }

    pub(crate) fn message_start_received(&self) {
        self.fire(HostEvent::MessageStartReceived, &self.message_start_received);
    }

    pub(crate) fn message_received(&self, message: Bytes) {
        match current(&self.message_received) {
            Some(callback) => guarded(HostEvent::MessageReceived, || callback(message)),
            None => debug!(
                callback = HostEvent::MessageReceived.name(),
                len = message.len(),
                "no callback registered; message dropped"
            ),
        }
    }

    fn fire(&self, event: HostEvent, slot: &RwLock<Option<EventCallback>>) {
        match current(slot) {
            Some(callback) => guarded(event, || callback()),
            None => debug!(callback = event.name(), "no callback registered"),
        }
    }
}

impl fmt::Debug for HostCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostCallbacks")
            .field(
                "connection_init_started",
                &self.is_registered(HostEvent::ConnectionInitStarted),
            )
            .field(
                "message_start_received",
                &self.is_registered(HostEvent::MessageStartReceived),
            )
            .field(
                "message_received",
                &self.is_registered(HostEvent::MessageReceived),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn fires_registered_callbacks() {
        let callbacks = HostCallbacks::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let counter = Arc::clone(&starts);
        callbacks.set_message_start_received(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let sink = Arc::clone(&received);
        callbacks.set_message_received(Some(Arc::new(move |message: Bytes| {
            sink.lock().unwrap().push(message);
        })));

        callbacks.message_start_received();
        callbacks.message_received(Bytes::from_static(b"payload"));
        callbacks.connection_init_started();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            received.lock().unwrap().as_slice(),
            &[Bytes::from_static(b"payload")]
        );
    }

    #[test]
    fn registering_again_replaces() {
        let callbacks = HostCallbacks::new();
        let hits = Arc::new(AtomicUsize::new(0));
        callbacks.set_connection_init_started(Some(Arc::new(|| {})));
        let counter = Arc::clone(&hits);
        callbacks.set_connection_init_started(Some(Arc::new(move || {
            counter.fetch_add(10, Ordering::SeqCst);
        })));
        callbacks.connection_init_started();
        assert_eq!(hits.load(Ordering::SeqCst), 10);

        callbacks.clear();
        assert!(!callbacks.is_registered(HostEvent::ConnectionInitStarted));
    }

    #[test]
    fn panicking_callback_is_contained() {
        let callbacks = HostCallbacks::new();
        callbacks.set_message_received(Some(Arc::new(|_: Bytes| panic!("host bug"))));
        callbacks.message_received(Bytes::from_static(b"x"));
        callbacks.message_received(Bytes::from_static(b"y"));
        assert!(callbacks.is_registered(HostEvent::MessageReceived));
    }
}
