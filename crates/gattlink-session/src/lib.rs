//! Peripheral and central session lifecycles for gattlink.
//!
//! All radio work runs on one background worker owned by the
//! [`EventLoopBridge`]. [`GattLink`] is the blocking front end hosts use: it
//! holds the single current session, either a [`PeripheralSession`] or a
//! [`CentralSession`], and routes every call through the bridge.

pub mod bridge;
pub mod callbacks;
pub mod central;
pub mod config;
pub mod control;
pub mod error;
mod inbound;
pub mod manager;
pub mod peripheral;
mod radio;
pub mod signal;

pub use bridge::EventLoopBridge;
pub use callbacks::{EventCallback, HostCallbacks, HostEvent, MessageCallback};
pub use central::{CentralSession, CentralState, DiscoveredService};
pub use config::{SessionConfig, DEFAULT_EXPECTED_NAME_LEN, DEFAULT_PREFERRED_MTU};
pub use control::{ControlValue, SESSION_TERMINATION, START_TRANSMISSION};
pub use error::{Result, SessionError};
pub use manager::{GattLink, LinkRole, LinkSnapshot};
pub use peripheral::{PeripheralSession, PeripheralState};
pub use signal::{Deferred, StartSignal};
