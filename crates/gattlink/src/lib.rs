//! Fragment-reassembling message transport over BLE GATT characteristics.
//!
//! gattlink moves arbitrary-length messages between a peripheral and a
//! central over four GATT characteristics, splitting each message into
//! marker-prefixed frames that fit the negotiated MTU.
//!
//! # Crate Structure
//!
//! - [`transport`]: radio and host-stack abstraction, plus the simulated radio
//! - [`frame`]: frame codec, message reassembly and channel registry
//! - [`session`]: peripheral/central sessions and the blocking `GattLink` manager (behind `session` feature)

/// Re-export transport types.
pub mod transport {
    pub use gattlink_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use gattlink_frame::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use gattlink_session::*;
}
