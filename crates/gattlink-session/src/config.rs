use std::fmt;
use std::time::Duration;

use gattlink_frame::{ChannelScheme, FrameConfig, DEFAULT_CHUNK_SIZE};
use gattlink_transport::{DeviceConfig, TransportDescriptor};

/// Largest ATT MTU the central asks for after connecting.
pub const DEFAULT_PREFERRED_MTU: u16 = 515;

/// Advertised local names of this length identify a candidate peripheral.
pub const DEFAULT_EXPECTED_NAME_LEN: usize = 4;

/// Configuration shared by both session roles and the bridge.
#[derive(Clone)]
pub struct SessionConfig {
    /// Radio to open.
    pub descriptor: TransportDescriptor,
    /// Local device settings passed to the radio on attach.
    pub device: DeviceConfig,
    /// Default bound for `begin_advertising`.
    pub setup_timeout: Duration,
    /// Default bound for `scan_and_connect`.
    pub scan_timeout: Duration,
    /// How long `start` waits for the worker to come up.
    pub bridge_ready_timeout: Duration,
    /// How long `stop` waits for the worker to exit.
    pub bridge_stop_timeout: Duration,
    /// Bound for every non-setup call submitted to the bridge.
    pub call_timeout: Duration,
    /// Bound for pushing the termination sentinel.
    pub termination_timeout: Duration,
    /// Added to setup and scan bounds on the calling side so the session's own
    /// timeout error wins over the bridge's.
    pub bridge_margin: Duration,
    /// MTU the central requests after connecting.
    pub preferred_mtu: u16,
    /// Pause after subscribing before the central reports Streaming.
    pub subscribe_grace: Duration,
    /// Pause between power-on and advertising on the peripheral.
    pub publish_settle: Duration,
    /// Local-name length that marks an advertiser as a match.
    pub expected_name_len: usize,
    /// Characteristic UUIDs of the four channels.
    pub channels: ChannelScheme,
    /// Report "message started" for single-frame messages too.
    pub announce_single_frame_messages: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            descriptor: TransportDescriptor::sim("default"),
            device: DeviceConfig::default(),
            setup_timeout: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(10),
            bridge_ready_timeout: Duration::from_secs(5),
            bridge_stop_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(5),
            termination_timeout: Duration::from_secs(1),
            bridge_margin: Duration::from_secs(2),
            preferred_mtu: DEFAULT_PREFERRED_MTU,
            subscribe_grace: Duration::from_millis(500),
            publish_settle: Duration::ZERO,
            expected_name_len: DEFAULT_EXPECTED_NAME_LEN,
            channels: ChannelScheme::default(),
            announce_single_frame_messages: false,
        }
    }
}

impl SessionConfig {
    pub fn with_descriptor(mut self, descriptor: TransportDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }

    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    pub fn with_subscribe_grace(mut self, grace: Duration) -> Self {
        self.subscribe_grace = grace;
        self
    }

    pub fn with_single_frame_announcements(mut self, enabled: bool) -> Self {
        self.announce_single_frame_messages = enabled;
        self
    }

    /// Reassembler configuration derived from this session config.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            announce_single_frame_messages: self.announce_single_frame_messages,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("descriptor", &format_args!("{}", self.descriptor))
            .field("device", &self.device)
            .field("setup_timeout", &self.setup_timeout)
            .field("scan_timeout", &self.scan_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("preferred_mtu", &self.preferred_mtu)
            .field("subscribe_grace", &self.subscribe_grace)
            .field("expected_name_len", &self.expected_name_len)
            .field(
                "announce_single_frame_messages",
                &self.announce_single_frame_messages,
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bounds() {
        let config = SessionConfig::default();
        assert_eq!(config.setup_timeout, Duration::from_secs(30));
        assert_eq!(config.termination_timeout, Duration::from_secs(1));
        assert_eq!(config.preferred_mtu, 515);
        assert_eq!(config.expected_name_len, 4);
        assert!(config.descriptor.is_sim());
    }

    #[test]
    fn debug_does_not_leak_identity() {
        let config = SessionConfig::default().with_device(DeviceConfig {
            identity: Some("cafebabe".to_string()),
            ..DeviceConfig::default()
        });
        let debug = format!("{config:?}");
        assert!(!debug.contains("cafebabe"));
        assert!(debug.contains("sim:default"));
    }

    #[test]
    fn frame_config_follows_announcement_flag() {
        let config = SessionConfig::default().with_single_frame_announcements(true);
        assert!(config.frame_config().announce_single_frame_messages);
    }
}
