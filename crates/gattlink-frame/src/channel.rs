//! Logical channel roles and their binding to GATT attributes.
//!
//! Four roles exist per session. Each side resolves them to its own handles:
//! the peripheral to the value handles it published, the central to the value
//! handles it discovered.

use std::fmt;

use gattlink_transport::AttributeHandle;
use uuid::Uuid;

use crate::error::{FrameError, Result};

/// Logical channel of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Start/termination sentinels.
    Control,
    /// Messages this side sends.
    Outbound,
    /// Messages this side receives.
    Inbound,
    /// Read-only device identity blob.
    Identity,
}

impl ChannelRole {
    pub const ALL: [ChannelRole; 4] = [
        ChannelRole::Control,
        ChannelRole::Outbound,
        ChannelRole::Inbound,
        ChannelRole::Identity,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ChannelRole::Control => "control",
            ChannelRole::Outbound => "outbound",
            ChannelRole::Inbound => "inbound",
            ChannelRole::Identity => "identity",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which end of the link a registry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Peripheral,
    Central,
}

/// Characteristic UUIDs of the four channels.
///
/// Data characteristics are named from the GATT server's point of view, so
/// "outbound" maps to a different characteristic on each [`Side`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelScheme {
    pub control: Uuid,
    pub client_to_server: Uuid,
    pub server_to_client: Uuid,
    pub identity: Uuid,
}

/// Control characteristic of the default scheme.
pub const CONTROL_UUID: Uuid = Uuid::from_u128(0x00000005_a123_48ce_896b_4c76973373e6);
/// Client-to-server data characteristic of the default scheme.
pub const CLIENT_TO_SERVER_UUID: Uuid = Uuid::from_u128(0x00000006_a123_48ce_896b_4c76973373e6);
/// Server-to-client data characteristic of the default scheme.
pub const SERVER_TO_CLIENT_UUID: Uuid = Uuid::from_u128(0x00000007_a123_48ce_896b_4c76973373e6);
/// Identity characteristic of the default scheme.
pub const IDENTITY_UUID: Uuid = Uuid::from_u128(0x00000008_a123_48ce_896b_4c76973373e6);

impl Default for ChannelScheme {
    fn default() -> Self {
        Self {
            control: CONTROL_UUID,
            client_to_server: CLIENT_TO_SERVER_UUID,
            server_to_client: SERVER_TO_CLIENT_UUID,
            identity: IDENTITY_UUID,
        }
    }
}

impl ChannelScheme {
    /// Characteristic UUID backing `role` as seen from `side`.
    pub fn uuid_for(&self, role: ChannelRole, side: Side) -> Uuid {
        match (role, side) {
            (ChannelRole::Control, _) => self.control,
            (ChannelRole::Identity, _) => self.identity,
            (ChannelRole::Outbound, Side::Peripheral) | (ChannelRole::Inbound, Side::Central) => {
                self.server_to_client
            }
            (ChannelRole::Outbound, Side::Central) | (ChannelRole::Inbound, Side::Peripheral) => {
                self.client_to_server
            }
        }
    }

    /// Role a discovered or published characteristic plays for `side`.
    pub fn role_of(&self, uuid: &Uuid, side: Side) -> Option<ChannelRole> {
        ChannelRole::ALL
            .into_iter()
            .find(|role| self.uuid_for(*role, side) == *uuid)
    }
}

/// Role-to-handle bindings of one session. Each role is bound at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelRegistry {
    bindings: [Option<AttributeHandle>; 4],
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, role: ChannelRole, handle: AttributeHandle) -> Result<()> {
        let slot = &mut self.bindings[role.index()];
        if slot.is_some() {
            return Err(FrameError::ChannelAlreadyBound(role));
        }
        *slot = Some(handle);
        Ok(())
    }

    pub fn resolve(&self, role: ChannelRole) -> Result<AttributeHandle> {
        self.bindings[role.index()].ok_or(FrameError::ChannelNotBound(role))
    }

    pub fn is_bound(&self, role: ChannelRole) -> bool {
        self.bindings[role.index()].is_some()
    }

    /// True when every role in `roles` is bound.
    pub fn has_all(&self, roles: &[ChannelRole]) -> bool {
        roles.iter().all(|role| self.is_bound(*role))
    }

    /// Release every binding, e.g. before republishing.
    pub fn clear(&mut self) {
        self.bindings = [None; 4];
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelRole, AttributeHandle)> + '_ {
        ChannelRole::ALL
            .into_iter()
            .filter_map(|role| self.bindings[role.index()].map(|handle| (role, handle)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sides_see_data_channels_mirrored() {
        let scheme = ChannelScheme::default();
        assert_eq!(
            scheme.uuid_for(ChannelRole::Outbound, Side::Peripheral),
            scheme.uuid_for(ChannelRole::Inbound, Side::Central)
        );
        assert_eq!(
            scheme.uuid_for(ChannelRole::Inbound, Side::Peripheral),
            scheme.uuid_for(ChannelRole::Outbound, Side::Central)
        );
        assert_eq!(
            scheme.uuid_for(ChannelRole::Control, Side::Central),
            CONTROL_UUID
        );
    }

    #[test]
    fn role_of_inverts_uuid_for() {
        let scheme = ChannelScheme::default();
        for side in [Side::Peripheral, Side::Central] {
            for role in ChannelRole::ALL {
                assert_eq!(scheme.role_of(&scheme.uuid_for(role, side), side), Some(role));
            }
        }
        assert_eq!(scheme.role_of(&Uuid::nil(), Side::Central), None);
    }

    #[test]
    fn default_scheme_uuids() {
        assert_eq!(
            CONTROL_UUID.to_string(),
            "00000005-a123-48ce-896b-4c76973373e6"
        );
        assert_eq!(
            IDENTITY_UUID.to_string(),
            "00000008-a123-48ce-896b-4c76973373e6"
        );
    }

    #[test]
    fn resolve_before_bind_fails() {
        let registry = ChannelRegistry::new();
        assert!(matches!(
            registry.resolve(ChannelRole::Outbound),
            Err(FrameError::ChannelNotBound(ChannelRole::Outbound))
        ));
    }

    #[test]
    fn bind_once_per_role() {
        let mut registry = ChannelRegistry::new();
        registry
            .bind(ChannelRole::Control, AttributeHandle(3))
            .unwrap();
        assert!(matches!(
            registry.bind(ChannelRole::Control, AttributeHandle(9)),
            Err(FrameError::ChannelAlreadyBound(ChannelRole::Control))
        ));
        assert_eq!(
            registry.resolve(ChannelRole::Control).unwrap(),
            AttributeHandle(3)
        );
    }

    #[test]
    fn clear_allows_rebinding_to_latest_handle() {
        let mut registry = ChannelRegistry::new();
        for role in ChannelRole::ALL {
            registry.bind(role, AttributeHandle(role as u16 + 1)).unwrap();
        }
        assert!(registry.has_all(&ChannelRole::ALL));
        assert_eq!(registry.iter().count(), 4);

        registry.clear();
        assert!(!registry.is_bound(ChannelRole::Inbound));
        registry
            .bind(ChannelRole::Inbound, AttributeHandle(40))
            .unwrap();
        assert_eq!(
            registry.resolve(ChannelRole::Inbound).unwrap(),
            AttributeHandle(40)
        );
        assert!(!registry.has_all(&[ChannelRole::Inbound, ChannelRole::Control]));
    }
}
