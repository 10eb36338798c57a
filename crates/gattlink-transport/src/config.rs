use std::fmt;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::gatt::Address;

/// Local device configuration, loaded from a JSON file.
///
/// ```json
/// { "name": "GLNK", "address": "F0:F1:F2:F3:F4:F5", "identity": "a1b2c3" }
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Local name advertised by the device.
    #[serde(default = "default_name")]
    pub name: String,
    /// Public address. The radio assigns one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    /// Hex-encoded identity blob served on the Identity channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

fn default_name() -> String {
    "gattlink".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            address: None,
            identity: None,
        }
    }
}

impl DeviceConfig {
    /// Load a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|err| TransportError::Config {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let config: Self = serde_json::from_slice(&raw).map_err(|err| TransportError::Config {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        config.identity_bytes().map_err(|reason| TransportError::Config {
            path: path.to_path_buf(),
            reason,
        })?;
        Ok(config)
    }

    /// Decoded identity blob (empty when none is configured).
    pub fn identity_bytes(&self) -> std::result::Result<Bytes, String> {
        match &self.identity {
            Some(encoded) => hex::decode(encoded.trim())
                .map(Bytes::from)
                .map_err(|err| format!("identity is not valid hex: {err}")),
            None => Ok(Bytes::new()),
        }
    }
}

impl fmt::Debug for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("DeviceConfig");
        dbg.field("name", &self.name).field("address", &self.address);
        if let Some(identity) = &self.identity {
            dbg.field(
                "identity",
                &format_args!("<{} hex chars>", identity.len()),
            );
        } else {
            dbg.field("identity", &Option::<String>::None);
        }
        dbg.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(tag: &str, contents: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "gattlink-config-{}-{}-{}",
            tag,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        let path = dir.join("device.json");
        std::fs::write(&path, contents).expect("config should be writable");
        path
    }

    #[test]
    fn loads_full_config() {
        let path = temp_file(
            "full",
            r#"{"name":"GLNK","address":"F0:F1:F2:F3:F4:F5","identity":"a1b2"}"#,
        );
        let config = DeviceConfig::from_file(&path).unwrap();
        assert_eq!(config.name, "GLNK");
        assert_eq!(config.address, Some("F0:F1:F2:F3:F4:F5".parse().unwrap()));
        assert_eq!(config.identity_bytes().unwrap().as_ref(), &[0xA1, 0xB2]);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn defaults_apply_to_empty_object() {
        let path = temp_file("empty", "{}");
        let config = DeviceConfig::from_file(&path).unwrap();
        assert_eq!(config, DeviceConfig::default());
        assert!(config.identity_bytes().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn rejects_bad_identity_hex() {
        let path = temp_file("badhex", r#"{"identity":"zz"}"#);
        let err = DeviceConfig::from_file(&path).unwrap_err();
        assert!(matches!(err, TransportError::Config { .. }));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn rejects_missing_file() {
        let err = DeviceConfig::from_file("/nonexistent/gattlink/device.json").unwrap_err();
        assert!(matches!(err, TransportError::Config { .. }));
    }

    #[test]
    fn debug_hides_identity() {
        let config = DeviceConfig {
            identity: Some("deadbeef".to_string()),
            ..DeviceConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(debug.contains("<8 hex chars>"));
        assert!(!debug.contains("deadbeef"));
    }
}
