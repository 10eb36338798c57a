#![cfg(feature = "cli")]

use std::path::PathBuf;
use std::process::Command;

const SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

fn gattlink() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_gattlink"));
    command.arg("--log-level").arg("error");
    command
}

fn unique_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "gattlink-cli-{tag}-{}-{}.json",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ))
}

#[test]
fn advertise_setup_timeout_returns_124() {
    let output = gattlink()
        .arg("advertise")
        .arg("--transport")
        .arg("sim:lonely")
        .arg("--service")
        .arg(SERVICE)
        .arg("--timeout")
        .arg("200ms")
        .output()
        .expect("advertise should run");

    assert_eq!(output.status.code(), Some(124));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("advertising setup failed"));
}

#[test]
fn scan_timeout_returns_124() {
    let output = gattlink()
        .arg("scan")
        .arg("--service")
        .arg(SERVICE)
        .arg("--timeout")
        .arg("200ms")
        .arg("--data")
        .arg("never sent")
        .output()
        .expect("scan should run");

    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn unbacked_transport_returns_transport_error() {
    let output = gattlink()
        .arg("advertise")
        .arg("--transport")
        .arg("usb:0")
        .arg("--service")
        .arg(SERVICE)
        .output()
        .expect("advertise should run");

    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn malformed_transport_returns_usage() {
    let output = gattlink()
        .arg("scan")
        .arg("--transport")
        .arg("nonsense")
        .arg("--service")
        .arg(SERVICE)
        .output()
        .expect("scan should run");

    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn missing_device_config_returns_data_invalid() {
    let output = gattlink()
        .arg("advertise")
        .arg("--config")
        .arg(unique_path("missing"))
        .arg("--service")
        .arg(SERVICE)
        .output()
        .expect("advertise should run");

    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn bad_identity_in_device_config_returns_data_invalid() {
    let path = unique_path("bad-identity");
    std::fs::write(&path, r#"{"name": "GLNK", "identity": "not hex"}"#)
        .expect("config should be writable");

    let output = gattlink()
        .arg("advertise")
        .arg("--config")
        .arg(&path)
        .arg("--service")
        .arg(SERVICE)
        .arg("--timeout")
        .arg("100ms")
        .output()
        .expect("advertise should run");

    assert_eq!(output.status.code(), Some(60));
    let _ = std::fs::remove_file(&path);
}
