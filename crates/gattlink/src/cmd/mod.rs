use clap::{Args, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gattlink_session::SessionConfig;
use gattlink_transport::{DeviceConfig, RadioTransport, SimTransport, TransportDescriptor};
use uuid::Uuid;

use crate::exit::{io_error, transport_error, CliError, CliResult, DATA_INVALID, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod advertise;
pub mod loopback;
pub mod scan;
pub mod version;

/// Service UUID used by `loopback` unless overridden.
pub const LOOPBACK_SERVICE: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the peripheral role and print received messages.
    Advertise(AdvertiseArgs),
    /// Run the central role: connect, send one message, optionally wait for a reply.
    Scan(ScanArgs),
    /// Run both roles in-process over a simulated air and exchange a message.
    Loopback(LoopbackArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Advertise(args) => advertise::run(args, format),
        Command::Scan(args) => scan::run(args, format),
        Command::Loopback(args) => loopback::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct RadioArgs {
    /// Radio transport descriptor (<scheme>:<target>, e.g. sim:bench or usb:0).
    ///
    /// Only `sim:` radios are built in. A simulated air lives inside one
    /// process, so `advertise` and `scan` started as separate processes never
    /// see each other; use `loopback` to run both roles together. Other
    /// schemes parse but fail to open.
    #[arg(long, env = "GATTLINK_TRANSPORT", default_value = "sim:default")]
    pub transport: String,
    /// Device configuration file (JSON).
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct AdvertiseArgs {
    #[command(flatten)]
    pub radio: RadioArgs,
    /// Service UUID to publish and advertise.
    #[arg(long)]
    pub service: Uuid,
    /// Identity blob (hex). Overrides the device config.
    #[arg(long, value_name = "HEX")]
    pub identity: Option<String>,
    /// How long to wait for a central's start signal (e.g. 30s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
    /// Send every received message back to the central.
    #[arg(long)]
    pub echo: bool,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ScanArgs {
    #[command(flatten)]
    pub radio: RadioArgs,
    /// Service UUID to look for.
    #[arg(long)]
    pub service: Uuid,
    /// How long to scan before giving up (e.g. 10s, 500ms).
    #[arg(long)]
    pub timeout: Option<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["hex", "file"])]
    pub data: Option<String>,
    /// Hex-encoded payload.
    #[arg(long, conflicts_with_all = ["data", "file"])]
    pub hex: Option<String>,
    /// Read payload from file.
    #[arg(long, conflicts_with_all = ["data", "hex"])]
    pub file: Option<PathBuf>,
    /// Wait for one message from the peripheral and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set.
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct LoopbackArgs {
    /// Simulated air to use. Defaults to one private to this process.
    #[arg(long)]
    pub air: Option<String>,
    /// Service UUID the peripheral publishes.
    #[arg(long, default_value = LOOPBACK_SERVICE)]
    pub service: Uuid,
    /// Raw string payload.
    #[arg(long, conflicts_with = "size")]
    pub data: Option<String>,
    /// Send a generated payload of this many bytes instead.
    #[arg(long)]
    pub size: Option<usize>,
    /// Identity blob (hex) the peripheral serves.
    #[arg(long, value_name = "HEX", default_value = "676c6e6b")]
    pub identity: String,
    /// Bound for setup and for each exchange step.
    #[arg(long, default_value = "10s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Session settings from the shared radio arguments.
pub fn session_config(radio: &RadioArgs) -> CliResult<SessionConfig> {
    let descriptor = TransportDescriptor::parse(&radio.transport)
        .map_err(|err| transport_error("invalid --transport", err))?;
    let device = match &radio.config {
        Some(path) => {
            DeviceConfig::from_file(path).map_err(|err| transport_error("device config", err))?
        }
        None => DeviceConfig::default(),
    };
    Ok(SessionConfig::default()
        .with_descriptor(descriptor)
        .with_device(device))
}

/// Radios this build can open: the in-process simulator only.
pub fn radio_transport() -> Arc<dyn RadioTransport> {
    Arc::new(SimTransport::default())
}

pub fn decode_hex(flag: &str, input: &str) -> CliResult<Vec<u8>> {
    hex::decode(input.trim())
        .map_err(|err| CliError::new(DATA_INVALID, format!("invalid {flag} hex: {err}")))
}

pub fn read_payload(
    data: Option<&str>,
    hex: Option<&str>,
    file: Option<&PathBuf>,
) -> CliResult<Option<Vec<u8>>> {
    if let Some(data) = data {
        return Ok(Some(data.as_bytes().to_vec()));
    }
    if let Some(hex) = hex {
        return decode_hex("--hex", hex).map(Some);
    }
    if let Some(path) = file {
        return std::fs::read(path)
            .map(Some)
            .map_err(|err| io_error("failed to read payload file", err));
    }
    Ok(None)
}

pub fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        _ => Err(CliError::new(
            USAGE,
            format!("unsupported duration unit: {unit}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
    }

    #[test]
    fn session_config_rejects_bad_descriptor() {
        let err = session_config(&RadioArgs {
            transport: "no-scheme".to_string(),
            config: None,
        })
        .unwrap_err();
        assert_eq!(err.code, USAGE);
    }

    #[test]
    fn transport_help_states_sim_limitation() {
        use clap::CommandFactory;

        #[derive(clap::Parser)]
        struct Harness {
            #[command(flatten)]
            radio: RadioArgs,
        }

        let command = Harness::command();
        let transport = command
            .get_arguments()
            .find(|arg| arg.get_id() == "transport")
            .unwrap();
        let help = transport.get_long_help().unwrap().to_string();
        assert!(help.contains("separate processes"));
        assert!(help.contains("loopback"));
    }

    #[test]
    fn payload_sources() {
        assert_eq!(
            read_payload(Some("hi"), None, None).unwrap(),
            Some(b"hi".to_vec())
        );
        assert_eq!(
            read_payload(None, Some("00ff"), None).unwrap(),
            Some(vec![0x00, 0xff])
        );
        assert_eq!(read_payload(None, None, None).unwrap(), None);
        assert_eq!(
            read_payload(None, Some("zz"), None).unwrap_err().code,
            DATA_INVALID
        );
    }
}
