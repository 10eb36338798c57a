use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gattlink_session::{DiscoveredService, GattLink};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cmd::{parse_duration, radio_transport, read_payload, session_config, ScanArgs};
use crate::exit::{session_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::logging::role_span;
use crate::output::{print_fields, print_json, print_message, OutputFormat};

#[derive(Serialize)]
struct ConnectionOutput {
    kind: &'static str,
    service: String,
    peer: String,
    connection: u64,
    mtu: u16,
    identity: Option<String>,
    connected: bool,
}

pub fn run(args: ScanArgs, format: OutputFormat) -> CliResult<i32> {
    let _span = role_span("central", &args.radio.transport).entered();
    let config = session_config(&args.radio)?;
    let scan_timeout = match &args.timeout {
        Some(timeout) => parse_duration(timeout)?,
        None => config.scan_timeout,
    };
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = read_payload(
        args.data.as_deref(),
        args.hex.as_deref(),
        args.file.as_ref(),
    )?;

    let link = GattLink::new(config, radio_transport());
    link.start()
        .map_err(|err| session_error("event loop failed to start", err))?;

    let (tx, rx) = mpsc::channel();
    link.on_message_received(Some(Arc::new(move |message: Bytes| {
        let _ = tx.send(message);
    })));

    let result = exchange(&link, &args, scan_timeout, payload, wait_timeout, &rx, format);
    if let Err(err) = link.disconnect() {
        debug!(%err, "disconnect skipped");
    }
    if !link.stop() {
        warn!("event loop did not stop cleanly");
    }
    result
}

fn exchange(
    link: &GattLink,
    args: &ScanArgs,
    scan_timeout: Duration,
    payload: Option<Vec<u8>>,
    wait_timeout: Duration,
    replies: &Receiver<Bytes>,
    format: OutputFormat,
) -> CliResult<i32> {
    let service = link
        .scan_and_connect(args.service, scan_timeout)
        .map_err(|err| session_error("scan failed", err))?;
    let identity = match link.read_identity() {
        Ok(identity) => Some(hex::encode(identity)),
        Err(err) => {
            debug!(%err, "identity unavailable");
            None
        }
    };
    print_connection(&service, identity, format);

    if let Some(payload) = payload {
        let len = payload.len();
        link.send_message(payload)
            .map_err(|err| session_error("send failed", err))?;
        info!(len, "message sent");
    }

    if args.wait {
        let reply = replies.recv_timeout(wait_timeout).map_err(|_| {
            CliError::new(TIMEOUT, format!("no reply within {wait_timeout:?}"))
        })?;
        print_message(&reply, "central", &service.peer.to_string(), format);
    }
    Ok(SUCCESS)
}

fn print_connection(service: &DiscoveredService, identity: Option<String>, format: OutputFormat) {
    let out = ConnectionOutput {
        kind: "connection-info",
        service: service.service.to_string(),
        peer: service.peer.to_string(),
        connection: service.connection.0,
        mtu: service.mtu,
        identity,
        connected: true,
    };
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_fields(
            "CONNECTION",
            &[
                ("service", out.service.clone()),
                ("peer", out.peer.clone()),
                ("mtu", out.mtu.to_string()),
                (
                    "identity",
                    out.identity.clone().unwrap_or_else(|| "-".to_string()),
                ),
            ],
        ),
        OutputFormat::Pretty => {
            println!("Connected:");
            println!("  Service:  {}", out.service);
            println!("  Peer:     {}", out.peer);
            println!("  MTU:      {}", out.mtu);
            match &out.identity {
                Some(identity) => println!("  Identity: {identity}"),
                None => println!("  Identity: unavailable"),
            }
        }
        // Raw output is reserved for message payloads.
        OutputFormat::Raw => {}
    }
}
