use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use gattlink_session::{EventLoopBridge, GattLink, SessionConfig};
use gattlink_transport::{DeviceConfig, TransportDescriptor};
use serde::Serialize;
use tracing::{info, warn};

use crate::cmd::{decode_hex, parse_duration, radio_transport, LoopbackArgs};
use crate::exit::{session_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS, TIMEOUT};
use crate::logging::role_span;
use crate::output::{print_fields, print_json, print_raw, OutputFormat};

const TERMINATION_POLL: Duration = Duration::from_millis(10);

#[derive(Serialize)]
struct LoopbackOutput {
    kind: &'static str,
    air: String,
    service: String,
    peer: String,
    mtu: u16,
    sent: usize,
    echoed: usize,
    matched: bool,
    identity: String,
    round_trip_ms: f64,
    terminated: bool,
}

struct Inbox {
    peripheral: Receiver<Bytes>,
    central: Receiver<Bytes>,
}

pub fn run(args: LoopbackArgs, format: OutputFormat) -> CliResult<i32> {
    let air = args
        .air
        .clone()
        .unwrap_or_else(|| format!("loopback-{}", std::process::id()));
    let timeout = parse_duration(&args.timeout)?;
    let identity = Bytes::from(decode_hex("--identity", &args.identity)?);
    let payload = match (&args.data, args.size) {
        (Some(data), _) => data.as_bytes().to_vec(),
        (None, Some(size)) => (0..size).map(|i| (i % 251) as u8).collect(),
        (None, None) => b"ping".to_vec(),
    };

    let descriptor = TransportDescriptor::sim(&air);
    let _span = role_span("central", &descriptor.to_string()).entered();
    let base = SessionConfig::default().with_descriptor(descriptor);
    let peripheral = Arc::new(role_link(&base, "GLNK", "gattlink-peripheral"));
    let central = role_link(&base, "gattlink-central", "gattlink-central");

    let (peripheral_tx, peripheral_rx) = mpsc::channel();
    peripheral.on_message_received(Some(Arc::new(move |message: Bytes| {
        let _ = peripheral_tx.send(message);
    })));
    let (central_tx, central_rx) = mpsc::channel();
    central.on_message_received(Some(Arc::new(move |message: Bytes| {
        let _ = central_tx.send(message);
    })));
    let inbox = Inbox {
        peripheral: peripheral_rx,
        central: central_rx,
    };

    let result = peripheral
        .start()
        .and_then(|()| central.start())
        .map_err(|err| session_error("event loop failed to start", err))
        .and_then(|()| exchange(&args, &air, &peripheral, &central, &inbox, identity, payload, timeout));

    for (role, link) in [("central", &central), ("peripheral", peripheral.as_ref())] {
        if !link.stop() {
            warn!(role, "event loop did not stop cleanly");
        }
    }

    let out = result?;
    print_report(&out, format);
    Ok(if out.matched { SUCCESS } else { FAILURE })
}

fn role_link(base: &SessionConfig, name: &str, bridge: &str) -> GattLink {
    let config = base.clone().with_device(DeviceConfig {
        name: name.to_string(),
        ..DeviceConfig::default()
    });
    GattLink::with_bridge(config, radio_transport(), Arc::new(EventLoopBridge::new(bridge)))
}

#[allow(clippy::too_many_arguments)]
fn exchange(
    args: &LoopbackArgs,
    air: &str,
    peripheral: &Arc<GattLink>,
    central: &GattLink,
    inbox: &Inbox,
    identity: Bytes,
    payload: Vec<u8>,
    timeout: Duration,
) -> CliResult<LoopbackOutput> {
    let service_id = args.service;
    let advertiser = {
        let peripheral = Arc::clone(peripheral);
        let transport = peripheral.config().descriptor.to_string();
        std::thread::Builder::new()
            .name("loopback-advertiser".to_string())
            .spawn(move || {
                let _span = role_span("peripheral", &transport).entered();
                peripheral.begin_advertising(identity, service_id, timeout)
            })
            .map_err(|err| CliError::new(INTERNAL, format!("failed to spawn advertiser: {err}")))?
    };

    let service = central
        .scan_and_connect(service_id, timeout)
        .map_err(|err| session_error("central setup failed", err))?;
    advertiser
        .join()
        .map_err(|_| CliError::new(INTERNAL, "advertiser thread panicked"))?
        .map_err(|err| session_error("peripheral setup failed", err))?;
    info!(peer = %service.peer, mtu = service.mtu, "loopback connected");

    let started = Instant::now();
    central
        .send_message(payload.clone())
        .map_err(|err| session_error("central send failed", err))?;
    let request = inbox
        .peripheral
        .recv_timeout(timeout)
        .map_err(|_| CliError::new(TIMEOUT, "peripheral did not receive the message"))?;
    peripheral
        .send_message(request)
        .map_err(|err| session_error("peripheral echo failed", err))?;
    let reply = inbox
        .central
        .recv_timeout(timeout)
        .map_err(|_| CliError::new(TIMEOUT, "central did not receive the echo"))?;
    let round_trip = started.elapsed();

    let identity = central
        .read_identity()
        .map_err(|err| session_error("identity read failed", err))?;

    peripheral
        .send_termination()
        .map_err(|err| session_error("termination failed", err))?;
    let terminated = wait_for_termination(central, timeout);
    central
        .disconnect()
        .map_err(|err| session_error("disconnect failed", err))?;

    Ok(LoopbackOutput {
        kind: "loopback-report",
        air: air.to_string(),
        service: service.service.to_string(),
        peer: service.peer.to_string(),
        mtu: service.mtu,
        sent: payload.len(),
        echoed: reply.len(),
        matched: reply.as_ref() == payload.as_slice(),
        identity: hex::encode(identity),
        round_trip_ms: (round_trip.as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
        terminated,
    })
}

fn wait_for_termination(central: &GattLink, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        match central.snapshot() {
            Ok(snapshot) if snapshot.peer_terminated => return true,
            Ok(_) => std::thread::sleep(TERMINATION_POLL),
            Err(err) => {
                warn!(%err, "snapshot failed");
                return false;
            }
        }
    }
    false
}

fn print_report(out: &LoopbackOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(out),
        OutputFormat::Table => print_fields(
            "LOOPBACK",
            &[
                ("air", out.air.clone()),
                ("service", out.service.clone()),
                ("peer", out.peer.clone()),
                ("mtu", out.mtu.to_string()),
                ("sent", out.sent.to_string()),
                ("echoed", out.echoed.to_string()),
                ("matched", out.matched.to_string()),
                ("identity", out.identity.clone()),
                ("round trip", format!("{:.2}ms", out.round_trip_ms)),
                ("terminated", out.terminated.to_string()),
            ],
        ),
        OutputFormat::Pretty => {
            println!(
                "loopback air={} peer={} mtu={} sent={} echoed={} matched={} rtt={:.2}ms terminated={}",
                out.air,
                out.peer,
                out.mtu,
                out.sent,
                out.echoed,
                out.matched,
                out.round_trip_ms,
                out.terminated
            );
        }
        OutputFormat::Raw => print_raw(out.identity.as_bytes()),
    }
}
