use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gattlink_session::GattLink;
use tracing::{info, warn};

use crate::cmd::{
    decode_hex, install_ctrlc_handler, parse_duration, radio_transport, session_config,
    AdvertiseArgs,
};
use crate::exit::{session_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::logging::role_span;
use crate::output::{print_message, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn run(args: AdvertiseArgs, format: OutputFormat) -> CliResult<i32> {
    let _span = role_span("peripheral", &args.radio.transport).entered();
    let config = session_config(&args.radio)?;
    let identity = match &args.identity {
        Some(encoded) => Bytes::from(decode_hex("--identity", encoded)?),
        None => config
            .device
            .identity_bytes()
            .map_err(|reason| CliError::new(DATA_INVALID, reason))?,
    };
    let setup_timeout = match &args.timeout {
        Some(timeout) => parse_duration(timeout)?,
        None => config.setup_timeout,
    };

    let link = GattLink::new(config, radio_transport());
    link.start()
        .map_err(|err| session_error("event loop failed to start", err))?;

    let (tx, rx) = mpsc::channel();
    link.on_message_received(Some(Arc::new(move |message: Bytes| {
        let _ = tx.send(message);
    })));
    link.on_connection_init_started(Some(Arc::new(|| info!("central connecting"))));

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let result = serve(&link, &args, identity, setup_timeout, &rx, &running, format);
    if !link.stop() {
        warn!("event loop did not stop cleanly");
    }
    result
}

fn serve(
    link: &GattLink,
    args: &AdvertiseArgs,
    identity: Bytes,
    setup_timeout: Duration,
    messages: &Receiver<Bytes>,
    running: &AtomicBool,
    format: OutputFormat,
) -> CliResult<i32> {
    link.begin_advertising(identity, args.service, setup_timeout)
        .map_err(|err| session_error("advertising setup failed", err))?;

    let peer = link
        .snapshot()
        .ok()
        .and_then(|snapshot| snapshot.peer)
        .map(|peer| peer.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    info!(service = %args.service, %peer, "streaming");

    let mut received = 0usize;
    while running.load(Ordering::SeqCst) {
        let message = match messages.recv_timeout(POLL_INTERVAL) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        print_message(&message, "peripheral", &peer, format);
        received = received.saturating_add(1);
        if args.echo {
            if let Err(err) = link.send_message(message) {
                warn!(%err, "echo failed");
            }
        }
        if args.count.is_some_and(|count| received >= count) {
            break;
        }
    }

    if let Err(err) = link.send_termination() {
        warn!(%err, "termination not sent");
    }
    Ok(SUCCESS)
}
