use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing::Span;

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Payload bytes are only logged (as hex) at `debug` and below.
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Install the stderr subscriber. Thread names tell the radio workers
/// (`gattlink-*`) apart from the host thread driving the command.
pub fn init_logging(format: LogFormat, level: LogLevel) {
    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(LevelFilter::from(level))
        .with_ansi(false)
        .with_target(false)
        .with_thread_names(true);

    match format {
        LogFormat::Text => {
            let _ = builder.try_init();
        }
        LogFormat::Json => {
            let _ = builder.json().with_current_span(true).try_init();
        }
    }
}

/// Span tagging host-thread events with the link role and radio they act on.
///
/// Events emitted on a bridge worker carry the worker's thread name instead.
pub fn role_span(role: &'static str, transport: &str) -> Span {
    tracing::info_span!("link", role, transport = %transport)
}
