//! Logging setup from the participant configuration.
//!
//! Maps the configured sinks onto a `tracing_subscriber` installation.
//! The global default can only be set once per process; additional
//! participants in the same process share the first installation.

use silbus_types::{LogLevel, LogSinkConfig, LogSinkKind, LoggingConfig};
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;

fn level_filter(level: LogLevel) -> LevelFilter {
    match level {
        LogLevel::Trace => LevelFilter::TRACE,
        LogLevel::Debug => LevelFilter::DEBUG,
        LogLevel::Info => LevelFilter::INFO,
        LogLevel::Warn => LevelFilter::WARN,
        LogLevel::Error => LevelFilter::ERROR,
        LogLevel::Off => LevelFilter::OFF,
    }
}

/// Install logging per the configuration. Safe to call repeatedly.
pub fn init(config: &LoggingConfig) {
    let mut stdout_level: Option<LogLevel> = None;
    let mut file_sink: Option<&LogSinkConfig> = None;

    for sink in &config.sinks {
        match sink.kind {
            LogSinkKind::Stdout => {
                stdout_level = Some(stdout_level.map_or(sink.level, |l| l.min(sink.level)));
            }
            LogSinkKind::File => file_sink = Some(sink),
            LogSinkKind::Remote => {
                // Remote log shipping lives outside the core.
                warn!("remote logging sink configured but not wired; ignoring");
            }
        }
    }

    if let Some(sink) = file_sink {
        let stem = sink.log_name.as_deref().unwrap_or("silbus");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(format!("{stem}.log"))
        {
            Ok(file) => {
                let _ = tracing_subscriber::fmt()
                    .with_max_level(level_filter(sink.level))
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .try_init();
                return;
            }
            Err(e) => {
                warn!(error = %e, "could not open log file; falling back to stdout");
            }
        }
    }

    if let Some(level) = stdout_level {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level_filter(level))
            .try_init();
    }
}
