//! Tracing setup: console output plus an optional JSON-lines file.

mod json;

pub use json::{JsonLogLayer, JsonLogWriter, LOG_BUFFER};

use crate::cli::{IndexerConfig, DEFAULT_LOG_JSON_FILTER};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

/// Guards that must be held to keep logging active.
pub struct TracingGuards {
    pub log_writer: Option<Arc<JsonLogWriter>>,
}

impl TracingGuards {
    /// Flushes the JSON log file, if any.
    pub fn finish(&self) {
        let Some(writer) = &self.log_writer else {
            return;
        };
        let dropped = writer.dropped_events();
        if dropped > 0 {
            warn!(dropped, written = writer.total_events(), "json log dropped events");
        }
        if let Err(err) = writer.finish() {
            eprintln!("failed to flush json log: {err:#}");
        }
    }
}

/// Console filter for a `-v` count, unless `RUST_LOG` is set.
fn console_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let (global, local) = match verbosity {
            0 => ("warn", "info"),
            1 => ("warn", "debug"),
            2 => ("info", "trace"),
            _ => ("debug", "trace"),
        };
        EnvFilter::new(format!("{global},help_indexer={local}"))
    })
}

pub fn init_tracing(config: &IndexerConfig) -> TracingGuards {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_filter(console_filter(config.verbosity));

    let json_log_filter = EnvFilter::try_new(&config.log_json_filter)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_JSON_FILTER));

    let mut open_error = None;
    let log_writer = config
        .log_json
        .as_deref()
        .and_then(|path| match JsonLogWriter::new(path, LOG_BUFFER) {
            Ok(writer) => Some(Arc::new(writer)),
            Err(err) => {
                open_error = Some(format!("{err:#}"));
                None
            }
        });
    let log_layer = log_writer
        .as_ref()
        .map(|writer| JsonLogLayer::new(Arc::clone(writer)).with_filter(json_log_filter));

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(log_layer)
        .init();

    if let Some(error) = open_error {
        warn!(%error, "failed to initialize json log writer");
    }
    TracingGuards { log_writer }
}
