//! JSON-lines log file written from a background thread.

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{
    io::{BufWriter, Write},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, SyncSender, TrySendError},
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tracing::Event;
use tracing_subscriber::Layer;

/// Buffer size for JSON log channel.
pub const LOG_BUFFER: usize = 10_000;

const FLUSH_EVERY: usize = 1_024;

/// A single log record serialized to JSON.
#[derive(Debug, Serialize)]
pub struct LogRecord {
    pub t_ms: u64,
    pub level: String,
    pub target: String,
    pub message: Option<String>,
    pub fields: JsonMap<String, JsonValue>,
}

/// Visitor that collects tracing fields into a JSON map.
#[derive(Default)]
pub struct JsonLogVisitor {
    pub fields: JsonMap<String, JsonValue>,
}

impl JsonLogVisitor {
    fn insert(&mut self, field: &tracing::field::Field, value: JsonValue) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl tracing::field::Visit for JsonLogVisitor {
    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.insert(field, JsonValue::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.insert(field, JsonValue::Number(value.into()));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.insert(field, JsonValue::Number(value.into()));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        let number = serde_json::Number::from_f64(value)
            .map_or_else(|| JsonValue::String(value.to_string()), JsonValue::Number);
        self.insert(field, number);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.insert(field, JsonValue::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.insert(field, JsonValue::String(format!("{value:?}")));
    }
}

/// Writes records to a file in a background thread. Records are dropped,
/// not blocked on, when the channel is full.
#[derive(Debug)]
pub struct JsonLogWriter {
    started_at: Instant,
    sender: Mutex<Option<SyncSender<LogRecord>>>,
    handle: Mutex<Option<JoinHandle<eyre::Result<()>>>>,
    dropped_events: AtomicU64,
    total_events: AtomicU64,
}

impl JsonLogWriter {
    pub fn new(path: &Path, capacity: usize) -> eyre::Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        let (tx, rx) = mpsc::sync_channel::<LogRecord>(capacity);
        let handle = std::thread::spawn(move || -> eyre::Result<()> {
            let mut since_flush = 0usize;
            for record in rx {
                serde_json::to_writer(&mut writer, &record)?;
                writer.write_all(b"\n")?;
                since_flush += 1;
                if since_flush >= FLUSH_EVERY {
                    writer.flush()?;
                    since_flush = 0;
                }
            }
            writer.flush()?;
            Ok(())
        });

        Ok(Self {
            started_at: Instant::now(),
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            dropped_events: AtomicU64::new(0),
            total_events: AtomicU64::new(0),
        })
    }

    pub fn record(&self, record: LogRecord) {
        let sender = self.sender.lock().as_ref().cloned();
        let Some(sender) = sender else {
            self.dropped_events.fetch_add(1, Ordering::SeqCst);
            return;
        };
        match sender.try_send(record) {
            Ok(()) => {
                self.total_events.fetch_add(1, Ordering::SeqCst);
            }
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => {
                self.dropped_events.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Closes the channel and waits for pending records to hit the file.
    pub fn finish(&self) -> eyre::Result<()> {
        drop(self.sender.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(res) => res?,
                Err(_) => return Err(eyre::eyre!("json log writer thread panicked")),
            }
        }
        Ok(())
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::SeqCst)
    }

    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// A tracing layer that forwards every event to a [`JsonLogWriter`].
#[derive(Clone)]
pub struct JsonLogLayer {
    writer: Arc<JsonLogWriter>,
}

impl JsonLogLayer {
    pub fn new(writer: Arc<JsonLogWriter>) -> Self {
        Self { writer }
    }
}

impl<S> Layer<S> for JsonLogLayer
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let meta = event.metadata();
        let mut visitor = JsonLogVisitor::default();
        event.record(&mut visitor);
        let mut fields = visitor.fields;
        let message = match fields.remove("message") {
            Some(JsonValue::String(value)) => Some(value),
            Some(value) => Some(value.to_string()),
            None => None,
        };

        self.writer.record(LogRecord {
            t_ms: self.writer.elapsed().as_millis() as u64,
            level: meta.level().as_str().to_string(),
            target: meta.target().to_string(),
            message,
            fields,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn temp_log(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("help-indexer-{name}-{}.jsonl", std::process::id()))
    }

    #[test]
    fn events_are_written_as_json_lines() {
        let path = temp_log("layer");
        let writer = Arc::new(JsonLogWriter::new(&path, 16).expect("writer"));
        let subscriber = tracing_subscriber::registry().with(JsonLogLayer::new(writer.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(block = 42u64, endpoint = "primary", "window fetched");
        });
        writer.finish().expect("finish");

        let contents = std::fs::read_to_string(&path).expect("read log");
        let line: JsonValue = serde_json::from_str(contents.lines().next().expect("one line"))
            .expect("json line");
        assert_eq!(line["level"], "INFO");
        assert_eq!(line["message"], "window fetched");
        assert_eq!(line["fields"]["block"], 42);
        assert_eq!(line["fields"]["endpoint"], "primary");
        assert_eq!(writer.total_events(), 1);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn records_after_finish_are_dropped() {
        let path = temp_log("finished");
        let writer = JsonLogWriter::new(&path, 4).expect("writer");
        writer.finish().expect("finish");
        writer.record(LogRecord {
            t_ms: 0,
            level: "INFO".into(),
            target: "test".into(),
            message: None,
            fields: JsonMap::new(),
        });
        assert_eq!(writer.dropped_events(), 1);
        let _ = std::fs::remove_file(path);
    }
}
