//! Log bus - structured log events fanned out to independent sinks.
//!
//! The library only emits `tracing` events. `LogBusLayer` turns each event
//! into a [`LogEvent`] and publishes it on a [`LogBus`]; console, file and
//! in-app log panels subscribe to the bus without knowing about each other.

use chrono::{DateTime, Local};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            tracing::Level::DEBUG => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        };
        f.write_str(name)
    }
}

/// One log line as seen by sinks.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl LogEvent {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Local::now(),
        }
    }
}

impl fmt::Display for LogEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level,
            self.message
        )
    }
}

/// Receiver of log events. Implementations must not block for long.
pub trait LogSink: Send + Sync {
    fn on_event(&self, event: &LogEvent);
}

/// Handle returned by [`LogBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Fan-out point between event producers and sinks.
#[derive(Clone, Default)]
pub struct LogBus {
    sinks: Arc<RwLock<Vec<(SubscriptionId, Arc<dyn LogSink>)>>>,
    next_id: Arc<AtomicU64>,
}

impl LogBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, sink: Arc<dyn LogSink>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.push((id, sink));
        }
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        if let Ok(mut sinks) = self.sinks.write() {
            sinks.retain(|(sid, _)| *sid != id);
        }
    }

    pub fn publish(&self, event: &LogEvent) {
        if let Ok(sinks) = self.sinks.read() {
            for (_, sink) in sinks.iter() {
                sink.on_event(event);
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sinks.read().map(|s| s.len()).unwrap_or(0)
    }

    /// `tracing` layer publishing onto this bus.
    pub fn layer(&self) -> LogBusLayer {
        LogBusLayer { bus: self.clone() }
    }
}

/// Bridges `tracing` events onto a [`LogBus`].
pub struct LogBusLayer {
    bus: LogBus,
}

impl<S: Subscriber> Layer<S> for LogBusLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let level = LogLevel::from(*event.metadata().level());
        self.bus.publish(&LogEvent::new(level, visitor.finish()));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} {}", self.message, self.fields.join(" "))
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }
}

/// Appends every event to a log file.
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn on_event(&self, event: &LogEvent) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", event);
        }
    }
}

/// Bounded in-memory log panel; keeps the newest `capacity` events.
pub struct RecentLog {
    capacity: usize,
    events: Mutex<VecDeque<LogEvent>>,
}

impl RecentLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Oldest first.
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for RecentLog {
    fn on_event(&self, event: &LogEvent) {
        if let Ok(mut events) = self.events.lock() {
            if events.len() == self.capacity {
                events.pop_front();
            }
            events.push_back(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_layer_publishes_tracing_events() {
        let bus = LogBus::new();
        let panel = Arc::new(RecentLog::new(10));
        bus.subscribe(panel.clone());

        let subscriber = tracing_subscriber::registry().with(bus.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Uploading {}", "world1.zip");
            tracing::warn!(size = 42, "Archive is large");
        });

        let events = panel.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].level, LogLevel::Info);
        assert_eq!(events[0].message, "Uploading world1.zip");
        assert_eq!(events[1].level, LogLevel::Warn);
        assert_eq!(events[1].message, "Archive is large size=42");
    }

    #[test]
    fn test_sinks_are_independent() {
        let bus = LogBus::new();
        let first = Arc::new(RecentLog::new(10));
        let second = Arc::new(RecentLog::new(10));
        let first_id = bus.subscribe(first.clone());
        bus.subscribe(second.clone());

        bus.publish(&LogEvent::new(LogLevel::Info, "one"));
        bus.unsubscribe(first_id);
        bus.publish(&LogEvent::new(LogLevel::Info, "two"));

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_recent_log_drops_oldest() {
        let panel = RecentLog::new(2);
        for message in ["a", "b", "c"] {
            panel.on_event(&LogEvent::new(LogLevel::Info, message));
        }
        let messages: Vec<String> = panel.snapshot().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn test_file_sink_appends_lines() -> anyhow::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let path = temp_dir.path().join("logs").join("mcdrive.log");
        let sink = FileSink::open(&path)?;
        sink.on_event(&LogEvent::new(LogLevel::Error, "upload failed"));
        sink.on_event(&LogEvent::new(LogLevel::Info, "done"));

        let content = std::fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("ERROR - upload failed"));
        Ok(())
    }
}
