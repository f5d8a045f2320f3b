//! Operator-facing log sink.
//!
//! Sessions report what happens on the wire ("bridge authorized 3",
//! "channel client connected 1", ...) through a `LogSink` handed to them at
//! construction. The binary forwards these to tracing; embedders and tests can
//! capture them instead. Internal diagnostics still go straight to `tracing`.

use std::sync::Arc;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

pub trait LogSink: Send + Sync {
    fn log(&self, severity: Severity, message: &str);

    fn info(&self, message: &str) {
        self.log(Severity::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(Severity::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(Severity::Error, message);
    }
}

pub type SharedSink = Arc<dyn LogSink>;

/// Forwards every message to `tracing` under the `bridgelet::log` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, severity: Severity, message: &str) {
        match severity {
            Severity::Debug => tracing::debug!(target: "bridgelet::log", "{}", message),
            Severity::Info => tracing::info!(target: "bridgelet::log", "{}", message),
            Severity::Warn => tracing::warn!(target: "bridgelet::log", "{}", message),
            Severity::Error => tracing::error!(target: "bridgelet::log", "{}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub severity: Severity,
    pub message: String,
}

/// Captures messages into an unbounded channel.
///
/// Dropping the receiver turns the sink into a no-op.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelSink {
    fn log(&self, severity: Severity, message: &str) {
        if self.tx.is_closed() {
            return;
        }
        let _ = self.tx.send(LogRecord {
            severity,
            message: message.to_string(),
        });
    }
}

/// Collect everything captured so far without waiting.
pub fn drain_records(rx: &mut mpsc::UnboundedReceiver<LogRecord>) -> Vec<LogRecord> {
    let mut records = Vec::new();
    while let Ok(record) = rx.try_recv() {
        records.push(record);
    }
    records
}
