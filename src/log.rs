//! Operator-facing synchronization log.
//!
//! During a sync the engine narrates what it is waiting on. Lines go to a
//! caller-supplied sink (typically multiplexed onto the wire protocol of the
//! in-flight fetch or push), each prefixed `# ` so clients render them as
//! comments. Every line is mirrored to `tracing` for the server-side log.

use std::sync::Arc;

/// Single-method sink for sync progress lines.
pub trait LogWriter: Send + Sync {
    fn write_log(&self, line: &str);
}

/// Writes sync progress to stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrLog;

impl LogWriter for StderrLog {
    fn write_log(&self, line: &str) {
        eprintln!("{line}");
    }
}

/// The engine's handle on the sync log. Cheap to clone; absent writer means
/// tracing-only.
#[derive(Clone, Default)]
pub struct EngineLog {
    writer: Option<Arc<dyn LogWriter>>,
}

impl EngineLog {
    pub fn new(writer: Arc<dyn LogWriter>) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// A log that only reaches `tracing`.
    pub fn disabled() -> Self {
        Self { writer: None }
    }

    pub fn say(&self, message: &str) {
        tracing::debug!(target: "repocluster::sync", "{message}");
        if let Some(writer) = &self.writer {
            writer.write_log(&format!("# {message}"));
        }
    }
}
