//! Logger adapter decoupling the engine from the host test framework.
//!
//! The engine only needs a tiny capability surface from whatever runs
//! the tests: emit a line, mark helper frames, flag failures. Hosts
//! implement [`TestReporter`] once; the engine talks to it through
//! [`Logger`], which chains key=value metadata and a timestamp prefix
//! onto every line. A logger without a sink silently discards.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Minimal capability surface consumed from the host test object.
///
/// The engine never asserts on its own; `fail` and `fail_now` exist so
/// hosts that escalate engine diagnostics can do so. The default
/// implementations make every capability except `log` optional.
pub trait TestReporter: Send + Sync {
    /// Emit one line of debug output.
    fn log(&self, message: &str);

    /// Mark the calling function as a helper so stack attribution in the
    /// host skips adapter frames.
    fn helper(&self) {}

    /// Mark the host test as failed without stopping it.
    fn fail(&self) {}

    /// Mark the host test as failed and stop it.
    fn fail_now(&self) {}
}

/// A debug logger carrying chained key=value metadata.
#[derive(Clone, Default)]
pub struct Logger {
    sink: Option<Arc<dyn TestReporter>>,
    fields: Vec<(String, String)>,
}

impl Logger {
    /// Create a logger emitting through the given reporter.
    #[must_use]
    pub fn new(sink: Arc<dyn TestReporter>) -> Self {
        Self {
            sink: Some(sink),
            fields: Vec::new(),
        }
    }

    /// A logger that discards everything.
    #[must_use]
    pub fn null() -> Self {
        Self::default()
    }

    /// Return a logger that stamps `key=value` onto every line, after
    /// the metadata already chained on this one.
    #[must_use]
    pub fn with_field(&self, key: &str, value: &str) -> Self {
        let mut fields = self.fields.clone();
        fields.push((key.to_string(), value.to_string()));
        Self {
            sink: self.sink.clone(),
            fields,
        }
    }

    /// Emit one line: timestamp prefix, chained metadata, message.
    pub fn log(&self, message: &str) {
        let Some(sink) = &self.sink else { return };
        sink.helper();

        let mut line = format!("[{:>13}] ", Self::now_millis());
        for (key, value) in &self.fields {
            // Writing to a String cannot fail.
            let _ = write!(line, "{key}={value} ");
        }
        line.push_str(message);
        sink.log(&line);
    }

    /// Get the current Unix timestamp in milliseconds.
    #[allow(clippy::cast_possible_truncation)]
    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}
