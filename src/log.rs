//! Diagnostic trail for driver calls.
//!
//! Every accessor and session operation formats the equivalent driver call
//! signature (function name plus arguments) and offers it to an attachable
//! byte-stream sink. The sink is any `Box<dyn Write + Send>`: a file, a
//! `Vec<u8>`, a pipe. Messages also flow through the `log` facade so an
//! embedder's logger sees them regardless of whether a sink is attached.
//!
//! The sink is a single shared stream; a mutex serializes the main thread
//! against the driver's callback thread so lines never interleave.

use std::io::Write;
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::{Deserialize, Serialize};

/// Verbosity of the diagnostic trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LogLevel {
    /// Every driver call signature plus errors.
    Verbose,
    /// Errors only.
    #[default]
    Error,
    /// Nothing reaches the sink.
    Quiet,
}

struct LogInner {
    sink: Option<Box<dyn Write + Send>>,
    level: LogLevel,
}

/// Shared handle to the diagnostic sink.
///
/// Cloning is cheap; all clones write to the same stream. The session and
/// its feature accessor hold clones of one `CameraLog`.
#[derive(Clone)]
pub struct CameraLog {
    inner: Arc<Mutex<LogInner>>,
}

impl Default for CameraLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraLog {
    /// Create a log with no sink attached, at the default level.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogInner {
                sink: None,
                level: LogLevel::default(),
            })),
        }
    }

    /// Attach a byte-stream destination. Replaces any previous sink.
    pub fn set_sink(&self, sink: Box<dyn Write + Send>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.sink = Some(sink);
        }
    }

    /// Detach the sink, if any.
    pub fn clear_sink(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.sink = None;
        }
    }

    /// Set the verbosity level.
    pub fn set_level(&self, level: LogLevel) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.level = level;
        }
    }

    /// Current verbosity level.
    pub fn level(&self) -> LogLevel {
        self.inner.lock().map(|i| i.level).unwrap_or_default()
    }

    /// Record a driver call signature. Written to the sink at `Verbose`.
    pub fn call(&self, signature: &str) {
        log::debug!(target: "andor3", "{signature}");
        self.write_line("CALL", signature, LogLevel::Verbose);
    }

    /// Record a failure. Written to the sink at `Verbose` and `Error`.
    pub fn error(&self, message: &str) {
        log::error!(target: "andor3", "{message}");
        self.write_line("ERROR", message, LogLevel::Error);
    }

    /// Record an informational state transition. Written at `Verbose`.
    pub fn info(&self, message: &str) {
        log::info!(target: "andor3", "{message}");
        self.write_line("INFO", message, LogLevel::Verbose);
    }

    fn write_line(&self, tag: &str, message: &str, needed: LogLevel) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let enabled = match inner.level {
            LogLevel::Quiet => false,
            LogLevel::Error => needed == LogLevel::Error,
            LogLevel::Verbose => true,
        };
        if !enabled {
            return;
        }
        if let Some(sink) = inner.sink.as_mut() {
            let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
            // A failing sink is not allowed to take the camera down.
            let _ = writeln!(sink, "[{stamp}] {tag} {message}");
            let _ = sink.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn contents(buf: &SharedBuf) -> String {
        String::from_utf8(buf.0.lock().unwrap().clone()).unwrap()
    }

    #[test]
    fn verbose_level_records_calls_and_errors() {
        let buf = SharedBuf::default();
        let log = CameraLog::new();
        log.set_sink(Box::new(buf.clone()));
        log.set_level(LogLevel::Verbose);

        log.call("AT_GetInt(hndl=1, 'SensorWidth', &value)");
        log.error("SDK error 13 in AT_WaitBuffer(hndl=1)");

        let text = contents(&buf);
        assert!(text.contains("CALL AT_GetInt(hndl=1, 'SensorWidth', &value)"));
        assert!(text.contains("ERROR SDK error 13"));
    }

    #[test]
    fn error_level_drops_call_lines() {
        let buf = SharedBuf::default();
        let log = CameraLog::new();
        log.set_sink(Box::new(buf.clone()));
        log.set_level(LogLevel::Error);

        log.call("AT_GetFloat(hndl=1, 'ExposureTime', &value)");
        log.error("boom");

        let text = contents(&buf);
        assert!(!text.contains("AT_GetFloat"));
        assert!(text.contains("boom"));
    }

    #[test]
    fn quiet_level_writes_nothing() {
        let buf = SharedBuf::default();
        let log = CameraLog::new();
        log.set_sink(Box::new(buf.clone()));
        log.set_level(LogLevel::Quiet);

        log.call("AT_Open(0, &hndl)");
        log.error("ignored");

        assert!(contents(&buf).is_empty());
    }

    #[test]
    fn clones_share_one_sink() {
        let buf = SharedBuf::default();
        let log = CameraLog::new();
        log.set_level(LogLevel::Verbose);
        let clone = log.clone();
        log.set_sink(Box::new(buf.clone()));

        clone.call("AT_Close(hndl=2)");
        assert!(contents(&buf).contains("AT_Close(hndl=2)"));
    }
}
