//! Logging and metrics sink consumed by the engine.
//!
//! The engine reports activity through [`Monitor`], never directly to a
//! metrics backend. A degraded monitor must not fail a run, so the engine
//! talks to it through [`MonitorHandle`], which logs and swallows errors.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

/// Severity passed to [`Monitor::log_activity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("monitor unavailable: {0}")]
pub struct MonitorError(pub String);

/// Tags attached to counters and timers.
pub type Tags<'a> = &'a [(&'a str, &'a str)];

/// Activity, counter and timer sink.
pub trait Monitor: Send + Sync {
    fn log_activity(&self, message: &str, level: LogLevel, details: &Value)
    -> Result<(), MonitorError>;

    fn increment_counter(&self, name: &str, tags: Tags<'_>) -> Result<(), MonitorError>;

    fn record_timer(&self, name: &str, duration: Duration, tags: Tags<'_>)
    -> Result<(), MonitorError>;
}

// ---------------------------------------------------------------------------
// TracingMonitor
// ---------------------------------------------------------------------------

/// Forwards everything to `tracing` events under the `conductor::monitor` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

fn format_tags(tags: Tags<'_>) -> String {
    tags.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

impl Monitor for TracingMonitor {
    fn log_activity(
        &self,
        message: &str,
        level: LogLevel,
        details: &Value,
    ) -> Result<(), MonitorError> {
        match level {
            LogLevel::Debug => {
                tracing::debug!(target: "conductor::monitor", %details, "{message}")
            }
            LogLevel::Info => {
                tracing::info!(target: "conductor::monitor", %details, "{message}")
            }
            LogLevel::Warning => {
                tracing::warn!(target: "conductor::monitor", %details, "{message}")
            }
            LogLevel::Error => {
                tracing::error!(target: "conductor::monitor", %details, "{message}")
            }
        }
        Ok(())
    }

    fn increment_counter(&self, name: &str, tags: Tags<'_>) -> Result<(), MonitorError> {
        tracing::debug!(
            target: "conductor::monitor",
            counter = name,
            tags = %format_tags(tags),
            "counter incremented"
        );
        Ok(())
    }

    fn record_timer(
        &self,
        name: &str,
        duration: Duration,
        tags: Tags<'_>,
    ) -> Result<(), MonitorError> {
        tracing::debug!(
            target: "conductor::monitor",
            timer = name,
            duration_ms = duration.as_millis() as u64,
            tags = %format_tags(tags),
            "timer recorded"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MonitorHandle
// ---------------------------------------------------------------------------

/// Shared, infallible front for a [`Monitor`].
#[derive(Clone)]
pub struct MonitorHandle {
    inner: Arc<dyn Monitor>,
}

impl std::fmt::Debug for MonitorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHandle").finish_non_exhaustive()
    }
}

impl Default for MonitorHandle {
    fn default() -> Self {
        Self::new(TracingMonitor)
    }
}

impl MonitorHandle {
    pub fn new(monitor: impl Monitor + 'static) -> Self {
        Self {
            inner: Arc::new(monitor),
        }
    }

    pub fn from_arc(monitor: Arc<dyn Monitor>) -> Self {
        Self { inner: monitor }
    }

    pub fn log(&self, message: &str, level: LogLevel, details: &Value) {
        if let Err(e) = self.inner.log_activity(message, level, details) {
            tracing::warn!(error = %e, "monitor log_activity failed");
        }
    }

    pub fn count(&self, name: &str, tags: Tags<'_>) {
        if let Err(e) = self.inner.increment_counter(name, tags) {
            tracing::warn!(error = %e, counter = name, "monitor increment_counter failed");
        }
    }

    pub fn time(&self, name: &str, duration: Duration, tags: Tags<'_>) {
        if let Err(e) = self.inner.record_timer(name, duration, tags) {
            tracing::warn!(error = %e, timer = name, "monitor record_timer failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records every call for assertions in engine tests.
    #[derive(Default)]
    pub(crate) struct RecordingMonitor {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingMonitor {
        pub(crate) fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Monitor for RecordingMonitor {
        fn log_activity(&self, message: &str, level: LogLevel, _: &Value) -> Result<(), MonitorError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("log:{}:{message}", level.as_str()));
            Ok(())
        }

        fn increment_counter(&self, name: &str, _: Tags<'_>) -> Result<(), MonitorError> {
            self.events.lock().unwrap().push(format!("counter:{name}"));
            Ok(())
        }

        fn record_timer(&self, name: &str, _: Duration, _: Tags<'_>) -> Result<(), MonitorError> {
            self.events.lock().unwrap().push(format!("timer:{name}"));
            Ok(())
        }
    }

    /// A monitor whose backend is down.
    pub(crate) struct BrokenMonitor;

    impl Monitor for BrokenMonitor {
        fn log_activity(&self, _: &str, _: LogLevel, _: &Value) -> Result<(), MonitorError> {
            Err(MonitorError("sink offline".into()))
        }

        fn increment_counter(&self, _: &str, _: Tags<'_>) -> Result<(), MonitorError> {
            Err(MonitorError("sink offline".into()))
        }

        fn record_timer(&self, _: &str, _: Duration, _: Tags<'_>) -> Result<(), MonitorError> {
            Err(MonitorError("sink offline".into()))
        }
    }

    #[test]
    fn test_handle_swallows_monitor_errors() {
        let handle = MonitorHandle::new(BrokenMonitor);
        handle.log("hello", LogLevel::Info, &Value::Null);
        handle.count("c", &[("k", "v")]);
        handle.time("t", Duration::from_millis(5), &[]);
    }

    #[test]
    fn test_handle_forwards_to_monitor() {
        let recorder = Arc::new(RecordingMonitor::default());
        let handle = MonitorHandle::from_arc(recorder.clone());
        handle.log("started", LogLevel::Info, &Value::Null);
        handle.count("workflow.started", &[]);
        handle.time("step.duration", Duration::from_millis(1), &[("step", "a")]);
        assert_eq!(
            recorder.events(),
            vec![
                "log:info:started".to_string(),
                "counter:workflow.started".to_string(),
                "timer:step.duration".to_string(),
            ]
        );
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
