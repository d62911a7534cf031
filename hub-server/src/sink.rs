//! Best-effort operational gauges.
//!
//! The coordinator pushes gauges (cost ratio, mode, peer and session
//! counts) to a [`MetricsSink`] after each background pass. Sink failures
//! are logged at debug level and otherwise ignored.

use std::sync::Arc;

/// Error returned by a sink; never surfaced to callers.
pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Destination for operational gauges.
pub trait MetricsSink: Send + Sync {
    /// Record the current value of a gauge.
    fn gauge(&self, name: &str, value: f64) -> Result<(), SinkError>;
}

/// Sink emitting each gauge as a `debug!` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn gauge(&self, name: &str, value: f64) -> Result<(), SinkError> {
        tracing::debug!(metric = name, value, "gauge");
        Ok(())
    }
}

/// Push a gauge, swallowing failures.
pub fn emit(sink: &Arc<dyn MetricsSink>, name: &str, value: f64) {
    if let Err(e) = sink.gauge(name, value) {
        tracing::debug!(metric = name, error = %e, "metrics sink rejected gauge");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink remembering every gauge, optionally failing.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub gauges: Mutex<Vec<(String, f64)>>,
        pub failing: bool,
    }

    impl RecordingSink {
        pub fn last(&self, name: &str) -> Option<f64> {
            self.gauges
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(n, _)| n == name)
                .map(|(_, v)| *v)
        }
    }

    impl MetricsSink for RecordingSink {
        fn gauge(&self, name: &str, value: f64) -> Result<(), SinkError> {
            if self.failing {
                return Err("sink offline".into());
            }
            self.gauges.lock().unwrap().push((name.to_string(), value));
            Ok(())
        }
    }
}
