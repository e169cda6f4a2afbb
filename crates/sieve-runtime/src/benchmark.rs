//! Benchmark measurement hook.
//!
//! While benchmarking is on, the service bypasses the cache and reports
//! one [`Measurement`] per analysis to a [`MeasurementSink`]. Aggregation
//! is left to the sink.

use parking_lot::Mutex;
use serde::Serialize;
use sieve_core::RuleKind;
use std::time::Duration;

use crate::providers::ProviderId;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    pub kind: RuleKind,
    pub provider: ProviderId,
    pub model: String,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    pub matches: bool,
    pub confidence: f64,
    /// Expected answer, when the caller labelled the sample
    pub ground_truth: Option<bool>,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}

pub trait MeasurementSink: Send + Sync {
    fn record(&self, measurement: Measurement);
}

/// Sink that keeps every measurement in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    measurements: Mutex<Vec<Measurement>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measurements(&self) -> Vec<Measurement> {
        self.measurements.lock().clone()
    }
}

impl MeasurementSink for RecordingSink {
    fn record(&self, measurement: Measurement) {
        tracing::debug!(
            kind = %measurement.kind,
            provider = %measurement.provider,
            latency_ms = measurement.latency.as_millis() as u64,
            "Recorded measurement"
        );
        self.measurements.lock().push(measurement);
    }
}
