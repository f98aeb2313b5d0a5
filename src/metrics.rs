//! Prometheus metrics for subscription workers
//!
//! One [`SubscriberMetrics`] registry is shared by every worker of a bus.
//! It records:
//!
//! - `edu_events_processed_messages_total{subject, queue, status}`
//! - `edu_events_processed_messages_latency_ms{subject, queue}`, handler
//!   time of successfully processed messages
//! - `edu_events_subscriber_events_total{stream, durable, event}`, the
//!   counters behind [`StatsSnapshot`](crate::worker::StatsSnapshot)

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{EventError, Result};

/// Latency histogram buckets, in milliseconds
pub const LATENCY_BUCKETS_MS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Status label of the processed-message counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    Ok,
    AckError,
    DecodeError,
    HandlerError,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Ok => "OK",
            ProcessStatus::AckError => "ACK_ERROR",
            ProcessStatus::DecodeError => "DECODE_ERROR",
            ProcessStatus::HandlerError => "HANDLER_ERROR",
        }
    }
}

/// Prometheus registry of the subscriber metrics
#[derive(Clone)]
pub struct SubscriberMetrics {
    registry: Registry,
    pub(crate) processed: IntCounterVec,
    pub(crate) latency: HistogramVec,
    pub(crate) events: IntCounterVec,
}

fn metrics_error(e: impl std::fmt::Display) -> EventError {
    EventError::Metrics(e.to_string())
}

impl SubscriberMetrics {
    /// Create the metrics in a fresh registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Register the metrics in an existing registry
    ///
    /// Fails if the registry already holds metrics with the same names.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let processed = IntCounterVec::new(
            Opts::new(
                "edu_events_processed_messages_total",
                "Processed messages by subject, queue and status",
            ),
            &["subject", "queue", "status"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(processed.clone()))
            .map_err(metrics_error)?;

        let latency = HistogramVec::new(
            HistogramOpts::new(
                "edu_events_processed_messages_latency_ms",
                "Handler latency of processed messages in milliseconds",
            )
            .buckets(LATENCY_BUCKETS_MS.to_vec()),
            &["subject", "queue"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(latency.clone()))
            .map_err(metrics_error)?;

        let events = IntCounterVec::new(
            Opts::new(
                "edu_events_subscriber_events_total",
                "Subscriber lifecycle events by stream and durable",
            ),
            &["stream", "durable", "event"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(events.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            processed,
            latency,
            events,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(metrics_error)
    }

    /// Processed-message count for one label set
    pub fn processed_count(&self, subject: &str, queue: &str, status: ProcessStatus) -> u64 {
        self.processed
            .with_label_values(&[subject, queue, status.as_str()])
            .get()
    }

    /// Number of latency samples for one label set
    pub fn latency_samples(&self, subject: &str, queue: &str) -> u64 {
        self.latency
            .with_label_values(&[subject, queue])
            .get_sample_count()
    }
}

impl std::fmt::Debug for SubscriberMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_metric_families() {
        let metrics = SubscriberMetrics::new().unwrap();
        metrics
            .processed
            .with_label_values(&["Lesson.Created", "queue-lesson", "OK"])
            .inc();
        metrics
            .latency
            .with_label_values(&["Lesson.Created", "queue-lesson"])
            .observe(12.0);

        let text = metrics.render().unwrap();
        assert!(text.contains("edu_events_processed_messages_total"));
        assert!(text.contains("status=\"OK\""));
        assert!(text.contains("edu_events_processed_messages_latency_ms_bucket"));
        assert_eq!(
            metrics.processed_count("Lesson.Created", "queue-lesson", ProcessStatus::Ok),
            1
        );
        assert_eq!(metrics.latency_samples("Lesson.Created", "queue-lesson"), 1);
    }

    #[test]
    fn test_shared_registry_rejects_second_registration() {
        let registry = Registry::new();
        SubscriberMetrics::with_registry(registry.clone()).unwrap();
        let err = SubscriberMetrics::with_registry(registry).unwrap_err();
        assert!(matches!(err, EventError::Metrics(_)));
    }
}
