//! Subscription workers
//!
//! A worker owns one bound consumer and runs until the bus shuts down or
//! its subscription is dropped. Push workers handle one message at a time;
//! pull workers fetch batches and hand them to a batch handler in chunks.

pub mod pull;
pub mod push;

use chrono::Utc;
use prometheus::{Histogram, IntCounter};
use serde::Serialize;
use std::any::Any;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::Result;
use crate::metrics::{ProcessStatus, SubscriberMetrics};
use crate::provider::{Delivery, DeliveryInfo};
use crate::types::Envelope;
use crate::wire::WireMessage;

pub use pull::PullWorker;
pub use push::PushWorker;

/// Final state of one delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    /// Acked: processed, or dropped as poison or permanent failure
    Acknowledged,
    /// Acked without processing because it was too old
    Skipped,
    /// Nak'd; the broker will deliver it again
    RedeliveryRequested,
    /// Failed on its final allowed delivery
    DeadLettered,
}

/// Per-subscription processing metrics
///
/// Every counter is a child of the bus [`SubscriberMetrics`] registry.
/// Event counters are labelled by stream and durable, so queue siblings of
/// one durable in the same process report shared totals.
#[derive(Clone)]
pub struct WorkerStats {
    received: IntCounter,
    acknowledged: IntCounter,
    skipped: IntCounter,
    redelivery_requested: IntCounter,
    dead_lettered: IntCounter,
    decode_errors: IntCounter,
    handler_errors: IntCounter,
    timeouts: IntCounter,
    ack_errors: IntCounter,
    processed_ok: IntCounter,
    processed_ack_error: IntCounter,
    processed_decode_error: IntCounter,
    processed_handler_error: IntCounter,
    latency: Histogram,
}

/// Point-in-time copy of [`WorkerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub received: u64,
    pub acknowledged: u64,
    pub skipped: u64,
    pub redelivery_requested: u64,
    pub dead_lettered: u64,
    pub decode_errors: u64,
    pub handler_errors: u64,
    pub timeouts: u64,
    pub ack_errors: u64,
    /// Handler latency samples recorded
    pub latency_samples: u64,
}

impl WorkerStats {
    /// Resolve the label set of one subscription
    ///
    /// `queue` is the queue group of a push subscription, or the durable
    /// name of a pull subscription.
    pub fn new(
        metrics: &SubscriberMetrics,
        subject: &str,
        queue: &str,
        stream: &str,
        durable: &str,
    ) -> Self {
        let event = |name: &str| metrics.events.with_label_values(&[stream, durable, name]);
        let processed =
            |status: ProcessStatus| metrics.processed.with_label_values(&[subject, queue, status.as_str()]);

        Self {
            received: event("received"),
            acknowledged: event("acknowledged"),
            skipped: event("skipped"),
            redelivery_requested: event("redelivery_requested"),
            dead_lettered: event("dead_lettered"),
            decode_errors: event("decode_error"),
            handler_errors: event("handler_error"),
            timeouts: event("timeout"),
            ack_errors: event("ack_error"),
            processed_ok: processed(ProcessStatus::Ok),
            processed_ack_error: processed(ProcessStatus::AckError),
            processed_decode_error: processed(ProcessStatus::DecodeError),
            processed_handler_error: processed(ProcessStatus::HandlerError),
            latency: metrics.latency.with_label_values(&[subject, queue]),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.get(),
            acknowledged: self.acknowledged.get(),
            skipped: self.skipped.get(),
            redelivery_requested: self.redelivery_requested.get(),
            dead_lettered: self.dead_lettered.get(),
            decode_errors: self.decode_errors.get(),
            handler_errors: self.handler_errors.get(),
            timeouts: self.timeouts.get(),
            ack_errors: self.ack_errors.get(),
            latency_samples: self.latency.get_sample_count(),
        }
    }

    /// Processed-message count for one status of this subscription
    pub fn processed(&self, status: ProcessStatus) -> u64 {
        self.processed_counter(status).get()
    }

    fn processed_counter(&self, status: ProcessStatus) -> &IntCounter {
        match status {
            ProcessStatus::Ok => &self.processed_ok,
            ProcessStatus::AckError => &self.processed_ack_error,
            ProcessStatus::DecodeError => &self.processed_decode_error,
            ProcessStatus::HandlerError => &self.processed_handler_error,
        }
    }

    pub(crate) fn record_received(&self, count: u64) {
        self.received.inc_by(count);
    }

    pub(crate) fn record_outcome(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Acknowledged => &self.acknowledged,
            Outcome::Skipped => &self.skipped,
            Outcome::RedeliveryRequested => &self.redelivery_requested,
            Outcome::DeadLettered => &self.dead_lettered,
        };
        counter.inc();
    }

    pub(crate) fn record_processed(&self, status: ProcessStatus, count: u64) {
        if count > 0 {
            self.processed_counter(status).inc_by(count);
        }
    }

    pub(crate) fn observe_latency(&self, elapsed: Duration) {
        self.latency.observe(elapsed.as_secs_f64() * 1000.0);
    }

    pub(crate) fn record_decode_error(&self) {
        self.decode_errors.inc();
    }

    pub(crate) fn record_handler_error(&self) {
        self.handler_errors.inc();
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.inc();
    }

    pub(crate) fn record_ack_error(&self) {
        self.ack_errors.inc();
    }
}

impl std::fmt::Debug for WorkerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WorkerStats").field(&self.snapshot()).finish()
    }
}

/// Text of a caught handler panic
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Decode a delivery's wire message into an envelope
pub(crate) fn open(delivery: &Delivery) -> Result<Envelope> {
    let wire = WireMessage::decode(&delivery.data)?;
    let payload = wire.payload_bytes()?;
    let acting_user_id = wire.acting_user().map(str::to_string);
    let info = &delivery.info;

    Ok(Envelope {
        subject: info.subject.clone(),
        payload,
        tenant_id: wire.resource_path,
        acting_user_id,
        delivery_attempt: info.delivery_attempt,
        stream_sequence: info.stream_sequence,
        message_id: info.message_id.clone(),
        published_at: info.published_at,
        trace_id: wire.trace_id,
    })
}

/// Whether a delivery was published longer ago than `limit`
pub(crate) fn is_stale(info: &DeliveryInfo, limit: Option<Duration>) -> bool {
    let (Some(limit), Some(published)) = (limit, info.published_at) else {
        return false;
    };
    (Utc::now() - published)
        .abs()
        .to_std()
        .map(|age| age > limit)
        .unwrap_or(false)
}

/// Sleep unless shutdown is signalled first; returns true on shutdown
pub(crate) async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::context::TenantContext;
    use bytes::Bytes;
    use chrono::DateTime;
    use futures::FutureExt;
    use std::sync::{Arc, Mutex};

    /// How a test delivery was settled
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Settled {
        Ack,
        Nak,
    }

    pub type SettleLog = Arc<Mutex<Vec<(u64, Settled)>>>;

    pub fn stats(subject: &str, queue: &str) -> Arc<WorkerStats> {
        let metrics = SubscriberMetrics::new().unwrap();
        Arc::new(WorkerStats::new(&metrics, subject, queue, "lesson", queue))
    }

    pub fn wire(tenant: &str, payload: &[u8]) -> Bytes {
        WireMessage::new(&TenantContext::new(tenant).with_user("user-1"), payload)
            .encode()
            .unwrap()
    }

    pub fn delivery(
        seq: u64,
        attempt: u64,
        data: Bytes,
        published_at: Option<DateTime<Utc>>,
        log: &SettleLog,
    ) -> Delivery {
        let ack_log = log.clone();
        let nak_log = log.clone();
        Delivery::new(
            DeliveryInfo {
                subject: "Lesson.Created".to_string(),
                delivery_attempt: attempt,
                stream_sequence: seq,
                message_id: Some(format!("m-{}", seq)),
                published_at,
            },
            data,
            move || {
                async move {
                    ack_log.lock().unwrap().push((seq, Settled::Ack));
                    Ok(())
                }
                .boxed()
            },
            move || {
                async move {
                    nak_log.lock().unwrap().push((seq, Settled::Nak));
                    Ok(())
                }
                .boxed()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_open_envelope() {
        let log: SettleLog = Arc::new(Mutex::new(Vec::new()));
        let delivery = delivery(3, 2, wire("tenant-a", b"{\"id\":1}"), None, &log);
        let envelope = open(&delivery).unwrap();

        assert_eq!(envelope.tenant_id, "tenant-a");
        assert_eq!(envelope.acting_user_id.as_deref(), Some("user-1"));
        assert_eq!(envelope.payload.as_ref(), b"{\"id\":1}");
        assert_eq!(envelope.delivery_attempt, 2);
        assert_eq!(envelope.stream_sequence, 3);
    }

    #[test]
    fn test_open_rejects_garbage() {
        let log: SettleLog = Arc::new(Mutex::new(Vec::new()));
        let delivery = delivery(1, 1, bytes::Bytes::from_static(b"\x00\x01"), None, &log);
        assert!(open(&delivery).is_err());
    }

    #[test]
    fn test_is_stale() {
        let log: SettleLog = Arc::new(Mutex::new(Vec::new()));
        let old = delivery(
            1,
            1,
            bytes::Bytes::new(),
            Some(Utc::now() - chrono::Duration::minutes(10)),
            &log,
        );
        assert!(is_stale(&old.info, Some(Duration::from_secs(60))));
        assert!(!is_stale(&old.info, Some(Duration::from_secs(3600))));
        assert!(!is_stale(&old.info, None));

        let unknown = delivery(2, 1, bytes::Bytes::new(), None, &log);
        assert!(!is_stale(&unknown.info, Some(Duration::from_secs(1))));
    }

    #[test]
    fn test_stats_snapshot_reads_registry() {
        let metrics = SubscriberMetrics::new().unwrap();
        let stats = WorkerStats::new(&metrics, "Lesson.*", "queue-lesson", "lesson", "durable-lesson");
        stats.record_received(2);
        stats.record_outcome(Outcome::Acknowledged);
        stats.record_outcome(Outcome::DeadLettered);
        stats.record_handler_error();
        stats.record_processed(ProcessStatus::Ok, 1);
        stats.observe_latency(Duration::from_millis(30));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.acknowledged, 1);
        assert_eq!(snapshot.dead_lettered, 1);
        assert_eq!(snapshot.handler_errors, 1);
        assert_eq!(snapshot.skipped, 0);
        assert_eq!(snapshot.latency_samples, 1);

        assert_eq!(metrics.processed_count("Lesson.*", "queue-lesson", ProcessStatus::Ok), 1);
        assert_eq!(metrics.latency_samples("Lesson.*", "queue-lesson"), 1);
        let text = metrics.render().unwrap();
        assert!(text.contains("durable=\"durable-lesson\""));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
