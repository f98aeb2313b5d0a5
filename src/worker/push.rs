//! Push subscription worker
//!
//! Each delivered message moves `Received → Processing → {Acknowledged |
//! RedeliveryRequested | DeadLettered}`. Undecodable messages are poison and
//! acked immediately. The handler runs under the subscription deadline; a
//! deadline overrun or a panic counts as a retryable failure.

use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

use super::{is_stale, open, panic_message, sleep_or_shutdown, Outcome, WorkerStats};
use crate::context::ProcessingContext;
use crate::dlq::{DeadLetter, DeadLetterSink};
use crate::error::EventError;
use crate::handler::{HandlerError, MessageHandler};
use crate::metrics::ProcessStatus;
use crate::provider::{Delivery, DeliveryStream};
use crate::types::{ConsumerDefinition, SubscribeOptions};

/// Worker draining one push consumer
pub struct PushWorker {
    stream: Box<dyn DeliveryStream>,
    processor: Processor,
}

/// Settles deliveries; shared by reference while the stream is polled
struct Processor {
    handler: Arc<dyn MessageHandler>,
    consumer: ConsumerDefinition,
    subject: String,
    options: SubscribeOptions,
    stats: Arc<WorkerStats>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl PushWorker {
    pub fn new(
        stream: Box<dyn DeliveryStream>,
        handler: Arc<dyn MessageHandler>,
        consumer: ConsumerDefinition,
        subject: impl Into<String>,
        options: SubscribeOptions,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            stream,
            processor: Processor {
                handler,
                consumer,
                subject: subject.into(),
                options,
                stats,
                dead_letters: None,
            },
        }
    }

    pub fn with_dead_letters(mut self, sink: Option<Arc<dyn DeadLetterSink>>) -> Self {
        self.processor.dead_letters = sink;
        self
    }

    /// Process deliveries until shutdown or the stream closes
    ///
    /// A message already being processed when shutdown is signalled is
    /// finished and settled before the worker exits.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let PushWorker {
            mut stream,
            processor,
        } = self;
        let durable = processor.consumer.durable_name.as_str();
        tracing::info!(
            subject = %processor.subject,
            durable = %durable,
            queue = ?processor.consumer.queue_group,
            "Push worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = stream.next() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    processor.process(delivery).await;
                }
                Ok(None) => {
                    tracing::info!(durable = %durable, "Delivery stream closed");
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        subject = %processor.subject,
                        durable = %durable,
                        error = %e,
                        "Failed to receive message"
                    );
                    if sleep_or_shutdown(processor.options.idle_backoff(), &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(durable = %durable, "Push worker stopped");
    }

    /// Handle and settle one delivery
    pub async fn process(&self, delivery: Delivery) -> Outcome {
        self.processor.process(delivery).await
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.processor.stats
    }
}

impl Processor {
    async fn process(&self, delivery: Delivery) -> Outcome {
        self.stats.record_received(1);
        let durable = self.consumer.durable_name.as_str();
        let info = delivery.info.clone();

        if is_stale(&info, self.options.skip_older_than()) {
            tracing::warn!(
                subject = %info.subject,
                durable = %durable,
                sequence = info.stream_sequence,
                published_at = ?info.published_at,
                "Skipping message older than allowed age"
            );
            let status = self.ack(delivery).await;
            self.stats.record_processed(status, 1);
            return self.finish(Outcome::Skipped);
        }

        let envelope = match open(&delivery) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::error!(
                    subject = %info.subject,
                    durable = %durable,
                    sequence = info.stream_sequence,
                    attempt = info.delivery_attempt,
                    message_id = ?info.message_id,
                    error = %e,
                    "Undecodable message, acknowledging"
                );
                self.stats.record_decode_error();
                self.stats.record_processed(ProcessStatus::DecodeError, 1);
                self.ack(delivery).await;
                return self.finish(Outcome::Acknowledged);
            }
        };

        if envelope.tenant_id.is_empty() {
            tracing::debug!(subject = %envelope.subject, durable = %durable, "Message without tenant");
        }

        let deadline = self.options.deadline();
        let ctx = ProcessingContext::from_envelope(&envelope, durable, deadline);
        let span = tracing::info_span!(
            "handle_message",
            handler = self.options.span_name.as_deref().unwrap_or(durable),
            subject = %envelope.subject,
            durable = %durable,
            attempt = envelope.delivery_attempt,
            trace_id = envelope.trace_id.as_deref().unwrap_or_default(),
        );

        let started = Instant::now();
        let handled = AssertUnwindSafe(self.handler.handle(&ctx, &envelope.payload)).catch_unwind();
        let result = match tokio::time::timeout(deadline, handled).instrument(span).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    subject = %envelope.subject,
                    durable = %durable,
                    sequence = envelope.stream_sequence,
                    attempt = envelope.delivery_attempt,
                    panic = %message,
                    "Handler panicked"
                );
                Err(HandlerError::retry(format!("handler panicked: {}", message)))
            }
            Err(_) => {
                self.stats.record_timeout();
                Err(HandlerError::retry(EventError::Timeout(format!(
                    "handler exceeded its {:?} deadline",
                    deadline
                ))))
            }
        };

        let err = match result {
            Ok(()) => {
                let status = self.ack(delivery).await;
                if status == ProcessStatus::Ok {
                    self.stats.observe_latency(started.elapsed());
                }
                self.stats.record_processed(status, 1);
                return self.finish(Outcome::Acknowledged);
            }
            Err(err) => err,
        };

        self.stats.record_handler_error();
        self.stats.record_processed(ProcessStatus::HandlerError, 1);
        if !err.should_redeliver() {
            tracing::warn!(
                subject = %envelope.subject,
                durable = %durable,
                sequence = envelope.stream_sequence,
                attempt = envelope.delivery_attempt,
                error = %err,
                "Handler failed permanently, acknowledging"
            );
            self.ack(delivery).await;
            return self.finish(Outcome::Acknowledged);
        }

        self.nak(delivery).await;
        if !self.consumer.is_final_attempt(envelope.delivery_attempt) {
            tracing::error!(
                subject = %envelope.subject,
                durable = %durable,
                sequence = envelope.stream_sequence,
                attempt = envelope.delivery_attempt,
                error = %err,
                "Handler failed, redelivery requested"
            );
            return self.finish(Outcome::RedeliveryRequested);
        }

        tracing::warn!(
            subject = %envelope.subject,
            durable = %durable,
            sequence = envelope.stream_sequence,
            attempt = envelope.delivery_attempt,
            error = %err,
            "Max deliveries reached, message dead-lettered"
        );
        if let Some(sink) = &self.dead_letters {
            if let Err(e) = sink
                .record(DeadLetter::new(&envelope, durable, err.to_string()))
                .await
            {
                tracing::error!(durable = %durable, error = %e, "Failed to record dead letter");
            }
        }
        self.finish(Outcome::DeadLettered)
    }

    fn finish(&self, outcome: Outcome) -> Outcome {
        self.stats.record_outcome(outcome);
        tracing::debug!(
            subject = %self.subject,
            durable = %self.consumer.durable_name,
            ?outcome,
            "Message processed"
        );
        outcome
    }

    async fn ack(&self, delivery: Delivery) -> ProcessStatus {
        let sequence = delivery.info.stream_sequence;
        match delivery.ack().await {
            Ok(()) => ProcessStatus::Ok,
            Err(e) => {
                self.stats.record_ack_error();
                tracing::error!(
                    durable = %self.consumer.durable_name,
                    sequence,
                    error = %e,
                    "Failed to ack message"
                );
                ProcessStatus::AckError
            }
        }
    }

    async fn nak(&self, delivery: Delivery) {
        let sequence = delivery.info.stream_sequence;
        if let Err(e) = delivery.nak().await {
            self.stats.record_ack_error();
            tracing::error!(
                durable = %self.consumer.durable_name,
                sequence,
                error = %e,
                "Failed to nak message"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::MemoryDeadLetterSink;
    use crate::error::Result;
    use crate::handler::handler_fn;
    use crate::provider::Delivery;
    use crate::worker::test_support::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Delivery stream that never yields
    struct Idle;

    #[async_trait]
    impl DeliveryStream for Idle {
        async fn next(&mut self) -> Result<Option<Delivery>> {
            futures::future::pending().await
        }
    }

    fn worker(handler: Arc<dyn MessageHandler>, options: SubscribeOptions) -> PushWorker {
        PushWorker::new(
            Box::new(Idle),
            handler,
            ConsumerDefinition::push("durable-lesson-event", "lesson").max_deliver(3),
            "Lesson.*",
            options,
            stats("Lesson.*", "queue-lesson-event"),
        )
    }

    fn ok_handler() -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(|_ctx, _payload: Bytes| async { Ok(()) }))
    }

    fn failing(err: fn() -> HandlerError) -> Arc<dyn MessageHandler> {
        Arc::new(handler_fn(move |_ctx, _payload: Bytes| async move { Err(err()) }))
    }

    fn new_log() -> SettleLog {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_success_acks() {
        let log = new_log();
        let worker = worker(ok_handler(), SubscribeOptions::default());
        let outcome = worker
            .process(delivery(1, 1, wire("tenant-a", b"{}"), None, &log))
            .await;

        assert_eq!(outcome, Outcome::Acknowledged);
        assert_eq!(*log.lock().unwrap(), vec![(1, Settled::Ack)]);
        assert_eq!(worker.stats().snapshot().acknowledged, 1);
        assert_eq!(worker.stats().processed(ProcessStatus::Ok), 1);
        assert_eq!(worker.stats().snapshot().latency_samples, 1);
    }

    #[tokio::test]
    async fn test_ack_failure_counted() {
        let worker = worker(ok_handler(), SubscribeOptions::default());
        let failing_ack = Delivery::new(
            crate::provider::DeliveryInfo {
                subject: "Lesson.Created".to_string(),
                delivery_attempt: 1,
                stream_sequence: 4,
                message_id: None,
                published_at: None,
            },
            wire("tenant-a", b"{}"),
            || async { Err(EventError::Ack("connection reset".to_string())) }.boxed(),
            || async { Ok(()) }.boxed(),
        );

        worker.process(failing_ack).await;

        assert_eq!(worker.stats().processed(ProcessStatus::AckError), 1);
        assert_eq!(worker.stats().processed(ProcessStatus::Ok), 0);
        assert_eq!(worker.stats().snapshot().ack_errors, 1);
        assert_eq!(worker.stats().snapshot().latency_samples, 0);
    }

    #[tokio::test]
    async fn test_panicking_handler_requests_redelivery() {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler_fn(|_ctx, payload: Bytes| async move {
            if payload.is_empty() {
                panic!("empty payload");
            }
            Ok(())
        }));
        let log = new_log();
        let worker = worker(handler, SubscribeOptions::default());

        let outcome = worker
            .process(delivery(1, 1, wire("tenant-a", b""), None, &log))
            .await;
        assert_eq!(outcome, Outcome::RedeliveryRequested);

        // The worker keeps handling later messages
        let outcome = worker
            .process(delivery(2, 1, wire("tenant-a", b"{}"), None, &log))
            .await;
        assert_eq!(outcome, Outcome::Acknowledged);
        assert_eq!(*log.lock().unwrap(), vec![(1, Settled::Nak), (2, Settled::Ack)]);
        assert_eq!(worker.stats().processed(ProcessStatus::HandlerError), 1);
    }

    #[tokio::test]
    async fn test_poison_acked_without_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(handler_fn(move |_ctx, _payload: Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));
        let log = new_log();
        let worker = worker(handler, SubscribeOptions::default());

        let outcome = worker
            .process(delivery(1, 1, Bytes::from_static(b"not a wire message"), None, &log))
            .await;

        assert_eq!(outcome, Outcome::Acknowledged);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock().unwrap(), vec![(1, Settled::Ack)]);
        assert_eq!(worker.stats().snapshot().decode_errors, 1);
        assert_eq!(worker.stats().processed(ProcessStatus::DecodeError), 1);
    }

    #[tokio::test]
    async fn test_retryable_error_naks() {
        let log = new_log();
        let worker = worker(failing(|| HandlerError::retry("db down")), SubscribeOptions::default());
        let outcome = worker
            .process(delivery(1, 1, wire("tenant-a", b"{}"), None, &log))
            .await;

        assert_eq!(outcome, Outcome::RedeliveryRequested);
        assert_eq!(*log.lock().unwrap(), vec![(1, Settled::Nak)]);
    }

    #[tokio::test]
    async fn test_permanent_error_acks() {
        let log = new_log();
        let worker = worker(failing(|| HandlerError::skip("bad data")), SubscribeOptions::default());
        let outcome = worker
            .process(delivery(1, 1, wire("tenant-a", b"{}"), None, &log))
            .await;

        assert_eq!(outcome, Outcome::Acknowledged);
        assert_eq!(*log.lock().unwrap(), vec![(1, Settled::Ack)]);
        assert_eq!(worker.stats().snapshot().handler_errors, 1);
    }

    #[tokio::test]
    async fn test_final_attempt_dead_letters() {
        let log = new_log();
        let sink = Arc::new(MemoryDeadLetterSink::default());
        let worker = worker(failing(|| HandlerError::retry("db down")), SubscribeOptions::default())
            .with_dead_letters(Some(sink.clone()));

        let outcome = worker
            .process(delivery(9, 3, wire("tenant-a", b"{}"), None, &log))
            .await;

        assert_eq!(outcome, Outcome::DeadLettered);
        let letters = sink.list(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].stream_sequence, 9);
        assert_eq!(letters[0].tenant_id, "tenant-a");
        assert_eq!(letters[0].reason, "db down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded_requests_redelivery() {
        let handler: Arc<dyn MessageHandler> = Arc::new(handler_fn(|_ctx, _payload: Bytes| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }));
        let log = new_log();
        let worker = worker(
            handler,
            SubscribeOptions::default().with_deadline(Duration::from_secs(5)),
        );

        let outcome = worker
            .process(delivery(1, 1, wire("tenant-a", b"{}"), None, &log))
            .await;

        assert_eq!(outcome, Outcome::RedeliveryRequested);
        assert_eq!(*log.lock().unwrap(), vec![(1, Settled::Nak)]);
        assert_eq!(worker.stats().snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn test_old_message_skipped() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(handler_fn(move |_ctx, _payload: Bytes| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        }));
        let log = new_log();
        let worker = worker(
            handler,
            SubscribeOptions::default().with_skip_older_than(Duration::from_secs(60)),
        );

        let published = Some(Utc::now() - chrono::Duration::minutes(5));
        let outcome = worker
            .process(delivery(1, 1, wire("tenant-a", b"{}"), published, &log))
            .await;

        assert_eq!(outcome, Outcome::Skipped);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(*log.lock().unwrap(), vec![(1, Settled::Ack)]);
    }

    #[tokio::test]
    async fn test_handler_sees_tenant() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(handler_fn(move |ctx: ProcessingContext, _payload: Bytes| {
            use crate::context::TenantScoped;
            sink.lock()
                .unwrap()
                .push(ctx.tenant().resource_path().to_string());
            async { Ok(()) }
        }));
        let log = new_log();
        let worker = worker(handler, SubscribeOptions::default());

        worker.process(delivery(1, 1, wire("tenant-a", b"{}"), None, &log)).await;
        worker.process(delivery(2, 1, wire("tenant-b", b"{}"), None, &log)).await;

        assert_eq!(*seen.lock().unwrap(), vec!["tenant-a", "tenant-b"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let worker = worker(ok_handler(), SubscribeOptions::default());
        let handle = tokio::spawn(worker.run(rx));

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
