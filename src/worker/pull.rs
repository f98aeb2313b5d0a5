//! Pull subscription worker
//!
//! Fetches up to `fetch_size` messages, drops poison messages (acked), and
//! hands the rest to the batch handler in chunks of `batch_size`. A failed
//! chunk stops processing of the fetch; every message not yet acked stays
//! pending and is redelivered by the broker after the ack wait. Pending
//! messages already on their final delivery are reported as dead letters.

use futures::FutureExt;
use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::Instrument;

use super::{open, panic_message, sleep_or_shutdown, Outcome, WorkerStats};
use crate::chunk::chunk_ranges;
use crate::dlq::{DeadLetter, DeadLetterSink};
use crate::error::EventError;
use crate::handler::{BatchHandler, BatchMessage, HandlerError};
use crate::metrics::ProcessStatus;
use crate::provider::{Delivery, PullConsumer};
use crate::types::{
    ConsumerDefinition, ConsumerMode, Envelope, SubscribeOptions, DEFAULT_BATCH_SIZE,
    DEFAULT_FETCH_SIZE,
};

/// Counts for one processed fetch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub received: usize,
    /// Undecodable messages acked and dropped
    pub poison: usize,
    /// Messages acked by the worker after a successful chunk
    pub acknowledged: usize,
    /// Messages left unsettled for broker redelivery
    pub pending: usize,
    /// Pending messages that will not be delivered again
    pub dead_lettered: usize,
}

/// Worker driving one pull consumer
pub struct PullWorker {
    pull: Box<dyn PullConsumer>,
    handler: Arc<dyn BatchHandler>,
    consumer: ConsumerDefinition,
    subject: String,
    options: SubscribeOptions,
    stats: Arc<WorkerStats>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl PullWorker {
    pub fn new(
        pull: Box<dyn PullConsumer>,
        handler: Arc<dyn BatchHandler>,
        consumer: ConsumerDefinition,
        subject: impl Into<String>,
        options: SubscribeOptions,
        stats: Arc<WorkerStats>,
    ) -> Self {
        Self {
            pull,
            handler,
            consumer,
            subject: subject.into(),
            options,
            stats,
            dead_letters: None,
        }
    }

    pub fn with_dead_letters(mut self, sink: Option<Arc<dyn DeadLetterSink>>) -> Self {
        self.dead_letters = sink;
        self
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    fn sizes(&self) -> (usize, usize) {
        match self.consumer.mode {
            ConsumerMode::Pull {
                fetch_size,
                batch_size,
            } => (fetch_size, batch_size),
            ConsumerMode::Push => (DEFAULT_FETCH_SIZE, DEFAULT_BATCH_SIZE),
        }
    }

    /// Fetch and process until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let (fetch_size, _) = self.sizes();
        let durable = self.consumer.durable_name.as_str();
        tracing::info!(
            subject = %self.subject,
            durable = %durable,
            fetch_size,
            "Pull worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let fetched = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                fetched = self.pull.fetch(fetch_size, self.options.fetch_timeout()) => fetched,
            };

            match fetched {
                Ok(deliveries) if deliveries.is_empty() => {
                    if sleep_or_shutdown(self.options.idle_backoff(), &mut shutdown).await {
                        break;
                    }
                }
                Ok(deliveries) => {
                    self.process(deliveries).await;
                }
                Err(e) => {
                    tracing::error!(
                        subject = %self.subject,
                        durable = %durable,
                        error = %e,
                        "Failed to fetch messages"
                    );
                    if sleep_or_shutdown(self.options.idle_backoff(), &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(durable = %durable, "Pull worker stopped");
    }

    /// Process one fetched batch
    pub async fn process(&self, deliveries: Vec<Delivery>) -> FetchReport {
        let durable = self.consumer.durable_name.as_str();
        let mut report = FetchReport {
            received: deliveries.len(),
            ..Default::default()
        };
        self.stats.record_received(deliveries.len() as u64);

        let mut batch = Vec::with_capacity(deliveries.len());
        for delivery in deliveries {
            match open(&delivery) {
                Ok(envelope) => batch.push(BatchMessage::new(envelope, delivery)),
                Err(e) => {
                    tracing::error!(
                        subject = %delivery.info.subject,
                        durable = %durable,
                        sequence = delivery.info.stream_sequence,
                        attempt = delivery.info.delivery_attempt,
                        error = %e,
                        "Undecodable message, acknowledging"
                    );
                    self.stats.record_decode_error();
                    self.stats.record_processed(ProcessStatus::DecodeError, 1);
                    if let Err(e) = delivery.ack().await {
                        self.stats.record_ack_error();
                        tracing::error!(durable = %durable, error = %e, "Failed to ack message");
                    }
                    self.stats.record_outcome(Outcome::Acknowledged);
                    report.poison += 1;
                }
            }
        }

        let (_, batch_size) = self.sizes();
        let ranges = match chunk_ranges::<Infallible>(batch.len(), batch_size) {
            Ok(ranges) => ranges,
            Err(e) => {
                tracing::error!(durable = %durable, error = %e, "Invalid batch size");
                report.pending = batch.len();
                return report;
            }
        };

        let deadline = self.options.deadline();
        for range in ranges {
            let (start, end) = (range.start, range.end);
            let chunk = &mut batch[range];
            let span = tracing::info_span!(
                "handle_batch",
                handler = self.options.span_name.as_deref().unwrap_or(durable),
                subject = %self.subject,
                durable = %durable,
                size = chunk.len(),
            );

            let started = Instant::now();
            let handled = AssertUnwindSafe(self.handler.handle_batch(chunk)).catch_unwind();
            let result = match tokio::time::timeout(deadline, handled).instrument(span).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(
                        subject = %self.subject,
                        durable = %durable,
                        panic = %message,
                        "Batch handler panicked"
                    );
                    Err(HandlerError::retry(format!("batch handler panicked: {}", message)))
                }
                Err(_) => {
                    self.stats.record_timeout();
                    Err(HandlerError::retry(EventError::Timeout(format!(
                        "batch handler exceeded its {:?} deadline",
                        deadline
                    ))))
                }
            };

            if let Err(e) = result {
                self.stats.record_handler_error();
                let unsettled: Vec<Envelope> = batch[start..]
                    .iter()
                    .filter(|m| !m.is_settled())
                    .map(|m| m.envelope().clone())
                    .collect();
                let attempt = unsettled
                    .iter()
                    .map(|envelope| envelope.delivery_attempt)
                    .max()
                    .unwrap_or_default();
                report.pending = unsettled.len();
                self.stats
                    .record_processed(ProcessStatus::HandlerError, unsettled.len() as u64);
                tracing::error!(
                    subject = %self.subject,
                    durable = %durable,
                    pending = unsettled.len(),
                    attempt,
                    error = %e,
                    "Batch handler failed, leaving messages for redelivery"
                );
                report.dead_lettered = self.dead_letter_final(&unsettled, &e).await;
                break;
            }

            let mut acked = 0u64;
            for message in batch[start..end].iter_mut() {
                if message.is_settled() {
                    continue;
                }
                match message.ack().await {
                    Ok(()) => {
                        acked += 1;
                        report.acknowledged += 1;
                        self.stats.record_outcome(Outcome::Acknowledged);
                    }
                    Err(e) => {
                        self.stats.record_ack_error();
                        self.stats.record_processed(ProcessStatus::AckError, 1);
                        tracing::error!(
                            durable = %durable,
                            sequence = message.envelope().stream_sequence,
                            error = %e,
                            "Failed to ack message"
                        );
                    }
                }
            }
            self.stats.record_processed(ProcessStatus::Ok, acked);
            self.stats.observe_latency(started.elapsed());
        }

        tracing::debug!(
            durable = %durable,
            received = report.received,
            acknowledged = report.acknowledged,
            pending = report.pending,
            "Batch processed"
        );
        report
    }

    /// Report pending messages the broker will not deliver again
    async fn dead_letter_final(&self, unsettled: &[Envelope], err: &HandlerError) -> usize {
        let durable = self.consumer.durable_name.as_str();
        let mut count = 0;
        for envelope in unsettled {
            if !self.consumer.is_final_attempt(envelope.delivery_attempt) {
                continue;
            }
            count += 1;
            self.stats.record_outcome(Outcome::DeadLettered);
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
                    .record(DeadLetter::new(envelope, durable, err.to_string()))
                    .await
                {
                    tracing::error!(durable = %durable, error = %e, "Failed to record dead letter");
                }
            }
        }
        count
    }
}
