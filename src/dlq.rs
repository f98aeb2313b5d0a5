//! Dead-letter observation for messages that exhausted their deliveries
//!
//! The broker stops redelivering a message once `max_deliver` is reached;
//! there is no reprocessing path. A `DeadLetterSink` is told about each such
//! message so it can be stored, counted or alerted on.

use crate::error::Result;
use crate::types::Envelope;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A message the broker will no longer redeliver
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub subject: String,
    /// Durable consumer that gave up on the message
    pub durable: String,
    pub stream_sequence: u64,
    pub message_id: Option<String>,
    pub tenant_id: String,
    pub delivery_attempt: u64,
    pub payload: Bytes,
    /// Last handler error
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Dead letter for a delivered envelope
    pub fn new(envelope: &Envelope, durable: &str, reason: impl Into<String>) -> Self {
        Self {
            subject: envelope.subject.clone(),
            durable: durable.to_string(),
            stream_sequence: envelope.stream_sequence,
            message_id: envelope.message_id.clone(),
            tenant_id: envelope.tenant_id.clone(),
            delivery_attempt: envelope.delivery_attempt,
            payload: envelope.payload.clone(),
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Receiver of dead-lettered messages
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Record a dead-lettered message
    async fn record(&self, letter: DeadLetter) -> Result<()>;

    /// Number of messages recorded
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory sink for development and testing
///
/// Keeps at most `max_letters` entries, dropping the oldest.
pub struct MemoryDeadLetterSink {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    max_letters: usize,
}

impl MemoryDeadLetterSink {
    pub fn new(max_letters: usize) -> Self {
        Self {
            letters: Arc::new(RwLock::new(Vec::new())),
            max_letters,
        }
    }
}

impl Default for MemoryDeadLetterSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<()> {
        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.max_letters > 0 && letters.len() > self.max_letters {
            let drain_count = letters.len() - self.max_letters;
            letters.drain(..drain_count);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}
