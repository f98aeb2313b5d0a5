//! Broker provider trait, the seam between the bus and a concrete broker
//!
//! Providers (NATS JetStream, in-memory) implement `BrokerProvider` to
//! upsert streams, bind durable consumers and publish with a dedup id.
//! Everything above this trait is broker-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;
use crate::topology::StreamDefinition;
use crate::types::ConsumerDefinition;

pub mod memory;
pub mod nats;

/// Future resolving to the stream sequence once the broker acks a publish
pub type PublishFuture = BoxFuture<'static, Result<u64>>;

/// Settlement callback of a delivery
pub type SettleFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// What to do when a durable exists with a different configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConsumerUpdatePolicy {
    /// Fail the bind with a binding error
    #[default]
    Reject,
    /// Delete the existing consumer and create the declared one
    Recreate,
}

/// Core trait for broker backends
#[async_trait]
pub trait BrokerProvider: Send + Sync {
    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;

    /// Whether the broker connection is currently up
    fn is_connected(&self) -> bool;

    /// Enqueue a message with the given dedup id
    ///
    /// Returns once the message is handed to the connection. The returned
    /// future resolves when the broker acknowledges it.
    async fn publish(&self, subject: &str, message_id: &str, payload: Bytes)
        -> Result<PublishFuture>;

    /// Create or reconcile a stream
    async fn upsert_stream(&self, stream: &StreamDefinition) -> Result<()>;

    /// Subject patterns of a stream known to the broker, `None` if missing
    async fn stream_subjects(&self, stream: &str) -> Result<Option<Vec<String>>>;

    /// Upsert a push consumer and start receiving its deliveries
    async fn bind_push(
        &self,
        filter: &str,
        consumer: &ConsumerDefinition,
    ) -> Result<Box<dyn DeliveryStream>>;

    /// Upsert a pull consumer and return a fetch handle
    async fn bind_pull(
        &self,
        filter: &str,
        consumer: &ConsumerDefinition,
    ) -> Result<Box<dyn PullConsumer>>;

    /// Provider status
    async fn info(&self) -> Result<ProviderInfo>;

    /// Health check, true if the provider is connected and operational
    async fn health(&self) -> Result<bool> {
        Ok(self.is_connected())
    }

    /// Release the broker connection
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Stream of pushed deliveries for one bound consumer
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery, `None` once the subscription is closed
    async fn next(&mut self) -> Result<Option<Delivery>>;
}

/// Fetch handle of a bound pull consumer
#[async_trait]
pub trait PullConsumer: Send + Sync {
    /// Fetch up to `max` deliveries, waiting at most `expires`
    async fn fetch(&self, max: usize, expires: Duration) -> Result<Vec<Delivery>>;
}

/// Broker metadata of a delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub subject: String,
    /// 1-based delivery count reported by the broker
    pub delivery_attempt: u64,
    pub stream_sequence: u64,
    pub message_id: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
}

/// A message pending acknowledgement
pub struct Delivery {
    /// Broker metadata
    pub info: DeliveryInfo,

    /// Raw broker payload (the wire message)
    pub data: Bytes,

    ack_fn: SettleFn,
    nak_fn: SettleFn,
}

impl Delivery {
    /// Create a delivery with ack/nak callbacks
    pub fn new(
        info: DeliveryInfo,
        data: Bytes,
        ack_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
        nak_fn: impl FnOnce() -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            info,
            data,
            ack_fn: Box::new(ack_fn),
            nak_fn: Box::new(nak_fn),
        }
    }

    /// Acknowledge successful processing
    pub async fn ack(self) -> Result<()> {
        (self.ack_fn)().await
    }

    /// Negative-acknowledge (request redelivery after the ack wait)
    pub async fn nak(self) -> Result<()> {
        (self.nak_fn)().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("info", &self.info)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Provider status information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderInfo {
    /// Provider name
    pub provider: String,
    /// Number of streams known to the provider
    pub streams: usize,
    /// Total messages stored
    pub messages: u64,
    /// Number of durable consumers
    pub consumers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_delivery_settles_once() {
        let acked = Arc::new(AtomicBool::new(false));
        let flag = acked.clone();
        let delivery = Delivery::new(
            DeliveryInfo {
                subject: "Lesson.Created".to_string(),
                delivery_attempt: 1,
                stream_sequence: 4,
                message_id: Some("m-1".to_string()),
                published_at: None,
            },
            Bytes::from_static(b"{}"),
            move || {
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            },
            || async { Ok(()) }.boxed(),
        );

        assert_eq!(delivery.info.stream_sequence, 4);
        delivery.ack().await.unwrap();
        assert!(acked.load(Ordering::SeqCst));
    }

    #[test]
    fn test_update_policy_default() {
        assert_eq!(ConsumerUpdatePolicy::default(), ConsumerUpdatePolicy::Reject);
        let json = serde_json::to_string(&ConsumerUpdatePolicy::Recreate).unwrap();
        assert_eq!(json, "\"recreate\"");
    }
}
