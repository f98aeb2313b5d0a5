//! In-memory broker provider
//!
//! Single-process broker with JetStream semantics: streams capture
//! subjects, durable consumers (shared by queue-group members) get explicit
//! acks, nak'd or expired deliveries are redelivered up to `max_deliver`,
//! interest streams drop messages once every consumer is done with them.
//! Used by the test suites and for local development without a NATS server.

mod consumer;
mod state;

pub use consumer::{MemoryDeliveryStream, MemoryPullConsumer};
pub use state::{ConsumerSnapshot, DEFAULT_DUPLICATE_WINDOW, DEFAULT_MAX_DEAD_LETTERS};

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use self::consumer::Binding;
use self::state::{BrokerState, Upsert};
use crate::error::{EventError, Result};
use crate::provider::{
    BrokerProvider, ConsumerUpdatePolicy, DeliveryStream, ProviderInfo, PublishFuture,
    PullConsumer,
};
use crate::topology::StreamDefinition;
use crate::types::ConsumerDefinition;

/// In-memory provider configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryConfig {
    /// Per-stream message cap, oldest dropped first
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_messages_per_stream: Option<usize>,

    /// Behaviour when a durable is redeclared with a different config
    pub consumer_update_policy: ConsumerUpdatePolicy,

    /// Publish de-duplication window in seconds
    pub duplicate_window_secs: u64,

    /// Dead-lettered sequences remembered per consumer
    pub max_dead_letters_per_consumer: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_messages_per_stream: None,
            consumer_update_policy: ConsumerUpdatePolicy::default(),
            duplicate_window_secs: DEFAULT_DUPLICATE_WINDOW.as_secs(),
            max_dead_letters_per_consumer: DEFAULT_MAX_DEAD_LETTERS,
        }
    }
}

impl MemoryConfig {
    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.duplicate_window_secs)
    }
}

/// In-memory broker provider
#[derive(Clone)]
pub struct MemoryProvider {
    state: Arc<Mutex<BrokerState>>,
    available: Arc<AtomicBool>,
    config: MemoryConfig,
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryProvider {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::new(
                config.duplicate_window(),
                config.max_dead_letters_per_consumer,
            ))),
            available: Arc::new(AtomicBool::new(true)),
            config,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Simulate the broker connection going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of a durable consumer
    pub async fn consumer(&self, stream: &str, durable: &str) -> Option<ConsumerSnapshot> {
        self.state.lock().await.snapshot(stream, durable)
    }

    /// Number of retained messages in a stream
    pub async fn stream_len(&self, stream: &str) -> Option<usize> {
        self.state.lock().await.stream_len(stream)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EventError::BrokerUnavailable(
                "memory broker is unavailable".to_string(),
            ))
        }
    }

    async fn bind(&self, filter: &str, consumer: &ConsumerDefinition) -> Result<Binding> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if state.is_closed() {
            return Err(EventError::Connection("memory broker is closed".to_string()));
        }
        let (generation, notify, outcome) =
            state.bind(filter, consumer, self.config.consumer_update_policy)?;

        match outcome {
            Upsert::Recreated => tracing::warn!(
                durable = %consumer.durable_name,
                stream = %consumer.stream,
                "Consumer config changed, recreated"
            ),
            Upsert::Unchanged => tracing::debug!(
                durable = %consumer.durable_name,
                "Rebound existing consumer"
            ),
            Upsert::Created | Upsert::Updated => tracing::debug!(
                durable = %consumer.durable_name,
                filter = %filter,
                "Consumer created"
            ),
        }

        Ok(Binding {
            state: self.state.clone(),
            available: self.available.clone(),
            key: (consumer.stream.clone(), consumer.durable_name.clone()),
            generation,
            notify,
        })
    }
}

#[async_trait]
impl BrokerProvider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_connected(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        subject: &str,
        message_id: &str,
        payload: Bytes,
    ) -> Result<PublishFuture> {
        self.ensure_available()?;
        let mut state = self.state.lock().await;
        if state.is_closed() {
            return Err(EventError::Connection("memory broker is closed".to_string()));
        }
        let result = state.publish(
            subject,
            message_id,
            payload,
            Instant::now(),
            self.config.max_messages_per_stream,
        );
        Ok(futures::future::ready(result).boxed())
    }

    async fn upsert_stream(&self, stream: &StreamDefinition) -> Result<()> {
        self.ensure_available()?;
        stream.validate()?;
        let outcome = self.state.lock().await.upsert_stream(stream);
        match outcome {
            Upsert::Recreated => tracing::warn!(
                stream = %stream.name,
                "Stream retention changed, recreated"
            ),
            _ => tracing::debug!(stream = %stream.name, ?outcome, "Stream ready"),
        }
        Ok(())
    }

    async fn stream_subjects(&self, stream: &str) -> Result<Option<Vec<String>>> {
        self.ensure_available()?;
        Ok(self.state.lock().await.stream_subjects(stream))
    }

    async fn bind_push(
        &self,
        filter: &str,
        consumer: &ConsumerDefinition,
    ) -> Result<Box<dyn DeliveryStream>> {
        let binding = self.bind(filter, consumer).await?;
        Ok(Box::new(MemoryDeliveryStream::new(binding)))
    }

    async fn bind_pull(
        &self,
        filter: &str,
        consumer: &ConsumerDefinition,
    ) -> Result<Box<dyn PullConsumer>> {
        let binding = self.bind(filter, consumer).await?;
        Ok(Box::new(MemoryPullConsumer::new(binding)))
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let state = self.state.lock().await;
        Ok(ProviderInfo {
            provider: "memory".to_string(),
            streams: state.stream_count(),
            messages: state.message_count(),
            consumers: state.consumer_count(),
        })
    }

    async fn health(&self) -> Result<bool> {
        Ok(self.is_connected() && !self.state.lock().await.is_closed())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.close();
        tracing::debug!("Memory broker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn provider_with_lesson() -> MemoryProvider {
        let provider = MemoryProvider::default();
        provider
            .upsert_stream(&StreamDefinition::new("lesson").subject("Lesson.*"))
            .await
            .unwrap();
        provider
    }

    #[tokio::test]
    async fn test_push_delivery_and_ack() {
        let provider = provider_with_lesson().await;
        let mut stream = provider
            .bind_push("Lesson.*", &ConsumerDefinition::push("d", "lesson"))
            .await
            .unwrap();

        let seq = provider
            .publish("Lesson.Created", "m-1", Bytes::from_static(b"x"))
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(seq, 1);

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.info.subject, "Lesson.Created");
        assert_eq!(delivery.info.message_id.as_deref(), Some("m-1"));
        assert_eq!(delivery.info.delivery_attempt, 1);
        delivery.ack().await.unwrap();

        let snapshot = provider.consumer("lesson", "d").await.unwrap();
        assert_eq!(snapshot.acked, 1);
        assert_eq!(provider.stream_len("lesson").await, Some(0));
    }

    #[tokio::test]
    async fn test_push_waits_for_publish() {
        let provider = provider_with_lesson().await;
        let mut stream = provider
            .bind_push("Lesson.*", &ConsumerDefinition::push("d", "lesson"))
            .await
            .unwrap();

        let publisher = provider.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher
                .publish("Lesson.Updated", "m-1", Bytes::from_static(b"x"))
                .await
                .unwrap()
                .await
                .unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.info.subject, "Lesson.Updated");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_pull_fetch_expires_empty() {
        let provider = provider_with_lesson().await;
        let pull = provider
            .bind_pull("Lesson.*", &ConsumerDefinition::pull("d", "lesson"))
            .await
            .unwrap();

        let batch = pull.fetch(10, Duration::from_millis(20)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_pull_fetch_batch() {
        let provider = provider_with_lesson().await;
        let pull = provider
            .bind_pull("Lesson.*", &ConsumerDefinition::pull("d", "lesson"))
            .await
            .unwrap();

        for i in 0..5 {
            provider
                .publish("Lesson.Created", &format!("m-{}", i), Bytes::from_static(b"x"))
                .await
                .unwrap()
                .await
                .unwrap();
        }

        let batch = pull.fetch(3, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 3);
        let rest = pull.fetch(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn test_unavailable_broker() {
        let provider = provider_with_lesson().await;
        provider.set_available(false);

        let err = provider
            .publish("Lesson.Created", "m-1", Bytes::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EventError::BrokerUnavailable(_)));
        assert!(!provider.health().await.unwrap());

        provider.set_available(true);
        assert!(provider.health().await.unwrap());
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let provider = provider_with_lesson().await;
        let mut stream = provider
            .bind_push("Lesson.*", &ConsumerDefinition::push("d", "lesson"))
            .await
            .unwrap();

        provider.close().await.unwrap();
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_info() {
        let provider = provider_with_lesson().await;
        provider
            .bind_push("Lesson.*", &ConsumerDefinition::push("d", "lesson"))
            .await
            .unwrap();
        let info = provider.info().await.unwrap();
        assert_eq!(info.provider, "memory");
        assert_eq!(info.streams, 1);
        assert_eq!(info.consumers, 1);
    }
}
