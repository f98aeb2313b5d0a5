//! NATS JetStream broker provider
//!
//! Implements `BrokerProvider` on top of JetStream streams and durable
//! consumers with explicit acks.

mod client;
mod config;
mod subscriber;

pub use client::NatsClient;
pub use config::NatsConfig;
pub use subscriber::{NatsDeliveryStream, NatsPullConsumer};

use crate::error::Result;
use crate::provider::{BrokerProvider, DeliveryStream, ProviderInfo, PublishFuture, PullConsumer};
use crate::topology::StreamDefinition;
use crate::types::ConsumerDefinition;
use async_trait::async_trait;
use bytes::Bytes;

/// NATS JetStream broker provider
///
/// Wraps `NatsClient` and implements the `BrokerProvider` trait.
pub struct NatsProvider {
    client: NatsClient,
}

impl NatsProvider {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self { client })
    }

    /// Get the underlying NATS client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl BrokerProvider for NatsProvider {
    fn name(&self) -> &str {
        "nats"
    }

    fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn publish(
        &self,
        subject: &str,
        message_id: &str,
        payload: Bytes,
    ) -> Result<PublishFuture> {
        self.client.publish(subject, message_id, payload).await
    }

    async fn upsert_stream(&self, stream: &StreamDefinition) -> Result<()> {
        self.client.upsert_stream(stream).await
    }

    async fn stream_subjects(&self, stream: &str) -> Result<Option<Vec<String>>> {
        self.client.stream_subjects(stream).await
    }

    async fn bind_push(
        &self,
        filter: &str,
        consumer: &ConsumerDefinition,
    ) -> Result<Box<dyn DeliveryStream>> {
        let stream = self.client.bind_push(filter, consumer).await?;
        Ok(Box::new(stream))
    }

    async fn bind_pull(
        &self,
        filter: &str,
        consumer: &ConsumerDefinition,
    ) -> Result<Box<dyn PullConsumer>> {
        let consumer = self.client.bind_pull(filter, consumer).await?;
        Ok(Box::new(consumer))
    }

    async fn info(&self) -> Result<ProviderInfo> {
        let (streams, messages, consumers) = self.client.totals().await?;
        Ok(ProviderInfo {
            provider: "nats".to_string(),
            streams,
            messages,
            consumers,
        })
    }

    async fn close(&self) -> Result<()> {
        self.client.flush().await?;
        tracing::info!("NATS connection flushed");
        Ok(())
    }
}
