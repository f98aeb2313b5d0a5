//! NATS provider configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::provider::ConsumerUpdatePolicy;
use crate::topology::StreamDefinition;
use crate::types::ConsumerDefinition;

/// NATS JetStream provider configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// NATS server URL (e.g., "nats://127.0.0.1:4222")
    pub url: String,

    /// Connection name reported to the server
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Username for user/password auth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password for user/password auth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Authentication token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Connect timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Maximum reconnect attempts (None = unlimited)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnects: Option<usize>,

    /// Delay between reconnect attempts in milliseconds
    pub reconnect_wait_ms: u64,

    /// Single-node development cluster
    ///
    /// Streams get one replica and consumers a short ack wait.
    pub local: bool,

    /// Ack wait applied to every consumer in local mode, in seconds
    pub local_ack_wait_secs: u64,

    /// Behaviour when a durable is redeclared with a different config
    pub consumer_update_policy: ConsumerUpdatePolicy,

    /// Consumer upsert attempts before giving up
    pub upsert_attempts: u32,

    /// Pause between consumer upsert attempts in milliseconds
    pub upsert_retry_ms: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            name: None,
            user: None,
            password: None,
            token: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            max_reconnects: Some(60),
            reconnect_wait_ms: 2_000,
            local: false,
            local_ack_wait_secs: 4,
            consumer_update_policy: ConsumerUpdatePolicy::Reject,
            upsert_attempts: 5,
            upsert_retry_ms: 1_000,
        }
    }
}

impl NatsConfig {
    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms)
    }

    pub fn upsert_retry(&self) -> Duration {
        Duration::from_millis(self.upsert_retry_ms)
    }

    /// Stream declaration as provisioned in this environment
    pub fn effective_stream(&self, stream: &StreamDefinition) -> StreamDefinition {
        if self.local {
            stream.clone().replicas(1)
        } else {
            stream.clone()
        }
    }

    /// Consumer declaration as provisioned in this environment
    pub fn effective_consumer(&self, consumer: &ConsumerDefinition) -> ConsumerDefinition {
        if self.local {
            consumer
                .clone()
                .ack_wait(Duration::from_secs(self.local_ack_wait_secs))
        } else {
            consumer.clone()
        }
    }
}
