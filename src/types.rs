//! Core consumer and delivery types
//!
//! All serialized types use camelCase JSON for config-file compatibility.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EventError, Result};

/// Default number of delivery attempts before the broker gives up
pub const DEFAULT_MAX_DELIVER: i64 = 10;

/// Default ack wait
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Default handler deadline
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(360);

/// Default pull fetch size
pub const DEFAULT_FETCH_SIZE: usize = 500;

/// Default pull batch size handed to a batch handler
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Where a new consumer starts reading from its stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliverPolicy {
    /// Only messages published after the consumer is created
    #[default]
    New,
    /// Replay from the start of the stream
    All,
}

/// Delivery mode of a consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ConsumerMode {
    /// Messages are pushed to the worker one at a time
    #[default]
    Push,
    /// The worker fetches batches
    #[serde(rename_all = "camelCase")]
    Pull { fetch_size: usize, batch_size: usize },
}

impl ConsumerMode {
    /// Pull mode with default fetch and batch sizes
    pub fn pull() -> Self {
        Self::Pull {
            fetch_size: DEFAULT_FETCH_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn is_pull(&self) -> bool {
        matches!(self, Self::Pull { .. })
    }
}

/// Declaration of a durable consumer bound to a stream
///
/// The `(durable_name, queue_group, deliver_subject)` triple identifies the
/// consumer across deployments. Changing any of them makes the broker treat
/// it as a new consumer starting from `deliver_policy`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDefinition {
    /// Durable consumer name (no dots)
    pub durable_name: String,

    /// Name of the stream the consumer reads from
    pub stream: String,

    /// Push delivery subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver_subject: Option<String>,

    /// Queue group shared by competing workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_group: Option<String>,

    /// Maximum delivery attempts (`-1` for unlimited)
    #[serde(default = "default_max_deliver")]
    pub max_deliver: i64,

    /// How long the broker waits for an ack before redelivering
    #[serde(default = "default_ack_wait_ms")]
    pub ack_wait_ms: u64,

    /// Where to start consuming from
    #[serde(default)]
    pub deliver_policy: DeliverPolicy,

    /// Push or pull delivery
    #[serde(default)]
    pub mode: ConsumerMode,
}

fn default_max_deliver() -> i64 {
    DEFAULT_MAX_DELIVER
}

fn default_ack_wait_ms() -> u64 {
    DEFAULT_ACK_WAIT.as_millis() as u64
}

impl ConsumerDefinition {
    /// Push consumer with default redelivery settings
    pub fn push(durable_name: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            durable_name: durable_name.into(),
            stream: stream.into(),
            deliver_subject: None,
            queue_group: None,
            max_deliver: DEFAULT_MAX_DELIVER,
            ack_wait_ms: default_ack_wait_ms(),
            deliver_policy: DeliverPolicy::default(),
            mode: ConsumerMode::Push,
        }
    }

    /// Pull consumer with default fetch and batch sizes
    pub fn pull(durable_name: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            mode: ConsumerMode::pull(),
            ..Self::push(durable_name, stream)
        }
    }

    pub fn deliver_subject(mut self, subject: impl Into<String>) -> Self {
        self.deliver_subject = Some(subject.into());
        self
    }

    pub fn queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn max_deliver(mut self, max_deliver: i64) -> Self {
        self.max_deliver = max_deliver;
        self
    }

    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait_ms = ack_wait.as_millis() as u64;
        self
    }

    pub fn deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn fetch(mut self, fetch_size: usize, batch_size: usize) -> Self {
        self.mode = ConsumerMode::Pull {
            fetch_size,
            batch_size,
        };
        self
    }

    /// Ack wait as a `Duration`
    pub fn ack_wait_duration(&self) -> Duration {
        Duration::from_millis(self.ack_wait_ms)
    }

    /// Deliver subject, derived from the durable name when not declared
    pub fn effective_deliver_subject(&self) -> String {
        self.deliver_subject
            .clone()
            .unwrap_or_else(|| format!("deliver.{}", self.durable_name))
    }

    /// Whether the broker stops redelivering after `attempt` deliveries
    pub fn is_final_attempt(&self, attempt: u64) -> bool {
        self.max_deliver > 0 && attempt >= self.max_deliver as u64
    }

    /// Check the declaration is well-formed
    pub fn validate(&self) -> Result<()> {
        if self.durable_name.is_empty() {
            return Err(EventError::Config("Durable name cannot be empty".to_string()));
        }
        if self.durable_name.contains(|c: char| matches!(c, '.' | '*' | '>') || c.is_whitespace()) {
            return Err(EventError::Config(format!(
                "Invalid durable name '{}'",
                self.durable_name
            )));
        }
        if self.stream.is_empty() {
            return Err(EventError::Config(format!(
                "Consumer '{}' is not bound to a stream",
                self.durable_name
            )));
        }
        if self.max_deliver == 0 || self.max_deliver < -1 {
            return Err(EventError::Config(format!(
                "Consumer '{}' has invalid max_deliver {}",
                self.durable_name, self.max_deliver
            )));
        }
        if self.ack_wait_ms == 0 {
            return Err(EventError::Config(format!(
                "Consumer '{}' must have a non-zero ack wait",
                self.durable_name
            )));
        }
        match self.mode {
            ConsumerMode::Pull {
                fetch_size,
                batch_size,
            } => {
                if fetch_size == 0 || batch_size == 0 {
                    return Err(EventError::Config(format!(
                        "Pull consumer '{}' needs non-zero fetch and batch sizes",
                        self.durable_name
                    )));
                }
                if self.queue_group.is_some() || self.deliver_subject.is_some() {
                    return Err(EventError::Config(format!(
                        "Pull consumer '{}' cannot declare a queue group or deliver subject",
                        self.durable_name
                    )));
                }
            }
            ConsumerMode::Push => {}
        }
        Ok(())
    }
}

/// Per-subscription worker options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeOptions {
    /// Handler deadline in milliseconds
    pub deadline_ms: u64,

    /// Skip (ack without processing) messages older than this many seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_older_than_secs: Option<u64>,

    /// How long a pull fetch waits for messages, in milliseconds
    pub fetch_timeout_ms: u64,

    /// Pause after an empty fetch, in milliseconds
    pub idle_backoff_ms: u64,

    /// Name of the span wrapping each handler invocation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_name: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            deadline_ms: DEFAULT_DEADLINE.as_millis() as u64,
            skip_older_than_secs: None,
            fetch_timeout_ms: 5_000,
            idle_backoff_ms: 500,
            span_name: None,
        }
    }
}

impl SubscribeOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn with_skip_older_than(mut self, age: Duration) -> Self {
        self.skip_older_than_secs = Some(age.as_secs());
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn with_span_name(mut self, name: impl Into<String>) -> Self {
        self.span_name = Some(name.into());
        self
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn skip_older_than(&self) -> Option<Duration> {
        self.skip_older_than_secs.map(Duration::from_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

/// A delivered message with its tenant identity and delivery metadata
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Subject the message was published to
    pub subject: String,

    /// Opaque business payload
    pub payload: Bytes,

    /// Tenant resource path
    pub tenant_id: String,

    /// User that caused the event, if any
    pub acting_user_id: Option<String>,

    /// 1-based delivery attempt
    pub delivery_attempt: u64,

    /// Broker-assigned stream sequence
    pub stream_sequence: u64,

    /// Publisher-assigned message id (dedup key)
    pub message_id: Option<String>,

    /// Broker publish time
    pub published_at: Option<DateTime<Utc>>,

    /// Trace id propagated from the publisher
    pub trace_id: Option<String>,
}

impl Envelope {
    /// Age of the message relative to `now`, if the publish time is known
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.published_at
            .and_then(|published| (now - published).abs().to_std().ok())
    }
}

/// Broker acknowledgement of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Message id sent as the dedup header
    pub message_id: String,

    /// Stream sequence assigned by the broker
    pub sequence: u64,
}
