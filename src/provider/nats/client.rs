//! NATS JetStream client: connect, publish, stream and consumer upsert

use super::config::NatsConfig;
use super::subscriber::{NatsDeliveryStream, NatsPullConsumer};
use crate::error::{EventError, Result};
use crate::provider::{ConsumerUpdatePolicy, PublishFuture};
use crate::topology::{RetentionPolicy, StreamDefinition};
use crate::types::{ConsumerDefinition, ConsumerMode, DeliverPolicy};
use crate::wire::MSG_ID_HEADER;
use async_nats::jetstream;
use async_nats::jetstream::context::GetStreamErrorKind;
use bytes::Bytes;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// NATS JetStream client
///
/// Low-level client owning the connection and the JetStream context.
pub struct NatsClient {
    /// NATS client connection
    client: async_nats::Client,

    /// JetStream context
    jetstream: jetstream::Context,

    /// Streams upserted through this client, in declaration order
    streams: Mutex<Vec<String>>,

    /// Configuration
    config: Arc<NatsConfig>,
}

/// Outcome of comparing an existing consumer with its declaration
enum ConsumerState {
    Missing,
    Identical,
    Different,
}

impl NatsClient {
    /// Connect to NATS
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| EventError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, local = config.local, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            streams: Mutex::new(Vec::new()),
            config: Arc::new(config),
        })
    }

    /// Whether the connection is up
    pub fn is_connected(&self) -> bool {
        matches!(
            self.client.connection_state(),
            async_nats::connection::State::Connected
        )
    }

    /// Publish with a dedup id, returning the ack future after enqueue
    pub async fn publish(
        &self,
        subject: &str,
        message_id: &str,
        payload: Bytes,
    ) -> Result<PublishFuture> {
        if !self.is_connected() {
            return Err(EventError::BrokerUnavailable(format!(
                "not connected to {}",
                self.config.url
            )));
        }

        let mut headers = async_nats::HeaderMap::new();
        headers.insert(MSG_ID_HEADER, message_id);

        let ack_fut = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| EventError::Publish {
                subject: subject.to_string(),
                reason: e.to_string(),
            })?;

        let subject = subject.to_string();
        Ok(async move {
            let ack = ack_fut.await.map_err(|e| EventError::Publish {
                subject: subject.clone(),
                reason: format!("ack failed: {}", e),
            })?;
            if ack.duplicate {
                tracing::debug!(subject = %subject, sequence = ack.sequence, "Duplicate publish");
            }
            Ok(ack.sequence)
        }
        .boxed())
    }

    /// Create the stream, or reconcile an existing one with the declaration
    ///
    /// A retention change deletes and recreates the stream; any other
    /// difference is applied in place.
    pub async fn upsert_stream(&self, definition: &StreamDefinition) -> Result<()> {
        definition.validate()?;
        let definition = self.config.effective_stream(definition);
        let desired = stream_config(&definition);

        let stream = self
            .jetstream
            .get_or_create_stream(desired.clone())
            .await
            .map_err(|e| {
                EventError::Stream(format!(
                    "Failed to create/get stream '{}': {}",
                    definition.name, e
                ))
            })?;
        let existing = &stream.cached_info().config;

        if existing.retention != desired.retention {
            tracing::warn!(stream = %definition.name, "Stream retention changed, recreating");
            self.jetstream
                .delete_stream(&definition.name)
                .await
                .map_err(|e| {
                    EventError::Stream(format!(
                        "Failed to delete stream '{}': {}",
                        definition.name, e
                    ))
                })?;
            self.jetstream
                .create_stream(desired)
                .await
                .map_err(|e| {
                    EventError::Stream(format!(
                        "Failed to create stream '{}': {}",
                        definition.name, e
                    ))
                })?;
        } else if stream_differs(existing, &desired) {
            self.jetstream.update_stream(desired).await.map_err(|e| {
                EventError::Stream(format!(
                    "Failed to update stream '{}': {}",
                    definition.name, e
                ))
            })?;
            tracing::info!(stream = %definition.name, "JetStream stream updated");
        }

        let mut streams = self.streams.lock().await;
        if !streams.contains(&definition.name) {
            streams.push(definition.name.clone());
        }

        tracing::info!(
            stream = %definition.name,
            subjects = ?definition.subjects,
            replicas = definition.replicas,
            "JetStream stream ready"
        );
        Ok(())
    }

    /// Subject patterns of a stream, `None` when it does not exist
    pub async fn stream_subjects(&self, name: &str) -> Result<Option<Vec<String>>> {
        match self.jetstream.get_stream(name).await {
            Ok(stream) => Ok(Some(stream.cached_info().config.subjects.clone())),
            Err(e) => match e.kind() {
                GetStreamErrorKind::JetStream(_) => Ok(None),
                _ => Err(EventError::Stream(format!(
                    "Failed to get stream '{}': {}",
                    name, e
                ))),
            },
        }
    }

    /// Upsert a push consumer and subscribe to its deliver subject
    pub async fn bind_push(
        &self,
        filter: &str,
        definition: &ConsumerDefinition,
    ) -> Result<NatsDeliveryStream> {
        let definition = self.config.effective_consumer(definition);
        self.upsert_consumer(filter, &definition).await?;

        let stream = self.stream_handle(&definition).await?;
        let consumer: jetstream::consumer::Consumer<jetstream::consumer::push::Config> = stream
            .get_consumer(&definition.durable_name)
            .await
            .map_err(|e| {
                EventError::Consumer(format!(
                    "Failed to get consumer '{}': {}",
                    definition.durable_name, e
                ))
            })?;

        let messages = consumer.messages().await.map_err(|e| EventError::Subscribe {
            subject: filter.to_string(),
            reason: e.to_string(),
        })?;

        tracing::info!(
            durable = %definition.durable_name,
            filter = %filter,
            queue = ?definition.queue_group,
            deliver_subject = %definition.effective_deliver_subject(),
            "Push consumer bound"
        );

        Ok(NatsDeliveryStream::new(
            messages,
            filter.to_string(),
            definition.ack_wait_duration(),
        ))
    }

    /// Upsert a pull consumer
    pub async fn bind_pull(
        &self,
        filter: &str,
        definition: &ConsumerDefinition,
    ) -> Result<NatsPullConsumer> {
        let definition = self.config.effective_consumer(definition);
        self.upsert_consumer(filter, &definition).await?;

        let stream = self.stream_handle(&definition).await?;
        let consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config> = stream
            .get_consumer(&definition.durable_name)
            .await
            .map_err(|e| {
                EventError::Consumer(format!(
                    "Failed to get consumer '{}': {}",
                    definition.durable_name, e
                ))
            })?;

        tracing::info!(
            durable = %definition.durable_name,
            filter = %filter,
            "Pull consumer bound"
        );

        Ok(NatsPullConsumer::new(consumer, definition.ack_wait_duration()))
    }

    /// Create, rebind, reject or recreate a durable consumer
    ///
    /// Transient failures are retried `upsert_attempts` times;
    /// binding conflicts are returned immediately.
    async fn upsert_consumer(&self, filter: &str, definition: &ConsumerDefinition) -> Result<()> {
        let attempts = self.config.upsert_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.try_upsert_consumer(filter, definition).await {
                Ok(()) => return Ok(()),
                Err(e @ EventError::Binding { .. }) => return Err(e),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        durable = %definition.durable_name,
                        attempt,
                        error = %e,
                        "Consumer upsert failed, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.upsert_retry()).await;
                }
            }
        }
    }

    async fn try_upsert_consumer(
        &self,
        filter: &str,
        definition: &ConsumerDefinition,
    ) -> Result<()> {
        let stream = self.stream_handle(definition).await?;
        if !stream
            .cached_info()
            .config
            .subjects
            .iter()
            .any(|pattern| crate::topology::subject::covers(pattern, filter))
        {
            return Err(EventError::Binding {
                durable: definition.durable_name.clone(),
                reason: format!(
                    "stream '{}' does not cover '{}'",
                    definition.stream, filter
                ),
            });
        }

        let state = match stream.consumer_info(&definition.durable_name).await {
            Ok(info) if consumer_matches(&info.config, filter, definition) => {
                ConsumerState::Identical
            }
            Ok(_) => ConsumerState::Different,
            Err(e) => {
                tracing::debug!(
                    durable = %definition.durable_name,
                    error = %e,
                    "Consumer info unavailable, creating"
                );
                ConsumerState::Missing
            }
        };

        match state {
            ConsumerState::Identical => {
                tracing::debug!(durable = %definition.durable_name, "Rebound existing consumer");
                return Ok(());
            }
            ConsumerState::Different => match self.config.consumer_update_policy {
                ConsumerUpdatePolicy::Reject => {
                    return Err(EventError::Binding {
                        durable: definition.durable_name.clone(),
                        reason: "a consumer with this name exists with a different configuration"
                            .to_string(),
                    });
                }
                ConsumerUpdatePolicy::Recreate => {
                    tracing::warn!(
                        durable = %definition.durable_name,
                        stream = %definition.stream,
                        "Consumer config changed, deleting and recreating"
                    );
                    stream
                        .delete_consumer(&definition.durable_name)
                        .await
                        .map_err(|e| {
                            EventError::Consumer(format!(
                                "Failed to delete consumer '{}': {}",
                                definition.durable_name, e
                            ))
                        })?;
                }
            },
            ConsumerState::Missing => {}
        }

        let created = match definition.mode {
            ConsumerMode::Push => stream
                .create_consumer(push_config(filter, definition))
                .await
                .map(|_| ()),
            ConsumerMode::Pull { .. } => stream
                .create_consumer(pull_config(filter, definition))
                .await
                .map(|_| ()),
        };
        created.map_err(|e| {
            EventError::Consumer(format!(
                "Failed to create consumer '{}': {}",
                definition.durable_name, e
            ))
        })?;

        tracing::info!(
            durable = %definition.durable_name,
            stream = %definition.stream,
            filter = %filter,
            "Consumer created"
        );
        Ok(())
    }

    async fn stream_handle(
        &self,
        definition: &ConsumerDefinition,
    ) -> Result<jetstream::stream::Stream> {
        self.jetstream
            .get_stream(&definition.stream)
            .await
            .map_err(|e| match e.kind() {
                GetStreamErrorKind::JetStream(_) => EventError::Binding {
                    durable: definition.durable_name.clone(),
                    reason: format!("stream '{}' not found", definition.stream),
                },
                _ => EventError::Stream(format!(
                    "Failed to get stream '{}': {}",
                    definition.stream, e
                )),
            })
    }

    /// Message and consumer totals across streams upserted by this client
    pub async fn totals(&self) -> Result<(usize, u64, usize)> {
        let names = self.streams.lock().await.clone();
        let mut messages = 0;
        let mut consumers = 0;
        for name in &names {
            let mut stream = self.jetstream.get_stream(name).await.map_err(|e| {
                EventError::Stream(format!("Failed to get stream '{}': {}", name, e))
            })?;
            let info = stream
                .info()
                .await
                .map_err(|e| EventError::Stream(format!("Failed to get stream info: {}", e)))?;
            messages += info.state.messages;
            consumers += info.state.consumer_count;
        }
        Ok((names.len(), messages, consumers))
    }

    /// Flush pending publishes
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| EventError::Connection(format!("flush failed: {}", e)))
    }

    /// Get the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.client
    }

    /// Get the JetStream context
    pub fn jetstream_context(&self) -> &jetstream::Context {
        &self.jetstream
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

fn stream_config(definition: &StreamDefinition) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: definition.name.clone(),
        subjects: definition.subjects.clone(),
        num_replicas: definition.replicas,
        retention: match definition.retention {
            RetentionPolicy::InterestBased => jetstream::stream::RetentionPolicy::Interest,
            RetentionPolicy::LimitsBased => jetstream::stream::RetentionPolicy::Limits,
        },
        max_bytes: definition.max_bytes.unwrap_or(-1),
        max_age: definition.max_age_duration().unwrap_or(Duration::ZERO),
        storage: jetstream::stream::StorageType::File,
        ..Default::default()
    }
}

fn stream_differs(existing: &jetstream::stream::Config, desired: &jetstream::stream::Config) -> bool {
    let limit = |bytes: i64| if bytes <= 0 { -1 } else { bytes };
    existing.subjects != desired.subjects
        || existing.num_replicas != desired.num_replicas
        || existing.max_age != desired.max_age
        || limit(existing.max_bytes) != limit(desired.max_bytes)
}

fn deliver_policy(policy: DeliverPolicy) -> jetstream::consumer::DeliverPolicy {
    match policy {
        DeliverPolicy::New => jetstream::consumer::DeliverPolicy::New,
        DeliverPolicy::All => jetstream::consumer::DeliverPolicy::All,
    }
}

fn push_config(filter: &str, definition: &ConsumerDefinition) -> jetstream::consumer::push::Config {
    jetstream::consumer::push::Config {
        durable_name: Some(definition.durable_name.clone()),
        deliver_subject: definition.effective_deliver_subject(),
        deliver_group: definition.queue_group.clone(),
        filter_subject: filter.to_string(),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy: deliver_policy(definition.deliver_policy),
        max_deliver: definition.max_deliver,
        ack_wait: definition.ack_wait_duration(),
        ..Default::default()
    }
}

fn pull_config(filter: &str, definition: &ConsumerDefinition) -> jetstream::consumer::pull::Config {
    jetstream::consumer::pull::Config {
        durable_name: Some(definition.durable_name.clone()),
        filter_subject: filter.to_string(),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        deliver_policy: deliver_policy(definition.deliver_policy),
        max_deliver: definition.max_deliver,
        ack_wait: definition.ack_wait_duration(),
        ..Default::default()
    }
}

/// Whether an existing consumer config is the declared one
fn consumer_matches(
    existing: &jetstream::consumer::Config,
    filter: &str,
    definition: &ConsumerDefinition,
) -> bool {
    let deliver_subject = match definition.mode {
        ConsumerMode::Push => Some(definition.effective_deliver_subject()),
        ConsumerMode::Pull { .. } => None,
    };
    existing.filter_subject == filter
        && existing.deliver_subject == deliver_subject
        && existing.deliver_group == definition.queue_group
        && existing.max_deliver == definition.max_deliver
        && existing.ack_wait == definition.ack_wait_duration()
        && existing.deliver_policy == deliver_policy(definition.deliver_policy)
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let reconnect_wait = config.reconnect_wait();
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)))
        .max_reconnects(config.max_reconnects)
        .reconnect_delay_callback(move |_attempts| reconnect_wait)
        .event_callback(|event| async move {
            match event {
                async_nats::Event::Connected => tracing::info!("NATS reconnected"),
                async_nats::Event::Disconnected => tracing::warn!("NATS disconnected"),
                other => tracing::debug!(event = %other, "NATS connection event"),
            }
        });

    if let Some(ref name) = config.name {
        opts = opts.name(name);
    }

    if let (Some(user), Some(password)) = (&config.user, &config.password) {
        opts = opts.user_and_password(user.clone(), password.clone());
    } else if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_config_mapping() {
        let definition = StreamDefinition::new("activitylog")
            .subject("ActivityLog.*")
            .retention(RetentionPolicy::LimitsBased)
            .max_bytes(1024)
            .max_age(Duration::from_secs(60));
        let config = stream_config(&definition);
        assert_eq!(config.name, "activitylog");
        assert_eq!(config.num_replicas, 3);
        assert_eq!(config.retention, jetstream::stream::RetentionPolicy::Limits);
        assert_eq!(config.max_bytes, 1024);
        assert_eq!(config.max_age, Duration::from_secs(60));

        let unlimited = stream_config(&StreamDefinition::new("lesson").subject("Lesson.*"));
        assert_eq!(unlimited.max_bytes, -1);
        assert_eq!(unlimited.retention, jetstream::stream::RetentionPolicy::Interest);
    }

    #[test]
    fn test_stream_differs() {
        let base = stream_config(&StreamDefinition::new("lesson").subject("Lesson.*"));
        let mut server_view = base.clone();
        server_view.max_bytes = 0;
        assert!(!stream_differs(&server_view, &base));

        let widened = stream_config(
            &StreamDefinition::new("lesson")
                .subject("Lesson.*")
                .subject("LessonReport.*"),
        );
        assert!(stream_differs(&base, &widened));
    }

    #[test]
    fn test_push_config_mapping() {
        let definition = ConsumerDefinition::push("durable-lesson-event", "lesson")
            .queue_group("queue-lesson-event")
            .max_deliver(5);
        let config = push_config("Lesson.*", &definition);
        assert_eq!(config.durable_name.as_deref(), Some("durable-lesson-event"));
        assert_eq!(config.deliver_subject, "deliver.durable-lesson-event");
        assert_eq!(config.deliver_group.as_deref(), Some("queue-lesson-event"));
        assert_eq!(config.max_deliver, 5);
        assert_eq!(config.ack_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_consumer_matches() {
        let definition = ConsumerDefinition::push("d", "lesson").queue_group("q");
        let existing = jetstream::consumer::Config {
            durable_name: Some("d".to_string()),
            deliver_subject: Some("deliver.d".to_string()),
            deliver_group: Some("q".to_string()),
            filter_subject: "Lesson.*".to_string(),
            max_deliver: 10,
            ack_wait: Duration::from_secs(30),
            deliver_policy: jetstream::consumer::DeliverPolicy::New,
            ..Default::default()
        };
        assert!(consumer_matches(&existing, "Lesson.*", &definition));
        assert!(!consumer_matches(&existing, "Lesson.Created", &definition));
        assert!(!consumer_matches(&existing, "Lesson.*", &definition.clone().max_deliver(3)));

        let pull = ConsumerDefinition::pull("d", "lesson");
        let pull_existing = jetstream::consumer::Config {
            deliver_subject: None,
            deliver_group: None,
            ..existing
        };
        assert!(consumer_matches(&pull_existing, "Lesson.*", &pull));
    }
}
