//! Event bus facade over a pluggable broker provider
//!
//! `EventBus` declares topology, publishes tenant-scoped messages and runs
//! one worker task per subscription. It is passed explicitly (by reference
//! or in an `Arc`) to everything that needs it.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OnceCell, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::context::TenantContext;
use crate::dlq::DeadLetterSink;
use crate::error::{EventError, Result};
use crate::handler::{BatchHandler, MessageHandler};
use crate::metrics::SubscriberMetrics;
use crate::provider::{BrokerProvider, ProviderInfo, PublishFuture};
use crate::topology::{subject, TopologyRegistry};
use crate::types::{ConsumerDefinition, PublishAck, SubscribeOptions};
use crate::wire::WireMessage;
use crate::worker::{PullWorker, PushWorker, StatsSnapshot, WorkerStats};

/// Event bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    /// How long shutdown waits for workers to finish, in milliseconds
    pub shutdown_grace_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 10_000,
        }
    }
}

impl BusConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// A publish handed to the connection but not yet acknowledged
///
/// The message id is known immediately; awaiting the handle yields the
/// broker's acknowledgement.
pub struct PendingPublish {
    message_id: String,
    subject: String,
    ack: PublishFuture,
}

impl PendingPublish {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl IntoFuture for PendingPublish {
    type Output = Result<PublishAck>;
    type IntoFuture = BoxFuture<'static, Result<PublishAck>>;

    fn into_future(self) -> Self::IntoFuture {
        async move {
            let sequence = self.ack.await?;
            Ok(PublishAck {
                message_id: self.message_id,
                sequence,
            })
        }
        .boxed()
    }
}

impl std::fmt::Debug for PendingPublish {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingPublish")
            .field("message_id", &self.message_id)
            .field("subject", &self.subject)
            .finish()
    }
}

/// Delivery mode of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionKind {
    Push,
    Pull,
}

/// Descriptor of a running subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    pub durable: String,
    pub subject: String,
    pub stream: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_group: Option<String>,
    pub kind: SubscriptionKind,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone)]
struct Descriptor {
    durable: String,
    subject: String,
    stream: String,
    queue_group: Option<String>,
    kind: SubscriptionKind,
}

impl Descriptor {
    fn new(subject: &str, consumer: &ConsumerDefinition, kind: SubscriptionKind) -> Self {
        Self {
            durable: consumer.durable_name.clone(),
            subject: subject.to_string(),
            stream: consumer.stream.clone(),
            queue_group: consumer.queue_group.clone(),
            kind,
        }
    }

    fn info(&self, stats: &WorkerStats) -> SubscriptionInfo {
        SubscriptionInfo {
            durable: self.durable.clone(),
            subject: self.subject.clone(),
            stream: self.stream.clone(),
            queue_group: self.queue_group.clone(),
            kind: self.kind,
            stats: stats.snapshot(),
        }
    }
}

/// Handle of a running subscription
///
/// Dropping the handle leaves the worker running until bus shutdown.
#[derive(Clone)]
pub struct Subscription {
    descriptor: Descriptor,
    stats: Arc<WorkerStats>,
    stop: Arc<watch::Sender<bool>>,
}

impl Subscription {
    pub fn durable(&self) -> &str {
        &self.descriptor.durable
    }

    pub fn subject(&self) -> &str {
        &self.descriptor.subject
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn info(&self) -> SubscriptionInfo {
        self.descriptor.info(&self.stats)
    }

    /// Whether `unsubscribe` or bus shutdown has been signalled
    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Stop the worker after its in-flight message
    ///
    /// The durable consumer stays on the broker; subscribing again with the
    /// same definition resumes from where it left off.
    pub fn unsubscribe(&self) {
        if !self.stop.send_replace(true) {
            tracing::info!(
                durable = %self.descriptor.durable,
                subject = %self.descriptor.subject,
                "Unsubscribed"
            );
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("descriptor", &self.descriptor)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

struct Running {
    subscription: Subscription,
    handle: JoinHandle<()>,
}

/// Broker client facade
pub struct EventBus {
    provider: Arc<dyn BrokerProvider>,
    config: BusConfig,
    topology: RwLock<Option<TopologyRegistry>>,
    running: Mutex<Vec<Running>>,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    metrics: OnceCell<Arc<SubscriberMetrics>>,
    closed: AtomicBool,
}

impl EventBus {
    /// Create a new event bus from a provider
    pub fn new(provider: impl BrokerProvider + 'static, config: BusConfig) -> Self {
        Self::from_arc(Arc::new(provider), config)
    }

    /// Create a bus sharing an existing provider handle
    pub fn from_arc(provider: Arc<dyn BrokerProvider>, config: BusConfig) -> Self {
        Self {
            provider,
            config,
            topology: RwLock::new(None),
            running: Mutex::new(Vec::new()),
            dead_letters: None,
            metrics: OnceCell::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Record subscriber metrics in `metrics` instead of a bus-owned registry
    pub fn with_metrics(mut self, metrics: Arc<SubscriberMetrics>) -> Self {
        self.metrics = OnceCell::new_with(Some(metrics));
        self
    }

    /// Subscriber metrics of this bus, created on first use
    pub async fn metrics(&self) -> Result<Arc<SubscriberMetrics>> {
        self.metrics
            .get_or_try_init(|| async { SubscriberMetrics::new().map(Arc::new) })
            .await
            .cloned()
    }

    /// Report messages that exhaust their deliveries to `sink`
    pub fn with_dead_letters(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Get the provider name
    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Get a reference to the underlying provider
    pub fn provider(&self) -> &dyn BrokerProvider {
        self.provider.as_ref()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Provision every stream of `registry` on the broker
    ///
    /// The registry is kept and used to validate later bindings.
    pub async fn declare_topology(&self, registry: &TopologyRegistry) -> Result<()> {
        self.ensure_open()?;
        registry.validate()?;

        for stream in registry.streams() {
            self.provider.upsert_stream(stream).await?;
        }

        tracing::info!(
            services = registry.services().len(),
            streams = registry.streams().count(),
            "Topology declared"
        );
        *self.topology.write().await = Some(registry.clone());
        Ok(())
    }

    /// Publish and wait for the broker acknowledgement
    pub async fn publish(
        &self,
        ctx: &TenantContext,
        subject_name: &str,
        payload: &[u8],
    ) -> Result<PublishAck> {
        self.publish_async(ctx, subject_name, payload).await?.await
    }

    /// Publish without waiting for the broker acknowledgement
    ///
    /// Returns once the message is enqueued on the connection.
    pub async fn publish_async(
        &self,
        ctx: &TenantContext,
        subject_name: &str,
        payload: &[u8],
    ) -> Result<PendingPublish> {
        self.ensure_open()?;
        subject::validate(subject_name)?;
        if subject_name.split('.').any(|t| t == "*" || t == ">") {
            return Err(EventError::Publish {
                subject: subject_name.to_string(),
                reason: "cannot publish to a wildcard subject".to_string(),
            });
        }
        if !self.provider.is_connected() {
            return Err(EventError::BrokerUnavailable(format!(
                "{} connection is down, cannot publish to '{}'",
                self.provider.name(),
                subject_name
            )));
        }

        let message_id = Uuid::new_v4().to_string();
        let data = WireMessage::new(ctx, payload).encode()?;
        let ack = self.provider.publish(subject_name, &message_id, data).await?;

        tracing::debug!(
            subject = %subject_name,
            message_id = %message_id,
            resource_path = %ctx.resource_path(),
            "Message published"
        );

        Ok(PendingPublish {
            message_id,
            subject: subject_name.to_string(),
            ack,
        })
    }

    /// Bind a push consumer in a queue group and start its worker
    ///
    /// Every subscriber of the same durable and queue group shares one
    /// consumer; the broker hands each message to exactly one of them.
    /// There is no ordering guarantee across those siblings.
    pub async fn queue_subscribe(
        &self,
        subject_name: &str,
        queue_group: &str,
        mut consumer: ConsumerDefinition,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        if consumer.mode.is_pull() {
            return Err(EventError::Binding {
                durable: consumer.durable_name,
                reason: "pull consumer cannot be bound to a queue subscription".to_string(),
            });
        }
        if let Some(declared) = consumer.queue_group.as_deref() {
            if declared != queue_group {
                return Err(EventError::Binding {
                    durable: consumer.durable_name.clone(),
                    reason: format!(
                        "declared queue group '{}' differs from '{}'",
                        declared, queue_group
                    ),
                });
            }
        }
        consumer.queue_group = Some(queue_group.to_string());
        consumer.validate()?;
        self.check_binding(subject_name, &consumer).await?;

        let metrics = self.metrics().await?;
        let stream = self.provider.bind_push(subject_name, &consumer).await?;
        let descriptor = Descriptor::new(subject_name, &consumer, SubscriptionKind::Push);
        let stats = Arc::new(WorkerStats::new(
            &metrics,
            subject_name,
            queue_group,
            &consumer.stream,
            &consumer.durable_name,
        ));
        let worker = PushWorker::new(
            stream,
            handler,
            consumer,
            subject_name,
            options,
            stats.clone(),
        )
        .with_dead_letters(self.dead_letters.clone());

        self.spawn(descriptor, stats, |shutdown| tokio::spawn(worker.run(shutdown)))
            .await
    }

    /// Bind a pull consumer and start its worker
    pub async fn pull_subscribe(
        &self,
        subject_name: &str,
        durable_name: &str,
        handler: Arc<dyn BatchHandler>,
        consumer: ConsumerDefinition,
        options: SubscribeOptions,
    ) -> Result<Subscription> {
        self.ensure_open()?;
        if consumer.durable_name != durable_name {
            return Err(EventError::Binding {
                durable: durable_name.to_string(),
                reason: format!(
                    "consumer declares durable '{}'",
                    consumer.durable_name
                ),
            });
        }
        if !consumer.mode.is_pull() {
            return Err(EventError::Binding {
                durable: consumer.durable_name,
                reason: "push consumer cannot be bound to a pull subscription".to_string(),
            });
        }
        consumer.validate()?;
        self.check_binding(subject_name, &consumer).await?;

        let metrics = self.metrics().await?;
        let pull = self.provider.bind_pull(subject_name, &consumer).await?;
        let descriptor = Descriptor::new(subject_name, &consumer, SubscriptionKind::Pull);
        let stats = Arc::new(WorkerStats::new(
            &metrics,
            subject_name,
            durable_name,
            &consumer.stream,
            &consumer.durable_name,
        ));
        let worker = PullWorker::new(pull, handler, consumer, subject_name, options, stats.clone())
            .with_dead_letters(self.dead_letters.clone());

        self.spawn(descriptor, stats, |shutdown| tokio::spawn(worker.run(shutdown)))
            .await
    }

    /// Start a worker and track it for shutdown
    ///
    /// `closed` is checked under the `running` lock, so a worker is either
    /// seen by `shutdown` or never left running.
    async fn spawn(
        &self,
        descriptor: Descriptor,
        stats: Arc<WorkerStats>,
        start: impl FnOnce(watch::Receiver<bool>) -> JoinHandle<()>,
    ) -> Result<Subscription> {
        let (stop, shutdown) = watch::channel(false);
        let subscription = Subscription {
            descriptor,
            stats,
            stop: Arc::new(stop),
        };

        let mut running = self.running.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            subscription.stop.send_replace(true);
            return Err(EventError::Shutdown);
        }
        let handle = start(shutdown);

        tracing::info!(
            durable = %subscription.descriptor.durable,
            subject = %subscription.descriptor.subject,
            stream = %subscription.descriptor.stream,
            queue = ?subscription.descriptor.queue_group,
            "Subscription started"
        );

        running.push(Running {
            subscription: subscription.clone(),
            handle,
        });
        Ok(subscription)
    }

    /// The bound stream must capture every subject the filter can match
    async fn check_binding(&self, filter: &str, consumer: &ConsumerDefinition) -> Result<()> {
        subject::validate(filter)?;

        let declared = self
            .topology
            .read()
            .await
            .as_ref()
            .and_then(|t| t.stream(&consumer.stream))
            .map(|s| s.subjects.clone());

        let subjects = match declared {
            Some(subjects) => subjects,
            None => self
                .provider
                .stream_subjects(&consumer.stream)
                .await?
                .ok_or_else(|| EventError::Binding {
                    durable: consumer.durable_name.clone(),
                    reason: format!("stream '{}' does not exist", consumer.stream),
                })?,
        };

        if subjects.iter().any(|pattern| subject::covers(pattern, filter)) {
            Ok(())
        } else {
            Err(EventError::Binding {
                durable: consumer.durable_name.clone(),
                reason: format!(
                    "stream '{}' does not cover '{}'",
                    consumer.stream, filter
                ),
            })
        }
    }

    /// Descriptors of subscriptions whose workers are still running
    pub async fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        let mut running = self.running.lock().await;
        running.retain(|r| {
            let finished = r.handle.is_finished();
            if finished && !r.subscription.is_stopped() {
                tracing::warn!(
                    durable = %r.subscription.descriptor.durable,
                    subject = %r.subscription.descriptor.subject,
                    "Worker exited without being stopped"
                );
            }
            !finished
        });
        running
            .iter()
            .map(|r| r.subscription.info())
            .collect()
    }

    /// Health check, false once shut down or disconnected
    pub async fn health(&self) -> Result<bool> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.provider.health().await
    }

    /// Get provider info
    pub async fn info(&self) -> Result<ProviderInfo> {
        self.provider.info().await
    }

    /// Stop every worker and close the provider
    ///
    /// Workers finish their in-flight message; those still running after
    /// the grace period are aborted. Later calls are no-ops.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let running = std::mem::take(&mut *self.running.lock().await);
        tracing::info!(workers = running.len(), "Shutting down event bus");
        for r in &running {
            r.subscription.stop.send_replace(true);
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace();
        let mut aborted = 0usize;
        for Running {
            subscription,
            mut handle,
        } in running
        {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(
                    durable = %subscription.descriptor.durable,
                    error = %e,
                    "Worker task failed"
                ),
                Err(_) => {
                    tracing::warn!(
                        durable = %subscription.descriptor.durable,
                        "Worker did not stop within grace period, aborting"
                    );
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        self.provider.close().await?;
        tracing::info!(aborted, "Event bus shut down");
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EventError::Shutdown)
        } else {
            Ok(())
        }
    }
}
