//! # edu-events
//!
//! Durable event subscription and delivery for the education platform
//! services.
//!
//! ## Overview
//!
//! `edu-events` lets every service declare its streams, bind durable
//! consumers to them and process events with at-least-once delivery,
//! bounded redelivery and batch chunking. Tenant identity travels with each
//! message and is restored before a handler runs.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use edu_events::{
//!     handler_fn, BusConfig, ConsumerDefinition, EventBus, HandlerError, MemoryProvider,
//!     StreamDefinition, SubscribeOptions, TenantContext, TenantScoped, TopologyRegistry,
//! };
//!
//! # async fn example() -> edu_events::Result<()> {
//! let bus = EventBus::new(MemoryProvider::default(), BusConfig::default());
//!
//! let mut topology = TopologyRegistry::new();
//! topology.register("lessonmgmt", || {
//!     vec![StreamDefinition::new("lesson").subject("Lesson.*")]
//! });
//! bus.declare_topology(&topology).await?;
//!
//! let handler = handler_fn(|ctx, payload| async move {
//!     println!("{} sent {} bytes", ctx.tenant().resource_path(), payload.len());
//!     Ok::<(), HandlerError>(())
//! });
//! bus.queue_subscribe(
//!     "Lesson.Created",
//!     "queue-lesson-created",
//!     ConsumerDefinition::push("durable-lesson-created", "lesson"),
//!     SubscribeOptions::default(),
//!     Arc::new(handler),
//! )
//! .await?;
//!
//! let ack = bus
//!     .publish(&TenantContext::new("manabie"), "Lesson.Created", br#"{"lessonId":"l-1"}"#)
//!     .await?;
//! println!("Published {} at {}", ack.message_id, ack.sequence);
//!
//! bus.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **memory** — In-process broker with JetStream semantics, for tests and local runs
//! - **nats** — NATS JetStream
//!
//! ## Architecture
//!
//! - **TopologyRegistry** — per-service stream declarations
//! - **BrokerProvider** trait — stream/consumer upsert, publish, bind
//! - **EventBus** — publish, subscribe, shutdown
//! - **PushWorker / PullWorker** — per-subscription delivery loops
//! - **SubscriberMetrics** — Prometheus counters and handler latency per subscription
//! - **MessageHandler / BatchHandler** — business capabilities
//! - **TenantContext / ProcessingContext** — identity restored per message

pub mod bus;
pub mod chunk;
pub mod context;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod provider;
pub mod registry;
pub mod topology;
pub mod types;
pub mod wire;
pub mod worker;

// Re-export core types
pub use bus::{BusConfig, EventBus, PendingPublish, Subscription, SubscriptionInfo, SubscriptionKind};
pub use chunk::{chunk_handler, chunk_handler_async, chunk_ranges, ChunkError, MAX_RECORD_PROCESS_PER_TIME};
pub use context::{ProcessingContext, TenantConnectionMap, TenantConnections, TenantContext, TenantScoped};
pub use dlq::{DeadLetter, DeadLetterSink, MemoryDeadLetterSink};
pub use error::{EventError, Result};
pub use handler::{
    handler_fn, BatchHandler, BatchMessage, BoxError, EventHandler, HandlerError, Json,
    MessageHandler,
};
pub use metrics::{ProcessStatus, SubscriberMetrics};
pub use provider::{BrokerProvider, ConsumerUpdatePolicy, Delivery, DeliveryInfo, ProviderInfo};
pub use registry::SubscriberRegistry;
pub use topology::{RetentionPolicy, StreamDefinition, TopicDefinition, TopologyRegistry};
pub use types::{
    ConsumerDefinition, ConsumerMode, DeliverPolicy, Envelope, PublishAck, SubscribeOptions,
};
pub use worker::{Outcome, StatsSnapshot};

// Re-export providers for convenience
pub use provider::memory::{MemoryConfig, MemoryProvider};
pub use provider::nats::{NatsClient, NatsConfig, NatsProvider};
