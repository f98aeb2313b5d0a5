//! Typed subscriber registry
//!
//! A service lists its subscriptions once at start-up and starts them all
//! against a bus. Durable names are checked when an entry is added, so a
//! copy-pasted durable fails before anything is bound.

use std::sync::Arc;

use crate::bus::{EventBus, Subscription};
use crate::error::{EventError, Result};
use crate::handler::{BatchHandler, MessageHandler};
use crate::types::{ConsumerDefinition, SubscribeOptions};

enum Target {
    Push {
        queue_group: String,
        handler: Arc<dyn MessageHandler>,
    },
    Pull {
        handler: Arc<dyn BatchHandler>,
    },
}

struct Entry {
    subject: String,
    consumer: ConsumerDefinition,
    options: SubscribeOptions,
    target: Target,
}

/// Subscriptions of one service, started together
#[derive(Default)]
pub struct SubscriberRegistry {
    entries: Vec<Entry>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queue-group push subscription
    pub fn push(
        &mut self,
        subject: impl Into<String>,
        queue_group: impl Into<String>,
        consumer: ConsumerDefinition,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<&mut Self> {
        self.add(Entry {
            subject: subject.into(),
            consumer,
            options,
            target: Target::Push {
                queue_group: queue_group.into(),
                handler,
            },
        })
    }

    /// Add a pull subscription
    pub fn pull(
        &mut self,
        subject: impl Into<String>,
        consumer: ConsumerDefinition,
        options: SubscribeOptions,
        handler: Arc<dyn BatchHandler>,
    ) -> Result<&mut Self> {
        self.add(Entry {
            subject: subject.into(),
            consumer,
            options,
            target: Target::Pull { handler },
        })
    }

    fn add(&mut self, entry: Entry) -> Result<&mut Self> {
        entry.consumer.validate()?;
        let duplicate = self.entries.iter().any(|e| {
            e.consumer.stream == entry.consumer.stream
                && e.consumer.durable_name == entry.consumer.durable_name
        });
        if duplicate {
            return Err(EventError::Config(format!(
                "Durable '{}' on stream '{}' is registered more than once",
                entry.consumer.durable_name, entry.consumer.stream
            )));
        }
        self.entries.push(entry);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered durable names in registration order
    pub fn durables(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.consumer.durable_name.as_str())
            .collect()
    }

    /// Bind every entry and start its worker
    ///
    /// Stops at the first failure; subscriptions already started are
    /// unsubscribed before the error is returned.
    pub async fn start(&self, bus: &EventBus) -> Result<Vec<Subscription>> {
        let mut started = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let result = match &entry.target {
                Target::Push {
                    queue_group,
                    handler,
                } => {
                    bus.queue_subscribe(
                        &entry.subject,
                        queue_group,
                        entry.consumer.clone(),
                        entry.options.clone(),
                        handler.clone(),
                    )
                    .await
                }
                Target::Pull { handler } => {
                    bus.pull_subscribe(
                        &entry.subject,
                        &entry.consumer.durable_name,
                        handler.clone(),
                        entry.consumer.clone(),
                        entry.options.clone(),
                    )
                    .await
                }
            };

            match result {
                Ok(subscription) => started.push(subscription),
                Err(e) => {
                    tracing::error!(
                        durable = %entry.consumer.durable_name,
                        subject = %entry.subject,
                        error = %e,
                        "Failed to start subscriber"
                    );
                    for subscription in &started {
                        subscription.unsubscribe();
                    }
                    return Err(e);
                }
            }
        }

        tracing::info!(subscribers = started.len(), "Subscribers started");
        Ok(started)
    }
}
