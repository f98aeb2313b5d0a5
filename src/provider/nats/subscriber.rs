//! JetStream push and pull handles producing `Delivery` values

use crate::error::{EventError, Result};
use crate::provider::{Delivery, DeliveryInfo, DeliveryStream, PullConsumer};
use crate::wire::MSG_ID_HEADER;
use async_nats::jetstream;
use async_nats::jetstream::AckKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;

/// Push subscription over a JetStream consumer's deliver subject
pub struct NatsDeliveryStream {
    messages: BoxStream<'static, std::result::Result<jetstream::Message, String>>,
    filter: String,
    ack_wait: Duration,
}

impl NatsDeliveryStream {
    pub(super) fn new(
        messages: jetstream::consumer::push::Messages,
        filter: String,
        ack_wait: Duration,
    ) -> Self {
        Self {
            messages: messages.map(|m| m.map_err(|e| e.to_string())).boxed(),
            filter,
            ack_wait,
        }
    }
}

#[async_trait]
impl DeliveryStream for NatsDeliveryStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        match self.messages.next().await {
            Some(Ok(msg)) => Ok(Some(into_delivery(msg, self.ack_wait))),
            Some(Err(e)) => Err(EventError::Subscribe {
                subject: self.filter.clone(),
                reason: e,
            }),
            None => Ok(None),
        }
    }
}

/// Durable pull consumer
pub struct NatsPullConsumer {
    consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
    ack_wait: Duration,
}

impl NatsPullConsumer {
    pub(super) fn new(
        consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
        ack_wait: Duration,
    ) -> Self {
        Self { consumer, ack_wait }
    }
}

#[async_trait]
impl PullConsumer for NatsPullConsumer {
    async fn fetch(&self, max: usize, expires: Duration) -> Result<Vec<Delivery>> {
        let batch = self
            .consumer
            .fetch()
            .max_messages(max)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| EventError::Consumer(format!("Failed to fetch: {}", e)))?;

        let mut deliveries = Vec::with_capacity(max);
        let mut batch = std::pin::pin!(batch);
        while let Some(msg) = batch.next().await {
            match msg {
                Ok(msg) => deliveries.push(into_delivery(msg, self.ack_wait)),
                Err(e) => {
                    tracing::warn!(error = %e, "Error fetching message");
                    break;
                }
            }
        }
        Ok(deliveries)
    }
}

/// Wrap a JetStream message with ack and delayed-nak callbacks
fn into_delivery(msg: jetstream::Message, ack_wait: Duration) -> Delivery {
    let (delivery_attempt, stream_sequence, published_at) = match msg.info() {
        Ok(info) => (
            info.delivered.max(1) as u64,
            info.stream_sequence,
            to_chrono(info.published),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Message without JetStream metadata");
            (1, 0, None)
        }
    };

    let message_id = msg
        .headers
        .as_ref()
        .and_then(|headers| headers.get(MSG_ID_HEADER))
        .map(|value| value.to_string());

    let info = DeliveryInfo {
        subject: msg.subject.to_string(),
        delivery_attempt,
        stream_sequence,
        message_id,
        published_at,
    };
    let data = msg.payload.clone();

    let msg = Arc::new(msg);
    let ack_msg = msg.clone();
    let nak_msg = msg;

    Delivery::new(
        info,
        data,
        move || {
            async move {
                ack_msg
                    .ack()
                    .await
                    .map_err(|e| EventError::Ack(e.to_string()))
            }
            .boxed()
        },
        move || {
            async move {
                nak_msg
                    .ack_with(AckKind::Nak(Some(ack_wait)))
                    .await
                    .map_err(|e| EventError::Ack(e.to_string()))
            }
            .boxed()
        },
    )
}

fn to_chrono(published: time::OffsetDateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(published.unix_timestamp(), published.nanosecond())
}
