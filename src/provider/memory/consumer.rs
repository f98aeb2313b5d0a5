//! Push and pull handles over the in-memory broker state

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::state::{BrokerState, ConsumerKey, Next};
use crate::error::{EventError, Result};
use crate::provider::{Delivery, DeliveryInfo, DeliveryStream, PullConsumer};

/// Shared binding of one durable consumer
#[derive(Clone)]
pub(super) struct Binding {
    pub state: Arc<Mutex<BrokerState>>,
    pub available: Arc<AtomicBool>,
    pub key: ConsumerKey,
    pub generation: u64,
    pub notify: Arc<Notify>,
}

enum Poll {
    Delivery(Delivery),
    Wait(Option<Instant>),
    Closed,
}

impl Binding {
    async fn poll(&self) -> Result<Poll> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(EventError::BrokerUnavailable(
                "memory broker is unavailable".to_string(),
            ));
        }
        let next = self
            .state
            .lock()
            .await
            .next(&self.key, self.generation, Instant::now());
        Ok(match next {
            Next::Ready(info, data, ack_wait) => Poll::Delivery(self.delivery(info, data, ack_wait)),
            Next::Wait(wake) => Poll::Wait(wake),
            Next::Closed => Poll::Closed,
        })
    }

    fn delivery(&self, info: DeliveryInfo, data: Bytes, ack_wait: Duration) -> Delivery {
        let seq = info.stream_sequence;
        let ack_binding = self.clone();
        let nak_binding = self.clone();
        Delivery::new(
            info,
            data,
            move || {
                async move {
                    ack_binding
                        .state
                        .lock()
                        .await
                        .ack(&ack_binding.key, ack_binding.generation, seq)
                }
                .boxed()
            },
            move || {
                async move {
                    nak_binding.state.lock().await.nak(
                        &nak_binding.key,
                        nak_binding.generation,
                        seq,
                        ack_wait,
                        Instant::now(),
                    )
                }
                .boxed()
            },
        )
    }

    /// Wait for the next delivery, giving up at `until`
    async fn wait_next(&self, until: Option<Instant>) -> Result<Option<Delivery>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake = match self.poll().await? {
                Poll::Delivery(delivery) => return Ok(Some(delivery)),
                Poll::Closed => return Ok(None),
                Poll::Wait(wake) => wake,
            };

            let wake = match (wake, until) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match wake {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }

            if until.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(None);
            }
        }
    }
}

/// Push delivery stream of a memory consumer
pub struct MemoryDeliveryStream {
    binding: Binding,
}

impl MemoryDeliveryStream {
    pub(super) fn new(binding: Binding) -> Self {
        Self { binding }
    }
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        self.binding.wait_next(None).await
    }
}

/// Pull handle of a memory consumer
pub struct MemoryPullConsumer {
    binding: Binding,
}

impl MemoryPullConsumer {
    pub(super) fn new(binding: Binding) -> Self {
        Self { binding }
    }
}

#[async_trait]
impl PullConsumer for MemoryPullConsumer {
    /// Returns as soon as at least one message is available
    async fn fetch(&self, max: usize, expires: Duration) -> Result<Vec<Delivery>> {
        let mut batch = Vec::new();
        let deadline = Instant::now() + expires;

        match self.binding.wait_next(Some(deadline)).await? {
            Some(first) => batch.push(first),
            None => return Ok(batch),
        }

        while batch.len() < max {
            match self.binding.poll().await? {
                Poll::Delivery(delivery) => batch.push(delivery),
                Poll::Wait(_) | Poll::Closed => break,
            }
        }
        Ok(batch)
    }
}
