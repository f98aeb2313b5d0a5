//! Handler capabilities invoked by the subscription workers
//!
//! A push handler returns `Ok(())` when the message is done, or a
//! [`HandlerError`] that says whether the broker should redeliver it.
//! Batch handlers receive a slice of [`BatchMessage`]s and ack each one
//! themselves.

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;

use crate::context::ProcessingContext;
use crate::error::{EventError, Result};
use crate::provider::Delivery;
use crate::types::Envelope;

/// Boxed error returned from business code
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by a handler
#[derive(Debug, Error)]
#[error("{source}")]
pub struct HandlerError {
    redeliver: bool,
    source: BoxError,
}

impl HandlerError {
    /// Retryable failure; the message will be redelivered
    pub fn retry(source: impl Into<BoxError>) -> Self {
        Self {
            redeliver: true,
            source: source.into(),
        }
    }

    /// Permanent failure; the message is acknowledged and dropped
    pub fn skip(source: impl Into<BoxError>) -> Self {
        Self {
            redeliver: false,
            source: source.into(),
        }
    }

    pub fn should_redeliver(&self) -> bool {
        self.redeliver
    }

    pub fn into_source(self) -> BoxError {
        self.source
    }
}

impl From<EventError> for HandlerError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::Decode(_) | EventError::Serialization(_) | EventError::MissingTenant => {
                Self::skip(err)
            }
            other => Self::retry(other),
        }
    }
}

/// Handles one pushed message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &ProcessingContext,
        payload: &[u8],
    ) -> std::result::Result<(), HandlerError>;
}

/// Handler built from an async closure
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`MessageHandler`]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ProcessingContext, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ProcessingContext, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(
        &self,
        ctx: &ProcessingContext,
        payload: &[u8],
    ) -> std::result::Result<(), HandlerError> {
        (self.f)(ctx.clone(), Bytes::copy_from_slice(payload)).await
    }
}

/// Business capability consuming one decoded event type
#[async_trait]
pub trait EventHandler<T>: Send + Sync {
    async fn handle_event(
        &self,
        ctx: &ProcessingContext,
        event: T,
    ) -> std::result::Result<(), HandlerError>;
}

/// Adapter decoding JSON payloads for an [`EventHandler`]
///
/// Payloads that fail to decode are poison messages and are skipped.
pub struct Json<H, T> {
    inner: H,
    _event: PhantomData<fn() -> T>,
}

impl<H, T> Json<H, T> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _event: PhantomData,
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H, T> MessageHandler for Json<H, T>
where
    H: EventHandler<T>,
    T: DeserializeOwned + Send + 'static,
{
    async fn handle(
        &self,
        ctx: &ProcessingContext,
        payload: &[u8],
    ) -> std::result::Result<(), HandlerError> {
        let event: T = serde_json::from_slice(payload).map_err(HandlerError::skip)?;
        self.inner.handle_event(ctx, event).await
    }
}

/// One message inside a pulled batch
pub struct BatchMessage {
    envelope: Envelope,
    delivery: Option<Delivery>,
}

impl BatchMessage {
    pub(crate) fn new(envelope: Envelope, delivery: Delivery) -> Self {
        Self {
            envelope,
            delivery: Some(delivery),
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn payload(&self) -> &[u8] {
        &self.envelope.payload
    }

    /// Whether the message was already acked or nak'd
    pub fn is_settled(&self) -> bool {
        self.delivery.is_none()
    }

    /// Acknowledge; a second call is a no-op
    pub async fn ack(&mut self) -> Result<()> {
        match self.delivery.take() {
            Some(delivery) => delivery.ack().await,
            None => Ok(()),
        }
    }

    /// Request redelivery; a no-op once settled
    pub async fn nak(&mut self) -> Result<()> {
        match self.delivery.take() {
            Some(delivery) => delivery.nak().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for BatchMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchMessage")
            .field("subject", &self.envelope.subject)
            .field("sequence", &self.envelope.stream_sequence)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Handles a batch of pulled messages
///
/// Returning `Ok` lets the worker ack every message the handler left
/// unsettled. Returning `Err` leaves unsettled messages pending so the
/// broker redelivers them after the ack wait.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(
        &self,
        messages: &mut [BatchMessage],
    ) -> std::result::Result<(), HandlerError>;
}
