//! Tenant context propagation
//!
//! Workers run detached from the request that published an event, so the
//! tenant scope and acting user are rebuilt from the envelope before the
//! handler runs. Downstream repositories ask the [`ProcessingContext`] for
//! the tenant and acquire tenant-scoped connections through
//! [`TenantConnections`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{EventError, Result};
use crate::types::Envelope;

/// Tenant scope and actor identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TenantContext {
    resource_path: String,
    user_id: Option<String>,
    trace_id: Option<String>,
}

impl TenantContext {
    pub fn new(resource_path: impl Into<String>) -> Self {
        Self {
            resource_path: resource_path.into(),
            user_id: None,
            trace_id: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Identity carried by a delivered envelope
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            resource_path: envelope.tenant_id.clone(),
            user_id: envelope.acting_user_id.clone(),
            trace_id: envelope.trace_id.clone(),
        }
    }

    pub fn resource_path(&self) -> &str {
        &self.resource_path
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Resource path, failing when the context carries no tenant
    pub fn require_tenant(&self) -> Result<&str> {
        if self.resource_path.is_empty() {
            Err(EventError::MissingTenant)
        } else {
            Ok(&self.resource_path)
        }
    }
}

/// Anything that belongs to exactly one tenant
pub trait TenantScoped {
    fn tenant(&self) -> &TenantContext;
}

impl TenantScoped for TenantContext {
    fn tenant(&self) -> &TenantContext {
        self
    }
}

/// Context handed to a handler for one delivered message
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    tenant: TenantContext,
    subject: String,
    durable: String,
    delivery_attempt: u64,
    message_id: Option<String>,
    deadline: Instant,
}

impl ProcessingContext {
    /// Build the context for an envelope with a deadline starting now
    pub fn from_envelope(envelope: &Envelope, durable: &str, deadline: Duration) -> Self {
        Self {
            tenant: TenantContext::from_envelope(envelope),
            subject: envelope.subject.clone(),
            durable: durable.to_string(),
            delivery_attempt: envelope.delivery_attempt,
            message_id: envelope.message_id.clone(),
            deadline: Instant::now() + deadline,
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn durable(&self) -> &str {
        &self.durable
    }

    pub fn delivery_attempt(&self) -> u64 {
        self.delivery_attempt
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }
}

impl TenantScoped for ProcessingContext {
    fn tenant(&self) -> &TenantContext {
        &self.tenant
    }
}

/// Source of tenant-scoped connections
///
/// Implemented by the service's database pool. Each call resolves the
/// connection for the tenant carried by the context.
#[async_trait]
pub trait TenantConnections: Send + Sync {
    type Connection: Send + Sync;

    async fn acquire(&self, tenant: &TenantContext) -> Result<Self::Connection>;
}

/// In-process tenant connection map
///
/// Creates one connection per resource path on first use and hands out the
/// same shared connection afterwards.
pub struct TenantConnectionMap<C> {
    connections: Mutex<HashMap<String, Arc<C>>>,
    factory: Box<dyn Fn(&str) -> Result<C> + Send + Sync>,
}

impl<C> TenantConnectionMap<C> {
    pub fn new(factory: impl Fn(&str) -> Result<C> + Send + Sync + 'static) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            factory: Box::new(factory),
        }
    }

    /// Number of tenants with an open connection
    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }
}

#[async_trait]
impl<C: Send + Sync + 'static> TenantConnections for TenantConnectionMap<C> {
    type Connection = Arc<C>;

    async fn acquire(&self, tenant: &TenantContext) -> Result<Arc<C>> {
        let resource_path = tenant.require_tenant()?;
        let mut connections = self.connections.lock().await;

        if let Some(conn) = connections.get(resource_path) {
            return Ok(conn.clone());
        }

        let conn = Arc::new((self.factory)(resource_path)?);
        connections.insert(resource_path.to_string(), conn.clone());
        tracing::debug!(resource_path = %resource_path, "Tenant connection opened");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[derive(Debug, PartialEq)]
    struct FakeConn {
        tenant: String,
    }

    fn envelope(tenant: &str, user: Option<&str>) -> Envelope {
        Envelope {
            subject: "StudentPackageV2.Upserted".to_string(),
            payload: Bytes::from_static(b"{}"),
            tenant_id: tenant.to_string(),
            acting_user_id: user.map(str::to_string),
            delivery_attempt: 2,
            stream_sequence: 7,
            message_id: Some("msg-1".to_string()),
            published_at: None,
            trace_id: Some("trace-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_context_from_envelope() {
        let ctx = ProcessingContext::from_envelope(
            &envelope("tenant-a", Some("user-1")),
            "durable-student-package-v2",
            Duration::from_secs(30),
        );

        assert_eq!(ctx.tenant().resource_path(), "tenant-a");
        assert_eq!(ctx.tenant().user_id(), Some("user-1"));
        assert_eq!(ctx.tenant().trace_id(), Some("trace-1"));
        assert_eq!(ctx.delivery_attempt(), 2);
        assert_eq!(ctx.message_id(), Some("msg-1"));
        assert_eq!(ctx.durable(), "durable-student-package-v2");
        assert!(!ctx.is_expired());
        assert!(ctx.remaining() <= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_deadline_expires() {
        let ctx = ProcessingContext::from_envelope(
            &envelope("tenant-a", None),
            "d",
            Duration::from_secs(5),
        );
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_tenants_get_disjoint_connections() {
        let pool = TenantConnectionMap::new(|tenant| {
            Ok(FakeConn {
                tenant: tenant.to_string(),
            })
        });

        let a = ProcessingContext::from_envelope(&envelope("tenant-a", None), "d", Duration::from_secs(5));
        let b = ProcessingContext::from_envelope(&envelope("tenant-b", None), "d", Duration::from_secs(5));
        let a_again = ProcessingContext::from_envelope(&envelope("tenant-a", None), "d", Duration::from_secs(5));

        let conn_a = pool.acquire(a.tenant()).await.unwrap();
        let conn_b = pool.acquire(b.tenant()).await.unwrap();
        let conn_a2 = pool.acquire(a_again.tenant()).await.unwrap();

        assert_eq!(conn_a.tenant, "tenant-a");
        assert_eq!(conn_b.tenant, "tenant-b");
        assert!(!Arc::ptr_eq(&conn_a, &conn_b));
        assert!(Arc::ptr_eq(&conn_a, &conn_a2));
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_missing_tenant_is_rejected() {
        let pool = TenantConnectionMap::new(|tenant| {
            Ok(FakeConn {
                tenant: tenant.to_string(),
            })
        });
        let ctx = ProcessingContext::from_envelope(&envelope("", None), "d", Duration::from_secs(5));

        let err = pool.acquire(ctx.tenant()).await.unwrap_err();
        assert!(matches!(err, EventError::MissingTenant));
        assert!(pool.is_empty().await);
    }
}
