//! Per-delivery execution scaffold.
//!
//! Integration events cross process boundaries, so nothing about the
//! producer's session survives to the consumer. Before any handler logic
//! runs, the scaffold re-establishes everything from the envelope's claims:
//! a tracing scope tagged with the event identity and consuming service,
//! the tenant scope, and an authenticated principal derived purely from
//! `(tenant_id, principal_id)`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use df_common::EventEnvelope;
use tracing::Instrument;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("tenant {0} not found")]
    TenantNotFound(i64),

    #[error("principal '{principal}' could not be authenticated in tenant {tenant}")]
    Unauthenticated { tenant: i64, principal: String },

    #[error("tenant/identity service unavailable: {0}")]
    Unavailable(String),
}

/// Tenant scope an event executes under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantScope {
    pub tenant_id: i64,
    pub name: String,
}

/// A principal authenticated from message claims, with no cookie or session
/// state involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub tenant_id: i64,
}

/// Tenant-resolution boundary. A missing tenant is a typed error, never a
/// silent fallback.
#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn tenant_by_id(&self, tenant_id: i64) -> Result<TenantScope, ContextError>;
}

/// Claims-based authentication boundary: a pure function from
/// `(tenant_id, principal_id)` to an authenticated principal or a typed
/// error.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        tenant_id: i64,
        principal_id: &str,
    ) -> Result<Principal, ContextError>;
}

/// Everything a handler needs, established and validated.
#[derive(Debug)]
pub struct EstablishedScope {
    pub tenant: TenantScope,
    pub principal: Principal,
    /// Logging scope for the delivery; all handler logs should run inside
    /// it so cross-service correlation by event id works.
    pub span: tracing::Span,
}

/// Builds an [`EstablishedScope`] for each delivery attempt.
pub struct HandlerScaffold {
    service: String,
    tenants: Arc<dyn TenantDirectory>,
    authenticator: Arc<dyn Authenticator>,
}

impl HandlerScaffold {
    pub fn new(
        service: impl Into<String>,
        tenants: Arc<dyn TenantDirectory>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            service: service.into(),
            tenants,
            authenticator,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Establish tenant scope and principal for this delivery attempt.
    ///
    /// Failure here is a poison-message condition for the attempt: the
    /// caller must leave the message unacknowledged so the broker
    /// redelivers it. Transient outages (directory unavailable) and
    /// permanent conditions (tenant deleted) are indistinguishable at this
    /// layer and both surface as errors.
    pub async fn establish(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<EstablishedScope, ContextError> {
        let span = tracing::info_span!(
            "event_delivery",
            service = %self.service,
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            tenant_id = envelope.tenant_id,
            redelivered = envelope.redelivered,
        );

        let tenants = self.tenants.clone();
        let authenticator = self.authenticator.clone();
        let tenant_id = envelope.tenant_id;
        let principal_id = envelope.created_by.clone();

        async move {
            let tenant = tenants.tenant_by_id(tenant_id).await?;
            let principal = authenticator.authenticate(tenant_id, &principal_id).await?;
            Ok((tenant, principal))
        }
        .instrument(span.clone())
        .await
        .map(|(tenant, principal)| EstablishedScope {
            tenant,
            principal,
            span,
        })
    }
}

/// In-memory tenant/identity store for tests and single-process setups.
#[derive(Default)]
pub struct StaticIdentity {
    tenants: parking_lot::RwLock<HashMap<i64, String>>,
    principals: parking_lot::RwLock<HashSet<(i64, String)>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tenant(&self, tenant_id: i64, name: impl Into<String>) -> &Self {
        self.tenants.write().insert(tenant_id, name.into());
        self
    }

    pub fn add_principal(&self, tenant_id: i64, principal_id: impl Into<String>) -> &Self {
        self.principals
            .write()
            .insert((tenant_id, principal_id.into()));
        self
    }
}

#[async_trait]
impl TenantDirectory for StaticIdentity {
    async fn tenant_by_id(&self, tenant_id: i64) -> Result<TenantScope, ContextError> {
        self.tenants
            .read()
            .get(&tenant_id)
            .map(|name| TenantScope {
                tenant_id,
                name: name.clone(),
            })
            .ok_or(ContextError::TenantNotFound(tenant_id))
    }
}

#[async_trait]
impl Authenticator for StaticIdentity {
    async fn authenticate(
        &self,
        tenant_id: i64,
        principal_id: &str,
    ) -> Result<Principal, ContextError> {
        if self
            .principals
            .read()
            .contains(&(tenant_id, principal_id.to_string()))
        {
            Ok(Principal {
                id: principal_id.to_string(),
                tenant_id,
            })
        } else {
            Err(ContextError::Unauthenticated {
                tenant: tenant_id,
                principal: principal_id.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use df_common::IntegrationEvent;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping;
    impl IntegrationEvent for Ping {
        const EVENT_TYPE: &'static str = "test.ping";
    }

    fn scaffold_with(identity: Arc<StaticIdentity>) -> HandlerScaffold {
        HandlerScaffold::new("test-service", identity.clone(), identity)
    }

    #[tokio::test]
    async fn establishes_tenant_and_principal_from_claims() {
        let identity = Arc::new(StaticIdentity::new());
        identity.add_tenant(7, "acme").add_principal(7, "user-1");

        let envelope = EventEnvelope::for_event(7, "user-1", &Ping).unwrap();
        let scope = scaffold_with(identity).establish(&envelope).await.unwrap();

        assert_eq!(scope.tenant.tenant_id, 7);
        assert_eq!(scope.tenant.name, "acme");
        assert_eq!(scope.principal.id, "user-1");
    }

    #[tokio::test]
    async fn missing_tenant_is_a_typed_error() {
        let identity = Arc::new(StaticIdentity::new());
        let envelope = EventEnvelope::for_event(42, "user-1", &Ping).unwrap();

        let err = scaffold_with(identity).establish(&envelope).await.unwrap_err();
        assert!(matches!(err, ContextError::TenantNotFound(42)));
    }

    #[tokio::test]
    async fn unknown_principal_is_never_anonymous() {
        let identity = Arc::new(StaticIdentity::new());
        identity.add_tenant(7, "acme");

        let envelope = EventEnvelope::for_event(7, "ghost", &Ping).unwrap();
        let err = scaffold_with(identity).establish(&envelope).await.unwrap_err();
        assert!(matches!(err, ContextError::Unauthenticated { .. }));
    }
}
