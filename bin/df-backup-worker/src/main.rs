//! DocFabric Backup Worker
//!
//! Consumes `backup.requested` events and exports each tenant's documents
//! to its configured webhook receivers. Exactly one worker instance runs a
//! given tenant's backup at a time, enforced by a cluster-wide lock.
//!
//! ## Deployment modes
//!
//! - In-process broker (default): single-node setups and demos. Set
//!   `DF_DEMO_PUBLISH=true` to publish one synthetic backup request per
//!   configured tenant at startup.
//! - Redis coordination: set `DF_REDIS_URL` to share locks across
//!   instances.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use df_bus::{EventBus, EventBusConfig, EventEnvelope, EventHandler, HandlerOutcome, MemoryBroker};
use df_common::{DispatchJob, IntegrationEvent};
use df_context::{EstablishedScope, HandlerScaffold, StaticIdentity};
use df_dispatch::{
    AdmissionController, AdmissionPolicy, DispatchError, DispatchQueueConfig, HttpExecutorConfig,
    HttpJobExecutor, WebhookRequest, WorkerDispatchQueue,
};
use df_lock::{
    CoordinationBackend, DistributedLockProvider, LockProviderConfig, MemoryCoordination,
    RedisCoordination,
};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Request to back up a tenant's documents.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupRequested {
    backup_id: String,
    document_ids: Vec<String>,
}

impl IntegrationEvent for BackupRequested {
    const EVENT_TYPE: &'static str = "backup.requested";
}

struct WorkerConfig {
    service_name: String,
    admission_ceiling: usize,
    dispatch_threads: usize,
    lock_timeout: Duration,
    lease_ttl: Duration,
    receiver_url: String,
    redis_url: Option<String>,
    demo_publish: bool,
    /// `id:name` pairs, comma separated.
    tenants: Vec<(i64, String)>,
}

struct BackupHandler {
    locks: DistributedLockProvider,
    lock_timeout: Duration,
    receiver_url: String,
    dispatch: Arc<WorkerDispatchQueue>,
}

#[async_trait::async_trait]
impl EventHandler for BackupHandler {
    fn name(&self) -> &str {
        "backup"
    }

    fn admission(&self) -> AdmissionPolicy {
        AdmissionPolicy::Gated
    }

    async fn handle(&self, scope: &EstablishedScope, envelope: &EventEnvelope) -> HandlerOutcome {
        let request: BackupRequested = match envelope.decode() {
            Ok(request) => request,
            Err(e) => return HandlerOutcome::Permanent(e.into()),
        };

        // One backup per tenant across the cluster. A miss is not a
        // failure: another instance is already on it, so come back when
        // the broker redelivers.
        let resource = format!("backup:tenant-{}", scope.tenant.tenant_id);
        let lock = match self.locks.acquire(&resource, self.lock_timeout).await {
            Ok(lock) => lock,
            Err(e) => return HandlerOutcome::Transient(e.into()),
        };
        if !lock.acquired() {
            info!(
                resource = %resource,
                backup_id = %request.backup_id,
                "Backup already running elsewhere, deferring"
            );
            return HandlerOutcome::Transient(anyhow::anyhow!("backup lock held elsewhere"));
        }

        info!(
            backup_id = %request.backup_id,
            documents = request.document_ids.len(),
            tenant = %scope.tenant.name,
            principal = %scope.principal.id,
            "Starting tenant backup"
        );

        let mut queued = 0usize;
        for document_id in &request.document_ids {
            let descriptor = WebhookRequest {
                url: self.receiver_url.clone(),
                body: serde_json::json!({
                    "backup_id": request.backup_id,
                    "tenant_id": scope.tenant.tenant_id,
                    "document_id": document_id,
                }),
                auth_token: None,
            };
            let payload = match serde_json::to_value(&descriptor) {
                Ok(payload) => payload,
                Err(e) => {
                    release_quietly(&lock).await;
                    return HandlerOutcome::Permanent(e.into());
                }
            };
            match self.dispatch.enqueue(DispatchJob::new(payload)) {
                Ok(()) => queued += 1,
                Err(DispatchError::QueueFull { depth }) => {
                    // Partial fan-out; redelivery will re-run the whole
                    // idempotent export once the queue drains.
                    warn!(depth = depth, queued = queued, "Dispatch queue full mid-backup");
                    release_quietly(&lock).await;
                    return HandlerOutcome::RejectedBusy;
                }
                Err(e) => {
                    release_quietly(&lock).await;
                    return HandlerOutcome::Transient(e.into());
                }
            }
        }

        release_quietly(&lock).await;
        info!(backup_id = %request.backup_id, queued = queued, "Backup fan-out complete");
        HandlerOutcome::Completed
    }
}

async fn release_quietly(lock: &df_lock::LockHandle) {
    if let Err(e) = lock.release().await {
        warn!(resource = %lock.resource(), error = %e, "Lock release failed; lease will expire");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting DocFabric Backup Worker");
    let config = load_worker_config();

    // 1. Coordination backend: Redis when configured, in-process otherwise.
    let backend: Arc<dyn CoordinationBackend> = match &config.redis_url {
        Some(url) => {
            info!(redis_url = %url, "Using Redis lock coordination");
            Arc::new(RedisCoordination::connect(url).await?)
        }
        None => {
            info!("No DF_REDIS_URL set, using in-process lock coordination");
            Arc::new(MemoryCoordination::new())
        }
    };
    let locks = DistributedLockProvider::with_config(
        backend,
        LockProviderConfig {
            lease_ttl: config.lease_ttl,
            ..Default::default()
        },
    );

    // 2. Webhook dispatch queue.
    let executor = Arc::new(HttpJobExecutor::new(HttpExecutorConfig::default())?);
    let dispatch = Arc::new(WorkerDispatchQueue::new(
        DispatchQueueConfig {
            thread_count: config.dispatch_threads,
            ..Default::default()
        },
        executor,
    ));
    let dispatch_handle = {
        let dispatch = dispatch.clone();
        tokio::spawn(async move { dispatch.run().await })
    };

    // 3. Tenant directory and authenticator.
    let identity = Arc::new(StaticIdentity::new());
    for (tenant_id, name) in &config.tenants {
        identity.add_tenant(*tenant_id, name.clone());
        identity.add_principal(*tenant_id, "svc-backup");
    }

    // 4. Event bus. AMQP when built with the feature and configured,
    // in-process broker otherwise.
    let broker = open_broker().await?;
    let bus = EventBus::new(
        EventBusConfig::default(),
        broker,
        HandlerScaffold::new(config.service_name.clone(), identity.clone(), identity),
        AdmissionController::new(config.admission_ceiling),
    );

    let handler = Arc::new(BackupHandler {
        locks,
        lock_timeout: config.lock_timeout,
        receiver_url: config.receiver_url.clone(),
        dispatch: dispatch.clone(),
    });
    bus.subscribe::<BackupRequested, _>(handler).await?;

    info!(
        service = %config.service_name,
        admission_ceiling = config.admission_ceiling,
        dispatch_threads = config.dispatch_threads,
        tenants = config.tenants.len(),
        receiver_url = %config.receiver_url,
        "Backup worker started. Press Ctrl+C to shutdown."
    );

    if config.demo_publish {
        for (tenant_id, name) in &config.tenants {
            let event = BackupRequested {
                backup_id: format!("demo-{tenant_id}"),
                document_ids: vec!["doc-1".into(), "doc-2".into()],
            };
            let envelope = EventEnvelope::for_event(*tenant_id, "svc-backup", &event)?;
            if let Err(e) = bus.publish(&envelope).await {
                error!(tenant = %name, error = %e, "Demo publish failed");
            }
        }
    }

    shutdown_signal().await;
    info!("Shutdown signal received...");

    bus.shutdown();
    dispatch.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(30), dispatch_handle).await;

    info!("Backup worker shutdown complete");
    Ok(())
}

#[cfg(feature = "amqp")]
async fn open_broker() -> Result<Arc<dyn df_bus::MessageBroker>> {
    match std::env::var("DF_AMQP_URL").ok() {
        Some(url) => {
            info!(amqp_url = %url, "Using AMQP broker");
            let broker = df_bus::amqp::AmqpBroker::connect(df_bus::amqp::AmqpConfig {
                url,
                ..Default::default()
            })
            .await?;
            Ok(Arc::new(broker))
        }
        None => {
            info!("No DF_AMQP_URL set, using in-process broker");
            Ok(Arc::new(MemoryBroker::new()))
        }
    }
}

#[cfg(not(feature = "amqp"))]
async fn open_broker() -> Result<Arc<dyn df_bus::MessageBroker>> {
    info!("Using in-process broker");
    Ok(Arc::new(MemoryBroker::new()))
}

/// Load worker configuration from environment variables.
fn load_worker_config() -> WorkerConfig {
    let service_name =
        std::env::var("DF_SERVICE_NAME").unwrap_or_else(|_| "backup-worker".to_string());

    let admission_ceiling = std::env::var("DF_ADMISSION_CEILING")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);

    let dispatch_threads = std::env::var("DF_DISPATCH_THREADS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8);

    let lock_timeout_secs = std::env::var("DF_LOCK_TIMEOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(10);

    let lease_ttl_secs = std::env::var("DF_LOCK_LEASE_TTL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let receiver_url = std::env::var("DF_RECEIVER_URL")
        .unwrap_or_else(|_| "http://localhost:9090/backup".to_string());

    let redis_url = std::env::var("DF_REDIS_URL").ok();

    let demo_publish = std::env::var("DF_DEMO_PUBLISH")
        .map(|v| v.parse().unwrap_or(false))
        .unwrap_or(false);

    let tenants = std::env::var("DF_TENANTS")
        .unwrap_or_else(|_| "1:default".to_string())
        .split(',')
        .filter_map(|pair| {
            let (id, name) = pair.split_once(':')?;
            Some((id.trim().parse().ok()?, name.trim().to_string()))
        })
        .collect();

    WorkerConfig {
        service_name,
        admission_ceiling,
        dispatch_threads,
        lock_timeout: Duration::from_secs(lock_timeout_secs),
        lease_ttl: Duration::from_secs(lease_ttl_secs),
        receiver_url,
        redis_url,
        demo_publish,
        tenants,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
