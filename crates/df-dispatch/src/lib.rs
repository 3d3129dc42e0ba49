//! Work acceptance and execution for DocFabric background services:
//! instance-local admission control, the bounded-concurrency worker
//! dispatch queue, and the HTTP webhook executor.

pub mod admission;
pub mod queue;
pub mod webhook;

pub use admission::{AdmissionController, AdmissionDecision, AdmissionPermit, AdmissionPolicy};
pub use queue::{
    DispatchQueueConfig, JobError, JobExecutor, QueueStats, WorkerDispatchQueue,
};
pub use webhook::{HttpExecutorConfig, HttpJobExecutor, WebhookRequest};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatch queue full at depth {depth}")]
    QueueFull { depth: usize },

    #[error("shutdown in progress")]
    ShutdownInProgress,

    #[error("executor setup error: {0}")]
    Executor(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
