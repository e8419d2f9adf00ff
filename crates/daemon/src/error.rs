use automat_core::SubsetError;
use automat_storage::PersistenceError;

/// Error type for daemon cycles and definition loading.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("Persistence failed: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Another cycle is already running")]
    CycleInProgress,
    #[error("Cycle for tick {tick_id} cancelled")]
    Cancelled { tick_id: u64 },
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Run request grouping failed: {0}")]
    Subset(#[from] SubsetError),
    #[error("Duplicate asset definition: {0}")]
    DuplicateAsset(String),
    #[error("Invalid definitions: {0}")]
    Definitions(String),
}

/// Error raised by a [`RunRequestSink`](crate::RunRequestSink).
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Run {run_id} rejected: {reason}")]
    Rejected { run_id: String, reason: String },
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}
