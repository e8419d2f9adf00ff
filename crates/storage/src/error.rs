use thiserror::Error;

/// Errors produced by schedule storage backends.
///
/// Any of these during a cycle commit fails the whole cycle: no cursor
/// advances and the tick is finalized as FAILURE.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Tick {0} not found")]
    TickNotFound(u64),

    #[error("Tick {0} is already finalized")]
    TickAlreadyFinalized(u64),

    #[error("Tick {0} cannot be finalized with a non-terminal status")]
    NotTerminal(u64),

    #[error("Evaluation row {id} is unreadable: {reason}")]
    CorruptRecord { id: u64, reason: String },

    #[error("Injected failure: {0}")]
    Injected(String),
}
