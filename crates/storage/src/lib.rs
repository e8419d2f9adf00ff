//! Persistence for the automation daemon.
//!
//! - [`ScheduleStorage`]: ticks, evaluation rows and cursors, with an
//!   atomic per-cycle commit; in-memory and JSON-file backends
//! - [`EvaluationStore`]: read-only history queries
//! - [`legacy`]: on-read translation of flat, pre-tree evaluation rows

pub mod backend;
pub mod error;
pub mod legacy;
pub mod query;
pub mod records;
mod state;

pub use backend::{FileScheduleStorage, InMemoryScheduleStorage, ScheduleStorage};
pub use error::PersistenceError;
pub use legacy::{DecisionType, LegacyAssetEvaluation, LegacyRuleEvaluation, LegacyRuleSnapshot};
pub use query::{EvaluationStore, PartitionEvaluation, PartitionNodeStatus, TickQuery};
pub use records::{
    CycleCommit, EvaluationRecord, NewEvaluation, RunRequest, StoredEvaluation, StoredEvaluationBody,
    TickRecord, TickStatus,
};
pub use state::TickFilter;
