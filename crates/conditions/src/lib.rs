//! Declarative automation conditions and their evaluation.
//!
//! - [`AutomationCondition`]: immutable, content-addressed condition trees
//! - [`evaluate_asset`]: one evaluation pass producing an [`EvaluationTree`]
//!   and the next [`AssetCursor`]
//! - [`InstanceState`]: read access to materialization and run history

pub mod condition;
mod cron;
pub mod cursor;
pub mod error;
pub mod evaluation;
pub mod evaluator;
pub mod instance;
pub mod rule;

pub use condition::{AutomationCondition, ConditionKind, ConditionSnapshot};
pub use cursor::{AssetCursor, NodeCursor, RequestedSubset};
pub use error::{ConditionEvaluationError, InstanceError};
pub use evaluation::{EvaluationNode, EvaluationTree, NodeKind, NodeStatus, SubsetWithMetadata};
pub use evaluator::{evaluate_asset, evaluate_without_cursor, AssetEvaluation};
pub use instance::{InMemoryInstance, InstanceSnapshot, InstanceState};
pub use rule::Rule;
