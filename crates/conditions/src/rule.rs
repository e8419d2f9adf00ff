//! Leaf predicates of a condition tree.

use serde::{Deserialize, Serialize};

/// The closed set of leaf rules. Every rule is evaluated per partition
/// inside its node's candidate subset; see the evaluator for the exact
/// predicate of each.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Rule {
    /// The partition has never been materialized.
    Missing,
    /// The partition belongs to an in-flight run.
    InProgress,
    /// The partition was requested by the previous evaluation.
    NewlyRequested,
    /// The partition was materialized since the previous evaluation.
    NewlyUpdated,
    /// A parent's matching partition was materialized since the previous evaluation.
    AnyParentsUpdated,
    /// A parent's matching partition has never been materialized.
    AnyParentsMissing,
    /// A cron tick fell between the previous evaluation and now.
    CronTickPassed {
        cron_schedule: String,
        cron_timezone: String,
    },
}

impl Rule {
    pub fn description(&self) -> String {
        match self {
            Rule::Missing => "missing".to_string(),
            Rule::InProgress => "in_progress".to_string(),
            Rule::NewlyRequested => "newly_requested".to_string(),
            Rule::NewlyUpdated => "newly_updated".to_string(),
            Rule::AnyParentsUpdated => "any parents updated".to_string(),
            Rule::AnyParentsMissing => "any parents missing".to_string(),
            Rule::CronTickPassed {
                cron_schedule,
                cron_timezone,
            } => format!("cron_tick_passed(cron_schedule={cron_schedule}, cron_timezone={cron_timezone})"),
        }
    }

    /// Canonical text fed into the structural hash.
    pub(crate) fn identity(&self) -> String {
        match self {
            Rule::Missing => "missing".to_string(),
            Rule::InProgress => "in_progress".to_string(),
            Rule::NewlyRequested => "newly_requested".to_string(),
            Rule::NewlyUpdated => "newly_updated".to_string(),
            Rule::AnyParentsUpdated => "any_parents_updated".to_string(),
            Rule::AnyParentsMissing => "any_parents_missing".to_string(),
            Rule::CronTickPassed {
                cron_schedule,
                cron_timezone,
            } => format!("cron_tick_passed\u{1f}{cron_schedule}\u{1f}{cron_timezone}"),
        }
    }
}
