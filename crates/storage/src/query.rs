//! Read-only query surface over committed history.
//!
//! Every method returns plain owned data; nothing here holds a reference
//! into live cursor or tree objects.

use std::borrow::Cow;

use automat_conditions::{EvaluationNode, NodeStatus};
use automat_core::AssetKey;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::backend::ScheduleStorage;
use crate::error::PersistenceError;
use crate::legacy::translate_legacy_for_partition;
use crate::records::{EvaluationRecord, StoredEvaluation, StoredEvaluationBody, TickRecord, TickStatus};
use crate::state::TickFilter;

/// Tick history query, relative to a reference time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickQuery {
    /// Window length in days ending `day_offset` days before now.
    #[serde(default)]
    pub day_range: Option<u32>,
    /// Days to shift the window back from now.
    #[serde(default)]
    pub day_offset: Option<u32>,
    #[serde(default)]
    pub statuses: Option<Vec<TickStatus>>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Tick id returned by a previous page.
    #[serde(default)]
    pub cursor: Option<u64>,
    #[serde(default)]
    pub before_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub after_timestamp: Option<DateTime<Utc>>,
}

impl TickQuery {
    /// Resolve relative bounds against `now`. Explicit timestamps win.
    pub fn to_filter(&self, now: DateTime<Utc>) -> TickFilter {
        let offset = i64::from(self.day_offset.unwrap_or(0));
        let after = self
            .day_range
            .map(|range| now - Duration::days(offset + i64::from(range)));
        let before = self.day_offset.map(|_| now - Duration::days(offset));
        TickFilter {
            after: self.after_timestamp.or(after),
            before: self.before_timestamp.or(before),
            statuses: self.statuses.clone(),
            limit: self.limit,
            cursor: self.cursor,
        }
    }
}

/// One node's verdict for a single partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionNodeStatus {
    pub unique_id: String,
    pub description: String,
    pub user_label: Option<String>,
    pub status: NodeStatus,
    pub child_unique_ids: Vec<String>,
}

/// Reconstructed per-node verdicts of one partition in one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionEvaluation {
    pub asset_key: AssetKey,
    pub partition_key: String,
    pub evaluation_id: u64,
    pub is_legacy: bool,
    pub root_unique_id: String,
    pub nodes: Vec<PartitionNodeStatus>,
}

/// Query facade over any [`ScheduleStorage`].
pub struct EvaluationStore<'a> {
    storage: &'a dyn ScheduleStorage,
}

/// Translate a page of rows, dropping the ones that cannot be read.
fn readable(rows: Vec<StoredEvaluation>) -> Vec<EvaluationRecord> {
    rows.iter()
        .filter_map(|row| match row.to_record() {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(row_id = row.id, asset = %row.asset_key, error = %e, "Skipping unreadable evaluation row");
                None
            }
        })
        .collect()
}

impl<'a> EvaluationStore<'a> {
    pub fn new(storage: &'a dyn ScheduleStorage) -> Self {
        Self { storage }
    }

    /// Records for `asset`, newest first. `cursor` is the `id` of the last
    /// record of the previous page. Rows that cannot be translated are
    /// logged and left out of the page.
    pub fn get_by_asset(
        &self,
        asset: &AssetKey,
        limit: usize,
        cursor: Option<u64>,
    ) -> Result<Vec<EvaluationRecord>, PersistenceError> {
        Ok(readable(self.storage.get_evaluations_for_asset(asset, limit, cursor)?))
    }

    /// Every asset's record from one cycle.
    pub fn get_by_evaluation_id(&self, evaluation_id: u64) -> Result<Vec<EvaluationRecord>, PersistenceError> {
        Ok(readable(self.storage.get_evaluations_by_evaluation_id(evaluation_id)?))
    }

    /// Per-node status of one partition, answered by subset membership so
    /// no key set is ever enumerated.
    pub fn get_for_partition(
        &self,
        asset: &AssetKey,
        partition_key: &str,
        evaluation_id: u64,
    ) -> Result<Option<PartitionEvaluation>, PersistenceError> {
        let Some(row) = self.storage.get_evaluation(asset, evaluation_id)? else {
            return Ok(None);
        };
        // Tree rows are read in place; legacy rows are narrowed to the key.
        let (root_unique_id, nodes): (String, Cow<'_, [EvaluationNode]>) = match &row.body {
            StoredEvaluationBody::Tree { tree, .. } => (tree.root_unique_id.clone(), Cow::Borrowed(tree.nodes.as_slice())),
            StoredEvaluationBody::Legacy { evaluation } => {
                let tree = translate_legacy_for_partition(evaluation, partition_key, row.timestamp).map_err(|e| {
                    PersistenceError::CorruptRecord {
                        id: row.id,
                        reason: e.to_string(),
                    }
                })?;
                (tree.root_unique_id, Cow::Owned(tree.nodes))
            }
        };
        let nodes = nodes
            .iter()
            .map(|node| PartitionNodeStatus {
                unique_id: node.unique_id.clone(),
                description: node.description.clone(),
                user_label: node.user_label.clone(),
                status: node.status_for_partition(partition_key),
                child_unique_ids: node.child_unique_ids.clone(),
            })
            .collect();
        Ok(Some(PartitionEvaluation {
            is_legacy: row.is_legacy(),
            asset_key: row.asset_key,
            partition_key: partition_key.to_string(),
            evaluation_id: row.evaluation_id,
            root_unique_id,
            nodes,
        }))
    }

    pub fn get_ticks(&self, query: &TickQuery, now: DateTime<Utc>) -> Result<Vec<TickRecord>, PersistenceError> {
        self.storage.get_ticks(&query.to_filter(now))
    }
}
