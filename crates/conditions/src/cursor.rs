use std::collections::BTreeMap;

use automat_core::{AssetKey, PartitionSubset};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Node-kind-specific state carried from one evaluation to the next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "subset", rename_all = "snake_case")]
pub enum NodeCursor {
    /// Partitions currently latched true by a `Since` node.
    Latch(PartitionSubset),
    /// Partitions known to have been materialized at least once.
    Materialized(PartitionSubset),
}

impl NodeCursor {
    pub fn subset(&self) -> &PartitionSubset {
        match self {
            NodeCursor::Latch(s) | NodeCursor::Materialized(s) => s,
        }
    }
}

/// What one evaluation requested for this asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedSubset {
    pub evaluation_id: u64,
    pub subset: PartitionSubset,
}

/// Per-asset state persisted between cycles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetCursor {
    pub asset_key: AssetKey,
    pub latest_evaluation_id: u64,
    pub latest_evaluation_timestamp: DateTime<Utc>,
    /// Instance storage id observed by that evaluation. Materializations
    /// above it have not been seen yet.
    #[serde(default)]
    pub latest_storage_id: u64,
    /// Keyed by condition node `unique_id`.
    #[serde(default)]
    pub node_cursors: BTreeMap<String, NodeCursor>,
    /// Newest last.
    #[serde(default)]
    pub requested_subset_history: Vec<RequestedSubset>,
}

impl AssetCursor {
    pub fn node_cursor(&self, unique_id: &str) -> Option<&NodeCursor> {
        self.node_cursors.get(unique_id)
    }

    /// Subset requested by the evaluation this cursor was produced by.
    pub fn latest_requested(&self) -> Option<&PartitionSubset> {
        self.requested_subset_history
            .last()
            .filter(|r| r.evaluation_id == self.latest_evaluation_id)
            .map(|r| &r.subset)
    }

    /// Record the subset requested at `latest_evaluation_id`, keeping at most
    /// `max_len` entries.
    pub fn record_requested(&mut self, subset: PartitionSubset, max_len: usize) {
        let evaluation_id = self.latest_evaluation_id;
        self.requested_subset_history
            .retain(|r| r.evaluation_id != evaluation_id);
        self.requested_subset_history.push(RequestedSubset {
            evaluation_id,
            subset,
        });
        let excess = self.requested_subset_history.len().saturating_sub(max_len.max(1));
        self.requested_subset_history.drain(..excess);
    }
}
