//! Output shape of one evaluation pass.

use std::collections::BTreeMap;
use std::fmt;

use automat_core::PartitionSubset;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cursor::NodeCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Rule,
    And,
    Or,
    Not,
    Since,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    True,
    False,
    /// The partition (or every partition) was outside the node's candidates.
    Skipped,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::True => "TRUE",
            NodeStatus::False => "FALSE",
            NodeStatus::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

/// A subset of partitions sharing the same metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubsetWithMetadata {
    pub subset: PartitionSubset,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Result of evaluating one condition node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationNode {
    pub unique_id: String,
    pub node_kind: NodeKind,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_label: Option<String>,
    pub true_subset: PartitionSubset,
    pub candidate_subset: PartitionSubset,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    #[serde(default)]
    pub child_unique_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_state: Option<NodeCursor>,
    #[serde(default)]
    pub subsets_with_metadata: Vec<SubsetWithMetadata>,
}

impl EvaluationNode {
    /// Status of the node as a whole.
    pub fn status(&self) -> NodeStatus {
        if self.candidate_subset.is_empty() {
            NodeStatus::Skipped
        } else if self.true_subset.is_empty() {
            NodeStatus::False
        } else {
            NodeStatus::True
        }
    }

    /// Status for one partition, answered by membership only so sentinel
    /// subsets are never enumerated.
    pub fn status_for_partition(&self, partition_key: &str) -> NodeStatus {
        if !self.candidate_subset.contains(partition_key) {
            NodeStatus::Skipped
        } else if self.true_subset.contains(partition_key) {
            NodeStatus::True
        } else {
            NodeStatus::False
        }
    }
}

/// Pre-order list of evaluation nodes; the first node is the root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationTree {
    pub root_unique_id: String,
    pub nodes: Vec<EvaluationNode>,
}

impl EvaluationTree {
    pub fn root(&self) -> Option<&EvaluationNode> {
        self.nodes.first()
    }

    /// First node with `unique_id`. Structurally identical subtrees share an
    /// id, so later duplicates are only reachable by position.
    pub fn node(&self, unique_id: &str) -> Option<&EvaluationNode> {
        self.nodes.iter().find(|n| n.unique_id == unique_id)
    }

    pub fn root_true_subset(&self) -> Option<&PartitionSubset> {
        self.root().map(|n| &n.true_subset)
    }

    /// Per-node status of one partition, in tree order.
    pub fn statuses_for_partition(&self, partition_key: &str) -> Vec<(String, NodeStatus)> {
        self.nodes
            .iter()
            .map(|n| (n.unique_id.clone(), n.status_for_partition(partition_key)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(true_subset: PartitionSubset, candidate_subset: PartitionSubset) -> EvaluationNode {
        let now = Utc::now();
        EvaluationNode {
            unique_id: "n".into(),
            node_kind: NodeKind::Rule,
            description: "missing".into(),
            user_label: None,
            true_subset,
            candidate_subset,
            start_timestamp: now,
            end_timestamp: now,
            child_unique_ids: Vec::new(),
            extra_state: None,
            subsets_with_metadata: Vec::new(),
        }
    }

    #[test]
    fn partition_status_from_membership() {
        let n = node(
            PartitionSubset::from_keys(["a"]),
            PartitionSubset::from_keys(["a", "b"]),
        );
        assert_eq!(n.status_for_partition("a"), NodeStatus::True);
        assert_eq!(n.status_for_partition("b"), NodeStatus::False);
        assert_eq!(n.status_for_partition("c"), NodeStatus::Skipped);
        assert_eq!(n.status(), NodeStatus::True);
    }

    #[test]
    fn empty_candidate_is_skipped_not_false() {
        let n = node(PartitionSubset::empty_partitioned(), PartitionSubset::empty_partitioned());
        assert_eq!(n.status(), NodeStatus::Skipped);
        let u = node(PartitionSubset::unpartitioned(false), PartitionSubset::unpartitioned(true));
        assert_eq!(u.status(), NodeStatus::False);
    }

    #[test]
    fn sentinel_candidate_answers_without_enumeration() {
        let n = node(PartitionSubset::empty_partitioned(), PartitionSubset::AllPartitions);
        assert_eq!(n.status_for_partition("2020-01-01"), NodeStatus::False);
        assert_eq!(n.status().to_string(), "FALSE");
    }
}
