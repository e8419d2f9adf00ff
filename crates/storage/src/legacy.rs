//! Read-side adapter for flat, pre-tree evaluation rows.
//!
//! Old rows list rule snapshots and, per rule evaluation, the partitions it
//! applied to. On read they become a fixed-shape tree:
//!
//! ```text
//! All of                      true = materialize ∩ not-skip [∩ not-discard]
//! ├── Any of   (materialize rules)
//! ├── Not      candidate = materialize.true
//! │   └── Any of (skip rules)
//! └── Not      only when discard rules exist
//!     └── Any of (discard rules)
//! ```
//!
//! Old rows never recorded exact candidates, so partitioned rows use the
//! all-partitions sentinel as candidate of every rule group. Arithmetic the
//! sentinel cannot answer (everything minus a concrete key set) keeps the
//! left operand and notes the degradation on the node. Lookups of a single
//! partition narrow every stored subset to that key first and stay exact.
//! Nothing in this crate ever writes this format.

use std::collections::{BTreeMap, BTreeSet};

use automat_conditions::{EvaluationNode, EvaluationTree, NodeKind, SubsetWithMetadata};
use automat_core::{AssetKey, PartitionSubset, SubsetError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    Materialize,
    Skip,
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LegacyRuleSnapshot {
    pub class_name: String,
    pub description: String,
    pub decision_type: DecisionType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyRuleEvaluation {
    pub rule_snapshot: LegacyRuleSnapshot,
    #[serde(default)]
    pub evaluation_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyAssetEvaluation {
    pub asset_key: AssetKey,
    #[serde(default)]
    pub num_requested: usize,
    #[serde(default)]
    pub num_skipped: usize,
    #[serde(default)]
    pub num_discarded: usize,
    /// `None` subsets mean the rule applied to the asset as a whole.
    #[serde(default)]
    pub partition_subsets_by_condition: Vec<(LegacyRuleEvaluation, Option<PartitionSubset>)>,
    #[serde(default)]
    pub rule_snapshots: Option<Vec<LegacyRuleSnapshot>>,
    #[serde(default)]
    pub run_ids: BTreeSet<String>,
}

fn legacy_id(tag: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"legacy");
    hasher.update([0x1e]);
    hasher.update(tag.as_bytes());
    for part in parts {
        hasher.update([0x1e]);
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    format!("{digest:x}")
}

struct Builder {
    timestamp: DateTime<Utc>,
    nodes: Vec<EvaluationNode>,
}

impl Builder {
    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        unique_id: String,
        node_kind: NodeKind,
        description: &str,
        true_subset: PartitionSubset,
        candidate_subset: PartitionSubset,
        child_unique_ids: Vec<String>,
        subsets_with_metadata: Vec<SubsetWithMetadata>,
    ) {
        self.nodes.push(EvaluationNode {
            unique_id,
            node_kind,
            description: description.to_string(),
            user_label: None,
            true_subset,
            candidate_subset,
            start_timestamp: self.timestamp,
            end_timestamp: self.timestamp,
            child_unique_ids,
            extra_state: None,
            subsets_with_metadata,
        });
    }
}

struct Leaf {
    unique_id: String,
    snapshot: LegacyRuleSnapshot,
    true_subset: PartitionSubset,
    metadata: Vec<SubsetWithMetadata>,
}

struct Group {
    unique_id: String,
    true_subset: PartitionSubset,
    leaves: Vec<Leaf>,
}

fn group(decision: DecisionType, leaves: Vec<Leaf>, empty: &PartitionSubset) -> Result<Group, SubsetError> {
    let mut true_subset = empty.clone();
    for leaf in &leaves {
        true_subset = true_subset.union(&leaf.true_subset)?;
    }
    let ids: Vec<&str> = leaves.iter().map(|l| l.unique_id.as_str()).collect();
    let tag = format!("any_of_{decision:?}");
    Ok(Group {
        unique_id: legacy_id(&tag, &ids),
        true_subset,
        leaves,
    })
}

/// Keep `fallback` when the sentinel makes `result` undecidable.
fn best_effort(
    result: Result<PartitionSubset, SubsetError>,
    fallback: &PartitionSubset,
    notes: &mut Vec<SubsetWithMetadata>,
) -> Result<PartitionSubset, SubsetError> {
    match result {
        Err(e @ SubsetError::Incomparable { .. }) if fallback.is_sentinel() => {
            let mut metadata = BTreeMap::new();
            metadata.insert("best_effort".to_string(), serde_json::Value::Bool(true));
            metadata.insert("error".to_string(), serde_json::Value::String(e.to_string()));
            notes.push(SubsetWithMetadata {
                subset: fallback.clone(),
                metadata,
            });
            Ok(fallback.clone())
        }
        other => other,
    }
}

/// Translate a flat row into the uniform tree shape.
pub fn translate_legacy(
    evaluation: &LegacyAssetEvaluation,
    timestamp: DateTime<Utc>,
) -> Result<EvaluationTree, SubsetError> {
    translate(evaluation, timestamp, None)
}

/// Same tree shape with every subset narrowed to `partition_key`, so
/// membership of that key is exact and the sentinel is never consulted.
/// Unpartitioned rows translate unchanged.
pub fn translate_legacy_for_partition(
    evaluation: &LegacyAssetEvaluation,
    partition_key: &str,
    timestamp: DateTime<Utc>,
) -> Result<EvaluationTree, SubsetError> {
    translate(evaluation, timestamp, Some(partition_key))
}

fn translate(
    evaluation: &LegacyAssetEvaluation,
    timestamp: DateTime<Utc>,
    focus: Option<&str>,
) -> Result<EvaluationTree, SubsetError> {
    let partitioned = evaluation
        .partition_subsets_by_condition
        .iter()
        .any(|(_, subset)| subset.as_ref().is_some_and(PartitionSubset::is_partitioned));
    let (candidate, empty) = match (partitioned, focus) {
        (true, Some(key)) => (PartitionSubset::from_keys([key]), PartitionSubset::empty_partitioned()),
        (true, None) => (PartitionSubset::AllPartitions, PartitionSubset::empty_partitioned()),
        (false, _) => (PartitionSubset::unpartitioned(true), PartitionSubset::unpartitioned(false)),
    };
    let narrow = |subset: &Option<PartitionSubset>| -> Result<PartitionSubset, SubsetError> {
        match subset {
            None => Ok(candidate.clone()),
            Some(s) if partitioned && focus.is_some() => s.intersect(&candidate),
            Some(s) => Ok(s.clone()),
        }
    };

    // Rule order: declared snapshots first, then any rule only seen in evaluations.
    let mut rules: Vec<LegacyRuleSnapshot> = evaluation.rule_snapshots.clone().unwrap_or_default();
    for (rule_eval, _) in &evaluation.partition_subsets_by_condition {
        if !rules.contains(&rule_eval.rule_snapshot) {
            rules.push(rule_eval.rule_snapshot.clone());
        }
    }

    let mut by_decision: BTreeMap<DecisionType, Vec<Leaf>> = BTreeMap::new();
    for snapshot in rules {
        let mut true_subset = empty.clone();
        let mut metadata = Vec::new();
        for (rule_eval, subset) in &evaluation.partition_subsets_by_condition {
            if rule_eval.rule_snapshot != snapshot {
                continue;
            }
            let subset = narrow(subset)?;
            true_subset = true_subset.union(&subset)?;
            if let Some(data) = &rule_eval.evaluation_data {
                let mut map = BTreeMap::new();
                map.insert("evaluation_data".to_string(), data.clone());
                metadata.push(SubsetWithMetadata { subset, metadata: map });
            }
        }
        let unique_id = legacy_id("rule", &[&snapshot.class_name, &snapshot.description]);
        by_decision.entry(snapshot.decision_type).or_default().push(Leaf {
            unique_id,
            snapshot,
            true_subset,
            metadata,
        });
    }

    let materialize = group(
        DecisionType::Materialize,
        by_decision.remove(&DecisionType::Materialize).unwrap_or_default(),
        &empty,
    )?;
    let skip = group(
        DecisionType::Skip,
        by_decision.remove(&DecisionType::Skip).unwrap_or_default(),
        &empty,
    )?;
    let discard = by_decision
        .remove(&DecisionType::Discard)
        .map(|leaves| group(DecisionType::Discard, leaves, &empty))
        .transpose()?;

    let not_skip_candidate = materialize.true_subset.clone();
    let mut not_skip_notes = Vec::new();
    let not_skip_true = best_effort(
        not_skip_candidate.difference(&skip.true_subset),
        &not_skip_candidate,
        &mut not_skip_notes,
    )?;
    let not_skip_id = legacy_id("not", &[&skip.unique_id]);

    let not_discard = match &discard {
        Some(d) => {
            let candidate = not_skip_true.clone();
            let mut notes = Vec::new();
            let true_subset = best_effort(candidate.difference(&d.true_subset), &candidate, &mut notes)?;
            Some((legacy_id("not", &[&d.unique_id]), candidate, true_subset, notes))
        }
        None => None,
    };

    let mut root_true = materialize.true_subset.intersect(&not_skip_true)?;
    let mut root_children = vec![materialize.unique_id.clone(), not_skip_id.clone()];
    if let Some((id, _, true_subset, _)) = &not_discard {
        root_true = root_true.intersect(true_subset)?;
        root_children.push(id.clone());
    }
    let root_refs: Vec<&str> = root_children.iter().map(String::as_str).collect();
    let root_id = legacy_id("all_of", &root_refs);

    let mut b = Builder {
        timestamp,
        nodes: Vec::new(),
    };
    b.push(
        root_id.clone(),
        NodeKind::And,
        "All of",
        root_true,
        candidate.clone(),
        root_children,
        Vec::new(),
    );
    push_group(&mut b, materialize, &candidate);
    b.push(
        not_skip_id,
        NodeKind::Not,
        "Not",
        not_skip_true,
        not_skip_candidate,
        vec![skip.unique_id.clone()],
        not_skip_notes,
    );
    push_group(&mut b, skip, &candidate);
    if let (Some(d), Some((id, not_candidate, not_true, notes))) = (discard, not_discard) {
        b.push(
            id,
            NodeKind::Not,
            "Not",
            not_true,
            not_candidate,
            vec![d.unique_id.clone()],
            notes,
        );
        push_group(&mut b, d, &candidate);
    }

    Ok(EvaluationTree {
        root_unique_id: root_id,
        nodes: b.nodes,
    })
}

fn push_group(b: &mut Builder, group: Group, candidate: &PartitionSubset) {
    b.push(
        group.unique_id,
        NodeKind::Or,
        "Any of",
        group.true_subset,
        candidate.clone(),
        group.leaves.iter().map(|l| l.unique_id.clone()).collect(),
        Vec::new(),
    );
    for leaf in group.leaves {
        b.push(
            leaf.unique_id,
            NodeKind::Rule,
            &leaf.snapshot.description,
            leaf.true_subset,
            candidate.clone(),
            Vec::new(),
            leaf.metadata,
        );
    }
}
