//! Single-pass evaluation of one asset's condition tree.
//!
//! The walk is pre-order for output (parents precede children in the
//! resulting [`EvaluationTree`]) and post-order for computation (a parent's
//! true subset is folded from its children). Candidates flow top-down:
//! the root considers every existing partition that is not in flight, and
//! each child inherits its parent's candidate subset.

use std::collections::BTreeMap;

use automat_core::{AssetKey, PartitionSubset, SubsetError};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::condition::{AutomationCondition, ConditionKind};
use crate::cron;
use crate::cursor::{AssetCursor, NodeCursor};
use crate::error::{ConditionEvaluationError, InstanceError};
use crate::evaluation::{EvaluationNode, EvaluationTree, NodeKind, SubsetWithMetadata};
use crate::instance::{asset_universe, InstanceState};
use crate::rule::Rule;

/// Everything one evaluation of one asset produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetEvaluation {
    pub asset_key: AssetKey,
    pub evaluation_id: u64,
    pub timestamp: DateTime<Utc>,
    /// Root true subset: the partitions the condition asks to materialize.
    pub true_subset: PartitionSubset,
    pub tree: EvaluationTree,
    /// Cursor to persist if this evaluation is committed.
    pub cursor: AssetCursor,
}

/// Evaluate `condition` for `asset_key` at `now`.
///
/// `previous_cursor` is the cursor committed by the last cycle, if any.
/// Passing `None` recomputes everything from full history.
pub fn evaluate_asset(
    asset_key: &AssetKey,
    condition: &AutomationCondition,
    instance: &dyn InstanceState,
    previous_cursor: Option<&AssetCursor>,
    evaluation_id: u64,
    now: DateTime<Utc>,
) -> Result<AssetEvaluation, ConditionEvaluationError> {
    let universe = asset_universe(instance, asset_key, now)
        .map_err(|e| ConditionEvaluationError::instance(asset_key, e))?;
    let in_flight = instance
        .in_flight_runs(asset_key)
        .map_err(|e| ConditionEvaluationError::instance(asset_key, e))?;
    let storage_id = instance
        .latest_storage_id()
        .map_err(|e| ConditionEvaluationError::instance(asset_key, e))?;
    let root_candidate = universe
        .difference(&in_flight)
        .map_err(|e| ConditionEvaluationError::subset(asset_key, condition.unique_id(), e))?;

    let mut walk = Walk {
        asset: asset_key,
        instance,
        previous: previous_cursor,
        now,
        storage_id,
        nodes: Vec::new(),
        node_cursors: BTreeMap::new(),
    };
    let root_idx = walk.evaluate(condition, &root_candidate)?;
    let true_subset = walk.nodes[root_idx].true_subset.clone();

    debug!(
        asset = %asset_key,
        evaluation_id,
        nodes = walk.nodes.len(),
        requested = %true_subset,
        "Evaluated condition tree"
    );

    let cursor = AssetCursor {
        asset_key: asset_key.clone(),
        latest_evaluation_id: evaluation_id,
        latest_evaluation_timestamp: now,
        latest_storage_id: storage_id,
        node_cursors: walk.node_cursors,
        requested_subset_history: previous_cursor
            .map(|c| c.requested_subset_history.clone())
            .unwrap_or_default(),
    };

    Ok(AssetEvaluation {
        asset_key: asset_key.clone(),
        evaluation_id,
        timestamp: now,
        true_subset,
        tree: EvaluationTree {
            root_unique_id: condition.unique_id().to_string(),
            nodes: walk.nodes,
        },
        cursor,
    })
}

/// Evaluate as if the asset had never been evaluated before.
pub fn evaluate_without_cursor(
    asset_key: &AssetKey,
    condition: &AutomationCondition,
    instance: &dyn InstanceState,
    evaluation_id: u64,
    now: DateTime<Utc>,
) -> Result<AssetEvaluation, ConditionEvaluationError> {
    evaluate_asset(asset_key, condition, instance, None, evaluation_id, now)
}

// ── Tree walk ───────────────────────────────────────────────────────

enum RuleFailure {
    Subset(SubsetError),
    Fatal(ConditionEvaluationError),
}

impl From<SubsetError> for RuleFailure {
    fn from(e: SubsetError) -> Self {
        RuleFailure::Subset(e)
    }
}

impl From<ConditionEvaluationError> for RuleFailure {
    fn from(e: ConditionEvaluationError) -> Self {
        RuleFailure::Fatal(e)
    }
}

struct RuleOutcome {
    true_subset: PartitionSubset,
    extra_state: Option<NodeCursor>,
}

struct Walk<'a> {
    asset: &'a AssetKey,
    instance: &'a dyn InstanceState,
    previous: Option<&'a AssetCursor>,
    now: DateTime<Utc>,
    /// Upper bound for every materialization read in this walk.
    storage_id: u64,
    nodes: Vec<EvaluationNode>,
    node_cursors: BTreeMap<String, NodeCursor>,
}

impl<'a> Walk<'a> {
    /// Evaluate `cond` within `candidate`; returns the index of its node.
    fn evaluate(
        &mut self,
        cond: &AutomationCondition,
        candidate: &PartitionSubset,
    ) -> Result<usize, ConditionEvaluationError> {
        let id = cond.unique_id().to_string();
        let idx = match cond.kind() {
            ConditionKind::Label { child, text } => {
                let idx = self.evaluate(child, candidate)?;
                self.nodes[idx].user_label = Some(text.clone());
                return Ok(idx);
            }
            ConditionKind::Rule(rule) => {
                let idx = self.open(cond, NodeKind::Rule, candidate);
                match self.evaluate_rule(rule, &id, candidate) {
                    Ok(outcome) => {
                        if let Some(state) = &outcome.extra_state {
                            self.node_cursors.insert(id.clone(), state.clone());
                        }
                        self.nodes[idx].extra_state = outcome.extra_state;
                        self.nodes[idx].true_subset = outcome.true_subset;
                    }
                    Err(RuleFailure::Subset(e @ SubsetError::Incomparable { .. })) => {
                        warn!(
                            asset = %self.asset,
                            rule = %rule.description(),
                            error = %e,
                            "Rule degraded to false"
                        );
                        let mut metadata = BTreeMap::new();
                        metadata.insert("error".to_string(), serde_json::Value::String(e.to_string()));
                        self.nodes[idx].true_subset = candidate.empty_like();
                        self.nodes[idx].subsets_with_metadata.push(SubsetWithMetadata {
                            subset: candidate.clone(),
                            metadata,
                        });
                    }
                    Err(RuleFailure::Subset(e)) => {
                        return Err(ConditionEvaluationError::subset(self.asset, &id, e));
                    }
                    Err(RuleFailure::Fatal(e)) => return Err(e),
                }
                idx
            }
            ConditionKind::And(children) => {
                let idx = self.open(cond, NodeKind::And, candidate);
                let mut true_subset = candidate.clone();
                for child in children {
                    let child_true = self.child_true(child, candidate)?;
                    true_subset = self.combine(&id, true_subset.intersect(&child_true))?;
                }
                self.nodes[idx].true_subset = true_subset;
                idx
            }
            ConditionKind::Or(children) => {
                let idx = self.open(cond, NodeKind::Or, candidate);
                let mut true_subset = candidate.empty_like();
                for child in children {
                    let child_true = self.child_true(child, candidate)?;
                    true_subset = self.combine(&id, true_subset.union(&child_true))?;
                }
                self.nodes[idx].true_subset = self.combine(&id, true_subset.intersect(candidate))?;
                idx
            }
            ConditionKind::Not(child) => {
                let idx = self.open(cond, NodeKind::Not, candidate);
                let child_true = self.child_true(child, candidate)?;
                self.nodes[idx].true_subset = self.combine(&id, candidate.difference(&child_true))?;
                idx
            }
            ConditionKind::Since { trigger, reset } => {
                let idx = self.open(cond, NodeKind::Since, candidate);
                let trigger_true = self.child_true(trigger, candidate)?;
                let reset_true = self.child_true(reset, candidate)?;
                let prior = match self.previous.and_then(|c| c.node_cursor(&id)) {
                    Some(NodeCursor::Latch(latch)) if latch.is_partitioned() == candidate.is_partitioned() => {
                        latch.clone()
                    }
                    _ => candidate.empty_like(),
                };
                let latch = self.combine(&id, prior.union(&trigger_true))?;
                let latch = self.combine(&id, latch.difference(&reset_true))?;
                self.nodes[idx].true_subset = self.combine(&id, latch.intersect(candidate))?;
                self.nodes[idx].extra_state = Some(NodeCursor::Latch(latch.clone()));
                self.node_cursors.insert(id.clone(), NodeCursor::Latch(latch));
                idx
            }
        };

        let node = &self.nodes[idx];
        debug!(
            asset = %self.asset,
            node = %node.description,
            unique_id = %node.unique_id,
            status = %node.status(),
            "Evaluated node"
        );
        Ok(idx)
    }

    fn open(&mut self, cond: &AutomationCondition, node_kind: NodeKind, candidate: &PartitionSubset) -> usize {
        self.nodes.push(EvaluationNode {
            unique_id: cond.unique_id().to_string(),
            node_kind,
            description: cond.description(),
            user_label: None,
            true_subset: candidate.empty_like(),
            candidate_subset: candidate.clone(),
            start_timestamp: self.now,
            end_timestamp: self.now,
            child_unique_ids: cond.children().iter().map(|c| c.unique_id().to_string()).collect(),
            extra_state: None,
            subsets_with_metadata: Vec::new(),
        });
        self.nodes.len() - 1
    }

    fn child_true(
        &mut self,
        child: &AutomationCondition,
        candidate: &PartitionSubset,
    ) -> Result<PartitionSubset, ConditionEvaluationError> {
        let idx = self.evaluate(child, candidate)?;
        Ok(self.nodes[idx].true_subset.clone())
    }

    fn combine(
        &self,
        node: &str,
        result: Result<PartitionSubset, SubsetError>,
    ) -> Result<PartitionSubset, ConditionEvaluationError> {
        result.map_err(|e| ConditionEvaluationError::subset(self.asset, node, e))
    }

    fn from_instance<T>(&self, result: Result<T, InstanceError>) -> Result<T, ConditionEvaluationError> {
        result.map_err(|e| ConditionEvaluationError::instance(self.asset, e))
    }

    fn previous_timestamp(&self) -> Option<DateTime<Utc>> {
        self.previous.map(|c| c.latest_evaluation_timestamp)
    }

    fn previous_storage_id(&self) -> Option<u64> {
        self.previous.map(|c| c.latest_storage_id)
    }

    fn materialized_after(&self, asset: &AssetKey, after: u64) -> Result<PartitionSubset, ConditionEvaluationError> {
        self.from_instance(self.instance.partitions_materialized_between(asset, after, self.storage_id))
    }

    // ── Leaf rules ──────────────────────────────────────────────────

    fn evaluate_rule(
        &self,
        rule: &Rule,
        unique_id: &str,
        candidate: &PartitionSubset,
    ) -> Result<RuleOutcome, RuleFailure> {
        let mut extra_state = None;
        let raw = match rule {
            Rule::Missing => {
                let known = match (self.previous, self.previous.and_then(|c| c.node_cursor(unique_id))) {
                    (Some(prev), Some(NodeCursor::Materialized(known))) => {
                        let newer = self.materialized_after(self.asset, prev.latest_storage_id)?;
                        known.union(&newer)?
                    }
                    _ => self.materialized_after(self.asset, 0)?,
                };
                let missing = candidate.difference(&known)?;
                extra_state = Some(NodeCursor::Materialized(known));
                missing
            }
            Rule::InProgress => self.from_instance(self.instance.in_flight_runs(self.asset))?,
            Rule::NewlyRequested => match self.previous.and_then(AssetCursor::latest_requested) {
                Some(requested) => requested.clone(),
                None => candidate.empty_like(),
            },
            Rule::NewlyUpdated => match self.previous_storage_id() {
                Some(after) => self.materialized_after(self.asset, after)?,
                None => candidate.empty_like(),
            },
            Rule::AnyParentsUpdated => match self.previous_storage_id() {
                Some(after) => {
                    let mut updated = candidate.empty_like();
                    for parent in self.from_instance(self.instance.parent_keys(self.asset))? {
                        let parent_updated = self.materialized_after(&parent, after)?;
                        updated = updated.union(&map_parent_subset(&parent_updated, candidate)?)?;
                    }
                    updated
                }
                None => candidate.empty_like(),
            },
            Rule::AnyParentsMissing => {
                let mut missing = candidate.empty_like();
                for parent in self.from_instance(self.instance.parent_keys(self.asset))? {
                    let parent_universe = self.from_instance(asset_universe(self.instance, &parent, self.now))?;
                    let parent_done = self.materialized_after(&parent, 0)?;
                    let parent_missing = parent_universe.difference(&parent_done)?;
                    missing = missing.union(&map_parent_subset(&parent_missing, candidate)?)?;
                }
                missing
            }
            Rule::CronTickPassed {
                cron_schedule,
                cron_timezone,
            } => {
                let schedule = cron::parse_schedule(cron_schedule)?;
                let tz = cron::parse_timezone(cron_timezone)?;
                match self.previous_timestamp() {
                    Some(since) if cron::tick_between(&schedule, tz, since, self.now) => candidate.clone(),
                    _ => candidate.empty_like(),
                }
            }
        };

        Ok(RuleOutcome {
            true_subset: raw.intersect(candidate)?,
            extra_state,
        })
    }
}

/// Map a parent's subset into the child's partition space. Partitioned
/// parents map by identical key; an unpartitioned parent covers every
/// child partition.
fn map_parent_subset(
    parent: &PartitionSubset,
    candidate: &PartitionSubset,
) -> Result<PartitionSubset, SubsetError> {
    match (parent.is_partitioned(), candidate.is_partitioned()) {
        (false, _) => Ok(if parent.is_empty() {
            candidate.empty_like()
        } else {
            candidate.clone()
        }),
        (true, true) => parent.intersect(candidate),
        (true, false) => Ok(PartitionSubset::unpartitioned(!parent.is_empty())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_mapping() {
        let cand = PartitionSubset::from_keys(["a", "b"]);
        assert_eq!(
            map_parent_subset(&PartitionSubset::unpartitioned(true), &cand).unwrap(),
            cand
        );
        assert_eq!(
            map_parent_subset(&PartitionSubset::from_keys(["b", "z"]), &cand).unwrap(),
            PartitionSubset::from_keys(["b"])
        );
        assert_eq!(
            map_parent_subset(&PartitionSubset::from_keys(["z"]), &PartitionSubset::unpartitioned(true))
                .unwrap(),
            PartitionSubset::unpartitioned(true)
        );
    }
}
