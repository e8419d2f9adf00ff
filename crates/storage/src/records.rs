//! Persisted row formats: ticks, run requests and evaluation rows.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use automat_conditions::{AssetCursor, EvaluationNode, EvaluationTree};
use automat_core::AssetKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::legacy::{translate_legacy, LegacyAssetEvaluation};

// ── Run requests ────────────────────────────────────────────────────

/// One run the daemon asks an external launcher to start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunRequest {
    pub asset_selection: BTreeSet<AssetKey>,
    #[serde(default)]
    pub partition_key: Option<String>,
}

// ── Ticks ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TickStatus {
    Started,
    Success,
    Failure,
    Skipped,
}

impl TickStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TickStatus::Started)
    }
}

impl fmt::Display for TickStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TickStatus::Started => "STARTED",
            TickStatus::Success => "SUCCESS",
            TickStatus::Failure => "FAILURE",
            TickStatus::Skipped => "SKIPPED",
        };
        write!(f, "{s}")
    }
}

/// Audit record of one scheduling cycle.
///
/// Created as STARTED before any evaluation and finalized exactly once. The
/// requested fields are fixed at finalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickRecord {
    pub id: u64,
    pub status: TickStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub end_timestamp: Option<DateTime<Utc>>,
    pub evaluation_id: u64,
    #[serde(default)]
    pub run_requests: Vec<RunRequest>,
    #[serde(default)]
    pub run_ids: Vec<String>,
    #[serde(default)]
    pub requested_asset_keys: BTreeSet<AssetKey>,
    /// Partition keys per requested asset; unpartitioned assets map to an empty set.
    #[serde(default)]
    pub requested_materializations: BTreeMap<AssetKey, BTreeSet<String>>,
    #[serde(default)]
    pub requested_asset_materialization_count: usize,
    #[serde(default)]
    pub error: Option<String>,
    /// Per-asset evaluation errors that did not fail the cycle.
    #[serde(default)]
    pub asset_errors: BTreeMap<AssetKey, String>,
}

impl TickRecord {
    pub fn started(id: u64, timestamp: DateTime<Utc>, evaluation_id: u64) -> Self {
        Self {
            id,
            status: TickStatus::Started,
            timestamp,
            end_timestamp: None,
            evaluation_id,
            run_requests: Vec::new(),
            run_ids: Vec::new(),
            requested_asset_keys: BTreeSet::new(),
            requested_materializations: BTreeMap::new(),
            requested_asset_materialization_count: 0,
            error: None,
            asset_errors: BTreeMap::new(),
        }
    }

    /// Terminal copy of this tick carrying `run_requests` (paired with
    /// `run_ids`) and the derived requested fields.
    pub fn finalized(
        &self,
        status: TickStatus,
        end_timestamp: DateTime<Utc>,
        run_requests: Vec<RunRequest>,
        run_ids: Vec<String>,
    ) -> Self {
        let mut requested_materializations: BTreeMap<AssetKey, BTreeSet<String>> = BTreeMap::new();
        let mut pairs: BTreeSet<(&AssetKey, Option<&String>)> = BTreeSet::new();
        for request in &run_requests {
            for asset in &request.asset_selection {
                let keys = requested_materializations.entry(asset.clone()).or_default();
                if let Some(pk) = &request.partition_key {
                    keys.insert(pk.clone());
                }
                pairs.insert((asset, request.partition_key.as_ref()));
            }
        }
        let requested_asset_materialization_count = pairs.len();

        Self {
            status,
            end_timestamp: Some(end_timestamp),
            requested_asset_keys: requested_materializations.keys().cloned().collect(),
            requested_materializations,
            requested_asset_materialization_count,
            run_requests,
            run_ids,
            ..self.clone()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_asset_errors(mut self, asset_errors: BTreeMap<AssetKey, String>) -> Self {
        self.asset_errors = asset_errors;
        self
    }
}

// ── Evaluation rows ─────────────────────────────────────────────────

/// A new-format evaluation about to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvaluation {
    pub asset_key: AssetKey,
    pub evaluation_id: u64,
    pub timestamp: DateTime<Utc>,
    pub num_requested: usize,
    pub tree: EvaluationTree,
    #[serde(default)]
    pub run_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum StoredEvaluationBody {
    Tree { num_requested: usize, tree: EvaluationTree },
    /// Flat rows written before condition trees existed. Read only.
    Legacy { evaluation: LegacyAssetEvaluation },
}

/// One evaluation row as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvaluation {
    /// Storage row id, increasing with insertion order.
    pub id: u64,
    pub asset_key: AssetKey,
    pub evaluation_id: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub run_ids: BTreeSet<String>,
    pub body: StoredEvaluationBody,
}

impl StoredEvaluation {
    pub(crate) fn from_new(id: u64, new: NewEvaluation) -> Self {
        Self {
            id,
            asset_key: new.asset_key,
            evaluation_id: new.evaluation_id,
            timestamp: new.timestamp,
            run_ids: new.run_ids,
            body: StoredEvaluationBody::Tree {
                num_requested: new.num_requested,
                tree: new.tree,
            },
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self.body, StoredEvaluationBody::Legacy { .. })
    }

    /// Uniform tree-shaped view, translating legacy rows on the fly.
    pub fn to_record(&self) -> Result<EvaluationRecord, PersistenceError> {
        let (num_requested, tree, is_legacy) = match &self.body {
            StoredEvaluationBody::Tree { num_requested, tree } => (*num_requested, tree.clone(), false),
            StoredEvaluationBody::Legacy { evaluation } => {
                let tree = translate_legacy(evaluation, self.timestamp).map_err(|e| {
                    PersistenceError::CorruptRecord {
                        id: self.id,
                        reason: e.to_string(),
                    }
                })?;
                (evaluation.num_requested, tree, true)
            }
        };
        Ok(EvaluationRecord {
            id: self.id,
            evaluation_id: self.evaluation_id,
            asset_key: self.asset_key.clone(),
            timestamp: self.timestamp,
            num_requested,
            is_legacy,
            run_ids: self.run_ids.clone(),
            root_unique_id: tree.root_unique_id,
            evaluation_nodes: tree.nodes,
        })
    }
}

/// Query-facing evaluation record, identical in shape for both formats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: u64,
    pub evaluation_id: u64,
    pub asset_key: AssetKey,
    pub timestamp: DateTime<Utc>,
    pub num_requested: usize,
    pub is_legacy: bool,
    pub run_ids: BTreeSet<String>,
    pub root_unique_id: String,
    pub evaluation_nodes: Vec<EvaluationNode>,
}

// ── Cycle commit ────────────────────────────────────────────────────

/// Everything one cycle writes, applied atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleCommit {
    /// Terminal tick; must match an existing STARTED tick.
    pub tick: TickRecord,
    pub evaluations: Vec<NewEvaluation>,
    pub cursors: Vec<AssetCursor>,
}
