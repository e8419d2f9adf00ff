use automat_core::{AssetKey, SubsetError};
use thiserror::Error;

/// Failures of the instance-state accessor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstanceError {
    #[error("Unknown asset: {0}")]
    UnknownAsset(AssetKey),

    #[error("Asset {0} has no partitions definition")]
    MissingPartitionsDefinition(AssetKey),

    #[error("Instance state lock poisoned")]
    LockPoisoned,

    #[error("Instance backend error: {0}")]
    Backend(String),
}

/// An asset's condition tree could not be evaluated this cycle.
///
/// Always scoped to one asset; the daemon records it on the tick and keeps
/// evaluating the other assets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConditionEvaluationError {
    #[error("Instance state unavailable for {asset}: {source}")]
    Instance {
        asset: AssetKey,
        #[source]
        source: InstanceError,
    },

    #[error("Subset error in node {node} of {asset}: {source}")]
    Subset {
        asset: AssetKey,
        node: String,
        #[source]
        source: SubsetError,
    },

    #[error("Invalid cron schedule {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Unknown timezone {0:?}")]
    UnknownTimezone(String),
}

impl ConditionEvaluationError {
    pub(crate) fn instance(asset: &AssetKey, source: InstanceError) -> Self {
        Self::Instance {
            asset: asset.clone(),
            source,
        }
    }

    pub(crate) fn subset(asset: &AssetKey, node: &str, source: SubsetError) -> Self {
        Self::Subset {
            asset: asset.clone(),
            node: node.to_string(),
            source,
        }
    }
}
