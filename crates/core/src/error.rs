use thiserror::Error;

/// Errors produced by [`PartitionSubset`](crate::PartitionSubset) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubsetError {
    /// The truth of the operation cannot be decided, e.g. taking a concrete
    /// complement inside the historical all-partitions sentinel, or mixing
    /// unpartitioned and partitioned subsets.
    #[error("Incomparable subsets: cannot {op} {left} with {right}")]
    Incomparable {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    /// Enumeration or counting of the all-partitions sentinel was requested.
    #[error("Unbounded subset: cannot {0} the historical all-partitions sentinel")]
    Unbounded(&'static str),
}

#[derive(Error, Debug)]
pub enum AssetKeyError {
    #[error("Asset key is empty")]
    Empty,

    #[error("Asset key {0:?} contains an empty path component")]
    EmptyComponent(String),
}
