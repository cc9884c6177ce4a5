//! Error surface of the tree.
//!
//! Reads never fail.  Mutators fail only on a frozen tree, and
//! [`check_valid`](crate::BpTreeMap::check_valid) reports the first
//! structural invariant it finds violated.

use thiserror::Error;

/// Result alias for tree operations.
pub type TreeResult<T> = Result<T, TreeError>;

/// Failures reported by mutators and the structural audit.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TreeError {
    /// A mutating call was made on a frozen tree.
    #[error("tree is frozen")]
    Frozen,

    /// The recorded entry count disagrees with an in-order walk.
    #[error("entry count mismatch: recorded {recorded}, counted {counted}")]
    SizeMismatch { recorded: usize, counted: usize },

    /// Keys are not strictly ascending at the given depth.
    #[error("keys out of order at depth {depth}")]
    UnorderedKeys { depth: usize },

    /// A stored per-child max key disagrees with its child's subtree.
    #[error("stale max key for child {child} at depth {depth}")]
    StaleMaxKey { depth: usize, child: usize },

    /// Two leaves sit at different depths.
    #[error("uneven leaf depth: expected {expected}, found {found}")]
    UnevenDepth { expected: usize, found: usize },

    /// A leaf's key and value arrays differ in length.
    #[error("skewed leaf: {keys} keys, {vals} values")]
    SkewedLeaf { keys: usize, vals: usize },

    /// An internal node's max-key and child arrays differ in length.
    #[error("skewed branch: {maxes} max keys, {kids} children")]
    SkewedBranch { maxes: usize, kids: usize },

    /// A node holds more entries than the configured maximum.
    #[error("over-full node at depth {depth}: {len} > {max}")]
    Overfull { depth: usize, len: usize, max: usize },

    /// A non-root node holds no entries.
    #[error("empty node at depth {depth}")]
    EmptyNode { depth: usize },
}
