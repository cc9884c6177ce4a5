//! # An ordered map with memory-efficient cloning
//!
//! `lazy-bptree` provides [`BpTreeMap`], a sorted key-value container on a
//! B+ tree whose `clone` is O(1): the clone shares its internal nodes with
//! the original, and the two representations diverge gradually as either
//! side is updated, because a write clones only the nodes on its own path.
//!
//! Keys are ordered by a [`Comparator`] fixed at construction; the default
//! is plain [`Ord`], and [`FnComparator`] adapts any comparison closure
//! (see [`total_f64`] for float keys).  Beyond point reads and writes the
//! map offers sorted iteration in both directions (optionally bounded) and
//! an in-place range-edit engine ([`BpTreeMap::edit_range`]) whose callback
//! can update, delete, or stop per entry while copy-on-write sharing is
//! preserved for everything it merely reads.
//!
//! Mutators return a `Result` so a [frozen](BpTreeMap::freeze) map fails
//! them explicitly; reads never fail.  The container is single-actor:
//! clones may be handed to other threads, but one map is not a concurrent
//! structure.

mod error;
mod order;
mod tree;

pub use error::{TreeError, TreeResult};
pub use order::{total_f32, total_f64, Comparator, FnComparator, NaturalOrder};
pub use tree::{
    BpTreeMap, Edit, Iter, RevIter, DEFAULT_NODE_SIZE, MAX_NODE_SIZE, MIN_NODE_SIZE,
};
