//! Derived aggregate structures built over the sorted operation stream
//!
//! One forward pass ([`aggregator`]) produces the global statistics and
//! timeline ([`stats`]), per-call-stack groups ([`groups`]), the call tree
//! ([`calltree`]) and tag aggregates ([`tagtree`]); [`filter`] holds the
//! predicate used when the pass reruns restricted to a selection.

pub mod aggregator;
pub mod calltree;
pub mod filter;
pub mod groups;
pub mod stats;
pub mod tagtree;

pub use calltree::{StackTree, StackTreeNode, TreeOpKind};
pub use filter::FilterView;
pub use groups::{GroupMap, MemoryOperationGroup};
pub use stats::{
    histogram_bin_index, MemoryStats, MemoryStatsLocalPeak, MemoryStatsTimed, NUM_HISTOGRAM_BINS,
};
pub use tagtree::{TagNode, TagTree};
