//! Call tree aggregation over resolved stack traces
//!
//! Tree children are keyed by symbol ID. Walking happens bottom-up: frames
//! are stored top-of-stack first, so iterating them in reverse descends
//! from main() toward the allocation site. Each trace caches the child
//! index it resolved to per frame (the scratch quarter of the trace
//! record), turning repeat walks into direct index hops, and threads
//! itself into the intrusive per-node trace list at most once per node.

use crate::analysis::filter::FilterView;
use crate::domain::{MemoryOperation, OpKind, TraceRef};
use crate::loader::pool::{OperationPool, StackTracePool, TreeScope, SCRATCH_UNCACHED};

/// Operation counters kept per tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeOpKind {
    Alloc = 0,
    Realloc = 1,
    Free = 2,
}

#[derive(Debug, Clone)]
pub struct StackTreeNode {
    /// Parent node index; `u32::MAX` for the root.
    pub parent: u32,
    /// Symbol ID of the frame this node represents; 0 for the root.
    pub address_id: u64,
    /// 0 for the root, 1 for its children, and so on.
    pub depth: u32,
    pub mem_usage: i64,
    pub mem_usage_peak: i64,
    pub overhead: i64,
    pub overhead_peak: i64,
    /// Counts indexed by [`TreeOpKind`].
    pub op_count: [u32; 3],
    pub children: Vec<u32>,
    /// Head of the intrusive list of traces passing through this node;
    /// follow with [`StackTracePool::next_link`] at this node's depth.
    pub trace_list: Option<TraceRef>,
}

impl StackTreeNode {
    fn new(parent: u32, address_id: u64, depth: u32) -> Self {
        Self {
            parent,
            address_id,
            depth,
            mem_usage: 0,
            mem_usage_peak: 0,
            overhead: 0,
            overhead_peak: 0,
            op_count: [0; 3],
            children: Vec::new(),
            trace_list: None,
        }
    }

    fn apply(&mut self, size: i64, overhead: i64, kind: Option<TreeOpKind>) {
        self.mem_usage += size;
        self.mem_usage_peak = self.mem_usage_peak.max(self.mem_usage);
        self.overhead += overhead;
        self.overhead_peak = self.overhead_peak.max(self.overhead);
        if let Some(kind) = kind {
            self.op_count[kind as usize] += 1;
        }
    }
}

/// Arena-backed call tree; node 0 is the root.
#[derive(Debug)]
pub struct StackTree {
    nodes: Vec<StackTreeNode>,
}

impl Default for StackTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StackTree {
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: vec![StackTreeNode::new(u32::MAX, 0, 0)] }
    }

    #[must_use]
    pub fn root(&self) -> &StackTreeNode {
        &self.nodes[0]
    }

    #[must_use]
    pub fn node(&self, index: u32) -> &StackTreeNode {
        &self.nodes[index as usize]
    }

    /// Total node count, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Child of `parent` keyed by `address_id`, if present.
    #[must_use]
    pub fn find_child(&self, parent: u32, address_id: u64) -> Option<u32> {
        self.nodes[parent as usize]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c as usize].address_id == address_id)
    }
}

/// Walk one trace through the tree applying a signed size/overhead delta.
fn add_trace(
    tree: &mut StackTree,
    traces: &mut StackTracePool,
    trace: TraceRef,
    size: i64,
    overhead: i64,
    scope: TreeScope,
    kind: Option<TreeOpKind>,
) {
    let num_frames = traces.num_entries(trace);

    tree.nodes[0].apply(size, overhead, kind);
    if traces.added_mark(trace, scope) < 1 {
        traces.set_next_link(trace, 0, tree.nodes[0].trace_list);
        tree.nodes[0].trace_list = Some(trace);
        traces.set_added_mark(trace, scope, 1);
    }

    let mut current: u32 = 0;
    for frame in (0..num_frames).rev() {
        let depth = (num_frames - frame) as u32;
        let symbol = traces.symbol_ids(trace)[frame];

        let cached = traces.scratch(trace, scope, frame);
        let child = if cached == SCRATCH_UNCACHED {
            let child = match tree.find_child(current, symbol) {
                Some(existing) => existing,
                None => {
                    let index = tree.nodes.len() as u32;
                    tree.nodes.push(StackTreeNode::new(current, symbol, depth));
                    tree.nodes[current as usize].children.push(index);
                    index
                }
            };
            traces.set_scratch(trace, scope, frame, u64::from(child));
            child
        } else {
            cached as u32
        };

        current = child;

        if traces.added_mark(trace, scope) < depth + 1 {
            traces.set_next_link(trace, depth as usize, tree.nodes[current as usize].trace_list);
            tree.nodes[current as usize].trace_list = Some(trace);
            traces.set_added_mark(trace, scope, depth + 1);
        }

        tree.nodes[current as usize].apply(size, overhead, kind);
    }
}

/// Add one operation: allocations add their bytes along their own trace,
/// frees subtract the predecessor's bytes along the predecessor's trace,
/// reallocs do both. A predecessor outside the filter contributes zero
/// delta so filtered trees cannot go negative, but the free counter still
/// ticks.
pub fn add_operation(
    tree: &mut StackTree,
    traces: &mut StackTracePool,
    ops: &OperationPool,
    filter: &FilterView,
    op: &MemoryOperation,
    scope: TreeScope,
) {
    match op.kind {
        OpKind::Alloc | OpKind::Calloc | OpKind::AllocAligned => {
            add_trace(
                tree,
                traces,
                op.stack_trace,
                op.alloc_size as i64,
                i64::from(op.overhead),
                scope,
                Some(TreeOpKind::Alloc),
            );
        }

        OpKind::Free => {
            debug_assert!(op.chain_prev.is_valid());
            let prev = *ops.get(op.chain_prev);
            if filter.accepts(&prev, traces) {
                add_trace(
                    tree,
                    traces,
                    prev.stack_trace,
                    -(prev.alloc_size as i64),
                    -i64::from(prev.overhead),
                    scope,
                    Some(TreeOpKind::Free),
                );
            } else {
                add_trace(tree, traces, prev.stack_trace, 0, 0, scope, Some(TreeOpKind::Free));
            }
        }

        OpKind::Realloc | OpKind::ReallocAligned => {
            if op.chain_prev.is_valid() {
                let prev = *ops.get(op.chain_prev);
                if filter.accepts(&prev, traces) {
                    add_trace(
                        tree,
                        traces,
                        prev.stack_trace,
                        -(prev.alloc_size as i64),
                        -i64::from(prev.overhead),
                        scope,
                        None,
                    );
                }
            }
            add_trace(
                tree,
                traces,
                op.stack_trace,
                op.alloc_size as i64,
                i64::from(op.overhead),
                scope,
                Some(TreeOpKind::Realloc),
            );
        }
    }
}
