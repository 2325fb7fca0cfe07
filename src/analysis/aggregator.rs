//! The single forward pass that builds every derived aggregate
//!
//! Runs once over the time-sorted valid operations after symbol
//! resolution, producing the global statistics, timed snapshots, usage
//! graph, leak list, operation groups, call tree and tag-tree aggregates
//! in one sweep. The same per-operation core reruns with a predicate for
//! filtered rebuilds.

use std::collections::HashMap;

use log::info;

use crate::analysis::calltree::{self, StackTree};
use crate::analysis::filter::FilterView;
use crate::analysis::groups::{self, GroupMap};
use crate::analysis::stats::{
    snapshot_granularity_mask, MemoryStats, MemoryStatsLocalPeak, MemoryStatsTimed,
};
use crate::analysis::tagtree::TagTree;
use crate::domain::{GraphEntry, MemoryOperation, OpKind, OpRef, TraceRef};
use crate::loader::pool::{OperationPool, StackTracePool, TreeScope};
use crate::progress::{Progress, ProgressTicker};

/// Everything the global pass derives.
pub struct GlobalOutput {
    pub stats: MemoryStats,
    pub timed_stats: Vec<MemoryStatsTimed>,
    pub usage_graph: Vec<GraphEntry>,
    pub leaks: Vec<OpRef>,
    pub groups: GroupMap,
    pub tree: StackTree,
}

/// Aggregates rebuilt whenever the filter changes.
pub struct FilteredOutput {
    pub operations: Vec<OpRef>,
    pub groups: GroupMap,
    pub tree: StackTree,
    pub tag_tree: TagTree,
}

/// The unfiltered pass over all operations. Also propagates tags along
/// realloc chains and collects the leak list, both of which only make
/// sense globally.
pub fn run_global_pass(
    ops: &mut OperationPool,
    traces: &mut StackTracePool,
    operations: &[OpRef],
    heaps: &mut HashMap<u64, String>,
    tag_tree: &mut TagTree,
    progress: &mut Progress,
) -> GlobalOutput {
    let filter = FilterView::pass_all();
    let mask = snapshot_granularity_mask(operations.len());

    let mut stats = MemoryStats::default();
    let mut local_peak = MemoryStatsLocalPeak::default();
    let mut timed_stats = Vec::with_capacity(operations.len() / (mask as usize + 1) + 2);
    let mut usage_graph = Vec::with_capacity(operations.len());
    let mut leaks = Vec::new();
    let mut groups = GroupMap::new();
    let mut tree = StackTree::new();
    let mut prev_tag_node = None;

    let mut live_blocks: u64 = 0;
    let mut live_size: u64 = 0;

    let total = operations.len();
    let mut ticker = ProgressTicker::new(total);

    for (i, &op_ref) in operations.iter().enumerate() {
        if let Some(percent) = ticker.tick(i, total) {
            progress.report(percent, "Building analysis data...");
        }

        if (i as u32) & mask == 0 {
            timed_stats.push(MemoryStatsTimed {
                time: ops.get(op_ref).time,
                operation_index: i as u32,
                local_peak,
                stats,
            });
            local_peak = MemoryStatsLocalPeak::default();
        }

        // a realloc successor without its own tag inherits this op's tag
        let chain_next = ops.get(op_ref).chain_next;
        if chain_next.is_valid() {
            let own_tag = ops.get(op_ref).tag;
            let next = ops.get_mut(chain_next);
            if next.tag == 0 {
                next.tag = own_tag;
            }
        }

        let op = *ops.get(op_ref);
        if !op.chain_next.is_valid() && op.is_leaked() {
            leaks.push(op_ref);
        }

        let prev = op.chain_prev.is_valid().then(|| *ops.get(op.chain_prev));

        stats.number_of_operations = stats.number_of_operations.wrapping_add(1);
        let bin = stats.record(&op, prev.as_ref());
        if op.kind != OpKind::Free {
            local_peak.update(&stats, bin);
        }

        usage_graph.push(GraphEntry {
            memory_usage: stats.memory_usage,
            num_live_blocks: stats.number_of_live_blocks,
        });

        update_live(&op, prev.as_ref(), &mut live_blocks, &mut live_size);

        groups::add_operation(&mut groups, ops, traces, &filter, op_ref, &op, live_blocks, live_size);
        calltree::add_operation(&mut tree, traces, ops, &filter, &op, TreeScope::Global);

        let delta = tag_delta(&op, prev.as_ref(), &filter, traces);
        tag_tree.add_operation(&op, delta, &mut prev_tag_node);

        heaps
            .entry(op.allocator_handle)
            .or_insert_with(|| format!("0x{:x}", op.allocator_handle));
    }

    // closing snapshot: covers the whole capture
    if let Some(&last) = operations.last() {
        timed_stats.push(MemoryStatsTimed {
            time: ops.get(last).time,
            operation_index: operations.len() as u32,
            local_peak,
            stats,
        });
    }

    info!(
        "aggregated {} operations into {} call-tree nodes, {} groups, {} leaks",
        operations.len(),
        tree.len(),
        groups.len(),
        leaks.len(),
    );
    progress.report(100.0, "Done!");

    GlobalOutput { stats, timed_stats, usage_graph, leaks, groups, tree, }
}

/// Rerun the per-operation core over an index range with the filter
/// predicate applied. The Filtered scratch of every trace is reset first.
#[allow(clippy::too_many_arguments)]
pub fn run_filtered_pass(
    ops: &OperationPool,
    traces: &mut StackTracePool,
    operations: &[OpRef],
    trace_list: &[TraceRef],
    range: std::ops::Range<usize>,
    filter: &FilterView,
    tag_registry: &TagTree,
    progress: &mut Progress,
) -> FilteredOutput {
    for &trace in trace_list {
        traces.reset_scratch(trace, TreeScope::Filtered);
    }

    let mut out = FilteredOutput {
        operations: Vec::new(),
        groups: GroupMap::new(),
        tree: StackTree::new(),
        tag_tree: tag_registry.clone_structure(),
    };
    let mut prev_tag_node = None;

    let mut live_blocks: u64 = 0;
    let mut live_size: u64 = 0;

    let end = range.end.min(operations.len());
    let span = end.saturating_sub(range.start);
    let mut ticker = ProgressTicker::new(span);

    for (done, i) in (range.start..end).enumerate() {
        if let Some(percent) = ticker.tick(done, span) {
            progress.report(percent, "Building filtered data...");
        }

        let op_ref = operations[i];
        let op = *ops.get(op_ref);
        if !filter.accepts(&op, traces) {
            continue;
        }

        out.operations.push(op_ref);

        let prev = op.chain_prev.is_valid().then(|| *ops.get(op.chain_prev));
        update_live(&op, prev.as_ref(), &mut live_blocks, &mut live_size);

        groups::add_operation(
            &mut out.groups,
            ops,
            traces,
            filter,
            op_ref,
            &op,
            live_blocks,
            live_size,
        );
        calltree::add_operation(&mut out.tree, traces, ops, filter, &op, TreeScope::Filtered);

        let delta = tag_delta(&op, prev.as_ref(), filter, traces);
        out.tag_tree.add_operation(&op, delta, &mut prev_tag_node);
    }

    progress.report(100.0, "Done!");
    out
}

/// Cumulative stats over an index range, shared by the windowed queries.
pub fn ranged_stats(
    stats: &mut MemoryStats,
    ops: &OperationPool,
    operations: &[OpRef],
    from: usize,
    to: usize,
) {
    let to = to.min(operations.len());
    for &op_ref in &operations[from.min(to)..to] {
        let op = ops.get(op_ref);
        let prev = op.chain_prev.is_valid().then(|| *ops.get(op.chain_prev));
        stats.number_of_operations = stats.number_of_operations.wrapping_add(1);
        stats.record(op, prev.as_ref());
    }
}

/// Running live-block / live-byte totals used for group peak context.
fn update_live(
    op: &MemoryOperation,
    prev: Option<&MemoryOperation>,
    live_blocks: &mut u64,
    live_size: &mut u64,
) {
    match op.kind {
        OpKind::Alloc | OpKind::Calloc | OpKind::AllocAligned => {
            *live_blocks = live_blocks.wrapping_add(1);
            *live_size = live_size.wrapping_add(op.alloc_size);
        }
        OpKind::Realloc | OpKind::ReallocAligned => {
            if prev.is_none() {
                *live_blocks = live_blocks.wrapping_add(1);
            } else if op.alloc_size == 0 {
                *live_blocks = live_blocks.wrapping_sub(1);
            }
            *live_size = live_size.wrapping_add(op.alloc_size);
            if let Some(prev) = prev {
                *live_size = live_size.wrapping_sub(prev.alloc_size);
            }
        }
        OpKind::Free => {
            *live_blocks = live_blocks.wrapping_sub(1);
            *live_size = live_size.wrapping_sub(op.alloc_size);
        }
    }
}

/// Net effect of one operation on its tag node. A predecessor outside the
/// filter contributes nothing, mirroring the call-tree rule.
fn tag_delta(
    op: &MemoryOperation,
    prev: Option<&MemoryOperation>,
    filter: &FilterView,
    traces: &StackTracePool,
) -> i64 {
    let released = prev
        .filter(|p| filter.accepts(p, traces))
        .map_or(0, |p| p.alloc_size as i64);

    match op.kind {
        OpKind::Alloc | OpKind::Calloc | OpKind::AllocAligned => op.alloc_size as i64,
        OpKind::Free => -released,
        OpKind::Realloc | OpKind::ReallocAligned => op.alloc_size as i64 - released,
    }
}
