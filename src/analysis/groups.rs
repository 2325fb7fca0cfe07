//! Operation groups keyed by stack-trace identity
//!
//! Every operation joins the group of its backtrace; frees and reallocs
//! additionally release their predecessor's bytes from the predecessor's
//! group when that predecessor passes the active filter. Peak values
//! snapshot the global live state at the moment the group peaked, which
//! is what lets a front end answer "how much of the program's memory was
//! this call site at its worst".

use std::collections::HashMap;

use crate::analysis::filter::FilterView;
use crate::domain::{MemoryOperation, OpKind, OpRef, TraceRef};
use crate::loader::pool::{OperationPool, StackTracePool};

pub type GroupMap = HashMap<TraceRef, MemoryOperationGroup>;

#[derive(Debug, Clone)]
pub struct MemoryOperationGroup {
    pub operations: Vec<OpRef>,
    pub count: u32,
    pub live_count: u32,
    pub live_size: i64,
    pub min_size: u64,
    pub max_size: u64,
    pub peak_size: i64,
    /// Global live bytes at the moment this group's size peaked.
    pub peak_size_global: u64,
    pub live_count_peak: u32,
    /// Global live blocks at the moment this group's count peaked.
    pub live_count_peak_global: u64,
}

impl Default for MemoryOperationGroup {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            count: 0,
            live_count: 0,
            live_size: 0,
            min_size: u64::MAX,
            max_size: 0,
            peak_size: 0,
            peak_size_global: 0,
            live_count_peak: 0,
            live_count_peak_global: 0,
        }
    }
}

impl MemoryOperationGroup {
    fn track_sizes(&mut self, size: u64) {
        self.min_size = self.min_size.min(size);
        self.max_size = self.max_size.max(size);
    }

    fn track_peaks(&mut self, live_blocks: u64, live_size: u64) {
        if self.live_size > self.peak_size {
            self.peak_size = self.live_size;
            self.peak_size_global = live_size;
        }
        if self.live_count > self.live_count_peak {
            self.live_count_peak = self.live_count;
            self.live_count_peak_global = live_blocks;
        }
    }
}

/// Add one operation to the group map. `live_blocks`/`live_size` are the
/// running totals of the aggregation pass, sampled after this op.
#[allow(clippy::too_many_arguments)]
pub fn add_operation(
    groups: &mut GroupMap,
    ops: &OperationPool,
    traces: &StackTracePool,
    filter: &FilterView,
    op_ref: OpRef,
    op: &MemoryOperation,
    live_blocks: u64,
    live_size: u64,
) {
    match op.kind {
        OpKind::Alloc | OpKind::Calloc | OpKind::AllocAligned => {
            let group = groups.entry(op.stack_trace).or_default();
            group.operations.push(op_ref);
            group.count = group.count.wrapping_add(1);
            group.live_count = group.live_count.wrapping_add(1);
            group.track_sizes(op.alloc_size);
            group.live_size += op.alloc_size as i64;
            group.track_peaks(live_blocks, live_size);
        }

        OpKind::Free => {
            release_predecessor(groups, ops, traces, filter, op.chain_prev);

            let group = groups.entry(op.stack_trace).or_default();
            group.operations.push(op_ref);
            group.count = group.count.wrapping_add(1);
            group.track_sizes(op.alloc_size);
            group.peak_size = group.peak_size.max(group.live_size);
        }

        OpKind::Realloc | OpKind::ReallocAligned => {
            release_predecessor(groups, ops, traces, filter, op.chain_prev);

            let group = groups.entry(op.stack_trace).or_default();
            group.operations.push(op_ref);
            group.count = group.count.wrapping_add(1);
            group.live_count = group.live_count.wrapping_add(1);
            group.track_sizes(op.alloc_size);
            group.live_size += op.alloc_size as i64;
            group.track_peaks(live_blocks, live_size);
        }
    }
}

/// Return the predecessor's bytes to its own group, provided the
/// predecessor itself passes the filter.
fn release_predecessor(
    groups: &mut GroupMap,
    ops: &OperationPool,
    traces: &StackTracePool,
    filter: &FilterView,
    prev_ref: OpRef,
) {
    if !prev_ref.is_valid() {
        return;
    }
    let prev = ops.get(prev_ref);
    if !filter.accepts(prev, traces) {
        return;
    }

    let group = groups.entry(prev.stack_trace).or_default();
    group.live_count = group.live_count.wrapping_sub(1);
    group.live_size -= prev.alloc_size as i64;
}
