//! The capture facade: load pipeline, filter engine and window queries
//!
//! A `Capture` is one loaded trace file with all of its derived
//! aggregates. Loading runs the whole pipeline: byte stream -> header and
//! module table -> event parsing and interning -> parallel time sort ->
//! chain linking -> parallel symbol resolution -> the single aggregation
//! pass. Afterwards the capture is a read-only value; the filter mutators
//! only rebuild derived views, never the operations themselves.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use log::info;
use rayon::prelude::*;

use crate::analysis::aggregator::{self, ranged_stats};
use crate::analysis::filter::FilterView;
use crate::analysis::groups::GroupMap;
use crate::analysis::stats::{MemoryStats, MemoryStatsTimed};
use crate::analysis::{StackTree, TagTree};
use crate::domain::{
    CaptureError, GraphEntry, LoadOutcome, MarkerEvent, MarkerTime, MemoryOperation, OpRef,
    Toolchain, TraceRef,
};
use crate::loader::header::{read_header, read_module_table, ModuleInfo, ModuleTable};
use crate::loader::linker::link_operations;
use crate::loader::parser::{parse_events, ParseContext};
use crate::loader::pool::{OperationPool, StackTracePool};
use crate::loader::reader::BinReader;
use crate::progress::{Progress, ProgressCallback};
use crate::symbolization::{resolve_traces, SymbolResolver};

/// User-selected filter constraints.
#[derive(Debug, Clone, Copy, Default)]
struct FilterState {
    min_time: u64,
    max_time: u64,
    histogram_index: Option<usize>,
    /// 0 = no tag selected.
    tag_hash: u32,
    /// 0 = no thread selected.
    thread_id: u64,
    leaked_only: bool,
}

/// Aggregates rebuilt under the active filter.
#[derive(Default)]
struct FilteredData {
    operations: Vec<OpRef>,
    groups: GroupMap,
    tree: StackTree,
    tag_tree: TagTree,
}

/// One loaded memory-trace capture and its derived data.
#[derive(Default)]
pub struct Capture {
    loaded_file: Option<PathBuf>,

    big_endian: bool,
    ptr64: bool,
    toolchain: Toolchain,
    cpu_frequency: u64,

    op_pool: OperationPool,
    trace_pool: StackTracePool,
    trace_list: Vec<TraceRef>,
    /// Time-sorted valid operations.
    operations: Vec<OpRef>,
    invalid_operation_count: usize,

    modules: ModuleTable,
    heaps: HashMap<u64, String>,
    markers: HashMap<u32, MarkerEvent>,
    marker_timeline: Vec<MarkerTime>,

    stats_global: MemoryStats,
    stats_snapshot: MemoryStats,
    timed_stats: Vec<MemoryStatsTimed>,
    usage_graph: Vec<GraphEntry>,
    leaks: Vec<OpRef>,
    groups_global: GroupMap,
    tree_global: StackTree,
    tag_tree: TagTree,

    filtered: FilteredData,
    filter: FilterState,
    current_heap: Option<u64>,
    current_module: Option<usize>,
    filtering_enabled: bool,

    min_time: u64,
    max_time: u64,

    progress: Progress,
}

impl Capture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_progress_callback(&mut self, callback: ProgressCallback) {
        self.progress.set_callback(callback);
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Load a capture file from disk.
    pub fn load_path(
        &mut self,
        path: impl AsRef<Path>,
        resolver: &dyn SymbolResolver,
    ) -> Result<LoadOutcome, CaptureError> {
        let path = path.as_ref();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(source) => {
                let error = CaptureError::IoOpen { path: path.to_path_buf(), source };
                self.progress.report(100.0, "Error reading capture file!");
                self.clear_data();
                return Err(error);
            }
        };
        let file_size = file.metadata().ok().map(|m| m.len());

        let outcome = self.load_reader(BufReader::new(file), file_size, resolver)?;
        self.loaded_file = Some(path.to_path_buf());
        Ok(outcome)
    }

    /// Load a capture from any byte source. `file_size` (bytes on disk)
    /// enables progress percentages and the truncation tolerance window.
    pub fn load_reader(
        &mut self,
        reader: impl Read,
        file_size: Option<u64>,
        resolver: &dyn SymbolResolver,
    ) -> Result<LoadOutcome, CaptureError> {
        match self.try_load(reader, file_size, resolver) {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let message = match &error {
                    CaptureError::NoOperations | CaptureError::Invariant => {
                        "Invalid data in capture file!"
                    }
                    _ => "Error reading capture file!",
                };
                self.progress.report(100.0, message);
                self.clear_data();
                Err(error)
            }
        }
    }

    fn try_load(
        &mut self,
        reader: impl Read,
        file_size: Option<u64>,
        resolver: &dyn SymbolResolver,
    ) -> Result<LoadOutcome, CaptureError> {
        self.clear_data();

        let mut r = BinReader::new(reader)?;
        let header = read_header(&mut r)?;
        self.big_endian = header.big_endian;
        self.ptr64 = header.ptr64;
        self.toolchain = header.toolchain;
        self.cpu_frequency = header.cpu_frequency;
        self.modules.set_toolchain(header.toolchain);

        read_module_table(&mut r, &mut self.modules, &mut self.progress, file_size)?;

        let summary = parse_events(
            &mut r,
            self.ptr64,
            file_size,
            ParseContext {
                ops: &mut self.op_pool,
                trace_pool: &mut self.trace_pool,
                traces: &mut self.trace_list,
                operations: &mut self.operations,
                heaps: &mut self.heaps,
                tag_tree: &mut self.tag_tree,
                markers: &mut self.markers,
                marker_timeline: &mut self.marker_timeline,
                modules: &mut self.modules,
                progress: &mut self.progress,
            },
        )?;
        drop(r);

        self.progress.report(100.0, "Sorting...");
        {
            let pool = &self.op_pool;
            self.operations.par_sort_by_key(|&op| pool.get(op).time);
        }

        let link = link_operations(&mut self.op_pool, &mut self.operations, &mut self.progress);
        self.invalid_operation_count = link.invalid_operations;
        if self.operations.is_empty() {
            return Err(CaptureError::NoOperations);
        }

        let first_time = self.op_pool.get(self.operations[0]).time;
        self.min_time = first_time.min(summary.min_marker_time);
        self.max_time = self.op_pool.get(self.operations[self.operations.len() - 1]).time;
        self.filter.min_time = self.min_time;
        self.filter.max_time = self.max_time;

        resolve_traces(resolver, &mut self.trace_pool, &self.trace_list, &mut self.progress);

        let output = aggregator::run_global_pass(
            &mut self.op_pool,
            &mut self.trace_pool,
            &self.operations,
            &mut self.heaps,
            &mut self.tag_tree,
            &mut self.progress,
        );
        self.stats_global = output.stats;
        self.stats_snapshot = output.stats;
        self.timed_stats = output.timed_stats;
        self.usage_graph = output.usage_graph;
        self.leaks = output.leaks;
        self.groups_global = output.groups;
        self.tree_global = output.tree;

        if !self.stats_global.verify() {
            return Err(CaptureError::Invariant);
        }

        info!(
            "loaded capture: {} operations, {} traces, {} heaps, time range [{}, {}]",
            self.operations.len(),
            self.trace_list.len(),
            self.heaps.len(),
            self.min_time,
            self.max_time,
        );

        Ok(if summary.complete { LoadOutcome::Complete } else { LoadOutcome::Partial })
    }

    /// Drop all loaded data. Pools reset in O(1); the progress callback
    /// survives so a reload keeps reporting.
    pub fn clear_data(&mut self) {
        self.loaded_file = None;
        self.big_endian = false;
        self.ptr64 = false;
        self.toolchain = Toolchain::default();
        self.cpu_frequency = 0;

        self.op_pool.reset();
        self.trace_pool.reset();
        self.trace_list.clear();
        self.operations.clear();
        self.invalid_operation_count = 0;

        self.modules.clear();
        self.heaps.clear();
        self.markers.clear();
        self.marker_timeline.clear();

        self.stats_global = MemoryStats::default();
        self.stats_snapshot = MemoryStats::default();
        self.timed_stats.clear();
        self.usage_graph.clear();
        self.leaks.clear();
        self.groups_global = GroupMap::new();
        self.tree_global = StackTree::new();
        self.tag_tree = TagTree::new();

        self.filtered = FilteredData::default();
        self.filter = FilterState::default();
        self.current_heap = None;
        self.current_module = None;
        self.filtering_enabled = false;

        self.min_time = 0;
        self.max_time = 0;
    }

    // ------------------------------------------------------------------
    // Filter engine
    // ------------------------------------------------------------------

    fn filter_view(&self) -> FilterView {
        FilterView {
            enabled: self.filtering_enabled,
            min_time: self.filter.min_time,
            max_time: self.filter.max_time,
            histogram_index: self.filter.histogram_index,
            tag_hash: self.filter.tag_hash,
            thread_id: self.filter.thread_id,
            leaked_only: self.filter.leaked_only,
            heap: self.current_heap,
            module_range: self
                .current_module
                .and_then(|i| self.modules.get(i))
                .map(|m| (m.base_address, m.base_address.saturating_add(m.size))),
        }
    }

    /// Does this operation pass the current filter?
    #[must_use]
    pub fn is_in_filter(&self, op: OpRef) -> bool {
        self.filter_view().accepts(self.op_pool.get(op), &self.trace_pool)
    }

    pub fn set_filtering_enabled(&mut self, enabled: bool) {
        self.filtering_enabled = enabled;
        if enabled {
            self.calculate_filtered_data();
        }
    }

    /// Restrict the window to `[min_time, max_time]`. Values outside the
    /// capture's range are ignored.
    pub fn set_snapshot(&mut self, min_time: u64, max_time: u64) {
        if min_time < self.min_time || max_time > self.max_time {
            return;
        }
        if self.filter.min_time != min_time || self.filter.max_time != max_time {
            self.filter.min_time = min_time;
            self.filter.max_time = max_time;
            self.refresh_after_filter_change();
        }
    }

    pub fn select_histogram_bin(&mut self, index: usize) {
        if self.filter.histogram_index != Some(index) {
            self.filter.histogram_index = Some(index);
            self.refresh_after_filter_change();
        }
    }

    pub fn deselect_histogram_bin(&mut self) {
        if self.filter.histogram_index.is_some() {
            self.filter.histogram_index = None;
            self.refresh_after_filter_change();
        }
    }

    pub fn select_tag(&mut self, tag_hash: u32) {
        if self.filter.tag_hash != tag_hash {
            self.filter.tag_hash = tag_hash;
            self.refresh_after_filter_change();
        }
    }

    pub fn deselect_tag(&mut self) {
        if self.filter.tag_hash != 0 {
            self.filter.tag_hash = 0;
            self.refresh_after_filter_change();
        }
    }

    pub fn select_thread(&mut self, thread_id: u64) {
        if self.filter.thread_id != thread_id {
            self.filter.thread_id = thread_id;
            self.refresh_after_filter_change();
        }
    }

    pub fn deselect_thread(&mut self) {
        if self.filter.thread_id != 0 {
            self.filter.thread_id = 0;
            self.refresh_after_filter_change();
        }
    }

    pub fn select_heap(&mut self, handle: u64) {
        if self.current_heap != Some(handle) {
            self.current_heap = Some(handle);
            self.rebuild_filtered_if_enabled();
        }
    }

    pub fn deselect_heap(&mut self) {
        if self.current_heap.is_some() {
            self.current_heap = None;
            self.rebuild_filtered_if_enabled();
        }
    }

    /// Select a module by its index in [`Capture::modules`].
    pub fn select_module(&mut self, index: usize) {
        if index < self.modules.len() && self.current_module != Some(index) {
            self.current_module = Some(index);
            self.rebuild_filtered_if_enabled();
        }
    }

    pub fn deselect_module(&mut self) {
        if self.current_module.is_some() {
            self.current_module = None;
            self.rebuild_filtered_if_enabled();
        }
    }

    pub fn set_leaked_only(&mut self, leaked_only: bool) {
        if self.filter.leaked_only != leaked_only {
            self.filter.leaked_only = leaked_only;
            self.rebuild_filtered_if_enabled();
        }
    }

    fn refresh_after_filter_change(&mut self) {
        self.calculate_snapshot_stats();
        self.rebuild_filtered_if_enabled();
    }

    fn rebuild_filtered_if_enabled(&mut self) {
        if self.filtering_enabled {
            self.calculate_filtered_data();
        }
    }

    fn calculate_filtered_data(&mut self) {
        if self.operations.is_empty() {
            return;
        }
        let (start, _) = self.op_lower_bound(self.filter.min_time);
        let (end, _) = self.op_upper_bound(self.filter.max_time);
        let filter = self.filter_view();

        let out = aggregator::run_filtered_pass(
            &self.op_pool,
            &mut self.trace_pool,
            &self.operations,
            &self.trace_list,
            start..end,
            &filter,
            &self.tag_tree,
            &mut self.progress,
        );
        self.filtered = FilteredData {
            operations: out.operations,
            groups: out.groups,
            tree: out.tree,
            tag_tree: out.tag_tree,
        };
    }

    // ------------------------------------------------------------------
    // Time index
    // ------------------------------------------------------------------

    /// Operation range `[start, end)` covered by the snapshot bracket.
    fn bracket(&self, timed_idx: usize) -> (usize, usize) {
        let len = self.operations.len();
        let start = (self.timed_stats[timed_idx].operation_index as usize).min(len);
        let end = if timed_idx + 1 < self.timed_stats.len() {
            (self.timed_stats[timed_idx + 1].operation_index as usize + 1).min(len)
        } else {
            len
        };
        (start, end.max(start))
    }

    /// First op index with `time >= t`, plus the snapshot index at/before.
    fn op_lower_bound(&self, time: u64) -> (usize, usize) {
        if self.timed_stats.is_empty() {
            return (0, 0);
        }
        let timed_idx = self.timed_stats.partition_point(|s| s.time < time).saturating_sub(1);
        let (start, end) = self.bracket(timed_idx);
        let rel = self.operations[start..end]
            .partition_point(|&r| self.op_pool.get(r).time < time);
        (start + rel, timed_idx)
    }

    /// First op index with `time > t`, plus the snapshot index at/before.
    fn op_upper_bound(&self, time: u64) -> (usize, usize) {
        if self.timed_stats.is_empty() {
            return (0, 0);
        }
        let timed_idx = self.timed_stats.partition_point(|s| s.time <= time).saturating_sub(1);
        let (start, end) = self.bracket(timed_idx);
        let rel = self.operations[start..end]
            .partition_point(|&r| self.op_pool.get(r).time <= time);
        (start + rel, timed_idx)
    }

    /// Index of the last operation with `time < t`; 0 when none exists.
    #[must_use]
    pub fn index_before(&self, time: u64) -> usize {
        self.op_lower_bound(time).0.saturating_sub(1)
    }

    /// Index of the first operation with `time > t`; the last index when
    /// none exists.
    #[must_use]
    pub fn index_after(&self, time: u64) -> usize {
        let (after, _) = self.op_upper_bound(time);
        after.min(self.operations.len().saturating_sub(1))
    }

    /// Usage-graph entry in effect at the given time.
    #[must_use]
    pub fn graph_at_time(&self, time: u64) -> GraphEntry {
        self.usage_graph[self.index_before(time)]
    }

    // ------------------------------------------------------------------
    // Snapshot stats
    // ------------------------------------------------------------------

    /// Stats for the selected `[min_time, max_time]` window: live values
    /// are absolute at the window end, peaks cover only the window, and
    /// the op-kind counters are window-relative differences.
    fn calculate_snapshot_stats(&mut self) {
        if self.operations.is_empty() || self.timed_stats.is_empty() {
            return;
        }

        let (min_op, min_timed) = self.op_lower_bound(self.filter.min_time);
        let (end_op, max_timed) = self.op_upper_bound(self.filter.max_time);

        let start_snapshot = self.timed_stats[min_timed];
        let start_index = start_snapshot.operation_index as usize;

        if max_timed < min_timed + 2 {
            // window inside one snapshot bracket: catch up and integrate
            let mut stats = start_snapshot.stats;
            ranged_stats(&mut stats, &self.op_pool, &self.operations, start_index, min_op);
            let start_counts = counters_of(&stats);

            stats.set_peaks_to_current();
            ranged_stats(&mut stats, &self.op_pool, &self.operations, min_op, end_op);

            subtract_counters(&mut stats, start_counts);
            self.stats_snapshot = stats;
            return;
        }

        // window spans snapshots: integrate the edges, take intermediate
        // peaks from the stored local-peak records
        let mut start_stats = start_snapshot.stats;
        ranged_stats(&mut start_stats, &self.op_pool, &self.operations, start_index, min_op);
        let start_counts = counters_of(&start_stats);

        let mut stats = start_stats;
        stats.set_peaks_to_current();
        let boundary = self.timed_stats[min_timed + 1].operation_index as usize;
        ranged_stats(&mut stats, &self.op_pool, &self.operations, min_op, boundary);

        let mut local_peak = stats.peaks_as_local();
        for t in min_timed + 2..=max_timed {
            local_peak.merge_max(&self.timed_stats[t].local_peak);
        }
        stats.set_peaks_from(&local_peak);

        // jump to the last bracket's absolutes and integrate the tail
        let last = &self.timed_stats[max_timed];
        stats.memory_usage = last.stats.memory_usage;
        stats.overhead = last.stats.overhead;
        stats.number_of_live_blocks = last.stats.number_of_live_blocks;
        stats.number_of_operations = last.stats.number_of_operations;
        stats.number_of_allocations = last.stats.number_of_allocations;
        stats.number_of_reallocations = last.stats.number_of_reallocations;
        stats.number_of_frees = last.stats.number_of_frees;
        for (bin, src) in stats.histogram.iter_mut().zip(&last.stats.histogram) {
            bin.size = src.size;
            bin.overhead = src.overhead;
            bin.count = src.count;
        }

        let tail_start = last.operation_index as usize;
        ranged_stats(&mut stats, &self.op_pool, &self.operations, tail_start, end_op);

        subtract_counters(&mut stats, start_counts);
        self.stats_snapshot = stats;
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[must_use]
    pub fn loaded_file(&self) -> Option<&Path> {
        self.loaded_file.as_deref()
    }

    #[must_use]
    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.ptr64
    }

    #[must_use]
    pub fn toolchain(&self) -> Toolchain {
        self.toolchain
    }

    #[must_use]
    pub fn cpu_frequency(&self) -> u64 {
        self.cpu_frequency
    }

    /// Time-sorted valid operations.
    #[must_use]
    pub fn operations(&self) -> &[OpRef] {
        &self.operations
    }

    #[must_use]
    pub fn operation(&self, op: OpRef) -> &MemoryOperation {
        self.op_pool.get(op)
    }

    /// Operations rejected by the linker, kept for diagnostics.
    #[must_use]
    pub fn invalid_operation_count(&self) -> usize {
        self.invalid_operation_count
    }

    #[must_use]
    pub fn leaks(&self) -> &[OpRef] {
        &self.leaks
    }

    #[must_use]
    pub fn heaps(&self) -> &HashMap<u64, String> {
        &self.heaps
    }

    #[must_use]
    pub fn modules(&self) -> &[ModuleInfo] {
        self.modules.modules()
    }

    #[must_use]
    pub fn markers(&self) -> &HashMap<u32, MarkerEvent> {
        &self.markers
    }

    #[must_use]
    pub fn marker_timeline(&self) -> &[MarkerTime] {
        &self.marker_timeline
    }

    #[must_use]
    pub fn usage_graph(&self) -> &[GraphEntry] {
        &self.usage_graph
    }

    #[must_use]
    pub fn timed_stats(&self) -> &[MemoryStatsTimed] {
        &self.timed_stats
    }

    #[must_use]
    pub fn global_stats(&self) -> &MemoryStats {
        &self.stats_global
    }

    /// Stats for the selected time window.
    #[must_use]
    pub fn snapshot_stats(&self) -> &MemoryStats {
        &self.stats_snapshot
    }

    #[must_use]
    pub fn global_groups(&self) -> &GroupMap {
        &self.groups_global
    }

    #[must_use]
    pub fn global_tree(&self) -> &StackTree {
        &self.tree_global
    }

    #[must_use]
    pub fn tag_tree(&self) -> &TagTree {
        &self.tag_tree
    }

    #[must_use]
    pub fn filtered_operations(&self) -> &[OpRef] {
        &self.filtered.operations
    }

    #[must_use]
    pub fn filtered_groups(&self) -> &GroupMap {
        &self.filtered.groups
    }

    #[must_use]
    pub fn filtered_tree(&self) -> &StackTree {
        &self.filtered.tree
    }

    #[must_use]
    pub fn filtered_tag_tree(&self) -> &TagTree {
        &self.filtered.tag_tree
    }

    #[must_use]
    pub fn stack_traces(&self) -> &[TraceRef] {
        &self.trace_list
    }

    #[must_use]
    pub fn trace_pool(&self) -> &StackTracePool {
        &self.trace_pool
    }

    #[must_use]
    pub fn min_time(&self) -> u64 {
        self.min_time
    }

    #[must_use]
    pub fn max_time(&self) -> u64 {
        self.max_time
    }

    #[must_use]
    pub fn is_filtering_enabled(&self) -> bool {
        self.filtering_enabled
    }

    /// Currently selected window `[min, max]`.
    #[must_use]
    pub fn snapshot_window(&self) -> (u64, u64) {
        (self.filter.min_time, self.filter.max_time)
    }
}

fn counters_of(stats: &MemoryStats) -> [u32; 4] {
    [
        stats.number_of_operations,
        stats.number_of_allocations,
        stats.number_of_reallocations,
        stats.number_of_frees,
    ]
}

fn subtract_counters(stats: &mut MemoryStats, start: [u32; 4]) {
    stats.number_of_operations = stats.number_of_operations.wrapping_sub(start[0]);
    stats.number_of_allocations = stats.number_of_allocations.wrapping_sub(start[1]);
    stats.number_of_reallocations = stats.number_of_reallocations.wrapping_sub(start[2]);
    stats.number_of_frees = stats.number_of_frees.wrapping_sub(start[3]);
}
