//! The filter predicate applied when rebuilding filtered aggregates
//!
//! A `FilterView` is a detached copy of the capture's filter state so the
//! aggregation passes can evaluate it without borrowing the whole capture.

use crate::analysis::stats::histogram_bin_index;
use crate::domain::MemoryOperation;
use crate::loader::pool::StackTracePool;

#[derive(Debug, Clone, Copy)]
pub struct FilterView {
    pub enabled: bool,
    pub min_time: u64,
    pub max_time: u64,
    pub histogram_index: Option<usize>,
    /// 0 = no tag selected.
    pub tag_hash: u32,
    /// 0 = no thread selected.
    pub thread_id: u64,
    pub leaked_only: bool,
    pub heap: Option<u64>,
    /// Half-open address range of the selected module.
    pub module_range: Option<(u64, u64)>,
}

impl FilterView {
    /// A view that accepts every valid operation; used by the global pass.
    #[must_use]
    pub fn pass_all() -> Self {
        Self {
            enabled: false,
            min_time: 0,
            max_time: u64::MAX,
            histogram_index: None,
            tag_hash: 0,
            thread_id: 0,
            leaked_only: false,
            heap: None,
            module_range: None,
        }
    }

    /// The filter predicate: every enabled constraint must hold.
    #[must_use]
    pub fn accepts(&self, op: &MemoryOperation, traces: &StackTracePool) -> bool {
        if !op.is_valid {
            return false;
        }
        if !self.enabled {
            return true;
        }

        if let Some(heap) = self.heap {
            if op.allocator_handle != heap {
                return false;
            }
        }
        if let Some(bin) = self.histogram_index {
            if histogram_bin_index(op.alloc_size) != bin {
                return false;
            }
        }
        if self.tag_hash != 0 && op.tag != self.tag_hash {
            return false;
        }
        if self.thread_id != 0 && op.thread_id != self.thread_id {
            return false;
        }
        if op.time < self.min_time || op.time > self.max_time {
            return false;
        }
        if let Some((start, end)) = self.module_range {
            let in_module = traces
                .addresses(op.stack_trace)
                .iter()
                .any(|&addr| addr >= start && addr < end);
            if !in_module {
                return false;
            }
        }
        if self.leaked_only && !op.is_leaked() {
            return false;
        }
        true
    }
}
