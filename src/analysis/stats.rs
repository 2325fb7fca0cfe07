//! Global and windowed memory statistics
//!
//! All counters use wrapping arithmetic: corrupt captures can drive live
//! values below zero, which wraps into the sign bit and is then rejected
//! by [`MemoryStats::verify`] instead of aborting the load mid-pass.

use crate::domain::MemoryOperation;

/// Power-of-two allocation-size bins. Bin 0 holds sizes up to 16 bytes,
/// each following bin doubles the limit, the last bin is open-ended.
pub const NUM_HISTOGRAM_BINS: usize = 16;

const FIRST_BIN_LIMIT: u64 = 16;

const SIGN_64: u64 = 0x8000_0000_0000_0000;
const SIGN_32: u32 = 0x8000_0000;

/// Histogram bin an allocation of `size` bytes falls into.
#[must_use]
pub fn histogram_bin_index(size: u64) -> usize {
    let mut bin = 0;
    let mut limit = FIRST_BIN_LIMIT;
    while size > limit && bin < NUM_HISTOGRAM_BINS - 1 {
        limit <<= 1;
        bin += 1;
    }
    bin
}

/// Snapshot cadence mask: a timed snapshot is emitted whenever
/// `op_index & mask == 0`. Coarser for larger captures.
#[must_use]
pub fn snapshot_granularity_mask(num_ops: usize) -> u32 {
    let mut granularity: u32 = 2048;
    if num_ops > 1024 * 1024 {
        granularity = 4096;
    }
    if num_ops > 10 * 1024 * 1024 {
        granularity = 8192;
    }
    granularity - 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistogramBin {
    pub size: u64,
    pub size_peak: u64,
    pub overhead: u32,
    pub overhead_peak: u32,
    pub count: u32,
    pub count_peak: u32,
}

impl HistogramBin {
    fn add(&mut self, size: u64, overhead: u32) {
        self.size = self.size.wrapping_add(size);
        self.size_peak = self.size_peak.max(self.size);
        self.overhead = self.overhead.wrapping_add(overhead);
        self.overhead_peak = self.overhead_peak.max(self.overhead);
        self.count = self.count.wrapping_add(1);
        self.count_peak = self.count_peak.max(self.count);
    }

    fn remove(&mut self, size: u64, overhead: u32) {
        self.size = self.size.wrapping_sub(size);
        self.overhead = self.overhead.wrapping_sub(overhead);
        self.count = self.count.wrapping_sub(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub memory_usage: u64,
    pub memory_usage_peak: u64,
    pub overhead: u32,
    pub overhead_peak: u32,
    pub number_of_operations: u32,
    pub number_of_allocations: u32,
    pub number_of_reallocations: u32,
    pub number_of_frees: u32,
    pub number_of_live_blocks: u32,
    pub histogram: [HistogramBin; NUM_HISTOGRAM_BINS],
}

impl MemoryStats {
    /// Apply one operation; the caller has already bumped
    /// `number_of_operations`. Returns the histogram bin the op landed in
    /// so local peaks can track it.
    pub fn record(&mut self, op: &MemoryOperation, prev: Option<&MemoryOperation>) -> usize {
        use crate::domain::OpKind;
        match op.kind {
            OpKind::Alloc | OpKind::Calloc | OpKind::AllocAligned => {
                self.record_alloc(op.alloc_size, op.overhead)
            }
            OpKind::Realloc | OpKind::ReallocAligned => self.record_realloc(
                op.alloc_size,
                op.overhead,
                prev.map(|p| (p.alloc_size, p.overhead)),
            ),
            OpKind::Free => self.record_free(op.alloc_size, op.overhead),
        }
    }

    fn record_alloc(&mut self, size: u64, overhead: u32) -> usize {
        self.number_of_allocations = self.number_of_allocations.wrapping_add(1);
        self.number_of_live_blocks = self.number_of_live_blocks.wrapping_add(1);

        self.memory_usage = self.memory_usage.wrapping_add(size);
        self.memory_usage_peak = self.memory_usage_peak.max(self.memory_usage);
        self.overhead = self.overhead.wrapping_add(overhead);
        self.overhead_peak = self.overhead_peak.max(self.overhead);

        let bin = histogram_bin_index(size);
        self.histogram[bin].add(size, overhead);
        bin
    }

    fn record_realloc(&mut self, size: u64, overhead: u32, prev: Option<(u64, u32)>) -> usize {
        self.number_of_reallocations = self.number_of_reallocations.wrapping_add(1);

        let frees_block = size == 0 && prev.is_some();
        match prev {
            None => self.number_of_live_blocks = self.number_of_live_blocks.wrapping_add(1),
            Some(_) if frees_block => {
                self.number_of_live_blocks = self.number_of_live_blocks.wrapping_sub(1);
            }
            Some(_) => {}
        }

        self.memory_usage = self.memory_usage.wrapping_add(size);
        self.overhead = self.overhead.wrapping_add(overhead);
        if let Some((prev_size, prev_overhead)) = prev {
            self.memory_usage = self.memory_usage.wrapping_sub(prev_size);
            self.overhead = self.overhead.wrapping_sub(prev_overhead);
            self.histogram[histogram_bin_index(prev_size)].remove(prev_size, prev_overhead);
        }
        self.memory_usage_peak = self.memory_usage_peak.max(self.memory_usage);
        self.overhead_peak = self.overhead_peak.max(self.overhead);

        if frees_block {
            // a shrink to zero is a free in realloc clothing: the block
            // left its old bin and enters no new one
            histogram_bin_index(prev.unwrap_or_default().0)
        } else {
            let bin = histogram_bin_index(size);
            self.histogram[bin].add(size, overhead);
            bin
        }
    }

    fn record_free(&mut self, size: u64, overhead: u32) -> usize {
        self.number_of_frees = self.number_of_frees.wrapping_add(1);
        self.number_of_live_blocks = self.number_of_live_blocks.wrapping_sub(1);

        self.memory_usage = self.memory_usage.wrapping_sub(size);
        self.overhead = self.overhead.wrapping_sub(overhead);

        let bin = histogram_bin_index(size);
        self.histogram[bin].remove(size, overhead);
        bin
    }

    /// Collapse every peak onto its current value, the baseline for
    /// windowed queries.
    pub fn set_peaks_to_current(&mut self) {
        self.memory_usage_peak = self.memory_usage;
        self.overhead_peak = self.overhead;
        for bin in &mut self.histogram {
            bin.size_peak = bin.size;
            bin.overhead_peak = bin.overhead;
            bin.count_peak = bin.count;
        }
    }

    /// Take peaks from an accumulated local-peak record.
    pub fn set_peaks_from(&mut self, peak: &MemoryStatsLocalPeak) {
        self.memory_usage_peak = peak.memory_usage_peak;
        self.overhead_peak = peak.overhead_peak;
        for (bin, p) in self.histogram.iter_mut().zip(&peak.histogram) {
            bin.size_peak = p.size_peak;
            bin.overhead_peak = p.overhead_peak;
            bin.count_peak = p.count_peak;
        }
    }

    /// Snapshot the current peak state as a local-peak record.
    #[must_use]
    pub fn peaks_as_local(&self) -> MemoryStatsLocalPeak {
        let mut peak = MemoryStatsLocalPeak {
            memory_usage_peak: self.memory_usage_peak,
            overhead_peak: self.overhead_peak,
            num_live_blocks_peak: self.number_of_live_blocks,
            ..Default::default()
        };
        for (p, bin) in peak.histogram.iter_mut().zip(&self.histogram) {
            p.size_peak = bin.size_peak;
            p.overhead_peak = bin.overhead_peak;
            p.count_peak = bin.count_peak;
        }
        peak
    }

    /// Reject aggregates whose unsigned counters wrapped through zero.
    #[must_use]
    pub fn verify(&self) -> bool {
        if self.memory_usage & SIGN_64 != 0
            || self.memory_usage_peak & SIGN_64 != 0
            || self.overhead & SIGN_32 != 0
            || self.overhead_peak & SIGN_32 != 0
            || self.number_of_operations & SIGN_32 != 0
            || self.number_of_allocations & SIGN_32 != 0
            || self.number_of_reallocations & SIGN_32 != 0
            || self.number_of_frees & SIGN_32 != 0
            || self.number_of_live_blocks & SIGN_32 != 0
        {
            return false;
        }

        self.histogram.iter().all(|bin| {
            bin.size & SIGN_64 == 0
                && bin.size_peak & SIGN_64 == 0
                && bin.overhead & SIGN_32 == 0
                && bin.overhead_peak & SIGN_32 == 0
                && bin.count & SIGN_32 == 0
                && bin.count_peak & SIGN_32 == 0
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistogramLocalPeak {
    pub size_peak: u64,
    pub overhead_peak: u32,
    pub count_peak: u32,
}

/// Max-since-last-snapshot tracker, reset at every timed snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStatsLocalPeak {
    pub memory_usage_peak: u64,
    pub overhead_peak: u32,
    pub num_live_blocks_peak: u32,
    pub histogram: [HistogramLocalPeak; NUM_HISTOGRAM_BINS],
}

impl MemoryStatsLocalPeak {
    /// Fold in the current stats after an alloc/realloc touched `bin`.
    pub fn update(&mut self, stats: &MemoryStats, bin: usize) {
        self.memory_usage_peak = self.memory_usage_peak.max(stats.memory_usage);
        self.overhead_peak = self.overhead_peak.max(stats.overhead);
        self.num_live_blocks_peak = self.num_live_blocks_peak.max(stats.number_of_live_blocks);

        let hp = &mut self.histogram[bin];
        let hb = &stats.histogram[bin];
        hp.size_peak = hp.size_peak.max(hb.size);
        hp.overhead_peak = hp.overhead_peak.max(hb.overhead);
        hp.count_peak = hp.count_peak.max(hb.count);
    }

    /// Element-wise maximum with another local peak.
    pub fn merge_max(&mut self, other: &MemoryStatsLocalPeak) {
        self.memory_usage_peak = self.memory_usage_peak.max(other.memory_usage_peak);
        self.overhead_peak = self.overhead_peak.max(other.overhead_peak);
        self.num_live_blocks_peak = self.num_live_blocks_peak.max(other.num_live_blocks_peak);
        for (a, b) in self.histogram.iter_mut().zip(&other.histogram) {
            a.size_peak = a.size_peak.max(b.size_peak);
            a.overhead_peak = a.overhead_peak.max(b.overhead_peak);
            a.count_peak = a.count_peak.max(b.count_peak);
        }
    }
}

/// Periodic snapshot: the jump table for sub-linear window queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStatsTimed {
    pub time: u64,
    /// Index into the sorted operation list; the snapshot covers every
    /// operation before this index.
    pub operation_index: u32,
    pub local_peak: MemoryStatsLocalPeak,
    pub stats: MemoryStats,
}
