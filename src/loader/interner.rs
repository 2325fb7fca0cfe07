//! Stack-trace interning
//!
//! Backtraces are deduplicated by a cheap additive hash plus an exact
//! frame-by-frame compare, so operations captured through the same call
//! path share one arena record. The hash table only lives for the duration
//! of the load; the trace list it feeds outlives it.

use std::collections::HashMap;

use crate::domain::TraceRef;
use crate::loader::pool::StackTracePool;

/// Wrapping sum of the frame addresses, truncated to 32 bits. Matches the
/// hash the tracing runtime precomputes into `Exists` records.
#[must_use]
pub fn hash_frames(frames: &[u64]) -> u32 {
    frames.iter().fold(0u64, |acc, &f| acc.wrapping_add(f)) as u32
}

#[derive(Debug, Default)]
pub struct TraceInterner {
    by_hash: HashMap<u32, TraceRef>,
}

impl TraceInterner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a backtrace under a precomputed hash. A hash hit with equal
    /// frames shares the existing record; a collision with different
    /// frames allocates a fresh record and takes over the hash slot.
    pub fn intern(
        &mut self,
        pool: &mut StackTracePool,
        traces: &mut Vec<TraceRef>,
        frames: &[u64],
        hash: u32,
    ) -> TraceRef {
        if let Some(&existing) = self.by_hash.get(&hash) {
            if pool.frames_equal(existing, frames) {
                return existing;
            }
        }

        let trace = pool.alloc(frames);
        self.by_hash.insert(hash, trace);
        traces.push(trace);
        trace
    }

    /// Look up the trace a previous `Add` record registered for this hash.
    #[must_use]
    pub fn lookup(&self, hash: u32) -> Option<TraceRef> {
        self.by_hash.get(&hash).copied()
    }
}
