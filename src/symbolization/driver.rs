//! Parallel symbol resolution over interned stack traces
//!
//! Every unique address across all traces is resolved exactly once. The
//! resolver is not reentrant within one module, so addresses are bucketed
//! per module and the buckets run in parallel while each bucket resolves
//! sequentially, sorted by address for resolver locality. After the join,
//! symbol IDs are written back into the traces and instrumentation frames
//! are stripped from call-stack tops.

use std::collections::{HashMap, HashSet};

use log::info;
use rayon::prelude::*;

use crate::domain::TraceRef;
use crate::loader::pool::{StackTracePool, TreeScope};
use crate::progress::{Progress, ProgressTicker};
use crate::symbolization::resolver::{SymbolInfo, SymbolResolver};

/// Resolve all trace addresses and rewrite the traces in place.
pub fn resolve_traces(
    resolver: &dyn SymbolResolver,
    pool: &mut StackTracePool,
    traces: &[TraceRef],
    progress: &mut Progress,
) {
    let address_info = resolve_unique_addresses(resolver, pool, traces);

    let total = traces.len();
    let mut ticker = ProgressTicker::new(total);

    for (idx, &trace) in traces.iter().enumerate() {
        if let Some(percent) = ticker.tick(idx, total) {
            progress.report(percent, "Generating unique symbol IDs...");
        }

        let num_frames = pool.num_entries(trace);
        let mut skip = 0;
        let mut counting_skippable = true;

        for frame in 0..num_frames {
            let address = pool.addresses(trace)[frame];
            let info = address_info.get(&address).copied().unwrap_or_default();
            pool.set_symbol_id(trace, frame, info.id);

            if !info.is_instrumentation {
                counting_skippable = false;
            }
            if counting_skippable {
                skip += 1;
            }
        }

        // remove instrumentation from the top of the call stack
        pool.strip_prefix(trace, skip);

        pool.reset_scratch(trace, TreeScope::Global);
        pool.reset_scratch(trace, TreeScope::Filtered);
    }
}

/// Gather every unique frame address, bucket by module, resolve the
/// buckets in parallel, and merge into one lookup map.
fn resolve_unique_addresses(
    resolver: &dyn SymbolResolver,
    pool: &StackTracePool,
    traces: &[TraceRef],
) -> HashMap<u64, SymbolInfo> {
    let mut unique: HashSet<u64> = HashSet::new();
    for &trace in traces {
        unique.extend(pool.addresses(trace).iter().copied());
    }

    // bucket 0 collects addresses outside every known module
    let mut buckets: Vec<Vec<u64>> = vec![Vec::new(); resolver.module_count() + 1];
    for address in unique {
        let bucket = resolver.module_index_of(address).map_or(0, |m| m + 1);
        buckets[bucket].push(address);
    }

    info!(
        "resolving {} unique addresses across {} module buckets",
        buckets.iter().map(Vec::len).sum::<usize>(),
        buckets.len(),
    );

    let resolved: Vec<Vec<(u64, SymbolInfo)>> = buckets
        .into_par_iter()
        .map(|mut bucket| {
            bucket.sort_unstable();
            bucket.into_iter().map(|address| (address, resolver.resolve(address))).collect()
        })
        .collect();

    // serial merge after the join
    let mut map = HashMap::new();
    for bucket in resolved {
        map.extend(bucket);
    }
    map
}
