//! Lifetime-chain linking and validation
//!
//! After the time sort, a single sweep pairs every operation with the one
//! that preceded it on the same heap block: allocs open a chain, reallocs
//! extend it, frees close it. Operations that contradict the live-pointer
//! map (duplicate address, missing predecessor, orphan free) are marked
//! invalid and dropped from the sorted list; their count survives for
//! diagnostics.

use std::collections::HashMap;

use log::{info, warn};

use crate::domain::{OpKind, OpRef};
use crate::loader::pool::OperationPool;
use crate::progress::{Progress, ProgressTicker};

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkSummary {
    /// Operations rejected by the sweep.
    pub invalid_operations: usize,
}

/// Walk the time-sorted operation list, set `chain_prev`/`chain_next`
/// links, inherit free sizes from predecessors, and drop invalid ops.
pub fn link_operations(
    pool: &mut OperationPool,
    operations: &mut Vec<OpRef>,
    progress: &mut Progress,
) -> LinkSummary {
    let mut live: HashMap<u64, OpRef> = HashMap::new();
    let total = operations.len();
    let mut ticker = ProgressTicker::new(total);

    for i in 0..total {
        if let Some(percent) = ticker.tick(i, total) {
            progress.report(percent, "Processing...");
        }

        let op_ref = operations[i];
        let op = *pool.get(op_ref);
        debug_assert!(!op.chain_prev.is_valid() && !op.chain_next.is_valid());

        match op.kind {
            OpKind::Alloc | OpKind::Calloc | OpKind::AllocAligned => {
                if live.contains_key(&op.pointer) {
                    pool.get_mut(op_ref).is_valid = false;
                } else {
                    live.insert(op.pointer, op_ref);
                }
            }

            OpKind::Realloc | OpKind::ReallocAligned => {
                let mut prev_ref = OpRef::INVALID;

                if op.previous_pointer != 0 {
                    // the block being resized must be live
                    match live.remove(&op.previous_pointer) {
                        Some(prev) => prev_ref = prev,
                        None => pool.get_mut(op_ref).is_valid = false,
                    }
                } else if live.contains_key(&op.pointer) {
                    // no previous block: behaves as a fresh allocation
                    pool.get_mut(op_ref).is_valid = false;
                }

                if prev_ref.is_valid() {
                    pool.get_mut(op_ref).chain_prev = prev_ref;
                    pool.get_mut(prev_ref).chain_next = op_ref;
                }

                live.insert(op.pointer, op_ref);
            }

            OpKind::Free => match live.remove(&op.pointer) {
                None => pool.get_mut(op_ref).is_valid = false,
                Some(prev_ref) => {
                    let prev = *pool.get(prev_ref);
                    debug_assert!(prev.kind != OpKind::Free);

                    pool.get_mut(prev_ref).chain_next = op_ref;
                    let current = pool.get_mut(op_ref);
                    current.chain_prev = prev_ref;
                    current.alloc_size = prev.alloc_size;
                    current.overhead = prev.overhead;
                }
            },
        }
    }

    let before = operations.len();
    operations.retain(|&r| pool.get(r).is_valid);
    let invalid = before - operations.len();

    if invalid > 0 {
        warn!("dropped {invalid} invalid operations out of {before}");
    } else {
        info!("linked {before} operations");
    }

    progress.report(100.0, "Processing...");
    LinkSummary { invalid_operations: invalid }
}
