//! Event stream parser
//!
//! Reads tagged records until end of stream: the six memory-operation
//! kinds plus tag, marker, module and allocator bookkeeping records.
//! Backtraces arrive either inline (`Add`) or as a hash reference to an
//! earlier record (`Exists`) and are interned on the way in. A parse
//! failure close to the end of the stream is tolerated so that truncated
//! captures still analyze.

use std::collections::HashMap;

use log::{debug, warn};

use crate::analysis::tagtree::TagTree;
use crate::domain::{
    CaptureError, MarkerEvent, MarkerTime, MemoryOperation, OpKind, OpRef, TraceRef, UNALIGNED,
};
use crate::loader::header::ModuleTable;
use crate::loader::interner::{hash_frames, TraceInterner};
use crate::loader::pool::{OperationPool, StackTracePool};
use crate::loader::reader::BinReader;
use crate::progress::Progress;

/// Wire values of the one-byte record tags.
pub mod tags {
    pub const OP_ALLOC: u8 = 1;
    pub const OP_CALLOC: u8 = 2;
    pub const OP_ALLOC_ALIGNED: u8 = 3;
    pub const OP_REALLOC: u8 = 4;
    pub const OP_REALLOC_ALIGNED: u8 = 5;
    pub const OP_FREE: u8 = 6;
    pub const REGISTER_TAG: u8 = 7;
    pub const ENTER_TAG: u8 = 8;
    pub const LEAVE_TAG: u8 = 9;
    pub const REGISTER_MARKER: u8 = 10;
    pub const MARKER: u8 = 11;
    pub const MODULE: u8 = 12;
    pub const ALLOCATOR: u8 = 13;

    /// Stack-trace sub-record tags.
    pub const STACK_EXISTS: u8 = 0;
    pub const STACK_ADD: u8 = 1;
}

/// Upper bound on frames per backtrace record.
pub const MAX_STACK_FRAMES: usize = 512;

/// A parse failure this close to the end of the stream downgrades the
/// load to `Partial` instead of failing it.
const TAIL_TOLERANCE_BYTES: u64 = 1000;

/// Mutable capture state the parser materializes records into.
pub struct ParseContext<'a> {
    pub ops: &'a mut OperationPool,
    pub trace_pool: &'a mut StackTracePool,
    pub traces: &'a mut Vec<TraceRef>,
    pub operations: &'a mut Vec<OpRef>,
    pub heaps: &'a mut HashMap<u64, String>,
    pub tag_tree: &'a mut TagTree,
    pub markers: &'a mut HashMap<u32, MarkerEvent>,
    pub marker_timeline: &'a mut Vec<MarkerTime>,
    pub modules: &'a mut ModuleTable,
    pub progress: &'a mut Progress,
}

#[derive(Debug, Clone, Copy)]
pub struct ParseSummary {
    /// Earliest marker timestamp, `u64::MAX` when the capture has none.
    pub min_marker_time: u64,
    /// False when the stream truncated but the failure was tolerated.
    pub complete: bool,
}

/// Parse the event stream until EOF.
///
/// `file_size` enables progress percentages and the end-of-stream
/// tolerance window; it refers to bytes on disk, so it is only compared
/// against the read position for uncompressed captures.
pub fn parse_events(
    r: &mut BinReader<'_>,
    ptr64: bool,
    file_size: Option<u64>,
    mut ctx: ParseContext<'_>,
) -> Result<ParseSummary, CaptureError> {
    let mut tag_stacks: HashMap<u64, Vec<u32>> = HashMap::new();
    let mut interner = TraceInterner::new();
    let mut min_marker_time = u64::MAX;

    let mut records: u64 = 0;
    let mut progress_point: u64 = 0;
    let size_over_100 = file_size.map(|s| (s / 100).max(1));

    let failure = loop {
        let tag = match r.try_read_u8() {
            Ok(None) => break None,
            Ok(Some(tag)) => tag,
            Err(e) => break Some(CaptureError::from_stream_io(e, r.tell())),
        };

        records += 1;
        if records >> 16 != progress_point {
            progress_point = records >> 16;
            if let Some(per) = size_over_100 {
                let percent = r.tell() as f32 / per as f32;
                ctx.progress.report(percent, "Loading capture file...");
            }
        }

        let result = match tag {
            tags::OP_ALLOC | tags::OP_CALLOC | tags::OP_ALLOC_ALIGNED | tags::OP_REALLOC
            | tags::OP_REALLOC_ALIGNED | tags::OP_FREE => {
                parse_memory_op(r, ptr64, tag, &mut ctx, &mut interner, &tag_stacks)
            }
            tags::REGISTER_TAG => parse_register_tag(r, &mut ctx),
            tags::ENTER_TAG | tags::LEAVE_TAG => parse_tag_scope(r, tag, &mut tag_stacks),
            tags::REGISTER_MARKER => parse_register_marker(r, &mut ctx),
            tags::MARKER => parse_marker(r, &mut ctx, &mut min_marker_time),
            tags::MODULE => parse_module(r, &mut ctx),
            tags::ALLOCATOR => parse_allocator(r, &mut ctx),
            unknown => Err(CaptureError::CorruptRecord {
                offset: r.tell(),
                what: format!("unknown record tag 0x{unknown:02x}"),
            }),
        };

        if let Err(e) = result {
            break Some(e);
        }
    };

    match failure {
        None => Ok(ParseSummary { min_marker_time, complete: true }),
        Some(error) => {
            let near_end = file_size
                .filter(|_| !r.is_compressed())
                .is_some_and(|size| size.saturating_sub(r.tell()) < TAIL_TOLERANCE_BYTES);
            if near_end || !ctx.operations.is_empty() {
                warn!(
                    "tolerating parse failure after {} operations: {error}",
                    ctx.operations.len()
                );
                Ok(ParseSummary { min_marker_time, complete: false })
            } else {
                Err(error)
            }
        }
    }
}

fn stream_err(r: &BinReader<'_>) -> impl FnOnce(std::io::Error) -> CaptureError {
    let offset = r.tell();
    move |e| CaptureError::from_stream_io(e, offset)
}

fn parse_memory_op(
    r: &mut BinReader<'_>,
    ptr64: bool,
    tag: u8,
    ctx: &mut ParseContext<'_>,
    interner: &mut TraceInterner,
    tag_stacks: &HashMap<u64, Vec<u32>>,
) -> Result<(), CaptureError> {
    let kind = match tag {
        tags::OP_ALLOC => OpKind::Alloc,
        tags::OP_CALLOC => OpKind::Calloc,
        tags::OP_ALLOC_ALIGNED => OpKind::AllocAligned,
        tags::OP_REALLOC => OpKind::Realloc,
        tags::OP_REALLOC_ALIGNED => OpKind::ReallocAligned,
        _ => OpKind::Free,
    };

    let mut op = MemoryOperation {
        kind,
        allocator_handle: r.read_u64().map_err(stream_err(r))?,
        thread_id: r.read_u64().map_err(stream_err(r))?,
        time: 0,
        pointer: 0,
        previous_pointer: 0,
        alloc_size: 0,
        overhead: 0,
        alignment: UNALIGNED,
        tag: 0,
        is_valid: true,
        stack_trace: TraceRef::INVALID,
        chain_prev: OpRef::INVALID,
        chain_next: OpRef::INVALID,
    };

    op.pointer = r.read_ptr(ptr64).map_err(stream_err(r))?;
    if kind.is_realloc() {
        op.previous_pointer = r.read_ptr(ptr64).map_err(stream_err(r))?;
    }
    op.time = r.read_u64().map_err(stream_err(r))?;

    if matches!(kind, OpKind::AllocAligned | OpKind::ReallocAligned) {
        op.alignment = r.read_u8().map_err(stream_err(r))?;
    }
    if kind != OpKind::Free {
        op.alloc_size = r.read_u64().map_err(stream_err(r))?;
        op.overhead = r.read_u32().map_err(stream_err(r))?;
    }

    op.stack_trace = parse_stack_trace(r, ptr64, ctx, interner)?;

    if kind.is_alloc() {
        if let Some(stack) = tag_stacks.get(&op.thread_id) {
            op.tag = stack.last().copied().unwrap_or(0);
        }
    }

    let op_ref = ctx.ops.alloc(op);
    ctx.operations.push(op_ref);

    ctx.heaps
        .entry(op.allocator_handle)
        .or_insert_with(|| format!("0x{:x}", op.allocator_handle));
    Ok(())
}

fn parse_stack_trace(
    r: &mut BinReader<'_>,
    ptr64: bool,
    ctx: &mut ParseContext<'_>,
    interner: &mut TraceInterner,
) -> Result<TraceRef, CaptureError> {
    let st_tag = r.read_u8().map_err(stream_err(r))?;
    match st_tag {
        tags::STACK_EXISTS => {
            let hash = r.read_u32().map_err(stream_err(r))?;
            interner.lookup(hash).ok_or_else(|| CaptureError::CorruptRecord {
                offset: r.tell(),
                what: format!("reference to unregistered stack trace 0x{hash:08x}"),
            })
        }
        tags::STACK_ADD => {
            let num_frames = r.read_u16().map_err(stream_err(r))? as usize;
            if num_frames > MAX_STACK_FRAMES {
                return Err(CaptureError::CorruptRecord {
                    offset: r.tell(),
                    what: format!("stack trace with {num_frames} frames"),
                });
            }

            let mut frames = Vec::with_capacity(num_frames);
            for _ in 0..num_frames {
                frames.push(r.read_ptr(ptr64).map_err(stream_err(r))?);
            }

            let hash = hash_frames(&frames);
            Ok(interner.intern(ctx.trace_pool, ctx.traces, &frames, hash))
        }
        other => Err(CaptureError::CorruptRecord {
            offset: r.tell(),
            what: format!("bad stack-trace tag 0x{other:02x}"),
        }),
    }
}

fn parse_register_tag(r: &mut BinReader<'_>, ctx: &mut ParseContext<'_>) -> Result<(), CaptureError> {
    let (name, _) = r.read_narrow_string(0).map_err(stream_err(r))?;
    let (parent_name, _) = r.read_narrow_string(0).map_err(stream_err(r))?;
    let hash = r.read_u32().map_err(stream_err(r))?;
    let parent_hash =
        if parent_name.is_empty() { 0 } else { r.read_u32().map_err(stream_err(r))? };

    if !ctx.tag_tree.insert(&name, hash, parent_hash) {
        debug!("duplicate tag registration 0x{hash:08x} ({name})");
    }
    Ok(())
}

fn parse_tag_scope(
    r: &mut BinReader<'_>,
    tag: u8,
    tag_stacks: &mut HashMap<u64, Vec<u32>>,
) -> Result<(), CaptureError> {
    let hash = r.read_u32().map_err(stream_err(r))?;
    let thread_id = r.read_u64().map_err(stream_err(r))?;

    let stack = tag_stacks.entry(thread_id).or_default();
    if tag == tags::ENTER_TAG {
        stack.push(hash);
    } else if stack.pop().is_none() {
        debug!("tag leave on empty stack (thread {thread_id}, tag 0x{hash:08x})");
    }
    Ok(())
}

fn parse_register_marker(
    r: &mut BinReader<'_>,
    ctx: &mut ParseContext<'_>,
) -> Result<(), CaptureError> {
    let (name, _) = r.read_narrow_string(0).map_err(stream_err(r))?;
    let name_hash = r.read_u32().map_err(stream_err(r))?;
    let color = r.read_u32().map_err(stream_err(r))?;

    ctx.markers.insert(name_hash, MarkerEvent { name, name_hash, color });
    Ok(())
}

fn parse_marker(
    r: &mut BinReader<'_>,
    ctx: &mut ParseContext<'_>,
    min_marker_time: &mut u64,
) -> Result<(), CaptureError> {
    let name_hash = r.read_u32().map_err(stream_err(r))?;
    let thread_id = r.read_u64().map_err(stream_err(r))?;
    let time = r.read_u64().map_err(stream_err(r))?;

    *min_marker_time = (*min_marker_time).min(time);

    ctx.markers
        .entry(name_hash)
        .or_insert_with(|| MarkerEvent { name: String::new(), name_hash, color: 0 });
    ctx.marker_timeline.push(MarkerTime { thread_id, name_hash, time });
    Ok(())
}

fn parse_module(r: &mut BinReader<'_>, ctx: &mut ParseContext<'_>) -> Result<(), CaptureError> {
    let char_size = r.read_u8().map_err(stream_err(r))?;
    let (name, _) = if char_size == 1 {
        r.read_narrow_string(0).map_err(stream_err(r))?
    } else {
        r.read_wide_string(0).map_err(stream_err(r))?
    };
    let base = r.read_u64().map_err(stream_err(r))?;
    let size = r.read_u64().map_err(stream_err(r))?;

    ctx.modules.add(&name, base, size);
    Ok(())
}

fn parse_allocator(r: &mut BinReader<'_>, ctx: &mut ParseContext<'_>) -> Result<(), CaptureError> {
    let (name, _) = r.read_narrow_string(0).map_err(stream_err(r))?;
    let handle = r.read_u64().map_err(stream_err(r))?;

    ctx.heaps.insert(handle, name);
    Ok(())
}
