//! # heapscope - Memory-Tracing Capture Loader and Analyzer
//!
//! heapscope ingests the compact binary log written by an instrumented
//! application - a stream of allocation, reallocation, free, tag, marker,
//! module and allocator events - reconstructs the full lifetime graph of
//! every heap block, and builds the aggregate structures a memory
//! profiler's front end queries: timed statistics, the usage timeline,
//! per-call-stack and per-tag aggregation trees, and allocation-size
//! histograms, all behind a filterable view.
//!
//! ## Architecture Overview
//!
//! ```text
//! capture file bytes
//!     │  (optional deflate, endian-sensitive)
//!     ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     loader (this crate)                     │
//! │                                                             │
//! │  reader ──▶ header/modules ──▶ event parser ──▶ interner    │
//! │                                      │                      │
//! │                                      ▼                      │
//! │                        operation & trace arenas             │
//! │                                      │                      │
//! │            parallel time sort ──▶ chain linker              │
//! └──────────────────────────────────────┬──────────────────────┘
//!                                        │ sorted valid ops
//!                                        ▼
//! ┌──────────────────┐      ┌─────────────────────────────────┐
//! │  symbolization   │─────▶│           analysis              │
//! │ (external        │      │  stats · usage graph · groups   │
//! │  resolver,       │      │  call tree · tag tree · leaks   │
//! │  per-module      │      └───────────────┬─────────────────┘
//! │  parallelism)    │                      │
//! └──────────────────┘                      ▼
//!                              ┌─────────────────────────┐
//!                              │   capture (query API)   │
//!                              │ filter · time index ·   │
//!                              │ window snapshot stats   │
//!                              └─────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`loader`]: binary format parsing and reconstruction
//!   - `reader`: endian-aware primitives, masked strings, decompression
//!   - `header`: header validation and the module table
//!   - `parser`: tag-dispatched event records
//!   - `interner`: backtrace deduplication
//!   - `pool`: arena storage for operations and traces
//!   - `linker`: time sort, lifetime-chain pairing, validation
//!
//! - [`symbolization`]: address-to-symbol resolution
//!   - The resolver itself is an external service ([`SymbolResolver`]);
//!     the driver parallelizes over per-module buckets and strips
//!     instrumentation frames from stack tops
//!
//! - [`analysis`]: the single aggregation pass and its products
//!
//! - [`capture`]: the [`Capture`] facade - load pipeline, filter
//!   mutators, binary-search time index, windowed snapshot stats
//!
//! - [`domain`]: core types ([`MemoryOperation`], index newtypes, errors)
//!
//! ## Typical Usage
//!
//! ```no_run
//! use heapscope::{Capture, SymbolResolver, SymbolInfo};
//!
//! struct MyResolver;
//! impl SymbolResolver for MyResolver {
//!     fn module_count(&self) -> usize { 0 }
//!     fn module_index_of(&self, _addr: u64) -> Option<usize> { None }
//!     fn resolve(&self, addr: u64) -> SymbolInfo {
//!         SymbolInfo { id: addr, is_instrumentation: false }
//!     }
//! }
//!
//! let mut capture = Capture::new();
//! capture.set_progress_callback(Box::new(|pct, msg| {
//!     eprintln!("[{pct:5.1}%] {msg}");
//! }));
//! capture.load_path("app.trace", &MyResolver).unwrap();
//!
//! println!("peak usage: {} bytes", capture.global_stats().memory_usage_peak);
//! println!("leaks: {}", capture.leaks().len());
//! ```
//!
//! ## Key Concepts
//!
//! - **Operation**: one memory event; free sizes are reconstructed from
//!   the allocation they close
//! - **Chain**: the linked sequence of operations against one heap block
//! - **Stack trace**: an interned backtrace, shared by identity
//! - **Timed snapshot**: periodic stats record enabling sub-linear
//!   window queries
//! - **Filter**: user-selected constraints producing a rebuilt view

pub mod analysis;
pub mod capture;
pub mod domain;
pub mod loader;
pub mod progress;
pub mod symbolization;

pub use analysis::{
    histogram_bin_index, GroupMap, MemoryOperationGroup, MemoryStats, MemoryStatsTimed, StackTree,
    StackTreeNode, TagTree, TreeOpKind, NUM_HISTOGRAM_BINS,
};
pub use capture::Capture;
pub use domain::{
    CaptureError, GraphEntry, LoadOutcome, MarkerEvent, MarkerTime, MemoryOperation, OpKind, OpRef,
    Toolchain, TraceRef,
};
pub use loader::{ModuleInfo, TreeScope};
pub use progress::ProgressCallback;
pub use symbolization::{SymbolInfo, SymbolResolver};
