//! Capture-file loading pipeline
//!
//! File bytes flow through the [`reader`] into the [`header`] and
//! [`parser`] stages, backtraces are deduplicated by the [`interner`] into
//! [`pool`] arenas, and the [`linker`] turns the unsorted event soup into
//! time-sorted, chain-linked operations ready for analysis.

pub mod header;
pub mod interner;
pub mod linker;
pub mod parser;
pub mod pool;
pub mod reader;

pub use header::{CaptureHeader, ModuleInfo, ModuleTable};
pub use pool::{OperationPool, StackTracePool, TreeScope};
pub use reader::BinReader;
