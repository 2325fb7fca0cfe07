//! Contract for the external symbol resolution service
//!
//! The resolver itself (DWARF/PDB readers, symbol servers) lives outside
//! this crate; the loader only needs stable per-function IDs and the
//! ability to recognize frames belonging to the tracing runtime so they
//! can be stripped off stack tops.

/// Resolution result for one instruction address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolInfo {
    /// Stable per-function identifier.
    pub id: u64,
    /// True when the address belongs to the tracing instrumentation
    /// itself rather than the profiled application.
    pub is_instrumentation: bool,
}

/// External address-to-symbol service.
///
/// # Thread safety
///
/// Resolving two addresses that fall in the *same* module concurrently is
/// not allowed; resolving addresses of *different* modules concurrently
/// is. The symbolization driver honors this by resolving sequentially
/// within each per-module bucket and in parallel across buckets. This
/// contract is part of the resolver's published interface and must not be
/// relaxed by implementations or callers.
pub trait SymbolResolver: Sync {
    /// Number of modules the resolver knows about.
    fn module_count(&self) -> usize;

    /// Module containing `address`, or None when unknown.
    fn module_index_of(&self, address: u64) -> Option<usize>;

    /// Resolve one address to its symbol info.
    fn resolve(&self, address: u64) -> SymbolInfo;
}
