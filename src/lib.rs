//! A concurrent, multi-threaded general-purpose allocator in the style of
//! Hoard: a three-layer ownership hierarchy (per-thread arenas of
//! page-sized superblocks drawn from a global arena, backed by an
//! OS-level page store) that bounds blowup and resists false sharing and
//! producer/consumer fragmentation across threads.
//!
//! Install as the process allocator with:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: hoardalloc::Hoard = hoardalloc::Hoard;
//! ```
//!
//! or call [`allocate`]/[`release`] directly for the raw two-operation
//! surface the core is built around.

mod allocator;
mod arena;
mod error;
mod lock;
mod os;
mod page_store;
mod stats;
mod superblock;
mod test_support;
mod thread_ident;
mod types;

pub use allocator::{allocate, init, release, try_allocate, Hoard};
pub use error::{HoardError, Result};

/// `(current, peak, total allocated, total freed)` live byte counters,
/// for diagnostics only — never consulted by any placement or migration
/// decision.
pub fn stats() -> (i64, i64, usize, usize) {
    stats::snapshot()
}
