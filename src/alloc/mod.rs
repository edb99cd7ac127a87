//! The allocator and the pieces it's built from.

pub mod header;
mod instrumented;
pub mod raw;
mod registry;
pub mod report;
pub mod stats;
mod tags;

pub use header::{GuardTag, Provenance, BLOCK_ALIGN};
pub use instrumented::InstrumentedAlloc;
pub use raw::{DefaultHeap, DlHeap, RawHeap, SystemHeap};
#[cfg(unix)]
pub use raw::LibcHeap;
pub use report::{LeakEntry, LeakReport};
pub use stats::StatsSnapshot;
