//! A heap allocator that tags every block with a header, keeps usage
//! counters, and in diagnostic mode can tell you exactly which blocks you
//! forgot to free, and where you allocated them.

pub mod alloc;
pub mod config;
pub mod error;
mod serialize;
pub mod util;

pub use alloc::InstrumentedAlloc;
pub use config::AllocConfig;
pub use error::AllocError;
