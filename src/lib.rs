//! plat: a zone-aware address-space arena.
//!
//! The arena reserves large regions of address space, subdivides them
//! into page-aligned tracts, and hands contiguous runs of tracts to
//! pools.  Placement is steered by zones, equivalence classes of the
//! high-order address bits, so cooperating pools can keep their
//! allocations apart without talking to each other.  Backing store is
//! pluggable: an `ArenaClass` maps "reserve", "commit", and "release"
//! onto client memory, `mmap`, or anything else.
mod arena;
mod block_pool;
mod chunk;
mod class;
mod client;
mod config;
mod control;
mod error;
mod pool;
mod pref;
mod range;
mod range_set;
mod reservoir;
mod sys;
#[cfg(unix)]
mod vm;
mod zone;

pub use arena::Arena;
pub use arena::ArenaState;
pub use chunk::Chunk;
pub use chunk::Tract;
pub use class::ArenaClass;
pub use class::SpareMap;
pub use client::ClientArena;
pub use config::ArenaArgs;
pub use error::Error;
pub use error::Result;
pub use pool::PoolId;
pub use pref::Placement;
pub use range::Range;
pub use sys::page_size;
#[cfg(unix)]
pub use vm::VmArena;
pub use zone::zone_of;
pub use zone::ZoneSet;
pub use zone::ZONE_COUNT;
