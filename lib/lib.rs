//! Kestrel: a memory-map database for program analysis.
//!
//! Kestrel models the address space of an analyzed binary as a sorted set
//! of named, typed memory blocks and provides coherent, typed read/write
//! access across them. A quick synopsis of Kestrel's modules:
//!
//! * **address** - Addresses in typed spaces, range-set algebra, and the
//! address factory.
//! * **block** - Memory blocks: default, overlay, bit-mapped, and
//! byte-mapped kinds with per-kind byte access.
//! * **map** - The memory map itself: block lifecycle, address lookup,
//! coverage sets, endian-aware typed I/O, and byte-pattern search.
//! * **monitor** - Cancellation and progress hooks for long operations.
//! * **store** - The block record store contract and the in-memory
//! adapter.
//!
//! ```
//! use std::sync::Arc;
//!
//! use kestrel::address::AddressFactory;
//! use kestrel::map::MemoryMap;
//! use kestrel::store::RecordStore;
//! use kestrel::types::Endian;
//!
//! # fn example() -> Result<(), kestrel::Error> {
//! let factory = Arc::new(AddressFactory::new("ram"));
//! let ram = factory.default_space();
//! let map = MemoryMap::new(
//!     Arc::new(RecordStore::new()),
//!     factory,
//!     Endian::Little,
//!     ram.address(0),
//! )?;
//! let text = map.create_initialized_block(".text", ram.address(0x1000), 0x100, 0, None, false)?;
//! map.set_int(text.start(), 0xdeadbeef)?;
//! assert_eq!(map.get_int(text.start())?, 0xdeadbeef);
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod block;
mod error;
pub mod map;
pub mod monitor;
pub mod store;
pub mod types;

pub use crate::error::Error;

#[cfg(test)]
mod tests;
