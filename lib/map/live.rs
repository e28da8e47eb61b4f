//! Live-memory override for a running target.

use std::sync::Arc;

use crate::address::Address;
use crate::error::Error;

/// Receives byte-change notifications from a live-memory handler.
pub trait LiveMemoryListener: Send + Sync {
    fn live_memory_changed(&self, addr: Address, length: usize);
}

/// Short-circuits block-backed I/O with reads and writes against a running
/// target.
///
/// While a handler is installed the map delegates all byte access to it
/// and reports every covered address as initialized. Block layout
/// mutations (move, split, join) are rejected for the duration.
pub trait LiveMemory: Send + Sync {
    fn get_byte(&self, addr: Address) -> Result<u8, Error>;

    fn get_bytes(&self, addr: Address, dst: &mut [u8]) -> Result<usize, Error>;

    fn put_byte(&self, addr: Address, value: u8) -> Result<(), Error>;

    fn put_bytes(&self, addr: Address, src: &[u8]) -> Result<usize, Error>;

    /// Drop any cached target bytes. Called after every rebuild.
    fn clear_cache(&self);

    fn add_listener(&self, listener: Arc<dyn LiveMemoryListener>);

    fn remove_listener(&self, listener: &Arc<dyn LiveMemoryListener>);
}
