//! Cross-module scenario and property tests for the memory map.

use std::sync::Arc;

use crate::address::AddressFactory;
use crate::map::MemoryMap;
use crate::store::RecordStore;
use crate::types::Endian;

mod properties;

/// A big-endian map over a fresh in-memory store, with the image base at
/// the bottom of the default space.
pub(crate) fn test_map() -> (MemoryMap, Arc<AddressFactory>) {
    let factory = Arc::new(AddressFactory::new("ram"));
    let base = factory.default_space().address(0);
    let map = MemoryMap::new(
        Arc::new(RecordStore::new()),
        Arc::clone(&factory),
        Endian::Big,
        base,
    )
    .unwrap();
    (map, factory)
}
