//! Persistence of block records and their backing bytes.
//!
//! The memory map never touches backing bytes directly; everything goes
//! through the [`BlockStore`] trait. [`RecordStore`] is the in-memory
//! adapter used for fresh programs and tests. A database-backed adapter
//! implements the same contract.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::block::{BlockKind, MemoryPermissions};
use crate::error::Error;
use crate::monitor::TaskMonitor;

/// Streams read in chunks this size so a cancelled monitor is noticed
/// promptly during large block creation.
const STREAM_CHUNK: usize = 64 * 1024;

/// The persisted shape of a memory block.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BlockRecord {
    pub id: u32,
    pub kind: BlockKind,
    pub name: String,
    pub start: Address,
    pub length: u64,
    pub permissions: MemoryPermissions,
    pub initialized: bool,
    pub mapping_target: Option<Address>,
}

impl BlockRecord {
    /// True if this record owns backing bytes. Mapped blocks never do.
    pub fn is_backed(&self) -> bool {
        self.initialized && matches!(self.kind, BlockKind::Default | BlockKind::Overlay)
    }
}

/// The store contract the memory map is written against.
///
/// `update` reconciles backing bytes with the record it is given: growing
/// or truncating the buffer on a length change, allocating a zero-filled
/// buffer when `initialized` flips on, and dropping the buffer when it
/// flips off.
pub trait BlockStore: Send + Sync {
    /// All persisted blocks, sorted ascending by start address.
    fn load_all(&self) -> Result<Vec<BlockRecord>, Error>;

    /// Re-read persisted records after external changes.
    fn refresh(&self) -> Result<(), Error>;

    /// Persist a new block record. For initialized default and overlay
    /// blocks the backing bytes are drawn from `source`, or zero-filled
    /// when `source` is `None`.
    #[allow(clippy::too_many_arguments)]
    fn create_block(
        &self,
        kind: BlockKind,
        name: &str,
        start: Address,
        length: u64,
        mapping_target: Option<Address>,
        initialized: bool,
        permissions: MemoryPermissions,
        source: Option<&mut dyn Read>,
        monitor: &dyn TaskMonitor,
    ) -> Result<BlockRecord, Error>;

    fn delete(&self, id: u32) -> Result<(), Error>;

    fn update(&self, record: &BlockRecord) -> Result<(), Error>;

    /// Read backing bytes at `offset` into `dst`, returning the number of
    /// bytes read. Reads past the end of the block are truncated.
    fn read(&self, id: u32, offset: u64, dst: &mut [u8]) -> Result<usize, Error>;

    /// Write `src` into the backing bytes at `offset`.
    fn write(&self, id: u32, offset: u64, src: &[u8]) -> Result<(), Error>;
}

/// An `io::Read` which yields one byte value forever. Wraps a fill byte so
/// block creation has a single stream-shaped code path.
pub struct FillStream(u8);

impl FillStream {
    pub fn new(value: u8) -> FillStream {
        FillStream(value)
    }
}

impl Read for FillStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        for byte in buf.iter_mut() {
            *byte = self.0;
        }
        Ok(buf.len())
    }
}

struct StoredBlock {
    record: BlockRecord,
    bytes: Option<Vec<u8>>,
}

#[derive(Default)]
struct RecordStoreInner {
    next_id: u32,
    blocks: BTreeMap<u32, StoredBlock>,
}

/// The in-memory block store.
#[derive(Default)]
pub struct RecordStore {
    inner: Mutex<RecordStoreInner>,
}

impl RecordStore {
    pub fn new() -> RecordStore {
        RecordStore::default()
    }

    fn lock(&self) -> MutexGuard<RecordStoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl BlockStore for RecordStore {
    fn load_all(&self) -> Result<Vec<BlockRecord>, Error> {
        let inner = self.lock();
        let mut records: Vec<BlockRecord> = inner
            .blocks
            .values()
            .map(|stored| stored.record.clone())
            .collect();
        records.sort_by_key(|r| r.start);
        Ok(records)
    }

    fn refresh(&self) -> Result<(), Error> {
        // records are the persisted truth for the in-memory store
        Ok(())
    }

    fn create_block(
        &self,
        kind: BlockKind,
        name: &str,
        start: Address,
        length: u64,
        mapping_target: Option<Address>,
        initialized: bool,
        permissions: MemoryPermissions,
        source: Option<&mut dyn Read>,
        monitor: &dyn TaskMonitor,
    ) -> Result<BlockRecord, Error> {
        let record = BlockRecord {
            id: 0,
            kind,
            name: name.to_string(),
            start,
            length,
            permissions,
            initialized,
            mapping_target,
        };
        let bytes = if record.is_backed() {
            let mut bytes = vec![0u8; length as usize];
            if let Some(source) = source {
                let mut filled = 0;
                while filled < bytes.len() {
                    monitor.check_cancelled()?;
                    let chunk = (bytes.len() - filled).min(STREAM_CHUNK);
                    let n = source
                        .read(&mut bytes[filled..filled + chunk])
                        .map_err(|e| Error::Store(e.to_string()))?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
            }
            Some(bytes)
        } else {
            None
        };

        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let mut record = record;
        record.id = id;
        inner.blocks.insert(
            id,
            StoredBlock {
                record: record.clone(),
                bytes,
            },
        );
        Ok(record)
    }

    fn delete(&self, id: u32) -> Result<(), Error> {
        let mut inner = self.lock();
        inner
            .blocks
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::Store(format!("no block record with id {}", id)))
    }

    fn update(&self, record: &BlockRecord) -> Result<(), Error> {
        let mut inner = self.lock();
        let stored = inner
            .blocks
            .get_mut(&record.id)
            .ok_or_else(|| Error::Store(format!("no block record with id {}", record.id)))?;
        if record.is_backed() {
            match stored.bytes.as_mut() {
                Some(bytes) => bytes.resize(record.length as usize, 0),
                None => stored.bytes = Some(vec![0u8; record.length as usize]),
            }
        } else {
            stored.bytes = None;
        }
        stored.record = record.clone();
        Ok(())
    }

    fn read(&self, id: u32, offset: u64, dst: &mut [u8]) -> Result<usize, Error> {
        let inner = self.lock();
        let stored = inner
            .blocks
            .get(&id)
            .ok_or_else(|| Error::Store(format!("no block record with id {}", id)))?;
        let bytes = stored
            .bytes
            .as_ref()
            .ok_or_else(|| Error::Store(format!("block record {} has no backing bytes", id)))?;
        if offset >= bytes.len() as u64 {
            return Ok(0);
        }
        let offset = offset as usize;
        let count = dst.len().min(bytes.len() - offset);
        dst[..count].copy_from_slice(&bytes[offset..offset + count]);
        Ok(count)
    }

    fn write(&self, id: u32, offset: u64, src: &[u8]) -> Result<(), Error> {
        let mut inner = self.lock();
        let stored = inner
            .blocks
            .get_mut(&id)
            .ok_or_else(|| Error::Store(format!("no block record with id {}", id)))?;
        let bytes = stored
            .bytes
            .as_mut()
            .ok_or_else(|| Error::Store(format!("block record {} has no backing bytes", id)))?;
        let end = offset
            .checked_add(src.len() as u64)
            .filter(|&end| end <= bytes.len() as u64)
            .ok_or_else(|| {
                Error::Store(format!(
                    "write of {} bytes at offset {:#x} exceeds block record {}",
                    src.len(),
                    offset,
                    id
                ))
            })?;
        bytes[offset as usize..end as usize].copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{BlockStore, FillStream, RecordStore};
    use crate::address::{Address, SpaceId};
    use crate::block::{BlockKind, MemoryPermissions};
    use crate::monitor::{CancelMonitor, NullMonitor};

    fn addr(offset: u64) -> Address {
        Address::new(SpaceId::new(0), offset)
    }

    #[test]
    fn create_and_read_back() {
        let store = RecordStore::new();
        let mut source = FillStream::new(0xAA);
        let record = store
            .create_block(
                BlockKind::Default,
                ".text",
                addr(0x1000),
                0x10,
                None,
                true,
                MemoryPermissions::READ,
                Some(&mut source),
                &NullMonitor,
            )
            .unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(store.read(record.id, 0, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0xAA; 4]);

        // reads truncate at the end of the block
        assert_eq!(store.read(record.id, 0xe, &mut buf).unwrap(), 2);
        assert_eq!(store.read(record.id, 0x10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn uninitialized_has_no_backing() {
        let store = RecordStore::new();
        let record = store
            .create_block(
                BlockKind::Default,
                ".bss",
                addr(0x2000),
                0x100,
                None,
                false,
                MemoryPermissions::READ | MemoryPermissions::WRITE,
                None,
                &NullMonitor,
            )
            .unwrap();
        let mut buf = [0u8; 1];
        assert!(store.read(record.id, 0, &mut buf).is_err());
    }

    #[test]
    fn update_reconciles_backing() {
        let store = RecordStore::new();
        let mut record = store
            .create_block(
                BlockKind::Default,
                ".bss",
                addr(0x2000),
                0x10,
                None,
                false,
                MemoryPermissions::READ,
                None,
                &NullMonitor,
            )
            .unwrap();

        record.initialized = true;
        store.update(&record).unwrap();
        let mut buf = [0u8; 0x10];
        assert_eq!(store.read(record.id, 0, &mut buf).unwrap(), 0x10);
        assert_eq!(buf, [0u8; 0x10]);

        record.length = 0x8;
        store.update(&record).unwrap();
        assert_eq!(store.read(record.id, 0, &mut buf).unwrap(), 0x8);

        record.initialized = false;
        store.update(&record).unwrap();
        assert!(store.read(record.id, 0, &mut buf).is_err());
    }

    #[test]
    fn cancelled_create_commits_nothing() {
        let store = RecordStore::new();
        let monitor = CancelMonitor::new();
        monitor.cancel();
        let mut source = FillStream::new(0x55);
        let result = store.create_block(
            BlockKind::Default,
            ".text",
            addr(0x1000),
            0x10,
            None,
            true,
            MemoryPermissions::READ,
            Some(&mut source),
            &monitor,
        );
        assert!(matches!(result, Err(crate::error::Error::Cancelled)));
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn load_all_is_sorted_by_start() {
        let store = RecordStore::new();
        for &(name, start) in &[(".b", 0x2000u64), (".a", 0x1000), (".c", 0x3000)] {
            store
                .create_block(
                    BlockKind::Default,
                    name,
                    addr(start),
                    0x10,
                    None,
                    false,
                    MemoryPermissions::READ,
                    None,
                    &NullMonitor,
                )
                .unwrap();
        }
        let names: Vec<String> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec![".a", ".b", ".c"]);
    }
}
