//! Memory blocks and per-kind byte access.
//!
//! A [`MemoryBlock`] is a handle to one persisted block: its record plus
//! the store holding its bytes and a non-owning reference back to the
//! owning map. Byte access dispatches on the block kind: default and
//! overlay blocks read and write their own backing bytes, mapped blocks
//! forward into the target range of another block.

use std::fmt;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::Error;
use crate::map::MapInner;
use crate::monitor::NullMonitor;
use crate::store::{BlockRecord, BlockStore};

bitflags! {
    /// RWXV permissions for a memory block.
    #[derive(Deserialize, Serialize)]
    pub struct MemoryPermissions: u8 {
        const NONE     = 0b0000;
        const READ     = 0b0001;
        const WRITE    = 0b0010;
        const EXECUTE  = 0b0100;
        const VOLATILE = 0b1000;
        const ALL      = 0b0111;
    }
}

/// The kind of a memory block.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum BlockKind {
    /// Owns `length` backing bytes when initialized, none otherwise.
    Default,
    /// Like `Default` but resides in an overlay space. Cannot be moved,
    /// split, or joined.
    Overlay,
    /// `length` bits of another block viewed one byte per bit, LSB first.
    BitMapped,
    /// `length` bytes forwarded 1:1 into another block.
    ByteMapped,
}

impl BlockKind {
    /// Mapped blocks forward their bytes into a target range and never own
    /// backing bytes.
    pub fn is_mapped(self) -> bool {
        matches!(self, BlockKind::BitMapped | BlockKind::ByteMapped)
    }

    /// Loaded blocks are part of the program's loaded image.
    pub fn is_loaded(self) -> bool {
        matches!(self, BlockKind::Default | BlockKind::Overlay)
    }
}

/// A handle to one block of the memory map.
///
/// Handles are cheap snapshots of the block's attributes; map mutations
/// replace the map's own handles, so a handle held across a mutation must
/// be re-fetched from the map.
#[derive(Clone)]
pub struct MemoryBlock {
    pub(crate) record: BlockRecord,
    pub(crate) store: Arc<dyn BlockStore>,
    pub(crate) map: Weak<MapInner>,
}

impl MemoryBlock {
    pub(crate) fn new(
        record: BlockRecord,
        store: Arc<dyn BlockStore>,
        map: Weak<MapInner>,
    ) -> MemoryBlock {
        MemoryBlock { record, store, map }
    }

    pub fn id(&self) -> u32 {
        self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn kind(&self) -> BlockKind {
        self.record.kind
    }

    pub fn start(&self) -> Address {
        self.record.start
    }

    pub fn end(&self) -> Address {
        Address::new(
            self.record.start.space(),
            self.record.start.offset() + (self.record.length - 1),
        )
    }

    pub fn length(&self) -> u64 {
        self.record.length
    }

    pub fn permissions(&self) -> MemoryPermissions {
        self.record.permissions
    }

    pub fn is_initialized(&self) -> bool {
        self.record.initialized
    }

    pub fn is_mapped(&self) -> bool {
        self.record.kind.is_mapped()
    }

    pub fn is_loaded(&self) -> bool {
        self.record.kind.is_loaded()
    }

    pub fn is_read(&self) -> bool {
        self.record.permissions.contains(MemoryPermissions::READ)
    }

    pub fn is_write(&self) -> bool {
        self.record.permissions.contains(MemoryPermissions::WRITE)
    }

    pub fn is_execute(&self) -> bool {
        self.record.permissions.contains(MemoryPermissions::EXECUTE)
    }

    pub fn is_volatile(&self) -> bool {
        self.record.permissions.contains(MemoryPermissions::VOLATILE)
    }

    /// The first target address of a mapped block.
    pub fn mapping_target(&self) -> Option<Address> {
        self.record.mapping_target
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr.space() == self.record.start.space()
            && addr >= self.record.start
            && addr <= self.end()
    }

    /// Read one byte at `addr`.
    pub fn get_byte(&self, addr: Address) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.get_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Read up to `dst.len()` bytes starting at `addr`, returning the
    /// number of bytes read. Reads are truncated at the end of the block,
    /// and for mapped blocks also at the end of initialized target
    /// coverage once at least one byte has been read.
    pub fn get_bytes(&self, addr: Address, dst: &mut [u8]) -> Result<usize, Error> {
        if dst.is_empty() {
            return Ok(0);
        }
        if !self.contains(addr) {
            return Err(Error::AccessDenied(format!(
                "address {} is not in block \"{}\"",
                addr, self.record.name
            )));
        }
        let offset = addr.subtract(self.record.start);
        let available = self.record.length - offset;
        let count = (dst.len() as u64).min(available) as usize;
        let dst = &mut dst[..count];
        match self.record.kind {
            BlockKind::Default | BlockKind::Overlay => {
                if !self.record.initialized {
                    return Err(Error::AccessDenied(format!(
                        "block \"{}\" is uninitialized",
                        self.record.name
                    )));
                }
                self.store.read(self.record.id, offset, dst)
            }
            BlockKind::BitMapped => self.read_bit_mapped(offset, dst),
            BlockKind::ByteMapped => self.read_byte_mapped(offset, dst),
        }
    }

    /// Write one byte at `addr`.
    pub fn put_byte(&self, addr: Address, value: u8) -> Result<(), Error> {
        self.put_bytes(addr, &[value]).map(|_| ())
    }

    /// Write up to `src.len()` bytes starting at `addr`, returning the
    /// number of bytes written. Writes are truncated at the end of the
    /// block and rejected when they conflict with a decoded instruction.
    pub fn put_bytes(&self, addr: Address, src: &[u8]) -> Result<usize, Error> {
        if src.is_empty() {
            return Ok(0);
        }
        if !self.contains(addr) {
            return Err(Error::AccessDenied(format!(
                "address {} is not in block \"{}\"",
                addr, self.record.name
            )));
        }
        let offset = addr.subtract(self.record.start);
        let available = self.record.length - offset;
        let count = (src.len() as u64).min(available) as usize;
        let src = &src[..count];
        if let Some(map) = self.map.upgrade() {
            map.check_memory_write(addr, count)?;
        }
        match self.record.kind {
            BlockKind::Default | BlockKind::Overlay => {
                if !self.record.initialized {
                    return Err(Error::AccessDenied(format!(
                        "block \"{}\" is uninitialized",
                        self.record.name
                    )));
                }
                self.store.write(self.record.id, offset, src)?;
            }
            BlockKind::BitMapped => self.write_bit_mapped(offset, src)?,
            BlockKind::ByteMapped => self.write_byte_mapped(offset, src)?,
        }
        if let Some(map) = self.map.upgrade() {
            map.fire_bytes_changed(addr, count as u64);
        }
        Ok(count)
    }

    fn target(&self) -> Result<Address, Error> {
        self.record.mapping_target.ok_or_else(|| {
            Error::Store(format!(
                "mapped block \"{}\" has no mapping target",
                self.record.name
            ))
        })
    }

    /// Resolve the block containing a mapped target address through the
    /// owning map. The map state lock is released before any byte access.
    fn target_block(&self, addr: Address) -> Result<MemoryBlock, Error> {
        let map = self.map.upgrade().ok_or_else(|| {
            Error::NotFound(format!(
                "block \"{}\" is no longer attached to a memory map",
                self.record.name
            ))
        })?;
        map.lookup(addr).ok_or_else(|| {
            Error::AccessDenied(format!("no block at mapped target address {}", addr))
        })
    }

    fn read_byte_mapped(&self, offset: u64, dst: &mut [u8]) -> Result<usize, Error> {
        let target = self.target()?;
        let mut read = 0;
        while read < dst.len() {
            let mut step = || -> Result<usize, Error> {
                let taddr = target.add_no_wrap(offset + read as u64)?;
                let block = self.target_block(taddr)?;
                block.get_bytes(taddr, &mut dst[read..])
            };
            match step() {
                Ok(n) if n > 0 => read += n,
                Ok(_) => break,
                Err(e) => {
                    if read == 0 {
                        return Err(e);
                    }
                    break;
                }
            }
        }
        Ok(read)
    }

    fn read_bit_mapped(&self, offset: u64, dst: &mut [u8]) -> Result<usize, Error> {
        let target = self.target()?;
        let mut cached: Option<(u64, u8)> = None;
        for (i, out) in dst.iter_mut().enumerate() {
            let bit = offset + i as u64;
            let byte_index = bit / 8;
            let value = match cached {
                Some((index, value)) if index == byte_index => value,
                _ => {
                    let step = || -> Result<u8, Error> {
                        let taddr = target.add_no_wrap(byte_index)?;
                        self.target_block(taddr)?.get_byte(taddr)
                    };
                    match step() {
                        Ok(value) => {
                            cached = Some((byte_index, value));
                            value
                        }
                        Err(e) => {
                            if i == 0 {
                                return Err(e);
                            }
                            return Ok(i);
                        }
                    }
                }
            };
            *out = (value >> (bit % 8)) & 1;
        }
        Ok(dst.len())
    }

    fn write_byte_mapped(&self, offset: u64, src: &[u8]) -> Result<(), Error> {
        let target = self.target()?;
        let mut written = 0;
        while written < src.len() {
            let taddr = target.add_no_wrap(offset + written as u64)?;
            let block = self.target_block(taddr)?;
            let n = block.put_bytes(taddr, &src[written..])?;
            if n == 0 {
                return Err(Error::AccessDenied(format!(
                    "no writable target bytes at {}",
                    taddr
                )));
            }
            written += n;
        }
        Ok(())
    }

    fn write_bit_mapped(&self, offset: u64, src: &[u8]) -> Result<(), Error> {
        if let Some(&bad) = src.iter().find(|&&b| b > 1) {
            return Err(Error::Custom(format!(
                "bit-mapped blocks may only store 0x00 or 0x01, got {:#04x}",
                bad
            )));
        }
        let target = self.target()?;
        let mut i = 0;
        while i < src.len() {
            let byte_index = (offset + i as u64) / 8;
            let taddr = target.add_no_wrap(byte_index)?;
            let block = self.target_block(taddr)?;
            let mut value = block.get_byte(taddr)?;
            while i < src.len() && (offset + i as u64) / 8 == byte_index {
                let bit = (offset + i as u64) % 8;
                if src[i] != 0 {
                    value |= 1 << bit;
                } else {
                    value &= !(1 << bit);
                }
                i += 1;
            }
            block.put_byte(taddr, value)?;
        }
        Ok(())
    }

    /// Persist a second record covering `[at, end]` and truncate this block
    /// to `[start, at - 1]`. Initialization and permissions are inherited.
    pub(crate) fn split(&self, at: Address) -> Result<(), Error> {
        if self.record.kind != BlockKind::Default {
            return Err(Error::InvalidKind(format!(
                "{:?} blocks cannot be split",
                self.record.kind
            )));
        }
        let offset = at.subtract(self.record.start);
        let tail_length = self.record.length - offset;
        let tail_name = format!("{}.split", self.record.name);
        if self.record.initialized {
            let mut tail = vec![0u8; tail_length as usize];
            self.store.read(self.record.id, offset, &mut tail)?;
            let mut source: &[u8] = &tail;
            self.store.create_block(
                BlockKind::Default,
                &tail_name,
                at,
                tail_length,
                None,
                true,
                self.record.permissions,
                Some(&mut source),
                &NullMonitor,
            )?;
        } else {
            self.store.create_block(
                BlockKind::Default,
                &tail_name,
                at,
                tail_length,
                None,
                false,
                self.record.permissions,
                None,
                &NullMonitor,
            )?;
        }
        let mut record = self.record.clone();
        record.length = offset;
        self.store.update(&record)
    }

    /// Absorb `other`, which the caller has verified starts immediately
    /// after this block, into this block's record.
    pub(crate) fn join(&self, other: &MemoryBlock) -> Result<(), Error> {
        if self.record.kind != BlockKind::Default {
            return Err(Error::InvalidKind(format!(
                "{:?} blocks cannot be joined",
                self.record.kind
            )));
        }
        let other_bytes = if self.record.initialized {
            let mut bytes = vec![0u8; other.record.length as usize];
            self.store.read(other.record.id, 0, &mut bytes)?;
            Some(bytes)
        } else {
            None
        };
        let head_length = self.record.length;
        let mut record = self.record.clone();
        record.length = head_length + other.record.length;
        self.store.update(&record)?;
        if let Some(bytes) = other_bytes {
            self.store.write(record.id, head_length, &bytes)?;
        }
        self.store.delete(other.record.id)
    }

    /// Allocate backing bytes filled with `fill`.
    pub(crate) fn initialize(&self, fill: u8) -> Result<(), Error> {
        if !matches!(self.record.kind, BlockKind::Default | BlockKind::Overlay) {
            return Err(Error::InvalidKind(format!(
                "{:?} blocks cannot be initialized",
                self.record.kind
            )));
        }
        let mut record = self.record.clone();
        record.initialized = true;
        self.store.update(&record)?;
        if fill != 0 {
            let chunk = vec![fill; (64 * 1024).min(record.length as usize)];
            let mut offset = 0;
            while offset < record.length {
                let count = (record.length - offset).min(chunk.len() as u64) as usize;
                self.store.write(record.id, offset, &chunk[..count])?;
                offset += count as u64;
            }
        }
        Ok(())
    }

    /// Drop backing bytes.
    pub(crate) fn uninitialize(&self) -> Result<(), Error> {
        if !matches!(self.record.kind, BlockKind::Default | BlockKind::Overlay) {
            return Err(Error::InvalidKind(format!(
                "{:?} blocks cannot be uninitialized",
                self.record.kind
            )));
        }
        let mut record = self.record.clone();
        record.initialized = false;
        self.store.update(&record)
    }

    pub(crate) fn set_start(&self, new_start: Address) -> Result<(), Error> {
        let mut record = self.record.clone();
        record.start = new_start;
        self.store.update(&record)
    }

    pub(crate) fn set_name(&self, name: &str) -> Result<(), Error> {
        let mut record = self.record.clone();
        record.name = name.to_string();
        self.store.update(&record)
    }

    pub(crate) fn set_permissions(&self, permissions: MemoryPermissions) -> Result<(), Error> {
        let mut record = self.record.clone();
        record.permissions = permissions;
        self.store.update(&record)
    }

    pub(crate) fn delete(&self) -> Result<(), Error> {
        self.store.delete(self.record.id)
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("record", &self.record)
            .finish()
    }
}

impl fmt::Display for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}, {}] {:?}",
            self.record.name,
            self.start(),
            self.end(),
            self.record.kind
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use super::{BlockKind, MemoryBlock, MemoryPermissions};
    use crate::address::{Address, SpaceId};
    use crate::monitor::NullMonitor;
    use crate::store::{BlockStore, FillStream, RecordStore};

    fn addr(offset: u64) -> Address {
        Address::new(SpaceId::new(0), offset)
    }

    fn detached_block(initialized: bool) -> MemoryBlock {
        let store = Arc::new(RecordStore::new());
        let mut source = FillStream::new(0xAA);
        let record = store
            .create_block(
                BlockKind::Default,
                ".text",
                addr(0x1000),
                0x10,
                None,
                initialized,
                MemoryPermissions::READ | MemoryPermissions::WRITE,
                if initialized { Some(&mut source) } else { None },
                &NullMonitor,
            )
            .unwrap();
        MemoryBlock::new(record, store, Weak::new())
    }

    #[test]
    fn contains_and_bounds() {
        let block = detached_block(true);
        assert!(block.contains(addr(0x1000)));
        assert!(block.contains(addr(0x100f)));
        assert!(!block.contains(addr(0xfff)));
        assert!(!block.contains(addr(0x1010)));
        assert_eq!(block.end(), addr(0x100f));
    }

    #[test]
    fn default_block_byte_access() {
        let block = detached_block(true);
        assert_eq!(block.get_byte(addr(0x1005)).unwrap(), 0xAA);

        block.put_byte(addr(0x1005), 0x42).unwrap();
        assert_eq!(block.get_byte(addr(0x1005)).unwrap(), 0x42);

        // reads truncate at the block end
        let mut buf = [0u8; 0x20];
        assert_eq!(block.get_bytes(addr(0x1008), &mut buf).unwrap(), 0x8);

        assert!(block.get_byte(addr(0x2000)).is_err());
    }

    #[test]
    fn uninitialized_block_rejects_access() {
        let block = detached_block(false);
        assert!(block.get_byte(addr(0x1000)).is_err());
        assert!(block.put_byte(addr(0x1000), 0).is_err());
    }

    #[test]
    fn split_and_join_round_trip() {
        let block = detached_block(true);
        block.put_byte(addr(0x100c), 0x42).unwrap();
        block.split(addr(0x1008)).unwrap();

        let records = block.store.load_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].length, 8);
        assert_eq!(records[1].start, addr(0x1008));
        assert_eq!(records[1].length, 8);
        assert!(records[1].initialized);

        let head = MemoryBlock::new(records[0].clone(), block.store.clone(), Weak::new());
        let tail = MemoryBlock::new(records[1].clone(), block.store.clone(), Weak::new());
        assert_eq!(tail.get_byte(addr(0x100c)).unwrap(), 0x42);

        head.join(&tail).unwrap();
        let records = block.store.load_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].length, 0x10);
        let joined = MemoryBlock::new(records[0].clone(), block.store.clone(), Weak::new());
        assert_eq!(joined.get_byte(addr(0x100c)).unwrap(), 0x42);
        assert_eq!(joined.get_byte(addr(0x1005)).unwrap(), 0xAA);
    }

    #[test]
    fn initialize_fill() {
        let block = detached_block(false);
        block.initialize(0x5A).unwrap();
        let records = block.store.load_all().unwrap();
        let initialized = MemoryBlock::new(records[0].clone(), block.store.clone(), Weak::new());
        assert_eq!(initialized.get_byte(addr(0x1003)).unwrap(), 0x5A);
    }
}
