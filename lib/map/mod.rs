//! The memory map: block membership, address lookup, coverage sets, and
//! typed I/O over the block set.
//!
//! The map publishes an immutable snapshot (`MapState`) behind a short
//! internal monitor. Mutators serialize on a coarse write lock, validate,
//! call the block store, then derive a fresh snapshot with [`rebuild`];
//! readers which only need one consistent snapshot never contend with a
//! mutator's store I/O.

mod events;
mod live;
mod search;

pub use self::events::{ChangeListener, ChangeRecord, CodeManager, Instruction};
pub use self::live::{LiveMemory, LiveMemoryListener};
#[cfg(test)]
pub(crate) use self::search::{match_in_buffer, PatternMatch};

use std::fmt;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use rustc_hash::FxHashMap;

use crate::address::{Address, AddressFactory, AddressIter, AddressRange, AddressSet};
use crate::block::{BlockKind, MemoryBlock, MemoryPermissions};
use crate::error::Error;
use crate::monitor::{NullMonitor, TaskMonitor};
use crate::store::{BlockStore, FillStream};
use crate::types::Endian;

pub const GBYTE_SHIFT_FACTOR: u32 = 30;
pub const GBYTE: u64 = 1 << GBYTE_SHIFT_FACTOR;

pub const MAX_BINARY_SIZE_GB: u64 = 16;
pub const MAX_BINARY_SIZE: u64 = MAX_BINARY_SIZE_GB << GBYTE_SHIFT_FACTOR;

pub const MAX_INITIALIZED_BLOCK_SIZE_GB: u64 = 16;
pub const MAX_INITIALIZED_BLOCK_SIZE: u64 = MAX_INITIALIZED_BLOCK_SIZE_GB << GBYTE_SHIFT_FACTOR;

pub const MAX_UNINITIALIZED_BLOCK_SIZE_GB: u64 = 16;
pub const MAX_UNINITIALIZED_BLOCK_SIZE: u64 =
    MAX_UNINITIALIZED_BLOCK_SIZE_GB << GBYTE_SHIFT_FACTOR;

/// Sentinel for an empty recency cache.
const NO_BLOCK: usize = usize::MAX;

/// The snapshot the map publishes after every mutation.
pub(crate) struct MapState {
    /// Blocks sorted ascending by start address. This vector is the sole
    /// iteration order.
    blocks: Vec<MemoryBlock>,
    block_index: FxHashMap<u32, usize>,
    addr_set: AddressSet,
    all_initialized: AddressSet,
    loaded_initialized: AddressSet,
    /// Index of the most recently resolved block. A non-synchronized hint;
    /// readers re-validate with `contains` before trusting it.
    last_block: AtomicUsize,
}

impl Default for MapState {
    fn default() -> MapState {
        MapState {
            blocks: Vec::new(),
            block_index: FxHashMap::default(),
            addr_set: AddressSet::new(),
            all_initialized: AddressSet::new(),
            loaded_initialized: AddressSet::new(),
            last_block: AtomicUsize::new(NO_BLOCK),
        }
    }
}

pub(crate) struct MapInner {
    store: Arc<dyn BlockStore>,
    factory: Arc<AddressFactory>,
    endian: Endian,
    image_base: Address,
    exclusive: AtomicBool,
    /// The coarse program/write lock. Held across every mutator and across
    /// multi-step reads which need one consistent snapshot.
    write_lock: Mutex<()>,
    /// The short internal monitor guarding the published snapshot.
    state: RwLock<MapState>,
    live: RwLock<Option<Arc<dyn LiveMemory>>>,
    live_listener: RwLock<Option<Arc<dyn LiveMemoryListener>>>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    code_manager: RwLock<Option<Arc<dyn CodeManager>>>,
}

impl MapInner {
    fn lock_write(&self) -> MutexGuard<()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state_read(&self) -> RwLockReadGuard<MapState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_write(&self) -> RwLockWriteGuard<MapState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn live_memory(&self) -> Option<Arc<dyn LiveMemory>> {
        self.live.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn code_manager(&self) -> Option<Arc<dyn CodeManager>> {
        self.code_manager
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn check_exclusive(&self) -> Result<(), Error> {
        if self.exclusive.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(Error::LockViolation(
                "exclusive access to the program is required".to_string(),
            ))
        }
    }

    /// Log a store failure before surfacing it; the caller escalates.
    fn db_error(&self, error: Error) -> Error {
        match error {
            Error::Cancelled => Error::Cancelled,
            error => {
                log::error!("record store failure: {}", error);
                error
            }
        }
    }

    /// Resolve the block containing `addr`: recency cache first, then a
    /// binary search over the sorted block vector.
    pub(crate) fn lookup(&self, addr: Address) -> Option<MemoryBlock> {
        let state = self.state_read();
        let hint = state.last_block.load(Ordering::Relaxed);
        if let Some(block) = state.blocks.get(hint) {
            if block.contains(addr) {
                return Some(block.clone());
            }
        }
        let index = match state.blocks.binary_search_by(|b| b.start().cmp(&addr)) {
            Ok(index) => index,
            Err(0) => return None,
            Err(insertion) => {
                let index = insertion - 1;
                if state.blocks[index].contains(addr) {
                    index
                } else {
                    return None;
                }
            }
        };
        state.last_block.store(index, Ordering::Relaxed);
        Some(state.blocks[index].clone())
    }

    /// Reject writes which overlap a decoded instruction.
    pub(crate) fn check_memory_write(&self, start: Address, length: usize) -> Result<(), Error> {
        let code_manager = match self.code_manager() {
            Some(code_manager) => code_manager,
            None => return Ok(()),
        };
        if let Some(instruction) = code_manager.instruction_containing(start) {
            return Err(Error::AccessDenied(format!(
                "memory change conflicts with instruction at {}",
                instruction.min_address()
            )));
        }
        if length > 1 {
            if let Some(instruction) = code_manager.instruction_after(start) {
                let end = start.add_no_wrap(length as u64 - 1)?;
                if instruction.min_address() <= end {
                    return Err(Error::AccessDenied(format!(
                        "memory change conflicts with instruction at {}",
                        instruction.min_address()
                    )));
                }
            }
        }
        Ok(())
    }

    fn fire(&self, record: ChangeRecord) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            listener.memory_map_changed(&record);
        }
    }

    pub(crate) fn fire_bytes_changed(&self, start: Address, count: u64) {
        if count == 0 {
            return;
        }
        let end = Address::new(start.space(), start.offset().saturating_add(count - 1));
        if let Some(code_manager) = self.code_manager() {
            code_manager.memory_changed(start, end);
        }
        self.fire(ChangeRecord::BytesChanged { start, end });
    }
}

/// The mapped projection: for each mapped block, the target span's
/// intersection with `other` projected back through the mapping.
/// Projections are clamped to the mapped block's own range so a partial
/// final target byte of a bit-mapped block cannot project past its end.
fn mapped_projection(blocks: &[MemoryBlock], other: &AddressSet) -> AddressSet {
    let mut projection = AddressSet::new();
    for block in blocks.iter().filter(|b| b.is_mapped()) {
        let target = match block.mapping_target() {
            Some(target) => target,
            None => continue,
        };
        let span = match block.kind() {
            BlockKind::BitMapped => (block.length() + 7) / 8,
            _ => block.length(),
        };
        if span == 0 {
            continue;
        }
        let target_end = match target.add_no_wrap(span - 1) {
            Ok(end) => end,
            Err(_) => continue,
        };
        let resolved = other.intersect_range(target, target_end);
        for range in resolved.ranges() {
            let offset = range.start().subtract(target);
            let (start, length) = match block.kind() {
                BlockKind::BitMapped => (
                    block.start().add_no_wrap(offset * 8),
                    range.num_addresses() * 8,
                ),
                _ => (block.start().add_no_wrap(offset), range.num_addresses()),
            };
            let start = match start {
                Ok(start) => start,
                Err(_) => continue,
            };
            let end = match start.add_no_wrap(length - 1) {
                Ok(end) => end.min(block.end()),
                Err(_) => block.end(),
            };
            if start <= end {
                projection.add_range(start, end);
            }
        }
    }
    projection
}

/// Derive and publish a fresh snapshot from the store. The only path which
/// publishes new coverage sets.
fn rebuild(inner: &Arc<MapInner>, refresh: bool) -> Result<(), Error> {
    if refresh {
        inner.store.refresh()?;
    }
    let records = inner.store.load_all()?;
    let mut blocks: Vec<MemoryBlock> = records
        .into_iter()
        .map(|record| MemoryBlock::new(record, Arc::clone(&inner.store), Arc::downgrade(inner)))
        .collect();
    blocks.sort_by_key(|b| b.start());

    let mut block_index = FxHashMap::default();
    let mut addr_set = AddressSet::new();
    let mut all_initialized = AddressSet::new();
    let mut loaded_initialized = AddressSet::new();
    for (index, block) in blocks.iter().enumerate() {
        block_index.insert(block.id(), index);
        addr_set.add_range(block.start(), block.end());
        if block.is_initialized() {
            all_initialized.add_range(block.start(), block.end());
            if block.is_loaded() {
                loaded_initialized.add_range(block.start(), block.end());
            }
        }
    }

    // Mapped blocks are uninitialized themselves, but ranges of them may
    // map onto initialized ranges of other blocks.
    all_initialized.add_set(&mapped_projection(&blocks, &all_initialized));
    loaded_initialized.add_set(&mapped_projection(&blocks, &loaded_initialized));

    {
        let mut state = inner.state_write();
        *state = MapState {
            blocks,
            block_index,
            addr_set,
            all_initialized,
            loaded_initialized,
            last_block: AtomicUsize::new(NO_BLOCK),
        };
    }
    if let Some(live) = inner.live_memory() {
        live.clear_cache();
    }
    Ok(())
}

struct MapLiveListener {
    inner: Weak<MapInner>,
}

impl LiveMemoryListener for MapLiveListener {
    fn live_memory_changed(&self, addr: Address, length: usize) {
        if let Some(inner) = self.inner.upgrade() {
            inner.fire_bytes_changed(addr, length as u64);
        }
    }
}

/// The memory map of an analyzed program.
pub struct MemoryMap {
    inner: Arc<MapInner>,
}

impl MemoryMap {
    /// Open a memory map over `store`, loading any persisted blocks.
    pub fn new(
        store: Arc<dyn BlockStore>,
        factory: Arc<AddressFactory>,
        endian: Endian,
        image_base: Address,
    ) -> Result<MemoryMap, Error> {
        let inner = Arc::new(MapInner {
            store,
            factory,
            endian,
            image_base,
            exclusive: AtomicBool::new(true),
            write_lock: Mutex::new(()),
            state: RwLock::new(MapState::default()),
            live: RwLock::new(None),
            live_listener: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            code_manager: RwLock::new(None),
        });
        rebuild(&inner, false)?;
        Ok(MemoryMap { inner })
    }

    pub fn endian(&self) -> Endian {
        self.inner.endian
    }

    pub fn is_big_endian(&self) -> bool {
        self.inner.endian.is_big()
    }

    pub fn image_base(&self) -> Address {
        self.inner.image_base
    }

    pub fn address_factory(&self) -> &Arc<AddressFactory> {
        &self.inner.factory
    }

    /// Withdraw or restore the caller's exclusive access. Mutators fail
    /// with `Error::LockViolation` while access is withdrawn.
    pub fn set_exclusive_access(&self, exclusive: bool) {
        self.inner.exclusive.store(exclusive, Ordering::Relaxed);
    }

    pub fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.inner
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn set_code_manager(&self, code_manager: Option<Arc<dyn CodeManager>>) {
        *self
            .inner
            .code_manager
            .write()
            .unwrap_or_else(|e| e.into_inner()) = code_manager;
    }

    /// Re-read persisted records and publish a fresh snapshot.
    pub fn refresh(&self) -> Result<(), Error> {
        let _guard = self.inner.lock_write();
        rebuild(&self.inner, true)
    }

    /// Install or remove the live-memory handler.
    pub fn set_live_memory(&self, handler: Option<Arc<dyn LiveMemory>>) {
        let _guard = self.inner.lock_write();
        let mut live = self.inner.live.write().unwrap_or_else(|e| e.into_inner());
        let mut slot = self
            .inner
            .live_listener
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let (Some(old), Some(listener)) = (live.as_ref(), slot.as_ref()) {
            old.remove_listener(listener);
        }
        *live = handler.clone();
        *slot = None;
        if let Some(new) = handler {
            let listener: Arc<dyn LiveMemoryListener> = Arc::new(MapLiveListener {
                inner: Arc::downgrade(&self.inner),
            });
            new.add_listener(Arc::clone(&listener));
            *slot = Some(listener);
        }
    }

    pub fn live_memory(&self) -> Option<Arc<dyn LiveMemory>> {
        self.inner.live_memory()
    }

    // ------------------------------------------------------------------
    // Block membership
    // ------------------------------------------------------------------

    /// The block containing `addr`, if any.
    pub fn get_block(&self, addr: Address) -> Option<MemoryBlock> {
        self.inner.lookup(addr)
    }

    /// The block named `name`, if any.
    pub fn get_block_by_name(&self, name: &str) -> Option<MemoryBlock> {
        let state = self.inner.state_read();
        state.blocks.iter().find(|b| b.name() == name).cloned()
    }

    /// A snapshot of all blocks, sorted ascending by start address.
    pub fn get_blocks(&self) -> Vec<MemoryBlock> {
        let _guard = self.inner.lock_write();
        self.inner.state_read().blocks.clone()
    }

    /// Re-resolve a caller-held handle against the current snapshot.
    fn validate_member(&self, block: &MemoryBlock) -> Result<MemoryBlock, Error> {
        if !Weak::ptr_eq(&block.map, &Arc::downgrade(&self.inner)) {
            return Err(Error::NotFound(format!(
                "block \"{}\" does not belong to this memory map",
                block.name()
            )));
        }
        let state = self.inner.state_read();
        let index = state.block_index.get(&block.id()).copied();
        let current = index.map(|i| state.blocks[i].clone()).filter(|current| {
            current.start() == block.start() && current.kind() == block.kind()
        });
        current.ok_or_else(|| {
            Error::NotFound(format!(
                "block \"{}\" does not belong to this memory map",
                block.name()
            ))
        })
    }

    // ------------------------------------------------------------------
    // Coverage sets
    // ------------------------------------------------------------------

    /// All covered addresses.
    pub fn address_set(&self) -> AddressSet {
        self.inner.state_read().addr_set.clone()
    }

    /// Initialized addresses, including mapped projections onto
    /// initialized targets.
    pub fn all_initialized_address_set(&self) -> AddressSet {
        self.inner.state_read().all_initialized.clone()
    }

    /// Initialized addresses restricted to loaded blocks. With live memory
    /// active every covered address is initialized.
    pub fn loaded_and_initialized_address_set(&self) -> AddressSet {
        if self.inner.live_memory().is_some() {
            return self.address_set();
        }
        self.inner.state_read().loaded_initialized.clone()
    }

    pub fn initialized_address_set(&self) -> AddressSet {
        self.loaded_and_initialized_address_set()
    }

    /// The union of ranges of blocks with the execute permission, computed
    /// on demand.
    pub fn execute_set(&self) -> AddressSet {
        let state = self.inner.state_read();
        let mut set = AddressSet::new();
        for block in state.blocks.iter().filter(|b| b.is_execute()) {
            set.add_range(block.start(), block.end());
        }
        set
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.inner.state_read().addr_set.contains(addr)
    }

    pub fn contains_range(&self, start: Address, end: Address) -> bool {
        self.inner.state_read().addr_set.contains_range(start, end)
    }

    pub fn contains_set(&self, set: &AddressSet) -> bool {
        self.inner.state_read().addr_set.contains_set(set)
    }

    pub fn intersects_range(&self, start: Address, end: Address) -> bool {
        self.inner
            .state_read()
            .addr_set
            .intersects_range(start, end)
    }

    pub fn intersects(&self, set: &AddressSet) -> bool {
        self.inner.state_read().addr_set.intersects(set)
    }

    pub fn intersect(&self, set: &AddressSet) -> AddressSet {
        self.inner.state_read().addr_set.intersect(set)
    }

    pub fn intersect_range(&self, start: Address, end: Address) -> AddressSet {
        self.inner
            .state_read()
            .addr_set
            .intersect_range(start, end)
    }

    pub fn union(&self, set: &AddressSet) -> AddressSet {
        self.inner.state_read().addr_set.union(set)
    }

    pub fn subtract(&self, set: &AddressSet) -> AddressSet {
        self.inner.state_read().addr_set.subtract(set)
    }

    pub fn xor(&self, set: &AddressSet) -> AddressSet {
        self.inner.state_read().addr_set.xor(set)
    }

    pub fn has_same_addresses(&self, set: &AddressSet) -> bool {
        self.inner.state_read().addr_set.has_same_addresses(set)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state_read().addr_set.is_empty()
    }

    pub fn min_address(&self) -> Option<Address> {
        self.inner.state_read().addr_set.min_address()
    }

    pub fn max_address(&self) -> Option<Address> {
        self.inner.state_read().addr_set.max_address()
    }

    pub fn num_address_ranges(&self) -> usize {
        self.inner.state_read().addr_set.num_address_ranges()
    }

    pub fn num_addresses(&self) -> u64 {
        self.inner.state_read().addr_set.num_addresses()
    }

    /// The number of covered addresses.
    pub fn size(&self) -> u64 {
        self.num_addresses()
    }

    pub fn first_range(&self) -> Option<AddressRange> {
        self.inner.state_read().addr_set.first_range()
    }

    pub fn last_range(&self) -> Option<AddressRange> {
        self.inner.state_read().addr_set.last_range()
    }

    pub fn range_containing(&self, addr: Address) -> Option<AddressRange> {
        self.inner.state_read().addr_set.range_containing(addr)
    }

    pub fn addresses(&self, start: Address, forward: bool) -> AddressIter {
        self.inner.state_read().addr_set.addresses(start, forward)
    }

    // ------------------------------------------------------------------
    // Validation helpers
    // ------------------------------------------------------------------

    fn check_block_size(&self, length: u64, initialized: bool) -> Result<(), Error> {
        let limit = if initialized {
            MAX_INITIALIZED_BLOCK_SIZE
        } else {
            MAX_UNINITIALIZED_BLOCK_SIZE
        };
        if length > limit {
            return Err(Error::Custom(format!(
                "block exceeds the maximum memory block size of {} GByte(s)",
                limit >> GBYTE_SHIFT_FACTOR
            )));
        }
        let total = self.num_addresses().saturating_add(length);
        if total > MAX_BINARY_SIZE {
            return Err(Error::Custom(format!(
                "block would push the program over the maximum size of {} GBytes",
                MAX_BINARY_SIZE_GB
            )));
        }
        Ok(())
    }

    /// The common validation for new non-overlay blocks: a known memory
    /// space, non-zero length, no overflow, no image-base crossing in the
    /// default space, and no intersection with covered memory.
    fn check_range(&self, start: Address, length: u64) -> Result<(), Error> {
        let space = self.inner.factory.space(start.space()).ok_or_else(|| {
            Error::NotFound(format!(
                "block may not be created in an unrecognized address space ({})",
                start
            ))
        })?;
        if space.is_overlay_space() {
            return Err(Error::Custom(format!(
                "block may not be created in overlay space \"{}\"",
                space.name()
            )));
        }
        if length == 0 {
            return Err(Error::Custom(
                "block must have a non-zero length".to_string(),
            ));
        }
        let end = start.add_no_wrap(length - 1)?;
        if end.offset() > space.max_offset() {
            return Err(Error::Overflow(format!(
                "block end {} exceeds space \"{}\"",
                end,
                space.name()
            )));
        }
        if start.space() == self.inner.factory.default_space().id() {
            let image_base = self.inner.image_base;
            if start < image_base && end >= image_base {
                return Err(Error::RangeConflict(format!(
                    "block may not span the image base address ({})",
                    image_base
                )));
            }
        }
        if self.intersects_range(start, end) {
            return Err(Error::RangeConflict(format!(
                "part of range [{}, {}] already exists in memory",
                start, end
            )));
        }
        Ok(())
    }

    /// Allocate the overlay space backing a new overlay block and rewrite
    /// `start` into it.
    fn make_overlay_space(
        &self,
        name: &str,
        start: Address,
        length: u64,
    ) -> Result<Address, Error> {
        let space = self.inner.factory.space(start.space()).ok_or_else(|| {
            Error::NotFound(format!(
                "block may not be created in an unrecognized address space ({})",
                start
            ))
        })?;
        if space.is_overlay_space() {
            return Err(Error::Custom(
                "an overlay block may not be overlayed".to_string(),
            ));
        }
        if !space.is_memory_space() {
            return Err(Error::Custom(format!(
                "invalid physical address for overlay block: {}",
                start
            )));
        }
        if length == 0 {
            return Err(Error::Custom(
                "block must have a non-zero length".to_string(),
            ));
        }
        start.add_no_wrap(length - 1)?;
        let overlay = self.inner.factory.create_overlay_space(
            name,
            space.id(),
            start.offset(),
            start.offset() + (length - 1),
        )?;
        Ok(overlay.address(start.offset()))
    }

    // ------------------------------------------------------------------
    // Mutators
    // ------------------------------------------------------------------

    /// Create an initialized block filled with `fill`.
    pub fn create_initialized_block(
        &self,
        name: &str,
        start: Address,
        length: u64,
        fill: u8,
        monitor: Option<&dyn TaskMonitor>,
        overlay: bool,
    ) -> Result<MemoryBlock, Error> {
        if fill != 0 {
            let mut stream = FillStream::new(fill);
            self.create_block_common(name, start, length, true, Some(&mut stream), monitor, overlay)
        } else {
            self.create_block_common(name, start, length, true, None, monitor, overlay)
        }
    }

    /// Create an initialized block whose bytes are drawn from `source`.
    /// A short stream leaves the remainder zero-filled.
    pub fn create_initialized_block_from(
        &self,
        name: &str,
        start: Address,
        source: &mut dyn Read,
        length: u64,
        monitor: Option<&dyn TaskMonitor>,
        overlay: bool,
    ) -> Result<MemoryBlock, Error> {
        self.create_block_common(name, start, length, true, Some(source), monitor, overlay)
    }

    /// Create an uninitialized block.
    pub fn create_uninitialized_block(
        &self,
        name: &str,
        start: Address,
        length: u64,
        overlay: bool,
    ) -> Result<MemoryBlock, Error> {
        self.create_block_common(name, start, length, false, None, None, overlay)
    }

    fn create_block_common(
        &self,
        name: &str,
        start: Address,
        length: u64,
        initialized: bool,
        source: Option<&mut dyn Read>,
        monitor: Option<&dyn TaskMonitor>,
        overlay: bool,
    ) -> Result<MemoryBlock, Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        self.check_block_size(length, initialized)?;
        let (start, overlay_space) = if overlay {
            let start = self.make_overlay_space(name, start, length)?;
            (start, Some(start.space()))
        } else {
            self.check_range(start, length)?;
            (start, None)
        };
        let kind = if overlay {
            BlockKind::Overlay
        } else {
            BlockKind::Default
        };
        let monitor = monitor.unwrap_or(&NullMonitor);
        let result = self.inner.store.create_block(
            kind,
            name,
            start,
            length,
            None,
            initialized,
            MemoryPermissions::READ,
            source,
            monitor,
        );
        let record = match result {
            Ok(record) => record,
            Err(error) => {
                // an aborted create must not leak its overlay space
                if let Some(space) = overlay_space {
                    let _ = self.inner.factory.remove_overlay_space(space);
                }
                return Err(self.inner.db_error(error));
            }
        };
        rebuild(&self.inner, true)?;
        let block = self.get_block(record.start).ok_or_else(|| {
            Error::NotFound(format!("created block \"{}\" did not load", name))
        })?;
        self.inner.fire(ChangeRecord::BlockAdded {
            start: block.start(),
            end: block.end(),
        });
        Ok(block)
    }

    /// Create a bit-mapped block: `length` bits of the target viewed one
    /// byte per bit.
    pub fn create_bit_mapped_block(
        &self,
        name: &str,
        start: Address,
        target: Address,
        length: u64,
    ) -> Result<MemoryBlock, Error> {
        let span = if length == 0 { 0 } else { (length - 1) / 8 };
        self.create_mapped_block(BlockKind::BitMapped, name, start, target, length, span)
    }

    /// Create a byte-mapped block forwarding 1:1 into the target range.
    pub fn create_byte_mapped_block(
        &self,
        name: &str,
        start: Address,
        target: Address,
        length: u64,
    ) -> Result<MemoryBlock, Error> {
        let span = length.saturating_sub(1);
        self.create_mapped_block(BlockKind::ByteMapped, name, start, target, length, span)
    }

    fn create_mapped_block(
        &self,
        kind: BlockKind,
        name: &str,
        start: Address,
        target: Address,
        length: u64,
        target_span: u64,
    ) -> Result<MemoryBlock, Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        self.check_block_size(length, false)?;
        self.check_range(start, length)?;
        // the declared target range must fit in its space
        target.add_no_wrap(target_span)?;
        let record = self
            .inner
            .store
            .create_block(
                kind,
                name,
                start,
                length,
                Some(target),
                false,
                MemoryPermissions::READ,
                None,
                &NullMonitor,
            )
            .map_err(|e| self.inner.db_error(e))?;
        rebuild(&self.inner, true)?;
        let block = self.get_block(record.start).ok_or_else(|| {
            Error::NotFound(format!("created block \"{}\" did not load", name))
        })?;
        self.inner.fire(ChangeRecord::BlockAdded {
            start: block.start(),
            end: block.end(),
        });
        Ok(block)
    }

    /// Create a new block with the kind, permissions, initialization, and
    /// mapping target of `prototype`.
    pub fn create_block_like(
        &self,
        prototype: &MemoryBlock,
        name: &str,
        start: Address,
        length: u64,
    ) -> Result<MemoryBlock, Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        self.check_block_size(length, prototype.is_initialized())?;
        self.check_range(start, length)?;
        let record = self
            .inner
            .store
            .create_block(
                prototype.kind(),
                name,
                start,
                length,
                prototype.mapping_target(),
                prototype.is_initialized(),
                prototype.permissions(),
                None,
                &NullMonitor,
            )
            .map_err(|e| self.inner.db_error(e))?;
        rebuild(&self.inner, true)?;
        let block = self.get_block(record.start).ok_or_else(|| {
            Error::NotFound(format!("created block \"{}\" did not load", name))
        })?;
        self.inner.fire(ChangeRecord::BlockAdded {
            start: block.start(),
            end: block.end(),
        });
        Ok(block)
    }

    /// Move a block to `new_start`.
    pub fn move_block(&self, block: &MemoryBlock, new_start: Address) -> Result<(), Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        if self.inner.live_memory().is_some() {
            return Err(Error::StateConflict(
                "memory move operation not permitted while live memory is active".to_string(),
            ));
        }
        let block = self.validate_member(block)?;
        if block.kind() == BlockKind::Overlay {
            return Err(Error::InvalidKind("overlay blocks cannot be moved".to_string()));
        }
        let space = self.inner.factory.space(new_start.space()).ok_or_else(|| {
            Error::NotFound(format!(
                "block may not be moved to an unrecognized address space ({})",
                new_start
            ))
        })?;
        if space.is_overlay_space() {
            return Err(Error::Custom(
                "a block may not be moved into an overlay space".to_string(),
            ));
        }
        let old_start = block.start();
        let length = block.length();
        let new_end = new_start.add_no_wrap(length - 1)?;
        if new_end.offset() > space.max_offset() {
            return Err(Error::Overflow(format!(
                "block end {} exceeds space \"{}\"",
                new_end,
                space.name()
            )));
        }
        let mut remaining = self.address_set();
        remaining.delete_range(block.start(), block.end());
        if remaining.intersects_range(new_start, new_end) {
            return Err(Error::RangeConflict(
                "block move conflicts with another existing memory block".to_string(),
            ));
        }
        block
            .set_start(new_start)
            .map_err(|e| self.inner.db_error(e))?;
        rebuild(&self.inner, true)?;
        self.inner.fire(ChangeRecord::BlockMoved {
            old_start,
            new_start,
            length,
        });
        Ok(())
    }

    /// Split a block in two at `at`, which must lie strictly inside it.
    pub fn split_block(&self, block: &MemoryBlock, at: Address) -> Result<(), Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        if self.inner.live_memory().is_some() {
            return Err(Error::StateConflict(
                "memory split operation not permitted while live memory is active".to_string(),
            ));
        }
        let block = self.validate_member(block)?;
        if !block.contains(at) {
            return Err(Error::Custom("block must contain split address".to_string()));
        }
        if at == block.start() {
            return Err(Error::Custom(
                "split cannot be done on the block start address".to_string(),
            ));
        }
        if block.kind() != BlockKind::Default {
            return Err(Error::InvalidKind(format!(
                "{:?} blocks cannot be split",
                block.kind()
            )));
        }
        let start = block.start();
        block.split(at).map_err(|e| self.inner.db_error(e))?;
        rebuild(&self.inner, true)?;
        self.inner
            .fire(ChangeRecord::BlockSplit { start, split_at: at });
        Ok(())
    }

    /// Join two adjacent default blocks into one.
    pub fn join_blocks(
        &self,
        block_one: &MemoryBlock,
        block_two: &MemoryBlock,
    ) -> Result<MemoryBlock, Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        if self.inner.live_memory().is_some() {
            return Err(Error::StateConflict(
                "memory join operation not permitted while live memory is active".to_string(),
            ));
        }
        if block_one.kind() != block_two.kind() {
            return Err(Error::InvalidKind(
                "blocks of different kinds cannot be joined".to_string(),
            ));
        }
        if block_one.is_initialized() != block_two.is_initialized() {
            return Err(Error::Custom(
                "both blocks must be either initialized or uninitialized".to_string(),
            ));
        }
        if block_one.kind() != BlockKind::Default {
            return Err(Error::InvalidKind(format!(
                "{:?} blocks cannot be joined",
                block_one.kind()
            )));
        }
        let total = block_one.length().saturating_add(block_two.length());
        if total > i32::MAX as u64 {
            return Err(Error::Custom("blocks are too large to be joined".to_string()));
        }
        let (first, second) = if block_one.start() <= block_two.start() {
            (block_one, block_two)
        } else {
            (block_two, block_one)
        };
        let first = self.validate_member(first)?;
        let second = self.validate_member(second)?;
        if !first.end().is_successor(second.start()) {
            return Err(Error::Custom("blocks are not contiguous".to_string()));
        }
        let start = first.start();
        let old_start = second.start();
        first.join(&second).map_err(|e| self.inner.db_error(e))?;
        rebuild(&self.inner, true)?;
        let joined = self.get_block(start).ok_or_else(|| {
            Error::NotFound("joined block did not load".to_string())
        })?;
        self.inner
            .fire(ChangeRecord::BlocksJoined { start, old_start });
        Ok(joined)
    }

    /// Allocate backing bytes for an uninitialized default or overlay
    /// block, filling them with `fill`. Coverage sets are patched in place.
    pub fn convert_to_initialized(
        &self,
        block: &MemoryBlock,
        fill: u8,
    ) -> Result<MemoryBlock, Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        let block = self.validate_member(block)?;
        if block.is_initialized() {
            return Err(Error::Custom(
                "only an uninitialized block may be converted to an initialized block".to_string(),
            ));
        }
        if !matches!(block.kind(), BlockKind::Default | BlockKind::Overlay) {
            return Err(Error::InvalidKind(format!(
                "{:?} blocks cannot be initialized",
                block.kind()
            )));
        }
        if block.length() > MAX_INITIALIZED_BLOCK_SIZE {
            return Err(Error::Custom("block is too large to initialize".to_string()));
        }
        block.initialize(fill).map_err(|e| self.inner.db_error(e))?;
        let refreshed = {
            let mut state = self.inner.state_write();
            let index = state.block_index[&block.id()];
            state.blocks[index].record.initialized = true;
            let (start, end) = (block.start(), block.end());
            state.all_initialized.add_range(start, end);
            state.loaded_initialized.add_range(start, end);
            state.blocks[index].clone()
        };
        self.inner.fire(ChangeRecord::BlockChanged {
            start: refreshed.start(),
        });
        self.inner
            .fire_bytes_changed(refreshed.start(), refreshed.length());
        Ok(refreshed)
    }

    /// Drop the backing bytes of an initialized default or overlay block.
    /// Coverage sets are patched in place.
    pub fn convert_to_uninitialized(&self, block: &MemoryBlock) -> Result<MemoryBlock, Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        let block = self.validate_member(block)?;
        if !block.is_initialized() {
            return Err(Error::Custom(
                "only an initialized block may be converted to an uninitialized block".to_string(),
            ));
        }
        if !matches!(block.kind(), BlockKind::Default | BlockKind::Overlay) {
            return Err(Error::InvalidKind(format!(
                "{:?} blocks cannot be uninitialized",
                block.kind()
            )));
        }
        block.uninitialize().map_err(|e| self.inner.db_error(e))?;
        let refreshed = {
            let mut state = self.inner.state_write();
            let index = state.block_index[&block.id()];
            state.blocks[index].record.initialized = false;
            let (start, end) = (block.start(), block.end());
            state.all_initialized.delete_range(start, end);
            state.loaded_initialized.delete_range(start, end);
            state.blocks[index].clone()
        };
        self.inner.fire(ChangeRecord::BlockChanged {
            start: refreshed.start(),
        });
        self.inner
            .fire_bytes_changed(refreshed.start(), refreshed.length());
        Ok(refreshed)
    }

    /// Remove a block. Removing the last block of an overlay space drops
    /// the space as well.
    pub fn remove_block(&self, block: &MemoryBlock) -> Result<(), Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        let block = self.validate_member(block)?;
        let start = block.start();
        let space = start.space();
        block.delete().map_err(|e| self.inner.db_error(e))?;
        rebuild(&self.inner, true)?;
        self.inner.fire(ChangeRecord::BlockRemoved { start });
        if self
            .inner
            .factory
            .space(space)
            .map_or(false, |s| s.is_overlay_space())
        {
            let occupied = {
                let state = self.inner.state_read();
                state.blocks.iter().any(|b| b.start().space() == space)
            };
            if !occupied {
                let _ = self.inner.factory.remove_overlay_space(space);
            }
        }
        Ok(())
    }

    /// Rename a block. Renaming a block residing in an overlay space
    /// renames the space with it.
    pub fn rename_block(&self, block: &MemoryBlock, name: &str) -> Result<(), Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        let block = self.validate_member(block)?;
        let space = self.inner.factory.space(block.start().space());
        if let Some(space) = space.filter(|s| s.is_overlay_space()) {
            self.inner
                .factory
                .rename_overlay_space(space.name(), name)?;
        }
        block.set_name(name).map_err(|e| self.inner.db_error(e))?;
        rebuild(&self.inner, true)?;
        self.inner.fire(ChangeRecord::BlockChanged {
            start: block.start(),
        });
        Ok(())
    }

    /// Replace a block's permission flags.
    pub fn set_block_permissions(
        &self,
        block: &MemoryBlock,
        permissions: MemoryPermissions,
    ) -> Result<(), Error> {
        let _guard = self.inner.lock_write();
        self.inner.check_exclusive()?;
        let block = self.validate_member(block)?;
        block
            .set_permissions(permissions)
            .map_err(|e| self.inner.db_error(e))?;
        rebuild(&self.inner, true)?;
        self.inner.fire(ChangeRecord::BlockChanged {
            start: block.start(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed I/O
    // ------------------------------------------------------------------

    /// Read one byte.
    pub fn get_byte(&self, addr: Address) -> Result<u8, Error> {
        if let Some(live) = self.inner.live_memory() {
            return live.get_byte(addr);
        }
        let _guard = self.inner.lock_write();
        let block = self.inner.lookup(addr).ok_or_else(|| {
            Error::AccessDenied(format!("address {} does not exist in memory", addr))
        })?;
        block.get_byte(addr)
    }

    /// Read up to `dst.len()` bytes starting at `addr`, spanning adjacent
    /// blocks, and return the number of bytes read. Reading stops at the
    /// first address not backed by an initialized or mapped block; reading
    /// nothing at all is an error.
    pub fn get_bytes(&self, addr: Address, dst: &mut [u8]) -> Result<usize, Error> {
        if let Some(live) = self.inner.live_memory() {
            return live.get_bytes(addr, dst);
        }
        let _guard = self.inner.lock_write();
        self.get_bytes_locked(addr, dst)
    }

    fn get_bytes_locked(&self, addr: Address, dst: &mut [u8]) -> Result<usize, Error> {
        let size = dst.len();
        let mut num_read = 0;
        let mut addr = addr;
        while num_read < size {
            let block = match self.inner.lookup(addr) {
                Some(block) => block,
                None => break,
            };
            if !(block.is_initialized() || block.is_mapped()) {
                break;
            }
            let last_read = block.get_bytes(addr, &mut dst[num_read..])?;
            if last_read == 0 {
                break;
            }
            num_read += last_read;
            addr = match addr.add_no_wrap(last_read as u64) {
                Ok(addr) => addr,
                Err(_) => break,
            };
        }
        if num_read == 0 && size > 0 {
            return Err(Error::AccessDenied(format!(
                "unable to read bytes at {}",
                addr
            )));
        }
        Ok(num_read)
    }

    /// Read a 16-bit value in the program's endianness.
    pub fn get_short(&self, addr: Address) -> Result<u16, Error> {
        self.get_short_endian(addr, self.inner.endian)
    }

    pub fn get_short_endian(&self, addr: Address, endian: Endian) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        if self.get_bytes(addr, &mut buf)? != 2 {
            return Err(Error::AccessDenied(format!("could not get short at {}", addr)));
        }
        Ok(endian.decode_u16(&buf))
    }

    /// Read a 32-bit value in the program's endianness.
    pub fn get_int(&self, addr: Address) -> Result<u32, Error> {
        self.get_int_endian(addr, self.inner.endian)
    }

    pub fn get_int_endian(&self, addr: Address, endian: Endian) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        if self.get_bytes(addr, &mut buf)? != 4 {
            return Err(Error::AccessDenied(format!("could not get int at {}", addr)));
        }
        Ok(endian.decode_u32(&buf))
    }

    /// Read a 64-bit value in the program's endianness.
    pub fn get_long(&self, addr: Address) -> Result<u64, Error> {
        self.get_long_endian(addr, self.inner.endian)
    }

    pub fn get_long_endian(&self, addr: Address, endian: Endian) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        if self.get_bytes(addr, &mut buf)? != 8 {
            return Err(Error::AccessDenied(format!("could not get long at {}", addr)));
        }
        Ok(endian.decode_u64(&buf))
    }

    /// Read up to `dst.len()` 16-bit values; a short read decodes only the
    /// whole values read. Returns the number of values decoded.
    pub fn get_shorts(&self, addr: Address, dst: &mut [u16]) -> Result<usize, Error> {
        self.get_shorts_endian(addr, dst, self.inner.endian)
    }

    pub fn get_shorts_endian(
        &self,
        addr: Address,
        dst: &mut [u16],
        endian: Endian,
    ) -> Result<usize, Error> {
        let mut buf = vec![0u8; dst.len() * 2];
        let n = self.get_bytes(addr, &mut buf)?;
        if n < 2 {
            return Err(Error::AccessDenied(format!("could not read shorts at {}", addr)));
        }
        Ok(endian.decode_u16s(&buf[..n], dst))
    }

    /// Read up to `dst.len()` 32-bit values; a short read decodes only the
    /// whole values read. Returns the number of values decoded.
    pub fn get_ints(&self, addr: Address, dst: &mut [u32]) -> Result<usize, Error> {
        self.get_ints_endian(addr, dst, self.inner.endian)
    }

    pub fn get_ints_endian(
        &self,
        addr: Address,
        dst: &mut [u32],
        endian: Endian,
    ) -> Result<usize, Error> {
        let mut buf = vec![0u8; dst.len() * 4];
        let n = self.get_bytes(addr, &mut buf)?;
        if n < 4 {
            return Err(Error::AccessDenied(format!("could not read ints at {}", addr)));
        }
        Ok(endian.decode_u32s(&buf[..n], dst))
    }

    /// Read up to `dst.len()` 64-bit values; a short read decodes only the
    /// whole values read. Returns the number of values decoded.
    pub fn get_longs(&self, addr: Address, dst: &mut [u64]) -> Result<usize, Error> {
        self.get_longs_endian(addr, dst, self.inner.endian)
    }

    pub fn get_longs_endian(
        &self,
        addr: Address,
        dst: &mut [u64],
        endian: Endian,
    ) -> Result<usize, Error> {
        let mut buf = vec![0u8; dst.len() * 8];
        let n = self.get_bytes(addr, &mut buf)?;
        if n < 8 {
            return Err(Error::AccessDenied(format!("could not read longs at {}", addr)));
        }
        Ok(endian.decode_u64s(&buf[..n], dst))
    }

    /// Write one byte.
    pub fn set_byte(&self, addr: Address, value: u8) -> Result<(), Error> {
        if let Some(live) = self.inner.live_memory() {
            live.put_byte(addr, value)?;
            self.inner.fire_bytes_changed(addr, 1);
            return Ok(());
        }
        let _guard = self.inner.lock_write();
        let block = self.inner.lookup(addr).ok_or_else(|| {
            Error::AccessDenied(format!("address {} does not exist in memory", addr))
        })?;
        block.put_byte(addr, value)
    }

    /// Write `src` starting at `addr`, spanning adjacent blocks. The whole
    /// span is verified to be covered before any byte is mutated.
    pub fn set_bytes(&self, addr: Address, src: &[u8]) -> Result<(), Error> {
        if let Some(live) = self.inner.live_memory() {
            let count = live.put_bytes(addr, src)?;
            self.inner.fire_bytes_changed(addr, count as u64);
            return Ok(());
        }
        let _guard = self.inner.lock_write();

        // first pass: the entire write must be covered before any byte
        // changes
        let mut walk = addr;
        let mut remaining = src.len() as u64;
        while remaining > 0 {
            let block = self.inner.lookup(walk).ok_or_else(|| {
                Error::AccessDenied(format!("address {} does not exist in memory", walk))
            })?;
            let available = block.end().subtract(walk) + 1;
            if remaining <= available {
                break;
            }
            remaining -= available;
            walk = block.end().add_no_wrap(1).map_err(|_| {
                Error::AccessDenied("attempted to write beyond the address space".to_string())
            })?;
        }

        // second pass: the actual writes
        let mut walk = addr;
        let mut offset = 0;
        while offset < src.len() {
            let block = self.inner.lookup(walk).ok_or_else(|| {
                Error::AccessDenied(format!("address {} does not exist in memory", walk))
            })?;
            let count = block.put_bytes(walk, &src[offset..])?;
            offset += count;
            if offset >= src.len() {
                break;
            }
            walk = block.end().add_no_wrap(1)?;
        }
        Ok(())
    }

    /// Write a 16-bit value in the program's endianness.
    pub fn set_short(&self, addr: Address, value: u16) -> Result<(), Error> {
        self.set_short_endian(addr, value, self.inner.endian)
    }

    pub fn set_short_endian(
        &self,
        addr: Address,
        value: u16,
        endian: Endian,
    ) -> Result<(), Error> {
        let mut buf = [0u8; 2];
        endian.encode_u16(value, &mut buf);
        self.set_bytes(addr, &buf)
    }

    /// Write a 32-bit value in the program's endianness.
    pub fn set_int(&self, addr: Address, value: u32) -> Result<(), Error> {
        self.set_int_endian(addr, value, self.inner.endian)
    }

    pub fn set_int_endian(&self, addr: Address, value: u32, endian: Endian) -> Result<(), Error> {
        let mut buf = [0u8; 4];
        endian.encode_u32(value, &mut buf);
        self.set_bytes(addr, &buf)
    }

    /// Write a 64-bit value in the program's endianness.
    pub fn set_long(&self, addr: Address, value: u64) -> Result<(), Error> {
        self.set_long_endian(addr, value, self.inner.endian)
    }

    pub fn set_long_endian(&self, addr: Address, value: u64, endian: Endian) -> Result<(), Error> {
        let mut buf = [0u8; 8];
        endian.encode_u64(value, &mut buf);
        self.set_bytes(addr, &buf)
    }
}

impl fmt::Display for MemoryMap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.inner.state_read();
        if state.blocks.is_empty() {
            return write!(f, "[empty]");
        }
        for (i, block) in state.blocks.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "[{}, {}]", block.start(), block.end())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::MemoryMap;
    use crate::address::AddressFactory;
    use crate::store::RecordStore;
    use crate::types::Endian;

    fn test_map() -> (MemoryMap, Arc<AddressFactory>) {
        let factory = Arc::new(AddressFactory::new("ram"));
        let base = factory.default_space().address(0);
        let map = MemoryMap::new(Arc::new(RecordStore::new()), Arc::clone(&factory), Endian::Big, base)
            .unwrap();
        (map, factory)
    }

    #[test]
    fn empty_map_display() {
        let (map, _) = test_map();
        assert_eq!(format!("{}", map), "[empty]");
    }

    #[test]
    fn lookup_uses_sorted_order() {
        let (map, factory) = test_map();
        let ram = factory.default_space();
        map.create_uninitialized_block(".b", ram.address(0x2000), 0x100, false)
            .unwrap();
        map.create_uninitialized_block(".a", ram.address(0x1000), 0x100, false)
            .unwrap();

        let starts: Vec<u64> = map
            .get_blocks()
            .iter()
            .map(|b| b.start().offset())
            .collect();
        assert_eq!(starts, vec![0x1000, 0x2000]);

        assert_eq!(
            map.get_block(ram.address(0x10ff)).map(|b| b.name().to_string()),
            Some(".a".to_string())
        );
        // repeated lookups hit the recency cache
        assert_eq!(
            map.get_block(ram.address(0x1000)).map(|b| b.name().to_string()),
            Some(".a".to_string())
        );
        assert!(map.get_block(ram.address(0x1100)).is_none());
        assert!(map.get_block(ram.address(0xfff)).is_none());
    }

    #[test]
    fn image_base_crossing_is_rejected() {
        let factory = Arc::new(AddressFactory::new("ram"));
        let base = factory.default_space().address(0x1000);
        let map = MemoryMap::new(
            Arc::new(RecordStore::new()),
            Arc::clone(&factory),
            Endian::Big,
            base,
        )
        .unwrap();
        let ram = factory.default_space();
        assert!(map
            .create_uninitialized_block(".x", ram.address(0xf00), 0x200, false)
            .is_err());
        assert!(map
            .create_uninitialized_block(".x", ram.address(0xf00), 0x100, false)
            .is_ok());
    }
}
