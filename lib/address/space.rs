//! Address spaces and the factory which interns them.

use std::sync::Mutex;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::error::Error;

/// A compact identifier for an interned address space.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct SpaceId(u32);

impl SpaceId {
    pub fn new(index: u32) -> SpaceId {
        SpaceId(index)
    }

    pub fn index(self) -> u32 {
        self.0
    }
}

/// Whether a space is a plain memory space or an overlay shadowing a range
/// of another space.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum SpaceKind {
    Memory,
    Overlay {
        base: SpaceId,
        min_offset: u64,
        max_offset: u64,
    },
}

/// A named domain of addresses with its own offset universe.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AddressSpace {
    id: SpaceId,
    name: String,
    kind: SpaceKind,
    max_offset: u64,
}

impl AddressSpace {
    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    pub fn max_offset(&self) -> u64 {
        self.max_offset
    }

    pub fn is_memory_space(&self) -> bool {
        matches!(self.kind, SpaceKind::Memory)
    }

    pub fn is_overlay_space(&self) -> bool {
        matches!(self.kind, SpaceKind::Overlay { .. })
    }

    /// An address at `offset` in this space.
    pub fn address(&self, offset: u64) -> Address {
        Address::new(self.id, offset)
    }

    pub fn max_address(&self) -> Address {
        Address::new(self.id, self.max_offset)
    }
}

/// The registry of a program's address spaces.
///
/// Handles returned from the factory are snapshots; `SpaceId`s remain valid
/// across overlay renames.
pub struct AddressFactory {
    inner: Mutex<FactoryInner>,
}

struct FactoryInner {
    next_index: u32,
    spaces: FxHashMap<SpaceId, AddressSpace>,
    by_name: FxHashMap<String, SpaceId>,
    default_space: SpaceId,
}

impl AddressFactory {
    /// Create a factory with a single memory space, which becomes the
    /// default space.
    pub fn new(default_space_name: &str) -> AddressFactory {
        let id = SpaceId::new(0);
        let space = AddressSpace {
            id,
            name: default_space_name.to_string(),
            kind: SpaceKind::Memory,
            max_offset: u64::MAX,
        };
        let mut spaces = FxHashMap::default();
        spaces.insert(id, space);
        let mut by_name = FxHashMap::default();
        by_name.insert(default_space_name.to_string(), id);
        AddressFactory {
            inner: Mutex::new(FactoryInner {
                next_index: 1,
                spaces,
                by_name,
                default_space: id,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<FactoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn default_space(&self) -> AddressSpace {
        let inner = self.lock();
        inner.spaces[&inner.default_space].clone()
    }

    /// Look a space up by name.
    pub fn get_space(&self, name: &str) -> Option<AddressSpace> {
        let inner = self.lock();
        inner.by_name.get(name).map(|id| inner.spaces[id].clone())
    }

    /// Look a space up by id.
    pub fn space(&self, id: SpaceId) -> Option<AddressSpace> {
        self.lock().spaces.get(&id).cloned()
    }

    /// Register an additional memory space.
    pub fn add_memory_space(&self, name: &str) -> Result<AddressSpace, Error> {
        let mut inner = self.lock();
        if inner.by_name.contains_key(name) {
            return Err(Error::DuplicateName(format!(
                "address space \"{}\" already exists",
                name
            )));
        }
        let id = SpaceId::new(inner.next_index);
        inner.next_index += 1;
        let space = AddressSpace {
            id,
            name: name.to_string(),
            kind: SpaceKind::Memory,
            max_offset: u64::MAX,
        };
        inner.spaces.insert(id, space.clone());
        inner.by_name.insert(name.to_string(), id);
        Ok(space)
    }

    /// Create an overlay space shadowing `[min_offset, max_offset]` of
    /// `base`.
    pub fn create_overlay_space(
        &self,
        name: &str,
        base: SpaceId,
        min_offset: u64,
        max_offset: u64,
    ) -> Result<AddressSpace, Error> {
        let mut inner = self.lock();
        if !inner.spaces.contains_key(&base) {
            return Err(Error::NotFound(format!(
                "base space {} does not exist",
                base.index()
            )));
        }
        if inner.by_name.contains_key(name) {
            return Err(Error::DuplicateName(format!(
                "address space \"{}\" already exists",
                name
            )));
        }
        let id = SpaceId::new(inner.next_index);
        inner.next_index += 1;
        let space = AddressSpace {
            id,
            name: name.to_string(),
            kind: SpaceKind::Overlay {
                base,
                min_offset,
                max_offset,
            },
            max_offset: u64::MAX,
        };
        inner.spaces.insert(id, space.clone());
        inner.by_name.insert(name.to_string(), id);
        Ok(space)
    }

    /// Rename an overlay space.
    pub fn rename_overlay_space(&self, old_name: &str, new_name: &str) -> Result<(), Error> {
        if old_name == new_name {
            return Ok(());
        }
        let mut inner = self.lock();
        let id = match inner.by_name.get(old_name) {
            Some(id) => *id,
            None => {
                return Err(Error::NotFound(format!(
                    "address space \"{}\" does not exist",
                    old_name
                )))
            }
        };
        if !inner.spaces[&id].is_overlay_space() {
            return Err(Error::InvalidKind(format!(
                "\"{}\" is not an overlay space",
                old_name
            )));
        }
        if inner.by_name.contains_key(new_name) {
            return Err(Error::DuplicateName(format!(
                "address space \"{}\" already exists",
                new_name
            )));
        }
        inner.by_name.remove(old_name);
        inner.by_name.insert(new_name.to_string(), id);
        if let Some(space) = inner.spaces.get_mut(&id) {
            space.name = new_name.to_string();
        }
        Ok(())
    }

    /// Remove an overlay space which no longer hosts any blocks.
    pub fn remove_overlay_space(&self, id: SpaceId) -> Result<(), Error> {
        let mut inner = self.lock();
        let space = inner.spaces.get(&id).ok_or_else(|| {
            Error::NotFound(format!("address space {} does not exist", id.index()))
        })?;
        if !space.is_overlay_space() {
            return Err(Error::InvalidKind(format!(
                "\"{}\" is not an overlay space",
                space.name()
            )));
        }
        let name = space.name().to_string();
        inner.spaces.remove(&id);
        inner.by_name.remove(&name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::AddressFactory;

    #[test]
    fn default_space() {
        let factory = AddressFactory::new("ram");
        let ram = factory.default_space();
        assert_eq!(ram.name(), "ram");
        assert!(ram.is_memory_space());
        assert_eq!(factory.get_space("ram").map(|s| s.id()), Some(ram.id()));
    }

    #[test]
    fn overlay_space_lifecycle() {
        let factory = AddressFactory::new("ram");
        let ram = factory.default_space();
        let ov = factory
            .create_overlay_space(".ov", ram.id(), 0x1000, 0x1fff)
            .unwrap();
        assert!(ov.is_overlay_space());
        assert!(factory
            .create_overlay_space(".ov", ram.id(), 0, 0xff)
            .is_err());

        factory.rename_overlay_space(".ov", ".ov2").unwrap();
        assert!(factory.get_space(".ov").is_none());
        assert_eq!(factory.get_space(".ov2").map(|s| s.id()), Some(ov.id()));

        factory.remove_overlay_space(ov.id()).unwrap();
        assert!(factory.space(ov.id()).is_none());
    }

    #[test]
    fn memory_space_cannot_be_removed() {
        let factory = AddressFactory::new("ram");
        let ram = factory.default_space();
        assert!(factory.remove_overlay_space(ram.id()).is_err());
    }
}
