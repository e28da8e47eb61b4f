//! Addresses, address spaces, and efficient range-set algebra.
//!
//! An [`Address`] is an offset inside a typed address space. Memory spaces
//! host user-created blocks; overlay spaces shadow a range of a memory
//! space and only host overlay blocks. The [`AddressFactory`] interns the
//! spaces of a program and creates overlay spaces on demand.
//!
//! [`AddressSet`] keeps a sorted vector of disjoint [`AddressRange`]s and
//! provides the set algebra the memory map derives its coverage sets with.

mod range;
mod set;
mod space;

pub use self::range::AddressRange;
pub use self::set::{AddressIter, AddressSet};
pub use self::space::{AddressFactory, AddressSpace, SpaceId, SpaceKind};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// An offset within an address space.
///
/// Addresses are totally ordered with the space as the major key, so a set
/// of addresses drawn from several spaces still sorts into one sequence.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct Address {
    space: SpaceId,
    offset: u64,
}

impl Address {
    pub fn new(space: SpaceId, offset: u64) -> Address {
        Address { space, offset }
    }

    pub fn space(self) -> SpaceId {
        self.space
    }

    pub fn offset(self) -> u64 {
        self.offset
    }

    /// Add `count` to this address, failing with `Error::Overflow` if the
    /// result does not fit in the space's offset universe.
    pub fn add_no_wrap(self, count: u64) -> Result<Address, Error> {
        let offset = self.offset.checked_add(count).ok_or_else(|| {
            Error::Overflow(format!("{} + {:#x} exceeds its address space", self, count))
        })?;
        Ok(Address::new(self.space, offset))
    }

    /// The difference in addresses between `self` and an earlier address
    /// `other` in the same space.
    pub fn subtract(self, other: Address) -> u64 {
        debug_assert_eq!(self.space, other.space);
        debug_assert!(self.offset >= other.offset);
        self.offset - other.offset
    }

    /// The next address in this space, if one exists.
    pub fn next(self) -> Option<Address> {
        self.offset.checked_add(1).map(|offset| Address::new(self.space, offset))
    }

    /// The previous address in this space, if one exists.
    pub fn previous(self) -> Option<Address> {
        self.offset.checked_sub(1).map(|offset| Address::new(self.space, offset))
    }

    /// True if `other` immediately follows this address in the same space.
    pub fn is_successor(self, other: Address) -> bool {
        self.space == other.space && self.offset.checked_add(1) == Some(other.offset)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{:#x}", self.space.index(), self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::{Address, SpaceId};

    #[test]
    fn ordering_is_space_major() {
        let a = Address::new(SpaceId::new(0), u64::MAX);
        let b = Address::new(SpaceId::new(1), 0);
        assert!(a < b);
    }

    #[test]
    fn successor() {
        let a = Address::new(SpaceId::new(0), 0xfff);
        assert!(a.is_successor(Address::new(SpaceId::new(0), 0x1000)));
        assert!(!a.is_successor(Address::new(SpaceId::new(1), 0x1000)));
        assert!(!Address::new(SpaceId::new(0), u64::MAX)
            .is_successor(Address::new(SpaceId::new(0), 0)));
    }

    #[test]
    fn add_no_wrap_overflow() {
        let a = Address::new(SpaceId::new(0), u64::MAX - 1);
        assert!(a.add_no_wrap(1).is_ok());
        assert!(a.add_no_wrap(2).is_err());
    }
}
