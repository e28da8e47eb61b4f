//! Property tests for the map's structural invariants.

use proptest::prelude::*;

use super::test_map;
use crate::address::{Address, AddressSet, AddressSpace};
use crate::map::{match_in_buffer, MemoryMap, PatternMatch};
use crate::types::Endian;

/// Structural invariants which must hold after every successful mutation:
/// blocks sorted and pairwise disjoint, the address set equal to the union
/// of block ranges, and the initialized sets confined to covered memory.
fn check_invariants(map: &MemoryMap) {
    let blocks = map.get_blocks();
    for pair in blocks.windows(2) {
        assert!(pair[0].start() <= pair[1].start(), "blocks are sorted");
        if pair[0].start().space() == pair[1].start().space() {
            assert!(pair[0].end() < pair[1].start(), "blocks are disjoint");
        }
    }

    let mut expected = AddressSet::new();
    for block in &blocks {
        expected.add_range(block.start(), block.end());
    }
    assert!(
        map.address_set().has_same_addresses(&expected),
        "addr_set is the union of block ranges"
    );

    let all = map.all_initialized_address_set();
    let loaded = map.loaded_and_initialized_address_set();
    assert!(map.address_set().contains_set(&all));
    assert!(all.contains_set(&loaded));
    for block in blocks.iter().filter(|b| b.is_initialized()) {
        assert!(all.contains_range(block.start(), block.end()));
        if block.is_loaded() {
            assert!(loaded.contains_range(block.start(), block.end()));
        }
    }
}

fn snapshot(map: &MemoryMap) -> (Vec<(u32, Address, u64, bool)>, AddressSet, AddressSet, AddressSet) {
    (
        map.get_blocks()
            .iter()
            .map(|b| (b.id(), b.start(), b.length(), b.is_initialized()))
            .collect(),
        map.address_set(),
        map.all_initialized_address_set(),
        map.loaded_and_initialized_address_set(),
    )
}

#[derive(Clone, Debug)]
enum Op {
    CreateInitialized { slot: u8, fill: u8 },
    CreateUninitialized { slot: u8 },
    Remove { pick: u8 },
    Split { pick: u8 },
    Join { pick: u8 },
    Move { pick: u8, slot: u8 },
    ConvertInitialized { pick: u8, fill: u8 },
    ConvertUninitialized { pick: u8 },
}

fn slot_address(ram: &AddressSpace, slot: u8) -> Address {
    ram.address(0x1000 + u64::from(slot % 16) * 0x100)
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), any::<u8>())
            .prop_map(|(slot, fill)| Op::CreateInitialized { slot, fill }),
        any::<u8>().prop_map(|slot| Op::CreateUninitialized { slot }),
        any::<u8>().prop_map(|pick| Op::Remove { pick }),
        any::<u8>().prop_map(|pick| Op::Split { pick }),
        any::<u8>().prop_map(|pick| Op::Join { pick }),
        (any::<u8>(), any::<u8>()).prop_map(|(pick, slot)| Op::Move { pick, slot }),
        (any::<u8>(), any::<u8>())
            .prop_map(|(pick, fill)| Op::ConvertInitialized { pick, fill }),
        any::<u8>().prop_map(|pick| Op::ConvertUninitialized { pick }),
    ]
}

/// Apply an operation, ignoring rejections; conflicting or ill-kinded
/// requests are part of the input space.
fn apply(map: &MemoryMap, ram: &AddressSpace, op: &Op) {
    let blocks = map.get_blocks();
    let picked = |pick: u8| {
        if blocks.is_empty() {
            None
        } else {
            Some(&blocks[pick as usize % blocks.len()])
        }
    };
    match op {
        Op::CreateInitialized { slot, fill } => {
            let _ = map.create_initialized_block(
                &format!("b{}", slot),
                slot_address(ram, *slot),
                0x80,
                *fill,
                None,
                false,
            );
        }
        Op::CreateUninitialized { slot } => {
            let _ = map.create_uninitialized_block(
                &format!("u{}", slot),
                slot_address(ram, *slot),
                0x80,
                false,
            );
        }
        Op::Remove { pick } => {
            if let Some(block) = picked(*pick) {
                let _ = map.remove_block(block);
            }
        }
        Op::Split { pick } => {
            if let Some(block) = picked(*pick) {
                if block.length() >= 2 {
                    let at = block.start().add_no_wrap(block.length() / 2).unwrap();
                    let _ = map.split_block(block, at);
                }
            }
        }
        Op::Join { pick } => {
            let adjacent = blocks
                .windows(2)
                .filter(|pair| pair[0].end().is_successor(pair[1].start()))
                .collect::<Vec<_>>();
            if !adjacent.is_empty() {
                let pair = adjacent[*pick as usize % adjacent.len()];
                let _ = map.join_blocks(&pair[0], &pair[1]);
            }
        }
        Op::Move { pick, slot } => {
            if let Some(block) = picked(*pick) {
                let _ = map.move_block(block, slot_address(ram, *slot));
            }
        }
        Op::ConvertInitialized { pick, fill } => {
            if let Some(block) = picked(*pick) {
                let _ = map.convert_to_initialized(block, *fill);
            }
        }
        Op::ConvertUninitialized { pick } => {
            if let Some(block) = picked(*pick) {
                let _ = map.convert_to_uninitialized(block);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn invariants_hold_under_operation_sequences(
        ops in proptest::collection::vec(op_strategy(), 0..12)
    ) {
        let (map, factory) = test_map();
        let ram = factory.default_space();
        check_invariants(&map);
        for op in &ops {
            apply(&map, &ram, op);
            check_invariants(&map);
        }
    }

    #[test]
    fn lookup_agrees_with_coverage(
        ops in proptest::collection::vec(op_strategy(), 0..8),
        probe in 0u64..0x3000,
    ) {
        let (map, factory) = test_map();
        let ram = factory.default_space();
        for op in &ops {
            apply(&map, &ram, op);
        }
        let addr = ram.address(probe);
        match map.get_block(addr) {
            Some(block) => {
                prop_assert!(map.contains(addr));
                prop_assert!(block.contains(addr));
            }
            None => prop_assert!(!map.contains(addr)),
        }
    }

    #[test]
    fn rebuild_is_idempotent(
        ops in proptest::collection::vec(op_strategy(), 0..10)
    ) {
        let (map, factory) = test_map();
        let ram = factory.default_space();
        for op in &ops {
            apply(&map, &ram, op);
        }
        let before = snapshot(&map);
        map.refresh().unwrap();
        map.refresh().unwrap();
        prop_assert_eq!(before, snapshot(&map));
    }

    #[test]
    fn typed_round_trip(value in any::<u64>(), big in any::<bool>(), offset in 0u64..0x38) {
        let endian = if big { Endian::Big } else { Endian::Little };
        let (map, factory) = test_map();
        let ram = factory.default_space();
        map.create_initialized_block(".data", ram.address(0x1000), 0x40, 0, None, false)
            .unwrap();
        let addr = ram.address(0x1000 + offset);

        map.set_long_endian(addr, value, endian).unwrap();
        prop_assert_eq!(map.get_long_endian(addr, endian).unwrap(), value);

        map.set_int_endian(addr, value as u32, endian).unwrap();
        prop_assert_eq!(map.get_int_endian(addr, endian).unwrap(), value as u32);

        map.set_short_endian(addr, value as u16, endian).unwrap();
        prop_assert_eq!(map.get_short_endian(addr, endian).unwrap(), value as u16);
    }

    #[test]
    fn bit_mapped_projection_follows_target_bytes(
        target_len in 1u64..0x20,
        target_skew in 0u64..0x28,
        bits in 8u64..0x40,
    ) {
        let (map, factory) = test_map();
        let ram = factory.default_space();
        let ov = factory.add_memory_space("ov").unwrap();

        map.create_initialized_block(".target", ram.address(0x2000), target_len, 0, None, false)
            .unwrap();
        map.create_bit_mapped_block(
            "bits",
            ov.address(0),
            ram.address(0x2000 + target_skew),
            bits,
        )
        .unwrap();

        let all = map.all_initialized_address_set();
        for bit in 0..bits {
            let target_byte = target_skew + bit / 8;
            let expected = target_byte < target_len;
            prop_assert_eq!(
                all.contains(ov.address(bit)),
                expected,
                "bit {} (target byte offset {})",
                bit,
                target_byte
            );
        }
    }

    #[test]
    fn safe_skip_is_sound_and_minimal(
        pattern in proptest::collection::vec(0u8..4, 1..6),
        data in proptest::collection::vec(0u8..4, 6),
        mask_bits in proptest::collection::vec(0xF0u8..=0xFF, 6),
        use_mask in any::<bool>(),
    ) {
        let data = &data[..pattern.len()];
        let mask = if use_mask {
            Some(&mask_bits[..pattern.len()])
        } else {
            None
        };
        let agrees = |shift: usize| {
            (0..pattern.len() - shift).all(|i| match mask {
                None => pattern[i] == data[i + shift],
                Some(mask) => pattern[i] & mask[i] == data[i + shift] & mask[i],
            })
        };
        match match_in_buffer(&pattern, mask.map(|m| &m[..]), data, true) {
            PatternMatch::Hit => prop_assert!(agrees(0)),
            PatternMatch::Miss => prop_assert!(false, "forward match never misses"),
            PatternMatch::Skip(skip) => {
                let skip = skip as usize;
                prop_assert!(!agrees(0));
                // no shorter shift can produce a match
                for shift in 1..skip {
                    prop_assert!(!agrees(shift));
                }
                // and the skip itself is the first agreeing shift, unless
                // no shift agrees at all
                if skip < pattern.len() {
                    prop_assert!(agrees(skip));
                }
            }
        }
    }
}
