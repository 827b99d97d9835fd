//! Allocation properties of a whole data space.
//!
//! Several table spaces share one file through the block directory; no two
//! live objects may ever overlap, whatever the interleaving.

use cachestore::common::config::SpacePolicy;
use cachestore::space::DataSpace;
use cachestore::{SpaceId, StoreConfig};
use proptest::prelude::*;

const SCALE: u64 = 8;

fn config(policy: SpacePolicy) -> StoreConfig {
    StoreConfig::default()
        .with_data_file_scale(SCALE as u32)
        .with_file_block_size(4096)
        .with_free_list_capacity(16)
        .with_space_policy(policy)
}

#[derive(Debug, Clone)]
enum Op {
    Allocate { table: usize, size: u32 },
    Release(prop::sample::Index),
    DropTable(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0usize..3, 1u32..80).prop_map(|(table, units)| Op::Allocate {
            table,
            size: units * SCALE as u32,
        }),
        3 => any::<prop::sample::Index>().prop_map(Op::Release),
        1 => (0usize..3).prop_map(Op::DropTable),
    ]
}

fn assert_disjoint(live: &[(SpaceId, u64, u32)], free_pos: u64) -> Result<(), TestCaseError> {
    let mut ranges: Vec<(u64, u64)> = live
        .iter()
        .map(|&(_, position, size)| (position * SCALE, size as u64))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        prop_assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "{:?} overlaps {:?}",
            pair[0],
            pair[1]
        );
    }
    for &(start, size) in &ranges {
        prop_assert!(start >= 32);
        prop_assert!(start + size <= free_pos);
    }
    Ok(())
}

fn run_ops(policy: SpacePolicy, ops: Vec<Op>) -> Result<(), TestCaseError> {
    let mut space = DataSpace::new(&config(policy), 32, 0).unwrap();
    let mut tables: Vec<SpaceId> = (0..3).map(|_| space.new_space_id()).collect();
    let mut live: Vec<(SpaceId, u64, u32)> = Vec::new();

    for op in ops {
        match op {
            Op::Allocate { table, size } => {
                let id = tables[table];
                let position = space.get_file_position(id, size, false).unwrap();
                live.push((id, position, size));
            }
            Op::Release(index) => {
                if !live.is_empty() {
                    let (id, position, size) = live.swap_remove(index.index(live.len()));
                    space.release(id, position, size);
                }
            }
            Op::DropTable(table) => {
                let id = tables[table];
                space.free_table_space(id);
                live.retain(|&(owner, _, _)| owner != id);
                tables[table] = space.new_space_id();
            }
        }
        assert_disjoint(&live, space.free_pos())?;
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_block_policy_never_overlaps(ops in prop::collection::vec(op_strategy(), 1..150)) {
        run_ops(SpacePolicy::Blocks, ops)?;
    }

    #[test]
    fn prop_append_policy_never_overlaps(ops in prop::collection::vec(op_strategy(), 1..150)) {
        run_ops(SpacePolicy::Append, ops)?;
    }
}

/// Space released by a dropped table is handed to the next table before
/// the file grows.
#[test]
fn test_dropped_table_blocks_are_reused() {
    let mut space = DataSpace::new(&config(SpacePolicy::Blocks), 32, 0).unwrap();
    let first = space.new_space_id();
    for _ in 0..100 {
        space.get_file_position(first, 64, false).unwrap();
    }
    let grown = space.free_pos();
    space.free_table_space(first);

    let second = space.new_space_id();
    for _ in 0..100 {
        space.get_file_position(second, 64, false).unwrap();
    }
    assert_eq!(space.free_pos(), grown);
}

/// Under the append policy released space is only counted, never reused.
#[test]
fn test_append_policy_counts_releases_as_lost() {
    let mut space = DataSpace::new(&config(SpacePolicy::Append), 32, 0).unwrap();
    let a = space.get_file_position(SpaceId::DEFAULT, 64, false).unwrap();
    space.release(SpaceId::DEFAULT, a, 64);
    let b = space.get_file_position(SpaceId::DEFAULT, 64, false).unwrap();

    assert!(b > a);
    assert_eq!(space.lost_size(), 64);
    assert_eq!(space.free_pos(), 32 + 128);
}
