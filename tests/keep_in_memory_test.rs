//! Pinning tests for cached objects.
//!
//! Core invariant: an object kept in memory is never evicted, however far
//! the cache is over its limits.

use cachestore::{CachedObject, DataFile, DataRow, KeepGuard, ObjectKind, SpaceId, StoreConfig};
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn create_file(max_rows: usize) -> (Arc<DataFile>, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let config = StoreConfig::default()
        .with_data_file_scale(8)
        .with_file_block_size(4096)
        .with_max_cache_rows(max_rows);
    let file = DataFile::open(dir.path().join("pins"), config).unwrap();
    (Arc::new(file), dir)
}

fn add_row(file: &DataFile, text: &str) -> u64 {
    let row: Arc<dyn CachedObject> = Arc::new(DataRow::new(text.as_bytes().to_vec()));
    file.add(SpaceId::DEFAULT, Arc::clone(&row)).unwrap();
    row.position().unwrap()
}

fn read_text(guard: &KeepGuard) -> String {
    let row = guard.downcast_ref::<DataRow>().unwrap();
    String::from_utf8(row.payload().to_vec()).unwrap()
}

/// Kept objects let the cache overflow; released ones are evicted first.
#[test]
fn test_keep_easy() {
    let (file, _dir) = create_file(2);

    let a = add_row(&file, "row0");
    let b = add_row(&file, "row1");

    {
        let guard_a = file.get_kept(a, ObjectKind::Row).unwrap();
        let guard_b = file.get_kept(b, ObjectKind::Row).unwrap();
        assert_eq!(guard_a.header().keep_count(), 1);
        assert_eq!(guard_b.header().keep_count(), 1);

        // Both slots are kept, so the new row pushes the cache over
        let c = add_row(&file, "row2");
        assert_eq!(file.cache().size(), 3);
        assert!(file.cache().contains(a));
        assert!(file.cache().contains(b));
        assert!(file.cache().contains(c));
    }

    // Guards dropped: the next insert evicts the two oldest rows
    let d = add_row(&file, "row3");
    assert!(!file.cache().contains(a));
    assert!(!file.cache().contains(b));
    assert!(file.cache().contains(d));
    assert!(file.cache().size() <= 2);

    // Evicted rows were written back and reload from disk
    let guard_a = file.get_kept(a, ObjectKind::Row).unwrap();
    assert_eq!(read_text(&guard_a), "row0");
    let guard_b = file.get_kept(b, ObjectKind::Row).unwrap();
    assert_eq!(read_text(&guard_b), "row1");
    assert!(file.stats().rows_read >= 2);
}

/// Keeping the same object twice needs two releases.
#[test]
fn test_nested_keeps() {
    let (file, _dir) = create_file(1);
    let a = add_row(&file, "nested");

    let outer = file.get_kept(a, ObjectKind::Row).unwrap();
    {
        let inner = file.get_kept(a, ObjectKind::Row).unwrap();
        assert_eq!(inner.header().keep_count(), 2);
    }
    assert_eq!(outer.header().keep_count(), 1);

    add_row(&file, "other");
    assert!(file.cache().contains(a));
    drop(outer);

    add_row(&file, "third");
    assert!(!file.cache().contains(a));
}

/// Readers racing to load other objects never push out a kept one.
#[test]
fn test_kept_object_survives_concurrent_loads() {
    const ROUNDS: usize = 20;
    const NUM_READERS: usize = 4;

    let (file, _dir) = create_file(1);

    for round in 0..ROUNDS {
        let winner = add_row(&file, &format!("winner{}", round));
        // Evicts winner to make room
        let loser = add_row(&file, &format!("loser{}", round));
        assert!(!file.cache().contains(winner));

        let winner_guard = file.get_kept(winner, ObjectKind::Row).unwrap();
        let start = Arc::new(Barrier::new(NUM_READERS));

        let readers: Vec<_> = (0..NUM_READERS)
            .map(|_| {
                let file = Arc::clone(&file);
                let start = Arc::clone(&start);
                thread::spawn(move || {
                    start.wait();
                    let row = file.get(winner, ObjectKind::Row, false).unwrap();
                    assert!(row.header().is_kept());

                    file.get(loser, ObjectKind::Row, false).unwrap();
                    assert!(
                        file.cache().contains(winner),
                        "round {}: kept row was evicted",
                        round
                    );
                })
            })
            .collect();

        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(read_text(&winner_guard), format!("winner{}", round));
        drop(winner_guard);
    }
}
