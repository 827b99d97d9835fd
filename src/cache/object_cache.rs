//! Object Cache - in-memory table of decoded objects keyed by file position.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          ObjectCache                          │
//! │                                                               │
//! │  ┌──────────────────────────────┐   ┌──────────────────────┐  │
//! │  │ CacheTable (RwLock)          │   │ LruReplacer (Mutex)  │  │
//! │  │  position -> Arc<dyn Object> │   │  stamp -> position   │  │
//! │  │  byte count                  │   │  oldest first        │  │
//! │  └──────────────────────────────┘   └──────────────────────┘  │
//! │                  │                                            │
//! │                  │ dirty victims, grouped in contiguous runs  │
//! │                  ▼                                            │
//! │           ┌─────────────┐                                     │
//! │           │  RowWriter  │ (the data file, under its lock)     │
//! │           └─────────────┘                                     │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Thread Safety
//! - Lookups take the table read lock and may run concurrently.
//! - Insertion, removal and clean-up take the table write lock.
//! - Lock order is table before replacer. Callers that also hold the data
//!   file lock take it before either.
//!
//! # Eviction
//! Before an insert would push the cache over `max_rows` or `max_bytes`,
//! the least recently used unpinned objects are dropped until the cache
//! is at about seven eighths of its limits. Dirty victims are written
//! back first. If that write fails the failure is logged and counted, the
//! dirty objects stay cached, and the next checkpoint retries them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::common::{Error, Result, StoreConfig};

use super::object::CachedObject;
use super::replacer::LruReplacer;
use super::stats::{CacheStats, StatsSnapshot};

/// Destination for write-back.
///
/// `rows` are dirty, sorted by position and physically contiguous in the
/// file, so an implementation can write them with one seek.
pub trait RowWriter {
    fn write_rows(&mut self, rows: &[Arc<dyn CachedObject>]) -> Result<()>;
}

#[derive(Default)]
struct CacheTable {
    objects: HashMap<u64, Arc<dyn CachedObject>>,
    bytes: u64,
}

impl CacheTable {
    fn remove(&mut self, position: u64) -> Option<Arc<dyn CachedObject>> {
        let object = self.objects.remove(&position)?;
        self.bytes -= object.header().storage_size() as u64;
        object.header().set_in_memory(false);
        Some(object)
    }
}

/// The in-memory cache of one data file.
pub struct ObjectCache {
    table: RwLock<CacheTable>,
    replacer: Mutex<LruReplacer>,
    max_rows: usize,
    max_bytes: u64,
    /// Bytes per position unit.
    scale: u64,
    stats: CacheStats,
}

impl ObjectCache {
    /// Create a cache with explicit limits.
    pub fn new(max_rows: usize, max_bytes: u64, scale: u32) -> Self {
        Self {
            table: RwLock::new(CacheTable::default()),
            replacer: Mutex::new(LruReplacer::new()),
            max_rows: max_rows.max(1),
            max_bytes: max_bytes.max(1),
            scale: scale as u64,
            stats: CacheStats::new(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(
            config.max_cache_rows,
            config.max_cache_bytes,
            config.data_file_scale,
        )
    }

    // ========================================================================
    // Public API: Lookup
    // ========================================================================

    /// The cached object at `position`, if any.
    pub fn get(&self, position: u64) -> Option<Arc<dyn CachedObject>> {
        self.get_and_keep(position, false)
    }

    /// Like [`get`](Self::get), pinning the object when `keep` is set.
    ///
    /// The pin is taken under the table lock, so a concurrent clean-up
    /// cannot evict the object between the lookup and the pin.
    pub fn get_and_keep(&self, position: u64, keep: bool) -> Option<Arc<dyn CachedObject>> {
        let table = self.table.read();
        match table.objects.get(&position) {
            Some(object) => {
                if keep {
                    object.header().keep_in_memory(true);
                }
                self.replacer.lock().record_access(position);
                CacheStats::add(&self.stats.hits, 1);
                Some(Arc::clone(object))
            }
            None => {
                CacheStats::add(&self.stats.misses, 1);
                None
            }
        }
    }

    pub fn contains(&self, position: u64) -> bool {
        self.table.read().objects.contains_key(&position)
    }

    /// Number of cached objects.
    pub fn size(&self) -> usize {
        self.table.read().objects.len()
    }

    /// Sum of the storage sizes of cached objects.
    pub fn total_bytes(&self) -> u64 {
        self.table.read().bytes
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Whether the cache is above either limit.
    pub fn is_over_limit(&self) -> bool {
        let table = self.table.read();
        table.objects.len() > self.max_rows || table.bytes > self.max_bytes
    }

    pub fn dirty_count(&self) -> usize {
        self.table
            .read()
            .objects
            .values()
            .filter(|o| o.header().is_changed())
            .count()
    }

    /// Cached positions in ascending order.
    pub fn positions(&self) -> Vec<u64> {
        let mut positions: Vec<u64> = self.table.read().objects.keys().copied().collect();
        positions.sort_unstable();
        positions
    }

    // ========================================================================
    // Public API: Mutation
    // ========================================================================

    /// Insert a placed object, making room first if needed.
    ///
    /// # Errors
    /// `Error::InvariantViolation` if the object has no position.
    pub fn put(&self, object: Arc<dyn CachedObject>, writer: &mut dyn RowWriter) -> Result<()> {
        let position = object.header().position().ok_or_else(|| {
            Error::InvariantViolation("cannot cache an object without a file position".into())
        })?;
        let size = object.header().storage_size() as u64;

        let needs_room = {
            let table = self.table.read();
            !table.objects.contains_key(&position)
                && (table.objects.len() + 1 > self.max_rows || table.bytes + size > self.max_bytes)
        };
        if needs_room {
            self.clean_up_for(writer, size);
        }

        let mut table = self.table.write();
        if let Some(old) = table.objects.insert(position, Arc::clone(&object)) {
            table.bytes -= old.header().storage_size() as u64;
            if !Arc::ptr_eq(&old, &object) {
                old.header().set_in_memory(false);
            }
        }
        table.bytes += size;
        object.header().set_in_memory(true);
        self.replacer.lock().record_access(position);
        Ok(())
    }

    /// Drop the object at `position` from the cache without writing it.
    pub fn release(&self, position: u64) -> Option<Arc<dyn CachedObject>> {
        let mut table = self.table.write();
        let object = table.remove(position)?;
        self.replacer.lock().remove(position);
        Some(object)
    }

    /// Drop everything without writing.
    pub fn clear(&self) {
        let mut table = self.table.write();
        for object in table.objects.values() {
            object.header().set_in_memory(false);
        }
        table.objects.clear();
        table.bytes = 0;
        self.replacer.lock().clear();
    }

    /// Evict down to about seven eighths of the limits. Returns the number
    /// of evicted objects.
    pub fn clean_up(&self, writer: &mut dyn RowWriter) -> usize {
        self.clean_up_for(writer, 0)
    }

    /// Write back every dirty object. Returns the number written.
    ///
    /// # Errors
    /// The first write failure; objects not yet written stay dirty.
    pub fn save_all(&self, writer: &mut dyn RowWriter) -> Result<usize> {
        let table = self.table.read();
        let mut dirty: Vec<Arc<dyn CachedObject>> = table
            .objects
            .values()
            .filter(|o| o.header().is_changed())
            .cloned()
            .collect();
        sort_by_position(&mut dirty);

        let written = self.write_back(&dirty, writer)?;
        debug!(written, "cache saved");
        Ok(written)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ========================================================================
    // Internal: Eviction and write-back
    // ========================================================================

    /// Evict until an object of `incoming` bytes fits within the limits.
    fn clean_up_for(&self, writer: &mut dyn RowWriter, incoming: u64) -> usize {
        let row_target = (self.max_rows - self.max_rows / 8).min(self.max_rows - 1);
        let byte_target =
            (self.max_bytes - self.max_bytes / 8).min(self.max_bytes.saturating_sub(incoming));

        let mut table = self.table.write();
        let mut replacer = self.replacer.lock();

        let mut rows = table.objects.len();
        let mut bytes = table.bytes;
        let mut victims = Vec::new();
        for position in replacer.candidates() {
            if rows <= row_target && bytes <= byte_target {
                break;
            }
            let Some(object) = table.objects.get(&position) else {
                continue;
            };
            if object.header().is_kept() {
                continue;
            }
            rows -= 1;
            bytes -= object.header().storage_size() as u64;
            victims.push(Arc::clone(object));
        }

        let mut dirty: Vec<Arc<dyn CachedObject>> = victims
            .iter()
            .filter(|o| o.header().is_changed())
            .cloned()
            .collect();
        sort_by_position(&mut dirty);

        if let Err(e) = self.write_back(&dirty, writer) {
            error!(error = %e, dirty = dirty.len(), "write-back during cache clean-up failed");
            CacheStats::add(&self.stats.write_failures, 1);
        }

        let mut evicted = 0;
        for victim in victims {
            // Unwritten objects must stay
            if victim.header().is_changed() {
                continue;
            }
            if let Some(position) = victim.header().position() {
                table.remove(position);
                replacer.remove(position);
                evicted += 1;
            }
        }

        CacheStats::add(&self.stats.evictions, evicted as u64);
        debug!(
            evicted,
            rows = table.objects.len(),
            bytes = table.bytes,
            "cache cleaned up"
        );
        evicted
    }

    /// Write sorted dirty objects one contiguous run at a time, clearing
    /// the changed flag of each run that succeeds.
    fn write_back(
        &self,
        dirty: &[Arc<dyn CachedObject>],
        writer: &mut dyn RowWriter,
    ) -> Result<usize> {
        let mut written = 0;
        for run in contiguous_runs(dirty, self.scale) {
            writer.write_rows(run)?;
            for object in run {
                object.header().set_changed(false);
            }
            written += run.len();
            CacheStats::add(&self.stats.rows_written, run.len() as u64);
        }
        Ok(written)
    }
}

fn sort_by_position(objects: &mut [Arc<dyn CachedObject>]) {
    objects.sort_by_key(|o| o.header().position().unwrap_or(u64::MAX));
}

/// Split position-sorted objects where one does not end where the next
/// begins.
fn contiguous_runs(
    objects: &[Arc<dyn CachedObject>],
    scale: u64,
) -> impl Iterator<Item = &[Arc<dyn CachedObject>]> {
    objects.chunk_by(move |a, b| {
        let end = a.header().position().unwrap_or(0) * scale + a.header().storage_size() as u64;
        b.header().position().map(|p| p * scale) == Some(end)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::objects::DataRow;

    /// Records every batch it is given.
    #[derive(Default)]
    struct RecordingWriter {
        batches: Vec<Vec<u64>>,
        fail: bool,
    }

    impl RowWriter for RecordingWriter {
        fn write_rows(&mut self, rows: &[Arc<dyn CachedObject>]) -> Result<()> {
            if self.fail {
                return Err(Error::Io(std::io::Error::other("disk gone")));
            }
            self.batches
                .push(rows.iter().filter_map(|r| r.position()).collect());
            Ok(())
        }
    }

    /// A placed row of `size` bytes at `position` (scale 1).
    fn row(position: u64, size: u32, dirty: bool) -> Arc<dyn CachedObject> {
        let row = DataRow::new(vec![0; 4]);
        row.header().set_position(position);
        row.header().set_storage_size(size);
        row.header().set_changed(dirty);
        Arc::new(row)
    }

    #[test]
    fn test_put_and_get() {
        let cache = ObjectCache::new(10, 1 << 20, 1);
        let mut writer = RecordingWriter::default();
        let object = row(100, 16, false);

        cache.put(Arc::clone(&object), &mut writer).unwrap();
        assert!(object.header().is_in_memory());
        assert_eq!(cache.size(), 1);
        assert_eq!(cache.total_bytes(), 16);

        let found = cache.get(100).unwrap();
        assert!(Arc::ptr_eq(&found, &object));
        assert!(cache.get(200).is_none());

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.hits, 1);
        assert_eq!(snapshot.misses, 1);
    }

    #[test]
    fn test_put_requires_position() {
        let cache = ObjectCache::new(10, 1 << 20, 1);
        let unplaced: Arc<dyn CachedObject> = Arc::new(DataRow::new(Vec::new()));
        let err = cache
            .put(unplaced, &mut RecordingWriter::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvariantViolation(_)));
    }

    #[test]
    fn test_row_limit_evicts_least_recent() {
        let cache = ObjectCache::new(4, 1 << 20, 1);
        let mut writer = RecordingWriter::default();
        for i in 0..4 {
            cache.put(row(i * 16, 16, false), &mut writer).unwrap();
        }
        // Touch 0 so that 16 becomes the oldest
        cache.get(0);

        cache.put(row(64, 16, false), &mut writer).unwrap();
        assert!(cache.size() <= 4);
        assert!(cache.contains(0));
        assert!(!cache.contains(16));
        assert!(cache.contains(64));
        assert!(writer.batches.is_empty());
    }

    #[test]
    fn test_byte_limit() {
        let cache = ObjectCache::new(100, 64, 1);
        let mut writer = RecordingWriter::default();
        for i in 0..4 {
            cache.put(row(i * 16, 16, false), &mut writer).unwrap();
        }
        cache.put(row(64, 32, false), &mut writer).unwrap();
        assert!(cache.total_bytes() <= 64);
        assert!(cache.contains(64));
    }

    #[test]
    fn test_kept_objects_survive_clean_up() {
        let cache = ObjectCache::new(2, 1 << 20, 1);
        let mut writer = RecordingWriter::default();
        cache.put(row(0, 16, false), &mut writer).unwrap();
        cache.put(row(16, 16, false), &mut writer).unwrap();

        let kept = cache.get_and_keep(0, true).unwrap();
        cache.get(16); // 0 is now the oldest candidate
        cache.put(row(32, 16, false), &mut writer).unwrap();

        assert!(cache.contains(0));
        assert!(!cache.contains(16));
        assert!(Arc::ptr_eq(&cache.get(0).unwrap(), &kept));
    }

    #[test]
    fn test_all_kept_exceeds_limit() {
        let cache = ObjectCache::new(1, 1 << 20, 1);
        let mut writer = RecordingWriter::default();
        cache.put(row(0, 16, false), &mut writer).unwrap();
        cache.get_and_keep(0, true).unwrap();

        cache.put(row(16, 16, false), &mut writer).unwrap();
        assert_eq!(cache.size(), 2);
        assert!(cache.is_over_limit());
    }

    #[test]
    fn test_dirty_victims_written_in_runs() {
        let cache = ObjectCache::new(8, 1 << 20, 1);
        let mut writer = RecordingWriter::default();
        // 0..48 contiguous, then a gap before 100
        for position in [32, 0, 16, 100] {
            cache.put(row(position, 16, true), &mut writer).unwrap();
        }

        assert_eq!(cache.save_all(&mut writer).unwrap(), 4);
        assert_eq!(writer.batches, vec![vec![0, 16, 32], vec![100]]);
        assert_eq!(cache.dirty_count(), 0);
        assert_eq!(cache.snapshot().rows_written, 4);
    }

    #[test]
    fn test_clean_up_writes_dirty_before_evicting() {
        let cache = ObjectCache::new(2, 1 << 20, 1);
        let mut writer = RecordingWriter::default();
        let first = row(0, 16, true);
        cache.put(Arc::clone(&first), &mut writer).unwrap();
        cache.put(row(16, 16, false), &mut writer).unwrap();
        cache.put(row(32, 16, false), &mut writer).unwrap();

        assert_eq!(writer.batches, vec![vec![0]]);
        assert!(!first.header().is_changed());
        assert!(!first.header().is_in_memory());
    }

    #[test]
    fn test_failed_write_back_keeps_dirty_objects() {
        let cache = ObjectCache::new(2, 1 << 20, 1);
        let mut writer = RecordingWriter {
            fail: true,
            ..Default::default()
        };
        cache.put(row(0, 16, true), &mut writer).unwrap();
        cache.put(row(16, 16, true), &mut writer).unwrap();

        cache.put(row(32, 16, false), &mut writer).unwrap();
        assert!(cache.contains(0));
        assert!(cache.contains(16));
        assert_eq!(cache.dirty_count(), 2);
        assert_eq!(cache.snapshot().write_failures, 1);

        // Retried on the next save
        writer.fail = false;
        assert_eq!(cache.save_all(&mut writer).unwrap(), 2);
    }

    #[test]
    fn test_release_and_clear() {
        let cache = ObjectCache::new(10, 1 << 20, 1);
        let mut writer = RecordingWriter::default();
        let object = row(8, 8, true);
        cache.put(Arc::clone(&object), &mut writer).unwrap();
        cache.put(row(16, 8, false), &mut writer).unwrap();

        let released = cache.release(8).unwrap();
        assert!(Arc::ptr_eq(&released, &object));
        assert!(!object.header().is_in_memory());
        assert_eq!(cache.total_bytes(), 8);
        assert!(cache.release(8).is_none());

        cache.clear();
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_scaled_runs() {
        // With scale 8, position 2 starts at byte 16
        let cache = ObjectCache::new(10, 1 << 20, 8);
        let mut writer = RecordingWriter::default();
        cache.put(row(0, 16, true), &mut writer).unwrap();
        cache.put(row(2, 16, true), &mut writer).unwrap();

        cache.save_all(&mut writer).unwrap();
        assert_eq!(writer.batches, vec![vec![0, 2]]);
    }

    #[test]
    fn test_concurrent_lookups() {
        use std::thread;

        let cache = Arc::new(ObjectCache::new(100, 1 << 20, 1));
        let mut writer = RecordingWriter::default();
        for i in 0..50 {
            cache.put(row(i * 8, 8, false), &mut writer).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..50 {
                        let object = cache.get_and_keep(i * 8, true).unwrap();
                        object.header().keep_in_memory(false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.snapshot().hits, 200);
        assert!(cache.positions().iter().all(|&p| !cache.get(p).unwrap().header().is_kept()));
    }
}
