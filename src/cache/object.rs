//! Cached objects - the unit the cache stores and the data file persists.
//!
//! Every persisted object embeds an [`ObjectHeader`] holding the
//! bookkeeping the cache and the data file need:
//! - Where the object lives in the file (if anywhere yet)
//! - How many bytes it occupies there
//! - Whether it changed since it was last written
//! - How many callers keep it pinned in memory

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::common::ObjectKind;

use super::codec::RowOutput;

/// Marker for "no file position assigned".
const NO_POSITION: u64 = u64::MAX;

/// Bookkeeping shared by all cached objects.
///
/// # Thread Safety
/// All fields are atomics so the header can be updated through a shared
/// `Arc` while the object sits in the cache:
/// - `position` / `storage_size`: assigned once under the file lock
/// - `changed`: lock-free dirty tracking
/// - `keep_count`: lock-free pin counting
/// - `in_memory`: whether the cache currently holds this instance
#[derive(Debug)]
pub struct ObjectHeader {
    position: AtomicU64,
    storage_size: AtomicU32,
    changed: AtomicBool,
    keep_count: AtomicU32,
    in_memory: AtomicBool,
}

impl ObjectHeader {
    /// Header for an object not yet placed in the file.
    pub fn new() -> Self {
        Self {
            position: AtomicU64::new(NO_POSITION),
            storage_size: AtomicU32::new(0),
            changed: AtomicBool::new(true),
            keep_count: AtomicU32::new(0),
            in_memory: AtomicBool::new(false),
        }
    }

    /// Header for an object decoded from `position`, occupying `size` bytes.
    pub fn loaded(position: u64, size: u32) -> Self {
        Self {
            position: AtomicU64::new(position),
            storage_size: AtomicU32::new(size),
            changed: AtomicBool::new(false),
            keep_count: AtomicU32::new(0),
            in_memory: AtomicBool::new(false),
        }
    }

    // ========================================================================
    // Placement
    // ========================================================================

    /// File position in scale units, if one has been assigned.
    #[inline]
    pub fn position(&self) -> Option<u64> {
        match self.position.load(Ordering::Acquire) {
            NO_POSITION => None,
            position => Some(position),
        }
    }

    #[inline]
    pub fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    /// Bytes the object occupies on disk, zero until sized.
    #[inline]
    pub fn storage_size(&self) -> u32 {
        self.storage_size.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_storage_size(&self, size: u32) {
        self.storage_size.store(size, Ordering::Release);
    }

    // ========================================================================
    // Dirty tracking
    // ========================================================================

    #[inline]
    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_changed(&self, changed: bool) {
        self.changed.store(changed, Ordering::Release);
    }

    // ========================================================================
    // Keep / pin counting
    // ========================================================================

    /// Pin (`true`) or unpin (`false`) the object.
    ///
    /// Unpinning an object that is not pinned is a no-op.
    pub fn keep_in_memory(&self, keep: bool) {
        if keep {
            self.keep_count.fetch_add(1, Ordering::AcqRel);
            return;
        }
        let _ = self
            .keep_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
    }

    #[inline]
    pub fn keep_count(&self) -> u32 {
        self.keep_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_kept(&self) -> bool {
        self.keep_count() > 0
    }

    // ========================================================================
    // Cache residency
    // ========================================================================

    #[inline]
    pub fn is_in_memory(&self) -> bool {
        self.in_memory.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_in_memory(&self, in_memory: bool) {
        self.in_memory.store(in_memory, Ordering::Release);
    }
}

impl Default for ObjectHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// An object that can live in the cache and be written to the data file.
///
/// Implementations own their payload and an [`ObjectHeader`]. The cache
/// shares them as `Arc<dyn CachedObject>`, so any mutable payload state
/// needs interior mutability.
pub trait CachedObject: Send + Sync + Any {
    fn header(&self) -> &ObjectHeader;

    fn kind(&self) -> ObjectKind;

    /// Serialized size in bytes, before padding and without the size prefix.
    fn real_size(&self) -> u32;

    /// Write the payload. The caller writes the size prefix and padding.
    fn write_to(&self, out: &mut RowOutput);

    fn as_any(&self) -> &dyn Any;

    /// Shorthand for `header().position()`.
    fn position(&self) -> Option<u64> {
        self.header().position()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header_is_unplaced_and_dirty() {
        let header = ObjectHeader::new();
        assert_eq!(header.position(), None);
        assert_eq!(header.storage_size(), 0);
        assert!(header.is_changed());
        assert!(!header.is_in_memory());
    }

    #[test]
    fn test_loaded_header_is_clean() {
        let header = ObjectHeader::loaded(12, 128);
        assert_eq!(header.position(), Some(12));
        assert_eq!(header.storage_size(), 128);
        assert!(!header.is_changed());
    }

    #[test]
    fn test_keep_count() {
        let header = ObjectHeader::new();
        header.keep_in_memory(true);
        header.keep_in_memory(true);
        assert_eq!(header.keep_count(), 2);

        header.keep_in_memory(false);
        header.keep_in_memory(false);
        assert!(!header.is_kept());
    }

    #[test]
    fn test_unkeep_does_not_underflow() {
        let header = ObjectHeader::new();
        header.keep_in_memory(false);
        assert_eq!(header.keep_count(), 0);
    }

    #[test]
    fn test_concurrent_keep() {
        use std::sync::Arc;
        use std::thread;

        let header = Arc::new(ObjectHeader::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let header = Arc::clone(&header);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        header.keep_in_memory(true);
                        header.keep_in_memory(false);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(header.keep_count(), 0);
    }
}
