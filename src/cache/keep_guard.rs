//! RAII pin for cached objects.

use std::ops::Deref;
use std::sync::Arc;

use super::object::CachedObject;

/// Keeps an object pinned in the cache for as long as the guard lives.
///
/// While any guard exists the cache will not evict the object, so every
/// lookup of its position returns this same instance. The pin is released
/// when the guard is dropped.
///
/// # Example
/// ```ignore
/// let node = data_file.get_kept(position, ObjectKind::IntArray)?;
/// node.header().set_changed(true);
/// // guard drops here, object may be evicted again
/// ```
pub struct KeepGuard {
    object: Arc<dyn CachedObject>,
}

impl KeepGuard {
    /// Wrap an object that the caller has already pinned once.
    ///
    /// Called by the data file after a keeping lookup.
    pub(crate) fn adopt(object: Arc<dyn CachedObject>) -> Self {
        Self { object }
    }

    /// Pin `object` and wrap it.
    pub fn new(object: Arc<dyn CachedObject>) -> Self {
        object.header().keep_in_memory(true);
        Self { object }
    }

    /// A shared handle to the object that does not hold the pin.
    pub fn object(&self) -> Arc<dyn CachedObject> {
        Arc::clone(&self.object)
    }

    /// Downcast to a concrete object type.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.object.as_any().downcast_ref::<T>()
    }
}

impl Deref for KeepGuard {
    type Target = dyn CachedObject;

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.object.as_ref()
    }
}

impl Drop for KeepGuard {
    fn drop(&mut self) {
        self.object.header().keep_in_memory(false);
    }
}
