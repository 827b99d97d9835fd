//! One bit per fixed-size page of a data file.

use bitvec::prelude::*;

/// Tracks which pages have already been copied into the shadow journal.
///
/// Bits are only cleared individually when a copy fails, or all at once by
/// [`reset`](Self::reset) when a new journal starts.
#[derive(Debug, Clone)]
pub struct PageBitmap {
    bits: BitVec<u64, Lsb0>,
}

impl PageBitmap {
    /// Bitmap covering `max_size` bytes in pages of `page_size` bytes.
    pub fn new(max_size: u64, page_size: u32) -> Self {
        let pages = max_size.div_ceil(page_size as u64) as usize;
        Self {
            bits: bitvec![u64, Lsb0; 0; pages],
        }
    }

    /// Number of pages covered.
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Set the bit for `page` and return whether it was already set.
    ///
    /// Pages past the end are reported as already set so callers skip them.
    pub fn set(&mut self, page: usize) -> bool {
        if page >= self.bits.len() {
            return true;
        }
        self.bits.replace(page, true)
    }

    pub fn unset(&mut self, page: usize) {
        if page < self.bits.len() {
            self.bits.set(page, false);
        }
    }

    pub fn is_set(&self, page: usize) -> bool {
        self.bits.get(page).map(|bit| *bit).unwrap_or(false)
    }

    pub fn count_set(&self) -> usize {
        self.bits.count_ones()
    }

    pub fn reset(&mut self) {
        self.bits.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sized_by_ceiling() {
        assert_eq!(PageBitmap::new(100, 64).len(), 2);
        assert_eq!(PageBitmap::new(128, 64).len(), 2);
        assert_eq!(PageBitmap::new(129, 64).len(), 3);
        assert!(PageBitmap::new(0, 64).is_empty());
    }

    #[test]
    fn test_set_reports_previous_state() {
        let mut bitmap = PageBitmap::new(1024, 64);
        assert!(!bitmap.set(3));
        assert!(bitmap.set(3));
        assert!(bitmap.is_set(3));
        assert!(!bitmap.is_set(4));
        assert_eq!(bitmap.count_set(), 1);
    }

    #[test]
    fn test_unset_and_reset() {
        let mut bitmap = PageBitmap::new(1024, 64);
        bitmap.set(0);
        bitmap.set(15);
        bitmap.unset(0);
        assert!(!bitmap.is_set(0));
        assert_eq!(bitmap.count_set(), 1);

        bitmap.reset();
        assert_eq!(bitmap.count_set(), 0);
        assert_eq!(bitmap.len(), 16);
    }

    #[test]
    fn test_out_of_range_pages() {
        let mut bitmap = PageBitmap::new(64, 64);
        assert!(bitmap.set(5));
        assert!(!bitmap.is_set(5));
        bitmap.unset(5);
    }
}
