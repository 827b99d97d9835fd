//! Backups of data-file contents between checkpoints.
//!
//! - [`ShadowJournal`] - Copy-on-first-write journal of page pre-images
//! - [`PageBitmap`] - Which pages the journal already holds
//! - [`full_copy`] - Whole-file copy when incremental backup is off

mod bitmap;
pub mod full_copy;
mod journal;

pub use bitmap::PageBitmap;
pub use journal::ShadowJournal;
