//! Error types for the storage engine.

use std::path::{Path, PathBuf};

use thiserror::Error as ThisError;

/// Convenient Result type alias.
///
/// Instead of writing `Result<T, Error>` everywhere, we can write `Result<T>`.
/// This is a common Rust pattern (see `std::io::Result`).
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors raised by the storage engine.
///
/// A single error type keeps handling uniform across the channel, the
/// allocator, the cache and the stores built on top of them.
#[derive(Debug, ThisError)]
pub enum Error {
    /// I/O error from a read, write, seek or sync.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An allocation would grow the data file past its configured maximum.
    #[error("data file is full: requested end {requested} exceeds maximum {max}")]
    FileFull { requested: u64, max: u64 },

    /// A structural inconsistency was found in the data file.
    #[error("data file corrupt: {0}")]
    DataFileCorrupt(String),

    /// Memory could not be reserved for a bulk operation.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// A programming or configuration error. Never retried.
    #[error("internal invariant violated: {0}")]
    InvariantViolation(String),

    /// Mutation attempted on a read-only channel or data file.
    #[error("data file is read-only")]
    ReadOnly,

    /// The supplied [`StoreConfig`](crate::common::config::StoreConfig) is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No factory is registered for the object kind tag found on disk.
    #[error("no factory registered for object kind {0}")]
    UnknownObjectKind(u16),

    /// Any of the above, tagged with the data file it happened in.
    #[error("{}: {source}", file.display())]
    DataFile {
        file: PathBuf,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Attach the data file name to this error.
    ///
    /// Errors that already carry a file name are returned unchanged.
    pub fn with_file(self, file: impl AsRef<Path>) -> Self {
        match self {
            Error::DataFile { .. } => self,
            other => Error::DataFile {
                file: file.as_ref().to_path_buf(),
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, with any file tagging removed.
    pub fn root(&self) -> &Error {
        match self {
            Error::DataFile { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error aborts the whole operation batch.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.root(),
            Error::DataFileCorrupt(_) | Error::OutOfMemory(_) | Error::InvariantViolation(_)
        )
    }
}
