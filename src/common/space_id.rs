//! Table-space identifier type.

use std::fmt;

/// Identifies one table space inside a data file.
///
/// Every persistent table owns a table space; its space manager carves the
/// file blocks the directory assigns to that id. Stores hold a `SpaceId`
/// instead of a reference to their space manager.
///
/// # Example
/// ```
/// use cachestore::SpaceId;
///
/// let space = SpaceId::new(7);
/// assert!(space.is_table());
/// assert!(!SpaceId::DEFAULT.is_table());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpaceId(pub u32);

impl SpaceId {
    /// File blocks not owned by any space.
    pub const EMPTY: SpaceId = SpaceId(0);

    /// Space used by the space directory itself.
    pub const DIRECTORY: SpaceId = SpaceId(1);

    /// Shared space for tables without a dedicated one.
    pub const DEFAULT: SpaceId = SpaceId(7);

    /// First id handed out for dedicated table spaces.
    pub const FIRST_TABLE: SpaceId = SpaceId(8);

    /// Create a new SpaceId.
    #[inline]
    pub fn new(id: u32) -> Self {
        SpaceId(id)
    }

    /// Whether this is a dedicated table space rather than a reserved id.
    #[inline]
    pub fn is_table(&self) -> bool {
        *self >= Self::FIRST_TABLE
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::EMPTY => write!(f, "Space(EMPTY)"),
            Self::DIRECTORY => write!(f, "Space(DIRECTORY)"),
            Self::DEFAULT => write!(f, "Space(DEFAULT)"),
            SpaceId(id) => write!(f, "Space({})", id),
        }
    }
}
