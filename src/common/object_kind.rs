//! Object kind tag.

use std::fmt;

/// The type of a cached object, used to pick its factory.
///
/// Built-in kinds cover the object types shipped with the crate. Clients
/// such as index implementations register their own node types under
/// `Custom` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Opaque row payload.
    Row,
    /// Fixed-length array of 32-bit ints.
    IntArray,
    /// Fixed-length bit map.
    BitMap,
    /// Client-defined object type.
    Custom(u16),
}

impl ObjectKind {
    /// Numeric tag for diagnostics and error reporting.
    pub fn tag(&self) -> u16 {
        match self {
            ObjectKind::Row => 1,
            ObjectKind::IntArray => 2,
            ObjectKind::BitMap => 3,
            ObjectKind::Custom(tag) => *tag,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Row => write!(f, "Row"),
            ObjectKind::IntArray => write!(f, "IntArray"),
            ObjectKind::BitMap => write!(f, "BitMap"),
            ObjectKind::Custom(tag) => write!(f, "Custom({})", tag),
        }
    }
}
