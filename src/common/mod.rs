//! Common types and utilities shared across the crate.
//!
//! This module contains fundamental primitives used throughout the codebase:
//! - Configuration and file-format constants
//! - Error types
//! - Identifiers (SpaceId, ObjectKind)

pub mod config;
pub mod error;
mod object_kind;
mod space_id;

pub use config::StoreConfig;
pub use error::{Error, Result};
pub use object_kind::ObjectKind;
pub use space_id::SpaceId;
