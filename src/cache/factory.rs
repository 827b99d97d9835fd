//! Object construction by kind.
//!
//! The data file only sees bytes and an [`ObjectKind`]; the factory table
//! turns the two into a typed object. Built-in kinds are registered up
//! front, custom kinds through [`FactoryTable::register`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::common::{Error, ObjectKind, Result};

use super::codec::RowInput;
use super::object::CachedObject;
use super::objects::{BitMapObject, DataRow, IntArrayObject};

/// Creates objects of one kind, either fresh or decoded from the file.
pub trait ObjectFactory: Send + Sync {
    fn kind(&self) -> ObjectKind;

    /// A blank object sized for `size` elements.
    fn new_instance(&self, size: usize) -> Arc<dyn CachedObject>;

    /// Decode an object whose size prefix has already been consumed.
    fn read_from(&self, input: &mut RowInput, storage_size: u32) -> Result<Arc<dyn CachedObject>>;
}

struct RowFactory;

impl ObjectFactory for RowFactory {
    fn kind(&self) -> ObjectKind {
        ObjectKind::Row
    }

    fn new_instance(&self, size: usize) -> Arc<dyn CachedObject> {
        Arc::new(DataRow::new(vec![0; size]))
    }

    fn read_from(&self, input: &mut RowInput, storage_size: u32) -> Result<Arc<dyn CachedObject>> {
        Ok(Arc::new(DataRow::read_from(input, storage_size)?))
    }
}

struct IntArrayFactory;

impl ObjectFactory for IntArrayFactory {
    fn kind(&self) -> ObjectKind {
        ObjectKind::IntArray
    }

    fn new_instance(&self, size: usize) -> Arc<dyn CachedObject> {
        Arc::new(IntArrayObject::new(size))
    }

    fn read_from(&self, input: &mut RowInput, storage_size: u32) -> Result<Arc<dyn CachedObject>> {
        Ok(Arc::new(IntArrayObject::read_from(input, storage_size)?))
    }
}

struct BitMapFactory;

impl ObjectFactory for BitMapFactory {
    fn kind(&self) -> ObjectKind {
        ObjectKind::BitMap
    }

    fn new_instance(&self, size: usize) -> Arc<dyn CachedObject> {
        Arc::new(BitMapObject::new(size))
    }

    fn read_from(&self, input: &mut RowInput, storage_size: u32) -> Result<Arc<dyn CachedObject>> {
        Ok(Arc::new(BitMapObject::read_from(input, storage_size)?))
    }
}

/// Factories keyed by object kind.
#[derive(Clone)]
pub struct FactoryTable {
    factories: HashMap<ObjectKind, Arc<dyn ObjectFactory>>,
}

impl FactoryTable {
    /// Table holding only the built-in kinds.
    pub fn with_builtins() -> Self {
        let mut table = Self {
            factories: HashMap::new(),
        };
        table.register(Arc::new(RowFactory));
        table.register(Arc::new(IntArrayFactory));
        table.register(Arc::new(BitMapFactory));
        table
    }

    /// Add a factory, replacing any previous one for the same kind.
    pub fn register(&mut self, factory: Arc<dyn ObjectFactory>) -> Option<Arc<dyn ObjectFactory>> {
        self.factories.insert(factory.kind(), factory)
    }

    /// # Errors
    /// `Error::UnknownObjectKind` if nothing is registered for `kind`.
    pub fn get(&self, kind: ObjectKind) -> Result<&dyn ObjectFactory> {
        self.factories
            .get(&kind)
            .map(|f| f.as_ref())
            .ok_or(Error::UnknownObjectKind(kind.tag()))
    }

    pub fn contains(&self, kind: ObjectKind) -> bool {
        self.factories.contains_key(&kind)
    }
}

impl Default for FactoryTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}
