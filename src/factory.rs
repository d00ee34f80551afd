//! Object factories used during deserialization.
//!
//! The communicator keeps a table of type id -> [`TypeFactory`]. When a reply
//! carries an object, the communicator asks the factory registered for its
//! type id to build a fresh instance, then the instance reads its fields.
//! [`ObjectFactory`] is the registry-backed implementation the client installs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::communicator::Communicator;
use crate::error::{ClientError, Result};
use crate::model::{Format, OriginalFile, RemoteObject};

/// Builds local instances for the type ids it was registered under.
pub trait TypeFactory: Send + Sync {
    fn create(&self, type_id: &str) -> Result<Box<dyn RemoteObject>>;

    /// Called once when the owning communicator is destroyed.
    fn destroy(&self);
}

/// Zero-argument constructor for one remote type.
pub trait ObjectConstructor: Send + Sync {
    fn construct(&self) -> Box<dyn RemoteObject>;
}

impl<F> ObjectConstructor for F
where
    F: Fn() -> Box<dyn RemoteObject> + Send + Sync,
{
    fn construct(&self) -> Box<dyn RemoteObject> {
        self()
    }
}

/// Constructor map for the model types this crate knows about.
pub fn default_map() -> HashMap<String, Arc<dyn ObjectConstructor>> {
    let mut map: HashMap<String, Arc<dyn ObjectConstructor>> = HashMap::new();
    map.insert(
        OriginalFile::TYPE_ID.to_string(),
        Arc::new(|| Box::new(OriginalFile::new()) as Box<dyn RemoteObject>),
    );
    map.insert(
        Format::TYPE_ID.to_string(),
        Arc::new(|| Box::new(Format::default()) as Box<dyn RemoteObject>),
    );
    map
}

/// Registry of constructors keyed by wire type id.
pub struct ObjectFactory {
    constructors: HashMap<String, Arc<dyn ObjectConstructor>>,
}

impl ObjectFactory {
    pub fn new(constructors: HashMap<String, Arc<dyn ObjectConstructor>>) -> Self {
        Self { constructors }
    }

    /// Add a constructor unless one already exists for `type_id`.
    /// Returns whether it was inserted.
    pub fn register(&mut self, type_id: impl Into<String>, constructor: Arc<dyn ObjectConstructor>) -> bool {
        let type_id = type_id.into();
        if self.constructors.contains_key(&type_id) {
            return false;
        }
        self.constructors.insert(type_id, constructor);
        true
    }

    pub fn type_ids(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Install this factory for every type id the communicator does not
    /// already have a factory for. Repeated calls change nothing.
    pub fn register_all(self: &Arc<Self>, communicator: &Communicator) {
        for type_id in self.constructors.keys() {
            if communicator.find_object_factory(type_id).is_none() {
                let factory: Arc<dyn TypeFactory> = self.clone();
                communicator.add_object_factory(factory, type_id);
            }
        }
    }
}

impl Default for ObjectFactory {
    fn default() -> Self {
        Self::new(default_map())
    }
}

impl TypeFactory for ObjectFactory {
    fn create(&self, type_id: &str) -> Result<Box<dyn RemoteObject>> {
        let constructor = self
            .constructors
            .get(type_id)
            .ok_or_else(|| ClientError::UnknownType(type_id.to_string()))?;
        Ok(constructor.construct())
    }

    fn destroy(&self) {}
}

impl fmt::Debug for ObjectFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.type_ids().collect();
        ids.sort_unstable();
        f.debug_struct("ObjectFactory").field("types", &ids).finish()
    }
}
