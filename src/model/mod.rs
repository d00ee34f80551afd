//! Local representations of remote objects.
//!
//! Objects cross the wire as a [`WireObject`]: a type id plus a JSON field
//! map. Turning one back into a typed value is a two-step affair driven by
//! the communicator: the registered factory constructs an empty instance for
//! the type id, then the instance reads its own fields.

mod original_file;

use std::any::Any;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ClientError, Result};

pub use original_file::{Format, OriginalFile};

/// A marshalled remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireObject {
    pub type_id: String,
    pub fields: Map<String, Value>,
}

impl WireObject {
    pub fn new(type_id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            type_id: type_id.into(),
            fields,
        }
    }

    /// Server-assigned identifier, if the object has been persisted.
    pub fn id(&self) -> Option<i64> {
        self.fields.get("id").and_then(Value::as_i64)
    }

    pub fn string_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// A mutable local object that a factory can build and the wire can fill.
pub trait RemoteObject: Any + Send + Sync + fmt::Debug {
    /// Wire type id, e.g. `::blitz::model::OriginalFile`.
    fn wire_type(&self) -> &'static str;

    /// Replace this object's state with the marshalled fields.
    fn read_fields(&mut self, fields: &Map<String, Value>) -> Result<()>;

    fn write_fields(&self) -> Map<String, Value>;

    fn to_wire(&self) -> WireObject {
        WireObject::new(self.wire_type(), self.write_fields())
    }

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Marshal any concrete object.
pub fn to_wire<T: RemoteObject>(object: &T) -> WireObject {
    object.to_wire()
}

/// Take a concrete type back out of a boxed remote object.
pub fn downcast<T: RemoteObject>(object: Box<dyn RemoteObject>) -> Result<T> {
    let actual = object.wire_type();
    object
        .into_any()
        .downcast::<T>()
        .map(|boxed| *boxed)
        .map_err(|_| ClientError::Protocol(format!("unexpected object type {}", actual)))
}

/// Shared `read_fields` for serde-backed model types.
pub(crate) fn read_serde<T: DeserializeOwned>(type_id: &str, fields: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(fields.clone()))
        .map_err(|e| ClientError::Protocol(format!("cannot unmarshal {}: {}", type_id, e)))
}

/// Shared `write_fields` for serde-backed model types.
pub(crate) fn write_serde<T: Serialize>(value: &T) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    }
}
