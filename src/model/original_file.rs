use std::any::Any;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{read_serde, write_serde, RemoteObject};
use crate::error::Result;

/// Remote-side record of an uploaded file.
///
/// `size` and `checksum` describe the content and are always recomputed from
/// the local file by the uploader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginalFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
}

impl OriginalFile {
    pub const TYPE_ID: &'static str = "::blitz::model::OriginalFile";

    pub fn new() -> Self {
        Self::default()
    }
}

impl RemoteObject for OriginalFile {
    fn wire_type(&self) -> &'static str {
        Self::TYPE_ID
    }

    fn read_fields(&mut self, fields: &Map<String, Value>) -> Result<()> {
        *self = read_serde(Self::TYPE_ID, fields)?;
        Ok(())
    }

    fn write_fields(&self) -> Map<String, Value> {
        write_serde(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// File format tag, e.g. `text/plain` or `text`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Format {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub value: String,
}

impl Format {
    pub const TYPE_ID: &'static str = "::blitz::model::Format";

    pub fn new(value: impl Into<String>) -> Self {
        Self {
            id: None,
            value: value.into(),
        }
    }
}

impl RemoteObject for Format {
    fn wire_type(&self) -> &'static str {
        Self::TYPE_ID
    }

    fn read_fields(&mut self, fields: &Map<String, Value>) -> Result<()> {
        *self = read_serde(Self::TYPE_ID, fields)?;
        Ok(())
    }

    fn write_fields(&self) -> Map<String, Value> {
        write_serde(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{downcast, to_wire};

    #[test]
    fn test_draft_omits_unset_fields() {
        let file = OriginalFile {
            name: Some("a.txt".into()),
            ..Default::default()
        };
        let wire = to_wire(&file);
        assert_eq!(wire.type_id, OriginalFile::TYPE_ID);
        assert_eq!(wire.fields.len(), 1);
        assert_eq!(wire.string_field("name"), Some("a.txt"));
        assert_eq!(wire.id(), None);
    }

    #[test]
    fn test_read_fields_replaces_state() {
        let saved = OriginalFile {
            id: Some(42),
            name: Some("a.txt".into()),
            path: Some("/tmp/a.txt".into()),
            size: Some(10),
            checksum: Some("abc".into()),
            format: Some(Format::new("text")),
        };
        let wire = to_wire(&saved);

        let mut fresh = OriginalFile {
            name: Some("stale".into()),
            ..Default::default()
        };
        fresh.read_fields(&wire.fields).unwrap();
        assert_eq!(fresh, saved);
    }

    #[test]
    fn test_read_fields_rejects_bad_types() {
        let mut fields = Map::new();
        fields.insert("size".into(), Value::String("ten".into()));
        let err = OriginalFile::new().read_fields(&fields).unwrap_err();
        assert!(err.to_string().contains("OriginalFile"));
    }

    #[test]
    fn test_downcast_wrong_type() {
        let boxed: Box<dyn RemoteObject> = Box::new(Format::new("text"));
        assert!(downcast::<OriginalFile>(boxed).is_err());

        let boxed: Box<dyn RemoteObject> = Box::new(Format::new("text"));
        assert_eq!(downcast::<Format>(boxed).unwrap().value, "text");
    }
}
