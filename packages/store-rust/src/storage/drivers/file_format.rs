//! Record file formats for the file driver.

use restkit_core::{FieldMap, Record, StoreError, StoreResult, Value};
use serde::{Deserialize, Serialize};

/// Serialization format of one record file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    /// Pretty-printed JSON, `.json`.
    #[default]
    Json,
    /// `MessagePack` with named fields, `.msgpack`.
    #[serde(rename = "msgpack")]
    MsgPack,
    /// Line-oriented TOML, `.toml`. Map records only; `null` fields are omitted.
    Toml,
    /// Raw bytes, `.raw`. Strings are stored as UTF-8 and read back as
    /// strings when the content is valid UTF-8.
    Raw,
}

impl FileFormat {
    /// File extension (without the dot).
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            FileFormat::Json => "json",
            FileFormat::MsgPack => "msgpack",
            FileFormat::Toml => "toml",
            FileFormat::Raw => "raw",
        }
    }

    /// Serializes a record to file contents.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SchemaViolation`] when the record's shape cannot
    /// be expressed in this format.
    pub fn encode(self, record: &Record) -> StoreResult<Vec<u8>> {
        match self {
            FileFormat::Json => serde_json::to_vec_pretty(record)
                .map_err(|e| StoreError::SchemaViolation(format!("json encoding: {e}"))),
            FileFormat::MsgPack => rmp_serde::to_vec_named(record)
                .map_err(|e| StoreError::SchemaViolation(format!("msgpack encoding: {e}"))),
            FileFormat::Toml => {
                let Value::Map(map) = record else {
                    return Err(StoreError::SchemaViolation(format!(
                        "toml records must be maps, got {}",
                        record.type_name()
                    )));
                };
                toml::to_string(&strip_nulls(map))
                    .map(String::into_bytes)
                    .map_err(|e| StoreError::SchemaViolation(format!("toml encoding: {e}")))
            }
            FileFormat::Raw => match record {
                Value::Bytes(bytes) => Ok(bytes.clone()),
                Value::String(text) => Ok(text.clone().into_bytes()),
                Value::Null => Ok(Vec::new()),
                Value::Bool(b) => Ok(b.to_string().into_bytes()),
                Value::Int(i) => Ok(i.to_string().into_bytes()),
                Value::Float(f) => Ok(f.to_string().into_bytes()),
                Value::Array(_) | Value::Map(_) => Err(StoreError::SchemaViolation(format!(
                    "raw records must be scalar or bytes, got {}",
                    record.type_name()
                ))),
            },
        }
    }

    /// Parses file contents into a record. `context` names the file in errors.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MediumFailure`] when the contents do not parse.
    pub fn decode(self, bytes: Vec<u8>, context: &str) -> StoreResult<Record> {
        match self {
            FileFormat::Json => serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::medium(format!("parsing {context}"), e)),
            FileFormat::MsgPack => rmp_serde::from_slice(&bytes)
                .map_err(|e| StoreError::medium(format!("parsing {context}"), e)),
            FileFormat::Toml => {
                let text = String::from_utf8(bytes)
                    .map_err(|e| StoreError::medium(format!("reading {context}"), e))?;
                toml::from_str(&text).map_err(|e| StoreError::medium(format!("parsing {context}"), e))
            }
            FileFormat::Raw => Ok(match String::from_utf8(bytes) {
                Ok(text) => Value::String(text),
                Err(e) => Value::Bytes(e.into_bytes()),
            }),
        }
    }
}

/// Drops `null` entries from a map, recursively through nested maps.
fn strip_nulls(map: &FieldMap) -> FieldMap {
    map.iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| {
            let value = match value {
                Value::Map(inner) => Value::Map(strip_nulls(inner)),
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dog() -> Value {
        [
            ("name", Value::from("Rex")),
            ("age", Value::Int(3)),
            ("weight", Value::Float(12.5)),
            ("tags", Value::Array(vec![Value::from("good")])),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn json_and_msgpack_round_trip_structured_records() {
        for format in [FileFormat::Json, FileFormat::MsgPack] {
            let bytes = format.encode(&dog()).unwrap();
            assert_eq!(format.decode(bytes, "dog").unwrap(), dog(), "{format:?}");
        }
    }

    #[test]
    fn toml_is_line_oriented_and_round_trips_maps() {
        let bytes = FileFormat::Toml.encode(&dog()).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("name = \"Rex\"\n"));
        assert_eq!(FileFormat::Toml.decode(bytes, "dog").unwrap(), dog());
    }

    #[test]
    fn toml_omits_null_fields() {
        let record: Value = [("name", Value::from("Rex")), ("owner", Value::Null)]
            .into_iter()
            .collect();
        let bytes = FileFormat::Toml.encode(&record).unwrap();
        let decoded = FileFormat::Toml.decode(bytes, "dog").unwrap();
        assert_eq!(decoded.get("owner"), None);
        assert_eq!(decoded.get("name"), Some(&Value::from("Rex")));
    }

    #[test]
    fn toml_rejects_scalars() {
        assert!(matches!(
            FileFormat::Toml.encode(&Value::from("Rex")),
            Err(StoreError::SchemaViolation(_))
        ));
    }

    #[test]
    fn raw_keeps_bytes_and_text() {
        let bytes = FileFormat::Raw.encode(&Value::Bytes(vec![0xff, 0x00])).unwrap();
        assert_eq!(
            FileFormat::Raw.decode(bytes, "blob").unwrap(),
            Value::Bytes(vec![0xff, 0x00])
        );
        let text = FileFormat::Raw.encode(&Value::from("hello")).unwrap();
        assert_eq!(FileFormat::Raw.decode(text, "txt").unwrap(), Value::from("hello"));
        assert!(FileFormat::Raw.encode(&dog()).is_err());
    }

    #[test]
    fn corrupt_contents_are_medium_failures() {
        let err = FileFormat::Json.decode(b"{not json".to_vec(), "x.json").unwrap_err();
        assert_eq!(err.kind(), restkit_core::ErrorKind::MediumFailure);
    }
}
