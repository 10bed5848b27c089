use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered field→value mapping used for structured records.
pub type FieldMap = IndexMap<String, Value>;

/// A stored entity: an ordered field mapping or, for degenerate schemas, a bare scalar.
pub type Record = Value;

/// Ordered `id → record` mapping returned by enumeration and search calls.
///
/// Iteration order is the driver's native order (see each driver's docs).
pub type RecordSet = IndexMap<ResourceId, Record>;

/// Generic runtime value type for record fields.
///
/// Supports all JSON-compatible types plus binary data. Maps preserve
/// insertion order so schema-bound drivers can keep records in schema order.
///
/// Serialized untagged: JSON and `MsgPack` see plain values, and `Bytes`
/// travels as a `MsgPack` `bin` payload. Deserialization is self-describing,
/// so a `bin` payload comes back as `Bytes` even when it is valid UTF-8.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent value.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit IEEE 754 float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence of values.
    Array(Vec<Value>),
    /// Ordered map of string keys to values.
    Map(FieldMap),
    /// Binary data (not directly representable in JSON).
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
}

impl Value {
    /// Returns `true` for every variant that is not a sequence, map, or byte blob.
    #[must_use]
    pub fn is_scalar(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Map(_) | Value::Bytes(_))
    }

    /// Returns `true` if this is [`Value::Null`].
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Borrows the field map if this value is a [`Value::Map`].
    #[must_use]
    pub fn as_map(&self) -> Option<&FieldMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Borrows the string if this value is a [`Value::String`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Looks up a field of a map record. Non-map values have no fields.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(field))
    }

    /// Short lowercase name of the variant, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Bytes(_) => "bytes",
        }
    }

    /// Converts into a `serde_json::Value`. Bytes become an array of numbers.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Bytes(bytes) => serde_json::Value::Array(
                bytes.iter().map(|b| serde_json::Value::from(*b)).collect(),
            ),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("any record value")
            }

            fn visit_unit<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
                Value::deserialize(d)
            }

            fn visit_bool<E>(self, b: bool) -> Result<Value, E> {
                Ok(Value::Bool(b))
            }

            fn visit_i64<E>(self, i: i64) -> Result<Value, E> {
                Ok(Value::Int(i))
            }

            #[allow(clippy::cast_precision_loss)]
            fn visit_u64<E>(self, u: u64) -> Result<Value, E> {
                Ok(i64::try_from(u).map_or(Value::Float(u as f64), Value::Int))
            }

            fn visit_f64<E>(self, f: f64) -> Result<Value, E> {
                Ok(Value::Float(f))
            }

            fn visit_str<E>(self, s: &str) -> Result<Value, E> {
                Ok(Value::String(s.to_string()))
            }

            fn visit_string<E>(self, s: String) -> Result<Value, E> {
                Ok(Value::String(s))
            }

            fn visit_bytes<E>(self, b: &[u8]) -> Result<Value, E> {
                Ok(Value::Bytes(b.to_vec()))
            }

            fn visit_byte_buf<E>(self, b: Vec<u8>) -> Result<Value, E> {
                Ok(Value::Bytes(b))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A: de::MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
                let mut fields = FieldMap::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, Value>()? {
                    fields.insert(key, value);
                }
                Ok(Value::Map(fields))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<FieldMap> for Value {
    fn from(map: FieldMap) -> Self {
        Value::Map(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Value::Map(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Identifies one record within one store: a positive integer or an opaque string.
///
/// Integers order before strings, and integers compare numerically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceId {
    /// Numeric identifier.
    Int(u64),
    /// Opaque textual identifier.
    Str(String),
}

impl ResourceId {
    /// Parses a textual id, normalizing canonical positive integers to [`ResourceId::Int`].
    ///
    /// `"12"` becomes `Int(12)`; `"012"`, `"0"`, `"rex"` and `""` stay strings.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let canonical = !s.is_empty()
            && !s.starts_with('0')
            && s.bytes().all(|b| b.is_ascii_digit());
        if canonical {
            if let Ok(n) = s.parse::<u64>() {
                return ResourceId::Int(n);
            }
        }
        ResourceId::Str(s.to_string())
    }

    /// Id for a number: positive values are [`ResourceId::Int`], zero is the
    /// string `"0"`, matching [`ResourceId::parse`].
    #[must_use]
    pub fn from_number(n: u64) -> Self {
        if n == 0 {
            ResourceId::Str("0".to_string())
        } else {
            ResourceId::Int(n)
        }
    }

    /// Returns the numeric value for [`ResourceId::Int`].
    #[must_use]
    pub fn as_int(&self) -> Option<u64> {
        match self {
            ResourceId::Int(n) => Some(*n),
            ResourceId::Str(_) => None,
        }
    }

    /// The id as a record field value (schema-bound drivers store it in the key column).
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            // Ids above i64::MAX are stored as text.
            ResourceId::Int(n) => i64::try_from(*n)
                .map_or_else(|_| Value::String(n.to_string()), Value::Int),
            ResourceId::Str(s) => Value::String(s.clone()),
        }
    }

    /// Reads an id back out of a key-column value. `Null` and composite values yield `None`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(
                u64::try_from(*i).map_or_else(|_| ResourceId::Str(i.to_string()), ResourceId::from_number),
            ),
            Value::String(s) if !s.is_empty() => Some(ResourceId::parse(s)),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Int(n) => write!(f, "{n}"),
            ResourceId::Str(s) => f.write_str(s),
        }
    }
}

impl FromStr for ResourceId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ResourceId::parse(s))
    }
}

impl From<u64> for ResourceId {
    fn from(n: u64) -> Self {
        ResourceId::from_number(n)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId::parse(s)
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        ResourceId::parse(&s)
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ResourceId::Int(n) => serializer.serialize_u64(*n),
            ResourceId::Str(s) => serializer.serialize_str(s),
        }
    }
}

impl<'de> Deserialize<'de> for ResourceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl Visitor<'_> for IdVisitor {
            type Value = ResourceId;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a positive integer or a string id")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<ResourceId, E> {
                Ok(ResourceId::from_number(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<ResourceId, E> {
                u64::try_from(v)
                    .map(ResourceId::from_number)
                    .map_err(|_| E::custom(format!("negative id {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<ResourceId, E> {
                Ok(ResourceId::parse(v))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

/// A paging window over an enumeration: `limit` records starting at `(page - 1) * limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    /// Maximum number of records in the window.
    pub limit: usize,
    /// 1-based page number. Page 0 is treated as page 1.
    pub page: usize,
}

impl Page {
    /// Creates a paging window.
    #[must_use]
    pub fn new(limit: usize, page: usize) -> Self {
        Self { limit, page }
    }

    /// Zero-based index of the first record in the window.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.page.max(1).saturating_sub(1).saturating_mul(self.limit)
    }

    /// Applies the window to an already ordered record set.
    #[must_use]
    pub fn apply(&self, records: RecordSet) -> RecordSet {
        records
            .into_iter()
            .skip(self.offset())
            .take(self.limit)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_id_parse_normalizes_canonical_integers() {
        assert_eq!(ResourceId::parse("12"), ResourceId::Int(12));
        assert_eq!(ResourceId::parse("012"), ResourceId::Str("012".into()));
        assert_eq!(ResourceId::parse("0"), ResourceId::Str("0".into()));
        assert_eq!(ResourceId::parse("rex"), ResourceId::Str("rex".into()));
        assert_eq!(ResourceId::parse("dogs/7"), ResourceId::Str("dogs/7".into()));
    }

    #[test]
    fn resource_id_orders_integers_before_strings() {
        let mut ids = vec![
            ResourceId::from("b"),
            ResourceId::Int(10),
            ResourceId::from("a"),
            ResourceId::Int(2),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                ResourceId::Int(2),
                ResourceId::Int(10),
                ResourceId::from("a"),
                ResourceId::from("b"),
            ]
        );
    }

    #[test]
    fn resource_id_json_shape() {
        assert_eq!(serde_json::to_string(&ResourceId::Int(3)).unwrap(), "3");
        assert_eq!(serde_json::to_string(&ResourceId::from("x")).unwrap(), "\"x\"");
        let id: ResourceId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(id, ResourceId::Int(42));
        assert!(serde_json::from_str::<ResourceId>("-1").is_err());
    }

    #[test]
    fn zero_is_the_same_id_however_it_arrives() {
        let zero = ResourceId::parse("0");
        assert_eq!(zero, ResourceId::Str("0".to_string()));
        assert_eq!(serde_json::from_str::<ResourceId>("0").unwrap(), zero);
        assert_eq!(serde_json::from_str::<ResourceId>("\"0\"").unwrap(), zero);
        assert_eq!(ResourceId::from(0u64), zero);
        assert_eq!(ResourceId::from_value(&Value::Int(0)), Some(zero.clone()));
        assert_eq!(ResourceId::parse(&zero.to_string()), zero);
    }

    #[test]
    fn resource_id_value_conversion() {
        assert_eq!(ResourceId::Int(5).to_value(), Value::Int(5));
        assert_eq!(ResourceId::from_value(&Value::Int(5)), Some(ResourceId::Int(5)));
        assert_eq!(
            ResourceId::from_value(&Value::from("rex")),
            Some(ResourceId::from("rex"))
        );
        assert_eq!(ResourceId::from_value(&Value::Null), None);
    }

    #[test]
    fn value_json_is_untagged_and_ordered() {
        let value: Value = serde_json::from_str(r#"{"b":1,"a":[true,null,"x"],"c":1.5}"#).unwrap();
        let keys: Vec<&String> = value.as_map().unwrap().keys().collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
        assert_eq!(value.get("b"), Some(&Value::Int(1)));
        assert_eq!(value.get("c"), Some(&Value::Float(1.5)));
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"b":1,"a":[true,null,"x"],"c":1.5}"#
        );
    }

    #[test]
    fn value_bytes_survive_msgpack() {
        let value: Value = [("blob", Value::Bytes(vec![0, 159, 146, 150]))]
            .into_iter()
            .collect();
        let encoded = rmp_serde::to_vec_named(&value).unwrap();
        let decoded: Value = rmp_serde::from_slice(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn utf8_bytes_stay_bytes_in_msgpack() {
        let value = Value::Bytes(b"plain text".to_vec());
        let decoded: Value = rmp_serde::from_slice(&rmp_serde::to_vec(&value).unwrap()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn value_from_json_roundtrip() {
        let json = serde_json::json!({"name": "Spike", "age": 3, "tags": ["a"]});
        let value = Value::from(json.clone());
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn page_offsets_are_one_based() {
        assert_eq!(Page::new(10, 1).offset(), 0);
        assert_eq!(Page::new(10, 3).offset(), 20);
        assert_eq!(Page::new(10, 0).offset(), 0);
    }

    #[test]
    fn page_apply_windows_records() {
        let records: RecordSet = (1..=5)
            .map(|i| (ResourceId::Int(i), Value::Int(i64::try_from(i).unwrap())))
            .collect();
        let window = Page::new(2, 2).apply(records);
        let ids: Vec<ResourceId> = window.into_keys().collect();
        assert_eq!(ids, vec![ResourceId::Int(3), ResourceId::Int(4)]);
    }
}
