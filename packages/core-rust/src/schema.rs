//! Record coercion strategies.
//!
//! Schema-less stores keep whatever shape they are given ([`PassThrough`]).
//! Schema-bound stores force every record into a fixed, ordered field list
//! ([`Schema`]).

use crate::error::{StoreError, StoreResult};
use crate::types::{FieldMap, Record, ResourceId, Value};

/// Converts loosely shaped input into the shape a store persists.
pub trait RecordCoercion: Send + Sync {
    /// Coerces `input` into the stored shape.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SchemaViolation`] when the input cannot be
    /// reconciled with the stored shape.
    fn coerce(&self, input: Record) -> StoreResult<Record>;
}

/// Keeps records exactly as given.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl RecordCoercion for PassThrough {
    fn coerce(&self, input: Record) -> StoreResult<Record> {
        Ok(input)
    }
}

/// Ordered field list with a designated primary-key field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<String>,
    primary_key: String,
}

impl Schema {
    /// Creates a schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] if the field list is
    /// empty, contains duplicates, or does not include `primary_key`.
    pub fn new(fields: Vec<String>, primary_key: impl Into<String>) -> StoreResult<Self> {
        let primary_key = primary_key.into();
        if fields.is_empty() {
            return Err(StoreError::InvalidConfiguration(
                "schema has no fields".to_string(),
            ));
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].contains(field) {
                return Err(StoreError::InvalidConfiguration(format!(
                    "duplicate schema field `{field}`"
                )));
            }
        }
        if !fields.contains(&primary_key) {
            return Err(StoreError::InvalidConfiguration(format!(
                "primary key `{primary_key}` is not a schema field"
            )));
        }
        Ok(Self {
            fields,
            primary_key,
        })
    }

    /// Field names in schema order.
    #[must_use]
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Name of the primary-key field.
    #[must_use]
    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    /// Whether `field` belongs to the schema.
    #[must_use]
    pub fn contains(&self, field: &str) -> bool {
        self.fields.iter().any(|f| f == field)
    }

    /// Forces `input` into exactly the schema's fields, in schema order.
    ///
    /// - map input: each field takes the same-named key, extras are dropped;
    /// - sequence input: fields take positional values in order;
    /// - a single scalar: assigned to the first non-primary-key field;
    /// - `Null`: every field is `Null`.
    ///
    /// Missing values are `Null`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SchemaViolation`] for a scalar input when the
    /// schema has no field besides the primary key.
    pub fn force_to_schema(&self, input: Record) -> StoreResult<FieldMap> {
        let mut out: FieldMap = self
            .fields
            .iter()
            .map(|f| (f.clone(), Value::Null))
            .collect();

        match input {
            Value::Null => {}
            Value::Map(mut map) => {
                for (field, slot) in &mut out {
                    if let Some(value) = map.shift_remove(field) {
                        *slot = value;
                    }
                }
            }
            Value::Array(items) => {
                for (slot, value) in out.values_mut().zip(items) {
                    *slot = value;
                }
            }
            scalar => {
                let target = self
                    .fields
                    .iter()
                    .find(|f| **f != self.primary_key)
                    .ok_or_else(|| {
                        StoreError::SchemaViolation(format!(
                            "cannot place a {} value: schema has only the key field `{}`",
                            scalar.type_name(),
                            self.primary_key
                        ))
                    })?;
                out.insert(target.clone(), scalar);
            }
        }
        Ok(out)
    }

    /// Coerces `input` and stamps `id` into the primary-key field.
    ///
    /// # Errors
    ///
    /// Propagates [`Schema::force_to_schema`] failures.
    pub fn shape_row(&self, input: Record, id: &ResourceId) -> StoreResult<FieldMap> {
        let mut row = self.force_to_schema(input)?;
        row.insert(self.primary_key.clone(), id.to_value());
        Ok(row)
    }
}

impl RecordCoercion for Schema {
    fn coerce(&self, input: Record) -> StoreResult<Record> {
        self.force_to_schema(input).map(Value::Map)
    }
}

/// Merges `partial` into `existing` for update calls.
///
/// When both are maps the partial's fields overwrite or extend the
/// existing ones, keeping existing field order. Any other combination
/// replaces the record with `partial`.
#[must_use]
pub fn merge(existing: Record, partial: Record) -> Record {
    match (existing, partial) {
        (Value::Map(mut base), Value::Map(patch)) => {
            for (field, value) in patch {
                base.insert(field, value);
            }
            Value::Map(base)
        }
        (_, partial) => partial,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn dog_schema() -> Schema {
        Schema::new(
            vec!["id".to_string(), "name".to_string(), "age".to_string()],
            "id",
        )
        .unwrap()
    }

    #[test]
    fn scalar_lands_in_first_non_key_field() {
        let row = dog_schema().force_to_schema(Value::from("Rex")).unwrap();
        let expected: FieldMap = [
            ("id".to_string(), Value::Null),
            ("name".to_string(), Value::from("Rex")),
            ("age".to_string(), Value::Null),
        ]
        .into_iter()
        .collect();
        assert_eq!(row, expected);
    }

    #[test]
    fn map_input_keeps_schema_order_and_drops_extras() {
        let input: Value = [
            ("age", Value::Int(4)),
            ("color", Value::from("brown")),
            ("name", Value::from("Spike")),
        ]
        .into_iter()
        .collect();
        let row = dog_schema().force_to_schema(input).unwrap();
        let keys: Vec<&str> = row.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["id", "name", "age"]);
        assert_eq!(row["name"], Value::from("Spike"));
        assert_eq!(row["age"], Value::Int(4));
        assert_eq!(row["id"], Value::Null);
    }

    #[test]
    fn sequence_input_is_positional() {
        let input = Value::Array(vec![Value::Int(7), Value::from("Fido")]);
        let row = dog_schema().force_to_schema(input).unwrap();
        assert_eq!(row["id"], Value::Int(7));
        assert_eq!(row["name"], Value::from("Fido"));
        assert_eq!(row["age"], Value::Null);
    }

    #[test]
    fn long_sequence_is_truncated() {
        let input = Value::Array((0..6).map(Value::Int).collect());
        let row = dog_schema().force_to_schema(input).unwrap();
        assert_eq!(row.len(), 3);
        assert_eq!(row["age"], Value::Int(2));
    }

    #[test]
    fn scalar_into_key_only_schema_is_a_violation() {
        let schema = Schema::new(vec!["id".to_string()], "id").unwrap();
        let err = schema.force_to_schema(Value::Int(1)).unwrap_err();
        assert!(matches!(err, StoreError::SchemaViolation(_)));
    }

    #[test]
    fn schema_requires_primary_key_field() {
        let err = Schema::new(vec!["name".to_string()], "id").unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfiguration(_)));
        let err = Schema::new(vec!["id".to_string(), "id".to_string()], "id").unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfiguration(_)));
    }

    #[test]
    fn shape_row_stamps_id() {
        let row = dog_schema()
            .shape_row(Value::from("Rex"), &ResourceId::Int(3))
            .unwrap();
        assert_eq!(row["id"], Value::Int(3));
    }

    #[test]
    fn pass_through_keeps_shape() {
        let input = Value::Array(vec![Value::Null, Value::from("x")]);
        assert_eq!(PassThrough.coerce(input.clone()).unwrap(), input);
    }

    #[test]
    fn merge_overlays_fields() {
        let existing: Value = [("name", "Spike"), ("breed", "mutt")].into_iter().collect();
        let partial: Value = [("name", "Fido")].into_iter().collect();
        let merged = merge(existing, partial);
        assert_eq!(merged.get("name"), Some(&Value::from("Fido")));
        assert_eq!(merged.get("breed"), Some(&Value::from("mutt")));
    }

    #[test]
    fn merge_replaces_non_maps() {
        assert_eq!(merge(Value::from("a"), Value::Int(1)), Value::Int(1));
    }

    fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[a-z]{0,8}".prop_map(Value::String),
        ]
    }

    fn arb_input() -> impl Strategy<Value = Value> {
        prop_oneof![
            arb_scalar(),
            proptest::collection::vec(arb_scalar(), 0..6).prop_map(Value::Array),
            proptest::collection::vec(("[a-z]{1,5}", arb_scalar()), 0..6)
                .prop_map(|pairs| pairs.into_iter().collect::<Value>()),
        ]
    }

    proptest! {
        #[test]
        fn coerced_rows_have_exactly_schema_fields(input in arb_input()) {
            let schema = dog_schema();
            let row = schema.force_to_schema(input).unwrap();
            let keys: Vec<&String> = row.keys().collect();
            let fields: Vec<&String> = schema.fields().iter().collect();
            prop_assert_eq!(keys, fields);
        }
    }
}
