//! Tagged text encoding for values that do not fit a scalar column or cell.
//!
//! Arrays and maps are written as `rk:json:<json>`, byte blobs as
//! `rk:b64:<base64>`. Readers detect the prefix and decode; text without a
//! known prefix is returned unchanged.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::types::Value;

const JSON_TAG: &str = "rk:json:";
const BYTES_TAG: &str = "rk:b64:";

/// Encodes a non-scalar value as tagged text. Scalars return `None`.
#[must_use]
pub fn encode_tagged(value: &Value) -> Option<String> {
    match value {
        Value::Array(_) | Value::Map(_) => {
            // serde_json cannot fail on Value: keys are strings, no custom serializers.
            let json = serde_json::to_string(value).ok()?;
            Some(format!("{JSON_TAG}{json}"))
        }
        Value::Bytes(bytes) => Some(format!("{BYTES_TAG}{}", STANDARD.encode(bytes))),
        _ => None,
    }
}

/// Decodes tagged text produced by [`encode_tagged`].
///
/// Returns `None` when `text` carries no tag or the payload is malformed, in
/// which case callers keep the text as a plain string.
#[must_use]
pub fn decode_tagged(text: &str) -> Option<Value> {
    if let Some(json) = text.strip_prefix(JSON_TAG) {
        match serde_json::from_str::<serde_json::Value>(json) {
            Ok(parsed) => return Some(Value::from(parsed)),
            Err(err) => {
                tracing::debug!(error = %err, "tagged json payload did not parse; keeping text");
                return None;
            }
        }
    }
    if let Some(b64) = text.strip_prefix(BYTES_TAG) {
        return STANDARD.decode(b64).ok().map(Value::Bytes);
    }
    None
}

/// Decodes tagged text, falling back to a plain string value.
#[must_use]
pub fn decode_text(text: String) -> Value {
    decode_tagged(&text).unwrap_or(Value::String(text))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn scalars_are_not_tagged() {
        assert_eq!(encode_tagged(&Value::Int(1)), None);
        assert_eq!(encode_tagged(&Value::from("x")), None);
        assert_eq!(encode_tagged(&Value::Null), None);
    }

    #[test]
    fn map_round_trips_through_tag() {
        let value: Value = [("a", Value::Int(1)), ("b", Value::Array(vec![Value::Bool(true)]))]
            .into_iter()
            .collect();
        let text = encode_tagged(&value).unwrap();
        assert!(text.starts_with("rk:json:"));
        assert_eq!(decode_tagged(&text), Some(value));
    }

    #[test]
    fn bytes_round_trip_through_tag() {
        let value = Value::Bytes(vec![0, 1, 2, 255]);
        let text = encode_tagged(&value).unwrap();
        assert_eq!(text, "rk:b64:AAEC/w==");
        assert_eq!(decode_tagged(&text), Some(value));
    }

    #[test]
    fn untagged_or_malformed_text_stays_text() {
        assert_eq!(decode_text("hello".to_string()), Value::from("hello"));
        assert_eq!(decode_text("rk:json:{oops".to_string()), Value::from("rk:json:{oops"));
    }

    proptest! {
        #[test]
        fn plain_text_is_never_mangled(s in "[^r].*") {
            prop_assert_eq!(decode_text(s.clone()), Value::String(s));
        }
    }
}
