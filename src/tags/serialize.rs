//! JSON encoding rules for tag values.
//!
//! The contract: native numerics stay JSON numbers, exact decimals cross the
//! boundary as JSON strings preserving digits and scale (trailing zeros
//! included), and non-finite floats become JSON null. A matching parser
//! accepts both numbers and strings for Decimal-typed tags.

use rust_decimal::Decimal;
use serde::ser::{Serialize, Serializer};
use serde_json::Value as JsonValue;
use std::str::FromStr;

use crate::error::{GatewayError, Result};
use crate::tags::structures::{Quality, TagDatatype, TagRecord, TagValue};

impl Serialize for TagValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TagValue::Bool(b) => serializer.serialize_bool(*b),
            TagValue::Int(i) => serializer.serialize_i64(*i),
            TagValue::Real(f) if f.is_finite() => serializer.serialize_f64(*f),
            // NaN and infinities have no JSON number form.
            TagValue::Real(_) => serializer.serialize_none(),
            TagValue::Decimal(d) => serializer.serialize_str(&d.to_string()),
            TagValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

/// Encode a value to a `serde_json::Value` following the same rules as the
/// `Serialize` impl.
pub fn value_to_json(value: &TagValue) -> JsonValue {
    serde_json::to_value(value).unwrap_or(JsonValue::Null)
}

/// Quality as seen by clients: a non-finite Real is reported `Bad` even if
/// the stored quality says otherwise, since its value serializes to null.
pub fn effective_quality(record: &TagRecord) -> Quality {
    match record.value {
        TagValue::Real(f) if !f.is_finite() => Quality::Bad,
        _ => record.quality,
    }
}

/// Parse a JSON value into the shape declared by `datatype`.
///
/// Decimal accepts both a JSON string (textual form preserved exactly) and
/// a JSON number; everything else requires its native JSON kind.
pub fn parse_value(datatype: TagDatatype, raw: &JsonValue) -> Result<TagValue> {
    let mismatch = || {
        GatewayError::TypeMismatch(format!("value {} does not match datatype {:?}", raw, datatype))
    };
    match datatype {
        TagDatatype::Bool => raw.as_bool().map(TagValue::Bool).ok_or_else(mismatch),
        TagDatatype::Int => raw.as_i64().map(TagValue::Int).ok_or_else(mismatch),
        TagDatatype::Real => match raw {
            JsonValue::Number(n) => n.as_f64().map(TagValue::Real).ok_or_else(mismatch),
            // serde_json has no representation for NaN/Inf; null is the
            // inverse of the non-finite encoding.
            JsonValue::Null => Ok(TagValue::Real(f64::NAN)),
            _ => Err(mismatch()),
        },
        TagDatatype::Decimal => match raw {
            JsonValue::String(s) => Decimal::from_str(s)
                .map(TagValue::Decimal)
                .map_err(|e| GatewayError::InvalidArgument(format!("bad decimal {:?}: {}", s, e))),
            JsonValue::Number(n) => Decimal::from_str(&n.to_string())
                .map(TagValue::Decimal)
                .map_err(|e| GatewayError::InvalidArgument(format!("bad decimal {}: {}", n, e))),
            _ => Err(mismatch()),
        },
        TagDatatype::String => match raw {
            JsonValue::String(s) => Ok(TagValue::Text(s.clone())),
            _ => Err(mismatch()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::structures::PlcName;

    #[test]
    fn decimal_serializes_as_string_with_trailing_zeros() {
        let v = TagValue::Decimal(Decimal::from_str("1.2300").unwrap());
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"1.2300\"");
    }

    #[test]
    fn int_and_real_serialize_as_numbers() {
        assert_eq!(serde_json::to_string(&TagValue::Int(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&TagValue::Real(2.5)).unwrap(), "2.5");
    }

    #[test]
    fn non_finite_real_serializes_as_null_and_reads_bad() {
        let v = TagValue::Real(f64::NAN);
        assert_eq!(serde_json::to_string(&v).unwrap(), "null");

        let mut record = TagRecord::new("r", PlcName::Compactlogix, "Main.X", TagDatatype::Real);
        record.value = TagValue::Real(f64::INFINITY);
        record.quality = Quality::Good;
        assert_eq!(effective_quality(&record), Quality::Bad);
    }

    #[test]
    fn parse_decimal_accepts_string_and_number() {
        let from_str = parse_value(TagDatatype::Decimal, &serde_json::json!("1.2300")).unwrap();
        match from_str {
            TagValue::Decimal(d) => assert_eq!(d.to_string(), "1.2300"),
            other => panic!("expected decimal, got {:?}", other),
        }
        let from_num = parse_value(TagDatatype::Decimal, &serde_json::json!(4.25)).unwrap();
        match from_num {
            TagValue::Decimal(d) => assert_eq!(d.to_string(), "4.25"),
            other => panic!("expected decimal, got {:?}", other),
        }
    }

    #[test]
    fn parse_rejects_kind_mismatch() {
        assert!(parse_value(TagDatatype::Int, &serde_json::json!("7")).is_err());
        assert!(parse_value(TagDatatype::Bool, &serde_json::json!(1)).is_err());
        assert!(parse_value(TagDatatype::String, &serde_json::json!(1.0)).is_err());
    }
}
