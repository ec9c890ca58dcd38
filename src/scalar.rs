//! The closed set of values legal for observed properties and named values.
//!
//! A `Scalar` is a string, a finite number, a boolean, null, or "absent"
//! (no value at all, the equivalent of a missing key). Structured values
//! (arrays, objects) are rejected at every entry point: construction from
//! JSON fails, and wire payloads carrying them are treated as malformed.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScalarError {
    #[error("number is not finite")]
    NonFinite,

    #[error("not a scalar value: {0}")]
    NotAScalar(String),
}

/// A property or named-value payload.
///
/// `Absent` is distinct from `Null`: null is a value an application stored
/// deliberately, absent means the slot was never set (or was cleared). On
/// the wire, absent slots are omitted rather than serialized.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Scalar {
    #[default]
    Absent,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Scalar {
    /// Build a number scalar, rejecting NaN and infinities.
    pub fn number(n: f64) -> Result<Self, ScalarError> {
        if n.is_finite() {
            Ok(Scalar::Number(n))
        } else {
            Err(ScalarError::NonFinite)
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Scalar::Absent)
    }

    /// Deterministic text form used as checksum input.
    ///
    /// Strings are JSON-quoted so that `"null"` the string and null the
    /// value can never collide. Numbers with no fractional part print as
    /// integers, matching their JSON rendering.
    pub fn encode(&self) -> String {
        match self {
            Scalar::Absent => "absent".to_string(),
            Scalar::Null => "null".to_string(),
            Scalar::Bool(b) => b.to_string(),
            Scalar::Number(n) => format_number(*n),
            Scalar::String(s) => serde_json::Value::String(s.clone()).to_string(),
        }
    }

    /// Convert to a JSON value. Absent maps to null; callers that care
    /// about the distinction must omit absent slots before reaching here.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Scalar::Absent | Scalar::Null => serde_json::Value::Null,
            Scalar::Bool(b) => serde_json::Value::Bool(*b),
            Scalar::Number(n) => match serde_json::Number::from_f64(*n) {
                Some(num) => serde_json::Value::Number(num),
                None => serde_json::Value::Null,
            },
            Scalar::String(s) => serde_json::Value::String(s.clone()),
        }
    }

    /// Convert from a JSON value, rejecting arrays and objects.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, ScalarError> {
        match value {
            serde_json::Value::Null => Ok(Scalar::Null),
            serde_json::Value::Bool(b) => Ok(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => {
                let n = n.as_f64().ok_or(ScalarError::NonFinite)?;
                Scalar::number(n)
            }
            serde_json::Value::String(s) => Ok(Scalar::String(s.clone())),
            other => Err(ScalarError::NotAScalar(other.to_string())),
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl From<bool> for Scalar {
    fn from(b: bool) -> Self {
        Scalar::Bool(b)
    }
}

impl From<i32> for Scalar {
    fn from(n: i32) -> Self {
        Scalar::Number(n as f64)
    }
}

impl From<i64> for Scalar {
    fn from(n: i64) -> Self {
        Scalar::Number(n as f64)
    }
}

impl From<&str> for Scalar {
    fn from(s: &str) -> Self {
        Scalar::String(s.to_string())
    }
}

impl From<String> for Scalar {
    fn from(s: String) -> Self {
        Scalar::String(s)
    }
}

impl Serialize for Scalar {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Scalar::Absent | Scalar::Null => serializer.serialize_none(),
            Scalar::Bool(b) => serializer.serialize_bool(*b),
            Scalar::Number(n) => serializer.serialize_f64(*n),
            Scalar::String(s) => serializer.serialize_str(s),
        }
    }
}

struct ScalarVisitor;

impl<'de> Visitor<'de> for ScalarVisitor {
    type Value = Scalar;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "a scalar value (string, finite number, boolean, or null)")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Scalar, E> {
        Ok(Scalar::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Scalar, E> {
        Ok(Scalar::Number(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Scalar, E> {
        Ok(Scalar::Number(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Scalar, E> {
        Scalar::number(v).map_err(de::Error::custom)
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Scalar, E> {
        Ok(Scalar::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Scalar, E> {
        Ok(Scalar::String(v))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Scalar, E> {
        Ok(Scalar::Null)
    }

    fn visit_none<E: de::Error>(self) -> Result<Scalar, E> {
        Ok(Scalar::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Scalar, D::Error> {
        d.deserialize_any(ScalarVisitor)
    }
}

impl<'de> Deserialize<'de> for Scalar {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Scalar, D::Error> {
        deserializer.deserialize_any(ScalarVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_distinguishes_null_from_the_string_null() {
        assert_eq!(Scalar::Null.encode(), "null");
        assert_eq!(Scalar::from("null").encode(), "\"null\"");
        assert_eq!(Scalar::Absent.encode(), "absent");
    }

    #[test]
    fn test_encode_numbers() {
        assert_eq!(Scalar::from(42).encode(), "42");
        assert_eq!(Scalar::number(2.5).unwrap().encode(), "2.5");
        assert_eq!(Scalar::from(-7).encode(), "-7");
    }

    #[test]
    fn test_rejects_non_finite_numbers() {
        assert!(Scalar::number(f64::NAN).is_err());
        assert!(Scalar::number(f64::INFINITY).is_err());
    }

    #[test]
    fn test_rejects_structured_json() {
        let arr = serde_json::json!([1, 2, 3]);
        assert!(Scalar::from_json(&arr).is_err());
        let obj = serde_json::json!({"a": 1});
        assert!(Scalar::from_json(&obj).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        for scalar in [
            Scalar::Null,
            Scalar::Bool(true),
            Scalar::from(3),
            Scalar::from("woof"),
        ] {
            let json = serde_json::to_value(&scalar).unwrap();
            let back: Scalar = serde_json::from_value(json).unwrap();
            assert_eq!(scalar, back);
        }
    }
}
