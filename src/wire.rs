//! Wire payload grammar.
//!
//! Every payload is a UTF-8 JSON text carrying one event: `added` (a full
//! item snapshot), `removed` (an id stub), `changed` (a property or
//! named-value delta), or `comment` (the checksum framing record that may
//! lead a bundle). Receivers ignore keys they do not recognize; payloads
//! with an unrecognized event name are classified separately from
//! structurally broken ones so callers can choose to skip or reject.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::scalar::Scalar;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error("payload serialization failed: {0}")]
    Serialize(String),

    #[error("invalid instant: {0}")]
    InvalidInstant(String),
}

/// Render an instant the way it appears on the wire and in checksum
/// input: ISO-8601 with millisecond precision and a trailing `Z`.
pub fn format_instant(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an instant from its wire form (any RFC 3339 offset accepted,
/// normalized to UTC).
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>, WireError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| WireError::InvalidInstant(s.to_string()))
}

/// Serde adapter keeping struct timestamps in the wire instant format.
pub mod iso_instant {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format_instant(t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let s = String::deserialize(d)?;
        parse_instant(&s).map_err(serde::de::Error::custom)
    }
}

/// Like [`iso_instant`] but for optional timestamps.
pub mod iso_instant_opt {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => s.serialize_str(&format_instant(t)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        match s {
            Some(s) => parse_instant(&s).map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Serialized form of one named value. An absent value is omitted, not
/// carried as null; the two encode to different checksum tokens, so
/// collapsing them on the wire would leave producer and consumer
/// permanently disagreeing about the item's digest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedValueSnapshot {
    pub name: String,
    #[serde(default, skip_serializing_if = "Scalar::is_absent")]
    pub value: Scalar,
    #[serde(with = "iso_instant")]
    pub timestamp: DateTime<Utc>,
}

/// Serialized form of one item: its id, declared class name, named values
/// ("notions" on the wire) and observed properties. Absent properties are
/// omitted rather than carried as null.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub id: String,
    #[serde(rename = "type")]
    pub class_name: String,
    #[serde(default)]
    pub notions: BTreeMap<String, NamedValueSnapshot>,
    #[serde(default)]
    pub properties: BTreeMap<String, Scalar>,
}

/// An id-only reference to an item, used by `removed` and `changed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: String,
}

/// The delta carried by a `changed` event. A present `new_timestamp`
/// marks a named-value change; without it the delta targets an observed
/// property.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub property: String,
    #[serde(default, skip_serializing_if = "Scalar::is_absent")]
    pub old_value: Scalar,
    #[serde(default, skip_serializing_if = "Scalar::is_absent")]
    pub new_value: Scalar,
    #[serde(
        default,
        with = "iso_instant_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub new_timestamp: Option<DateTime<Utc>>,
}

/// One wire event, tagged by `event_name`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_name", rename_all = "lowercase")]
pub enum WireEvent {
    Added {
        item: ItemSnapshot,
    },
    Removed {
        item: ItemRef,
    },
    Changed {
        item: ItemRef,
        change: ChangeRecord,
    },
    Comment {
        #[serde(rename = "_metadata", default)]
        metadata: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_checksum: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_checksum: Option<String>,
    },
}

impl WireEvent {
    /// Build the framing record that leads a checksum-framed bundle.
    pub fn framing(start_checksum: Option<String>, end_checksum: String) -> Self {
        WireEvent::Comment {
            metadata: true,
            start_checksum,
            end_checksum: Some(end_checksum),
        }
    }

    /// True for a comment record carrying checksum framing.
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            WireEvent::Comment {
                metadata: true,
                end_checksum: Some(_),
                ..
            }
        )
    }

    pub fn to_payload(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(|e| WireError::Serialize(e.to_string()))
    }
}

/// Parse one payload. Structural problems (bad JSON, missing fields,
/// non-scalar values) are `Malformed`; a well-formed payload whose
/// `event_name` is outside the accepted set is `UnknownEvent`.
pub fn parse_event(payload: &str) -> Result<WireEvent, WireError> {
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| WireError::Malformed(e.to_string()))?;
    let name = value
        .get("event_name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| WireError::Malformed("missing event_name".to_string()))?
        .to_string();
    match name.as_str() {
        "added" | "removed" | "changed" | "comment" => {
            serde_json::from_value(value).map_err(|e| WireError::Malformed(e.to_string()))
        }
        _ => Err(WireError::UnknownEvent(name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
    }

    #[test]
    fn test_instant_format_has_millis_and_z() {
        assert_eq!(format_instant(&instant()), "2026-01-02T03:04:05.000Z");
    }

    #[test]
    fn test_instant_round_trip() {
        let t = instant();
        assert_eq!(parse_instant(&format_instant(&t)).unwrap(), t);
    }

    #[test]
    fn test_parse_added() {
        let payload = r#"{"event_name":"added","item":{"id":"dog1","type":"Dog","notions":{},"properties":{"name":"Rex"}}}"#;
        match parse_event(payload).unwrap() {
            WireEvent::Added { item } => {
                assert_eq!(item.id, "dog1");
                assert_eq!(item.class_name, "Dog");
                assert_eq!(item.properties.get("name"), Some(&Scalar::from("Rex")));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_parse_changed_named_value() {
        let payload = r#"{"event_name":"changed","item":{"id":"dog1"},"change":{"property":"mood","new_value":"sleepy","new_timestamp":"2026-01-02T03:04:05.000Z"}}"#;
        match parse_event(payload).unwrap() {
            WireEvent::Changed { item, change } => {
                assert_eq!(item.id, "dog1");
                assert_eq!(change.new_timestamp, Some(instant()));
                assert_eq!(change.old_value, Scalar::Absent);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_name_is_classified() {
        let err = parse_event(r#"{"event_name":"renamed","item":{"id":"x"}}"#).unwrap_err();
        assert!(matches!(err, WireError::UnknownEvent(name) if name == "renamed"));
    }

    #[test]
    fn test_bad_json_is_malformed() {
        assert!(matches!(
            parse_event("{not json"),
            Err(WireError::Malformed(_))
        ));
        assert!(matches!(
            parse_event(r#"{"item":{"id":"x"}}"#),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_structured_property_value_is_malformed() {
        let payload = r#"{"event_name":"changed","item":{"id":"x"},"change":{"property":"p","new_value":[1,2]}}"#;
        assert!(matches!(
            parse_event(payload),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn test_unrecognized_keys_are_ignored() {
        let payload = r#"{"event_name":"removed","item":{"id":"dog1","extra":true},"reserved":1}"#;
        match parse_event(payload).unwrap() {
            WireEvent::Removed { item } => assert_eq!(item.id, "dog1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_framing_record_round_trip() {
        let frame = WireEvent::framing(Some("aa".to_string()), "bb".to_string());
        assert!(frame.is_framing());
        let payload = frame.to_payload().unwrap();
        assert!(payload.contains("\"_metadata\":true"));
        assert_eq!(parse_event(&payload).unwrap(), frame);
    }

    #[test]
    fn test_plain_comment_is_not_framing() {
        let event = parse_event(r#"{"event_name":"comment"}"#).unwrap();
        assert!(!event.is_framing());
    }

    #[test]
    fn test_absent_named_value_round_trips_as_absent() {
        let snapshot = NamedValueSnapshot {
            name: "mood".to_string(),
            value: Scalar::Absent,
            timestamp: instant(),
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(!json.contains("value"));

        let restored: NamedValueSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.value, Scalar::Absent);

        // A stored null is a different value and stays one.
        let snapshot = NamedValueSnapshot {
            value: Scalar::Null,
            ..snapshot
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: NamedValueSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.value, Scalar::Null);
    }

    #[test]
    fn test_absent_old_value_is_omitted() {
        let event = WireEvent::Changed {
            item: ItemRef {
                id: "x".to_string(),
            },
            change: ChangeRecord {
                property: "p".to_string(),
                old_value: Scalar::Absent,
                new_value: Scalar::from(1),
                new_timestamp: None,
            },
        };
        let payload = event.to_payload().unwrap();
        assert!(!payload.contains("old_value"));
        assert!(!payload.contains("new_timestamp"));
    }
}
