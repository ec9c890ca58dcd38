//! Timestamped named values.
//!
//! A named value is a `(name, value, timestamp)` cell held by an item: a
//! way to attach observable, individually-timestamped data to an item
//! without declaring a property for it.

use chrono::{DateTime, Utc};

use crate::scalar::Scalar;
use crate::wire::{parse_instant, NamedValueSnapshot, WireError};

#[derive(Clone, Debug, PartialEq)]
pub struct NamedValue {
    name: String,
    value: Scalar,
    timestamp: DateTime<Utc>,
}

/// The previous state of a cell, returned by [`NamedValue::set`] when the
/// new `(value, timestamp)` pair differs from the old one.
#[derive(Clone, Debug, PartialEq)]
pub struct Replaced {
    pub old_value: Scalar,
    pub old_timestamp: DateTime<Utc>,
}

impl NamedValue {
    pub fn new(name: impl Into<String>, value: Scalar, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            value,
            timestamp,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &Scalar {
        &self.value
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Replace the cell's state. Returns the previous state when either
    /// the value or the timestamp changed, `None` when both are equal
    /// (no notification is due).
    pub fn set(&mut self, value: Scalar, timestamp: DateTime<Utc>) -> Option<Replaced> {
        if self.value == value && self.timestamp == timestamp {
            return None;
        }
        let old_value = std::mem::replace(&mut self.value, value);
        let old_timestamp = std::mem::replace(&mut self.timestamp, timestamp);
        Some(Replaced {
            old_value,
            old_timestamp,
        })
    }

    pub fn snapshot(&self) -> NamedValueSnapshot {
        NamedValueSnapshot {
            name: self.name.clone(),
            value: self.value.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn from_snapshot(snapshot: &NamedValueSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            value: snapshot.value.clone(),
            timestamp: snapshot.timestamp,
        }
    }

    /// Build a cell from a value and a textual timestamp, as found in
    /// loosely-typed input. Fails on unparseable instants.
    pub fn parse(
        name: impl Into<String>,
        value: Scalar,
        timestamp: &str,
    ) -> Result<Self, WireError> {
        Ok(Self::new(name, value, parse_instant(timestamp)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, secs).unwrap()
    }

    #[test]
    fn test_set_reports_replacement() {
        let mut nv = NamedValue::new("mood", Scalar::from("sleepy"), t(0));

        let replaced = nv.set(Scalar::from("hungry"), t(1)).unwrap();
        assert_eq!(replaced.old_value, Scalar::from("sleepy"));
        assert_eq!(replaced.old_timestamp, t(0));
        assert_eq!(nv.value(), &Scalar::from("hungry"));
    }

    #[test]
    fn test_set_with_equal_state_is_silent() {
        let mut nv = NamedValue::new("mood", Scalar::from("sleepy"), t(0));
        assert!(nv.set(Scalar::from("sleepy"), t(0)).is_none());
    }

    #[test]
    fn test_timestamp_change_alone_is_a_replacement() {
        let mut nv = NamedValue::new("mood", Scalar::from("sleepy"), t(0));
        assert!(nv.set(Scalar::from("sleepy"), t(5)).is_some());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let nv = NamedValue::new("mood", Scalar::from("sleepy"), t(3));
        assert_eq!(NamedValue::from_snapshot(&nv.snapshot()), nv);
    }

    #[test]
    fn test_parse_rejects_bad_instants() {
        assert!(NamedValue::parse("mood", Scalar::Null, "not-a-time").is_err());
        assert!(NamedValue::parse("mood", Scalar::Null, "2026-01-01T00:00:00.000Z").is_ok());
    }
}
