//! Cadence tags: the short strings naming a pulse's emit interval.
//!
//! A tag is `{n}ms` with `n` in `[100, 999]`, or `{n}s` with `n` a
//! positive integer. Tags name the per-cadence keys a producer publishes
//! under, and consumers parse them back into polling intervals.

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CadenceError {
    #[error("unrecognized cadence tag: {0}")]
    BadTag(String),

    #[error("cadence must be at least 100 ms")]
    TooShort,
}

/// Render a duration as its cadence tag. Sub-second durations render in
/// milliseconds, everything else in whole seconds, rounded to nearest.
pub fn format_tag(interval: Duration) -> String {
    if interval < Duration::from_secs(1) {
        format!("{}ms", (interval.as_secs_f64() * 1000.0).round() as u64)
    } else {
        format!("{}s", interval.as_secs_f64().round() as u64)
    }
}

/// Parse a cadence tag back into a duration.
pub fn parse_tag(tag: &str) -> Result<Duration, CadenceError> {
    if let Some(digits) = tag.strip_suffix("ms") {
        let n = parse_digits(digits).ok_or_else(|| CadenceError::BadTag(tag.to_string()))?;
        if n < 100 {
            return Err(CadenceError::TooShort);
        }
        if n > 999 {
            return Err(CadenceError::BadTag(tag.to_string()));
        }
        Ok(Duration::from_millis(n))
    } else if let Some(digits) = tag.strip_suffix('s') {
        let n = parse_digits(digits).ok_or_else(|| CadenceError::BadTag(tag.to_string()))?;
        if n == 0 {
            return Err(CadenceError::BadTag(tag.to_string()));
        }
        Ok(Duration::from_secs(n))
    } else {
        Err(CadenceError::BadTag(tag.to_string()))
    }
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format() {
        assert_eq!(format_tag(Duration::from_millis(100)), "100ms");
        assert_eq!(format_tag(Duration::from_millis(999)), "999ms");
        assert_eq!(format_tag(Duration::from_secs(1)), "1s");
        assert_eq!(format_tag(Duration::from_secs(10)), "10s");
        assert_eq!(format_tag(Duration::from_millis(1500)), "2s");
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse_tag("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_tag("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_tag("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_tag("60s").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_rejections() {
        assert_eq!(parse_tag("99ms").unwrap_err(), CadenceError::TooShort);
        assert!(matches!(parse_tag("1000ms"), Err(CadenceError::BadTag(_))));
        assert!(matches!(parse_tag("0s"), Err(CadenceError::BadTag(_))));
        assert!(matches!(parse_tag("10"), Err(CadenceError::BadTag(_))));
        assert!(matches!(parse_tag("ms"), Err(CadenceError::BadTag(_))));
        assert!(matches!(parse_tag("-1s"), Err(CadenceError::BadTag(_))));
        assert!(matches!(parse_tag("1.5s"), Err(CadenceError::BadTag(_))));
        assert!(matches!(parse_tag(""), Err(CadenceError::BadTag(_))));
    }

    #[test]
    fn test_round_trip() {
        for interval in [
            Duration::from_millis(100),
            Duration::from_millis(500),
            Duration::from_secs(1),
            Duration::from_secs(10),
            Duration::from_secs(90),
        ] {
            assert_eq!(parse_tag(&format_tag(interval)).unwrap(), interval);
        }
        for tag in ["100ms", "999ms", "1s", "5s", "60s"] {
            assert_eq!(format_tag(parse_tag(tag).unwrap()), tag);
        }
    }
}
