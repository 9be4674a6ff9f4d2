//! Duration-string parsing and rendering.
//!
//! Workflow and step timeouts are written as a composition of
//! `<number><unit>` terms where unit is one of `ns`, `us`, `ms`, `s`, `m`,
//! `h` -- e.g. `"30s"`, `"1h30m"`, `"500ms"`, `"1.5h"`. Rendering uses the
//! same units, largest first, so timeout failure messages read naturally
//! ("timed out after 1m30s").

use std::time::Duration;

/// Errors from duration-string parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DurationError {
    #[error("empty duration string")]
    Empty,

    #[error("invalid duration number in '{0}'")]
    InvalidNumber(String),

    #[error("unknown duration unit '{unit}' in '{input}'")]
    UnknownUnit { unit: String, input: String },
}

/// Parse a duration string such as `"30s"`, `"5m"`, `"1h30m"`, `"500ms"`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }

    let bytes = s.as_bytes();
    let mut i = 0;
    let mut total_nanos = 0f64;

    while i < bytes.len() {
        let num_start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        if i == num_start {
            return Err(DurationError::InvalidNumber(s.to_string()));
        }
        let number: f64 = s[num_start..i]
            .parse()
            .map_err(|_| DurationError::InvalidNumber(s.to_string()))?;

        let unit_start = i;
        while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
            i += 1;
        }
        let unit = &s[unit_start..i];
        let unit_nanos = match unit {
            "ns" => 1.0,
            "us" => 1_000.0,
            "ms" => 1_000_000.0,
            "s" => 1_000_000_000.0,
            "m" => 60.0 * 1_000_000_000.0,
            "h" => 3_600.0 * 1_000_000_000.0,
            _ => {
                return Err(DurationError::UnknownUnit {
                    unit: unit.to_string(),
                    input: s.to_string(),
                });
            }
        };

        total_nanos += number * unit_nanos;
    }

    Ok(Duration::from_nanos(total_nanos as u64))
}

/// Render a duration with the same units the parser accepts, largest first.
///
/// `90s` renders as `"1m30s"`, `30s` as `"30s"`, half a second as `"500ms"`.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{nanos}ns");
    }
    if nanos < 1_000_000 {
        return trim_unit(nanos as f64 / 1_000.0, "us");
    }
    if nanos < 1_000_000_000 {
        return trim_unit(nanos as f64 / 1_000_000.0, "ms");
    }

    let total_secs = d.as_secs_f64();
    let hours = (total_secs / 3600.0) as u64;
    let minutes = ((total_secs - hours as f64 * 3600.0) / 60.0) as u64;
    let seconds = total_secs - hours as f64 * 3600.0 - minutes as f64 * 60.0;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if seconds > 0.0 || out.is_empty() {
        out.push_str(&trim_unit(seconds, "s"));
    }
    out
}

/// Format a number with its unit, dropping a trailing `.0` fraction.
fn trim_unit(value: f64, unit: &str) -> String {
    if (value - value.trunc()).abs() < f64::EPSILON {
        format!("{}{}", value as u64, unit)
    } else {
        format!("{value}{unit}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("100ns").unwrap(), Duration::from_nanos(100));
    }

    #[test]
    fn test_parse_composed_terms() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_duration("1m30s500ms").unwrap(),
            Duration::from_millis(90_500)
        );
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(parse_duration("1.5h").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("0.5s").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_duration("").unwrap_err(), DurationError::Empty);
        assert_eq!(parse_duration("   ").unwrap_err(), DurationError::Empty);
        assert!(matches!(
            parse_duration("30"),
            Err(DurationError::UnknownUnit { .. })
        ));
        assert!(matches!(
            parse_duration("s30"),
            Err(DurationError::InvalidNumber(_))
        ));
        assert!(matches!(
            parse_duration("10d"),
            Err(DurationError::UnknownUnit { .. })
        ));
        assert!(matches!(
            parse_duration("1..5s"),
            Err(DurationError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_format_round_numbers() {
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_secs(5400)), "1h30m");
        assert_eq!(format_duration(Duration::from_secs(3601)), "1h1s");
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }

    #[test]
    fn test_format_parse_roundtrip() {
        for input in ["30s", "1m30s", "1h30m", "500ms", "2h"] {
            let parsed = parse_duration(input).unwrap();
            assert_eq!(format_duration(parsed), input);
        }
    }
}
