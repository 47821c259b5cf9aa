//! # Compact duration strings.
//!
//! Durations cross three boundaries: the settings file
//! (`clean_temp_services_after: "1h15m"`), the service definition file, and
//! the CLI (`--clean-after 30s`). All of them use the same compact form: an
//! unbroken sequence of `<number><unit>` segments, where a unit is one of
//! `ns`, `us`, `ms`, `s`, `m`, `h`. `"0"` alone is accepted as zero.
//!
//! [`format_duration`] produces the same shape, preferring the largest units
//! (`90s` renders as `1m30s`), so values round-trip through config files.

use std::time::Duration;

/// Parses a compact duration string like `1h15m10s` or `500ms`.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut num = String::new();
    let mut chars = s.chars().peekable();
    let mut segments = 0usize;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' {
            num.push(c);
            continue;
        }

        let mut unit = String::new();
        unit.push(c);
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphabetic() {
                unit.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if num.is_empty() {
            return Err(format!("missing number before unit '{unit}' in '{input}'"));
        }
        let value: f64 = num
            .parse()
            .map_err(|_| format!("bad number '{num}' in '{input}'"))?;
        num.clear();

        let unit_secs = match unit.as_str() {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(format!("unknown unit '{unit}' in '{input}'")),
        };
        total += Duration::from_secs_f64(value * unit_secs);
        segments += 1;
    }

    if !num.is_empty() {
        return Err(format!("missing unit after '{num}' in '{input}'"));
    }
    if segments == 0 {
        return Err(format!("no duration segments in '{input}'"));
    }
    Ok(total)
}

/// Renders a duration in the same compact form [`parse_duration`] accepts.
pub fn format_duration(d: Duration) -> String {
    if d.is_zero() {
        return "0s".to_string();
    }

    let total_nanos = d.as_nanos();
    if total_nanos < 1_000_000 {
        // Sub-millisecond values are rare here (escalation intervals at the
        // smallest); keep them exact.
        if total_nanos % 1_000 == 0 {
            return format!("{}us", total_nanos / 1_000);
        }
        return format!("{total_nanos}ns");
    }

    let millis = d.subsec_millis();
    let mut secs = d.as_secs();
    let hours = secs / 3600;
    secs %= 3600;
    let mins = secs / 60;
    secs %= 60;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    if millis > 0 {
        out.push_str(&format!("{millis}ms"));
    }
    if out.is_empty() {
        out.push_str("0s");
    }
    out
}

/// Serde adapter: `Duration` as a compact string.
///
/// Usage: `#[serde(with = "crate::config::duration::serde_compact")]`.
pub mod serde_compact {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    use super::{format_duration, parse_duration};

    pub fn serialize<S: Serializer>(d: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(de)?;
        parse_duration(&s).map_err(de::Error::custom)
    }
}
