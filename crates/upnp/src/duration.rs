use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};

// UPnP duration grammar (AVTransport spec): optional sign, unpadded hour,
// two-digit minute and second, optional fraction that is either decimal
// digits or a rational n/d with n < d.
static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([+-])?(\d+):(\d{2}):(\d{2})(?:\.(\d+)(?:/(\d+))?)?$").unwrap()
});

/// Parses a UPnP `H+:MM:SS[.F+|.F0/F1]` duration into seconds.
pub fn parse_duration(s: &str) -> Result<f64> {
    let invalid = || Error::InvalidDuration(s.to_owned());
    let caps = DURATION_RE.captures(s).ok_or_else(invalid)?;

    let sign = match caps.get(1).map(|m| m.as_str()) {
        Some("-") => -1.0,
        _ => 1.0,
    };
    let hours: u64 = caps[2].parse().map_err(|_| invalid())?;
    let minutes: u64 = caps[3].parse().map_err(|_| invalid())?;
    let seconds: u64 = caps[4].parse().map_err(|_| invalid())?;
    if minutes > 59 || seconds > 59 {
        return Err(invalid());
    }

    let mut total = (hours * 3600 + minutes * 60 + seconds) as f64;
    match (caps.get(5), caps.get(6)) {
        (Some(num), Some(den)) => {
            let num: f64 = num.as_str().parse().map_err(|_| invalid())?;
            let den: f64 = den.as_str().parse().map_err(|_| invalid())?;
            if num >= den {
                return Err(invalid());
            }
            total += num / den;
        }
        (Some(frac), None) => {
            let frac: f64 = format!("0.{}", frac.as_str())
                .parse()
                .map_err(|_| invalid())?;
            total += frac;
        }
        _ => {}
    }
    Ok(sign * total)
}

/// Renders seconds as `[-]H:MM:SS.mmm` with an unpadded hour field and
/// exactly three decimals, the form AVTransport's `Seek` expects.
pub fn to_duration(seconds: f64) -> String {
    let sign = if seconds < 0.0 { "-" } else { "" };
    let millis = (seconds.abs() * 1000.0).round() as u64;
    let (secs, millis) = (millis / 1000, millis % 1000);
    format!(
        "{}{}:{:02}:{:02}.{:03}",
        sign,
        secs / 3600,
        secs % 3600 / 60,
        secs % 60,
        millis
    )
}

#[cfg(test)]
mod tests {
    use super::{parse_duration, to_duration};

    #[test]
    fn test_parse_whole_fields() {
        assert_eq!(parse_duration("1:00:00").unwrap(), 3600.0);
        assert_eq!(parse_duration("0:10:00").unwrap(), 600.0);
        assert_eq!(parse_duration("0:00:05").unwrap(), 5.0);
        assert_eq!(parse_duration("123:00:01").unwrap(), 442801.0);
    }

    #[test]
    fn test_parse_fractions() {
        assert_eq!(parse_duration("0:00:05.5").unwrap(), 5.5);
        assert_eq!(parse_duration("0:00:05.1/2").unwrap(), 5.5);
    }

    #[test]
    fn test_parse_signs() {
        assert_eq!(parse_duration("+1:01:01").unwrap(), 3661.0);
        assert_eq!(parse_duration("-1:01:01").unwrap(), -3661.0);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for s in [
            "00:00", ":00:00", "0:0:00", "0:00:0", "0:-1:00", "0:60:00", "0:00:-1", "0:00:60",
            "0:00:05.", "0:00:05.5/5", "0:00:05.5/", "x:00:00", "",
        ] {
            assert!(parse_duration(s).is_err(), "expected {s:?} to be rejected");
        }
    }

    #[test]
    fn test_to_duration() {
        assert_eq!(to_duration(5.0), "0:00:05.000");
        assert_eq!(to_duration(5.5), "0:00:05.500");
        assert_eq!(to_duration(65.0), "0:01:05.000");
        assert_eq!(to_duration(3600.0), "1:00:00.000");
        assert_eq!(to_duration(-3661.0), "-1:01:01.000");
    }

    #[test]
    fn test_round_trip_is_idempotent() {
        for s in ["1:00:00", "0:00:05.1/2", "-1:01:01", "26:03:04.5"] {
            let rendered = to_duration(parse_duration(s).unwrap());
            assert_eq!(
                to_duration(parse_duration(&rendered).unwrap()),
                rendered
            );
        }
    }
}
