//! Time-window parsing and tag filtering.
//!
//! Durations use the familiar unit grammar (`300ms`, `1.5h`, `2h45m`) with
//! units `ns`, `us`/`µs`, `ms`, `s`, `m` and `h`, plus a day suffix: `Nd`
//! is read as `Nh` multiplied by 24.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ocisync_registry::Tag;

use crate::error::{ControllerError, Result};

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Parses a time-window string.
///
/// The empty string is rejected; filtering is only ever requested with an
/// explicit window.
///
/// # Errors
///
/// Returns [`ControllerError::InvalidDuration`] naming the input.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use ocisync_controller::parse_duration;
///
/// assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(48 * 3600));
/// assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
/// assert!(parse_duration("").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = |reason: &str| ControllerError::InvalidDuration {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    if let Some(days) = input.strip_suffix('d').filter(|days| !days.is_empty()) {
        let hours = parse_units(&format!("{days}h")).map_err(invalid)?;
        return hours
            .checked_mul(24)
            .filter(|d| d.as_nanos() <= i64::MAX as u128)
            .ok_or_else(|| invalid("duration out of range"));
    }

    parse_units(input).map_err(invalid)
}

fn parse_units(input: &str) -> std::result::Result<Duration, &'static str> {
    let mut rest = input.strip_prefix('+').unwrap_or(input);
    if rest.starts_with('-') {
        return Err("negative durations are not allowed");
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err("empty duration");
    }

    let mut total: u128 = 0;
    while !rest.is_empty() {
        let (whole, after) = split_digits(rest);
        let (fraction, after) = match after.strip_prefix('.') {
            Some(after) => split_digits(after),
            None => ("", after),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err("expected a number");
        }

        let unit_len = after
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(after.len());
        let (unit, tail) = after.split_at(unit_len);
        let scale = unit_nanos(unit)?;

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| "duration out of range")?
        };
        let mut nanos = whole.checked_mul(scale).ok_or("duration out of range")?;

        if !fraction.is_empty() {
            // Digits past 18 cannot change the result at nanosecond scale.
            let digits = &fraction[..fraction.len().min(18)];
            let numerator: u128 = digits.parse().map_err(|_| "invalid fraction")?;
            let denominator = 10u128.pow(u32::try_from(digits.len()).unwrap_or(18));
            nanos = nanos
                .checked_add(numerator * scale / denominator)
                .ok_or("duration out of range")?;
        }

        total = total.checked_add(nanos).ok_or("duration out of range")?;
        if total > i64::MAX as u128 {
            return Err("duration out of range");
        }
        rest = tail;
    }

    let secs = u64::try_from(total / NANOS_PER_SEC).map_err(|_| "duration out of range")?;
    let subsec = u32::try_from(total % NANOS_PER_SEC).map_err(|_| "duration out of range")?;
    Ok(Duration::new(secs, subsec))
}

fn split_digits(s: &str) -> (&str, &str) {
    let len = s.bytes().take_while(u8::is_ascii_digit).count();
    s.split_at(len)
}

fn unit_nanos(unit: &str) -> std::result::Result<u128, &'static str> {
    Ok(match unit {
        "ns" => 1,
        "us" | "µs" | "μs" => 1_000,
        "ms" => 1_000_000,
        "s" => NANOS_PER_SEC,
        "m" => 60 * NANOS_PER_SEC,
        "h" => 3_600 * NANOS_PER_SEC,
        "" => return Err("missing unit"),
        _ => return Err("unknown unit"),
    })
}

/// Keeps the tags whose last-modified time lies in `[now - window, now]`,
/// preserving order.
#[must_use]
pub fn filter_since(tags: Vec<Tag>, window: Duration, now: DateTime<Utc>) -> Vec<Tag> {
    let since = chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    tags.into_iter()
        .filter(|tag| tag.last_modified >= since && tag.last_modified <= now)
        .collect()
}
