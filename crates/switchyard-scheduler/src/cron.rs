//! Schedule parsing and next-fire computation.
//!
//! Calendar expressions go through the `cron` crate, which wants a leading
//! seconds field and numbers weekdays 1-7 from Sunday. Classic 5-field
//! expressions are converted: `0` is prepended and numeric weekdays shift by one.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::job::{Schedule, ScheduleKind};

/// Parse an `every` expression: `<n>s|m|h|d`, non-zero.
pub fn parse_interval(expr: &str) -> Option<Duration> {
    let expr = expr.trim();
    let unit = expr.chars().last()?;
    let digits = expr[..expr.len() - unit.len_utf8()].trim_end();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let n: u64 = digits.parse().ok()?;
    let secs = match unit {
        's' => n,
        'm' => n.checked_mul(60)?,
        'h' => n.checked_mul(3_600)?,
        'd' => n.checked_mul(86_400)?,
        _ => return None,
    };
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Parse a calendar expression.
pub fn parse_cron(expr: &str) -> Result<::cron::Schedule, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => {
            let dow = shift_weekdays(fields[4]);
            format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], dow)
        }
        6 | 7 => fields.join(" "),
        n => return Err(format!("expected 5 or 6 fields, got {n}")),
    };
    ::cron::Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

/// Parse a one-shot instant.
pub fn parse_at(expr: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(expr.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp ({e})"))
}

pub fn parse_timezone(name: &str) -> Result<Tz, String> {
    name.parse::<Tz>().map_err(|_| format!("unknown timezone \"{name}\""))
}

/// Check that a schedule parses for its kind. `Err` carries the field and message.
pub fn validate(schedule: &Schedule, now: DateTime<Utc>) -> Result<(), (&'static str, String)> {
    if schedule.expr.trim().is_empty() {
        return Err(("schedule.expr", "required string".into()));
    }
    match schedule.kind {
        ScheduleKind::Cron => {
            parse_cron(&schedule.expr)
                .map_err(|e| ("schedule.expr", format!("invalid cron expression: {e}")))?;
        }
        ScheduleKind::Every => {
            parse_interval(&schedule.expr).ok_or((
                "schedule.expr",
                "invalid interval, expected e.g. 30s, 15m, 2h, 1d".to_string(),
            ))?;
        }
        ScheduleKind::At => {
            let at = parse_at(&schedule.expr).map_err(|e| ("schedule.expr", e))?;
            if at <= now {
                return Err(("schedule.expr", "\"at\" time must be in the future".into()));
            }
        }
    }
    if let Some(tz) = &schedule.timezone {
        parse_timezone(tz).map_err(|e| ("schedule.timezone", e))?;
    }
    Ok(())
}

/// Next fire strictly after `after`. `None` if the schedule never fires again.
///
/// `at` ignores `after` and always returns its instant; firing it once is the
/// engine's job.
pub fn next_fire(schedule: &Schedule, after: DateTime<Utc>, default_tz: &str) -> Option<DateTime<Utc>> {
    match schedule.kind {
        ScheduleKind::Cron => {
            let parsed = parse_cron(&schedule.expr).ok()?;
            let tz_name = schedule.timezone.as_deref().unwrap_or(default_tz);
            let tz = parse_timezone(tz_name).unwrap_or(Tz::UTC);
            parsed
                .after(&after.with_timezone(&tz))
                .next()
                .map(|t| t.with_timezone(&Utc))
        }
        ScheduleKind::Every => {
            let every = parse_interval(&schedule.expr)?;
            let every = chrono::Duration::from_std(every).ok()?;
            after.checked_add_signed(every)
        }
        ScheduleKind::At => parse_at(&schedule.expr).ok(),
    }
}

/// Shift numeric weekdays from 0-7 (Sunday = 0 or 7) to 1-7 (Sunday = 1).
///
/// A range ending at 7 wraps around to Sunday = 1 once shifted, so it is
/// spelled out as a list.
fn shift_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|item| {
            let (base, step) = match item.split_once('/') {
                Some((b, s)) => (b, Some(s)),
                None => (item, None),
            };
            if let Some(days) = expand_sunday_range(base, step) {
                return days;
            }
            let base = base
                .split('-')
                .map(|part| match part.parse::<u8>() {
                    Ok(n) => shift_day(n).map(|d| d.to_string()).unwrap_or_else(|| part.to_string()),
                    Err(_) => part.to_string(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(s) => format!("{base}/{s}"),
                None => base,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn shift_day(day: u8) -> Option<u8> {
    match day {
        0 | 7 => Some(1),
        n if n < 7 => Some(n + 1),
        _ => None,
    }
}

/// `lo-7` (optionally stepped) as an explicit list of shifted days.
fn expand_sunday_range(base: &str, step: Option<&str>) -> Option<String> {
    let (lo, hi) = base.split_once('-')?;
    let (lo, hi) = (lo.parse::<u8>().ok()?, hi.parse::<u8>().ok()?);
    if hi != 7 || lo > 7 {
        return None;
    }
    let step = match step {
        Some(s) => s.parse::<usize>().ok().filter(|s| *s > 0)?,
        None => 1,
    };
    let mut days: Vec<u8> = (lo..=hi).step_by(step).filter_map(shift_day).collect();
    days.sort_unstable();
    days.dedup();
    Some(days.iter().map(u8::to_string).collect::<Vec<_>>().join(","))
}
