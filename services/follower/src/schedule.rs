//! When followers wake up to check for updates.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

/// Default resync interval.
pub const DEFAULT_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("invalid duration `{0}`")]
    InvalidDuration(String),

    #[error("`every` and `cron` cannot be used together")]
    Conflict,
}

/// Check schedule: a fixed interval or a cron expression.
#[derive(Debug, Clone)]
pub enum Schedule {
    Every(Duration),
    Cron {
        expr: String,
        schedule: Box<cron::Schedule>,
    },
}

impl Schedule {
    pub fn every(interval: Duration) -> Result<Self, ScheduleError> {
        if interval.is_zero() {
            return Err(ScheduleError::InvalidDuration("0s".to_string()));
        }
        Ok(Self::Every(interval))
    }

    /// Parse a standard 5-field cron expression (minute hour dom month dow,
    /// Sunday = 0 or 7). Expressions with a leading seconds field and
    /// `@hourly`-style shorthands are passed to the `cron` crate as-is.
    pub fn cron(expr: &str) -> Result<Self, ScheduleError> {
        let expr = expr.trim();
        let invalid = |reason: String| ScheduleError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = if let [minute, hour, dom, month, dow] = fields.as_slice() {
            let dow = translate_day_of_week(dow).map_err(invalid)?;
            format!("0 {minute} {hour} {dom} {month} {dow}")
        } else {
            expr.to_string()
        };
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
        Ok(Self::Cron {
            expr: expr.to_string(),
            schedule: Box::new(schedule),
        })
    }

    /// Pick the schedule from mutually exclusive options, defaulting to
    /// [`DEFAULT_EVERY`].
    pub fn from_options(every: Option<Duration>, cron: Option<&str>) -> Result<Self, ScheduleError> {
        match (every, cron.filter(|c| !c.trim().is_empty())) {
            (Some(_), Some(_)) => Err(ScheduleError::Conflict),
            (None, Some(expr)) => Self::cron(expr),
            (Some(every), None) => Self::every(every),
            (None, None) => Self::every(DEFAULT_EVERY),
        }
    }

    /// Next trigger strictly after `now`, if there is one.
    pub fn next(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Every(interval) => now.checked_add_signed(TimeDelta::from_std(*interval).ok()?),
            Self::Cron { schedule, .. } => schedule.after(&now).next(),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Every(interval) => write!(f, "every {}", format_duration(*interval)),
            Self::Cron { expr, .. } => write!(f, "cron `{expr}`"),
        }
    }
}

/// Rewrite a standard day-of-week field into the numbering of the `cron`
/// crate, which counts 1-7 from Sunday. Day names pass through unchanged.
fn translate_day_of_week(field: &str) -> Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    let mut named = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            named.push(item.to_string());
            continue;
        }
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: usize = step
                    .parse()
                    .map_err(|_| format!("invalid day-of-week step in `{item}`"))?;
                (range, step)
            }
            None => (item, 1),
        };
        if step == 0 {
            return Err(format!("invalid day-of-week step in `{item}`"));
        }
        let (first, last) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((first, last)) => (weekday(first)?, weekday(last)?),
            // `n/step` runs to the end of the week
            None if step > 1 => (weekday(range)?, 6),
            None => {
                let day = weekday(range)?;
                (day, day)
            }
        };
        if first > last {
            return Err(format!("day-of-week range `{range}` is reversed"));
        }
        days.extend((first..=last).step_by(step).map(|d| d % 7));
    }

    let mut items: Vec<String> = days.into_iter().map(|d| (d + 1).to_string()).collect();
    items.extend(named);
    Ok(items.join(","))
}

fn weekday(s: &str) -> Result<u32, String> {
    match s.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("day of week `{s}` is not in 0-7")),
    }
}

/// Parse durations such as `90s`, `15m`, `6h`, `1h30m` or `500ms`.
pub fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidDuration(s.to_string());
    let input = s.trim();
    if input.is_empty() {
        return Err(invalid());
    }
    if let Ok(secs) = input.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            "d" => Duration::from_secs(value * 86_400),
            _ => return Err(invalid()),
        };
        total += unit;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if d.subsec_millis() != 0 || secs == 0 {
        return format!("{}ms", d.as_millis());
    }
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{h}h"));
    }
    if m > 0 {
        out.push_str(&format!("{m}m"));
    }
    if s > 0 {
        out.push_str(&format!("{s}s"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_every_next() {
        let schedule = Schedule::every(Duration::from_secs(90)).unwrap();
        let now = at(10, 0);
        assert_eq!(schedule.next(now), Some(now + TimeDelta::seconds(90)));
        assert_eq!(schedule.to_string(), "every 1m30s");
    }

    #[test]
    fn test_cron_next() {
        let schedule = Schedule::cron("*/15 * * * *").unwrap();
        assert_eq!(schedule.next(at(10, 7)), Some(at(10, 15)));
        // strictly after now
        assert_eq!(schedule.next(at(10, 15)), Some(at(10, 30)));

        let daily = Schedule::cron("30 2 * * *").unwrap();
        assert_eq!(
            daily.next(at(3, 0)),
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 2, 30, 0).unwrap())
        );
    }

    // 2026-10-14 is a Wednesday.
    fn oct(day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, day, h, 0, 0).unwrap()
    }

    #[rstest]
    #[case("0 9 * * 1", oct(14, 12), oct(19, 9))]
    #[case("0 9 * * 0", oct(14, 12), oct(18, 9))]
    #[case("* * * * 0", oct(14, 12), oct(18, 0))]
    #[case("0 9 * * 7", oct(14, 12), oct(18, 9))]
    #[case("0 9 * * 1-5", oct(14, 12), oct(15, 9))]
    #[case("* * * * 1-5", oct(17, 12), oct(19, 0))]
    #[case("0 9 * * 5-7", oct(17, 10), oct(18, 9))]
    #[case("0 9 * * 0,3", oct(14, 12), oct(18, 9))]
    #[case("0 9 * * */3", oct(14, 12), oct(17, 9))]
    #[case("0 9 * * Mon", oct(14, 12), oct(19, 9))]
    fn test_cron_standard_weekdays(
        #[case] expr: &str,
        #[case] now: DateTime<Utc>,
        #[case] expected: DateTime<Utc>,
    ) {
        let schedule = Schedule::cron(expr).unwrap();
        assert_eq!(schedule.next(now), Some(expected));
    }

    #[test]
    fn test_translate_day_of_week() {
        assert_eq!(translate_day_of_week("*").unwrap(), "*");
        assert_eq!(translate_day_of_week("0").unwrap(), "1");
        assert_eq!(translate_day_of_week("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(translate_day_of_week("5-7").unwrap(), "1,6,7");
        assert_eq!(translate_day_of_week("*/2").unwrap(), "1,3,5,7");
        assert_eq!(translate_day_of_week("SAT,SUN").unwrap(), "SAT,SUN");
        assert!(translate_day_of_week("8").is_err());
        assert!(translate_day_of_week("5-1").is_err());
        assert!(translate_day_of_week("*/0").is_err());
    }

    #[test]
    fn test_invalid_cron() {
        assert!(matches!(
            Schedule::cron("not a cron"),
            Err(ScheduleError::InvalidCron { .. })
        ));
    }

    #[test]
    fn test_from_options() {
        assert!(matches!(
            Schedule::from_options(Some(Duration::from_secs(1)), Some("* * * * *")),
            Err(ScheduleError::Conflict)
        ));
        assert!(matches!(
            Schedule::from_options(None, None).unwrap(),
            Schedule::Every(d) if d == DEFAULT_EVERY
        ));
        assert!(matches!(
            Schedule::from_options(None, Some("0 * * * *")).unwrap(),
            Schedule::Cron { .. }
        ));
        assert!(Schedule::every(Duration::ZERO).is_err());
    }

    #[rstest]
    #[case("30", Duration::from_secs(30))]
    #[case("90s", Duration::from_secs(90))]
    #[case("15m", Duration::from_secs(900))]
    #[case("1h30m", Duration::from_secs(5400))]
    #[case("24h", Duration::from_secs(86_400))]
    #[case("250ms", Duration::from_millis(250))]
    fn test_parse_duration(#[case] input: &str, #[case] expected: Duration) {
        assert_eq!(parse_duration(input).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("h")]
    #[case("10")]
    #[case("10x")]
    #[case("5m3")]
    fn test_parse_duration_invalid(#[case] input: &str) {
        if input == "10" {
            // bare numbers are seconds
            assert!(parse_duration(input).is_ok());
        } else {
            assert!(parse_duration(input).is_err());
        }
    }
}
