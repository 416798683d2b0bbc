//! Date/time parsing, formatting and the 2000-01-01 epoch arithmetic used by
//! the binary wire format.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use std::fmt;

use crate::error::{PgError, PgResult};

const USECS_PER_SEC: i64 = 1_000_000;
const USECS_PER_MINUTE: i64 = 60 * USECS_PER_SEC;
const USECS_PER_HOUR: i64 = 60 * USECS_PER_MINUTE;

pub fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or(NaiveDate::MIN)
}

pub fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_time(NaiveTime::MIN)
}

pub fn parse_date(input: &str) -> PgResult<NaiveDate> {
    let trimmed = input.trim();
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| {
            // Accept timestamps when the target is a date.
            parse_timestamp(trimmed).map(|ts| ts.date()).map_err(|_| ())
        })
        .map_err(|_| PgError::invalid_text("date", input))
}

pub fn parse_time(input: &str) -> PgResult<NaiveTime> {
    let trimmed = input.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M"))
        .map_err(|_| PgError::invalid_text("time without time zone", input))
}

pub fn parse_timestamp(input: &str) -> PgResult<NaiveDateTime> {
    let trimmed = input.trim();
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(ts);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date.and_time(NaiveTime::MIN));
    }
    // A zone suffix on a plain timestamp is ignored, as PostgreSQL does.
    if let Some((local, _)) = split_offset(trimmed) {
        return parse_timestamp(local)
            .map_err(|_| PgError::invalid_text("timestamp without time zone", input));
    }
    Err(PgError::invalid_text("timestamp without time zone", input))
}

/// Parses a timestamptz literal. A missing zone means UTC, the session
/// time zone the bridge always reports.
pub fn parse_timestamptz(input: &str) -> PgResult<DateTime<Utc>> {
    let trimmed = input.trim();
    let invalid = || PgError::invalid_text("timestamp with time zone", input);
    match split_offset(trimmed) {
        Some((local, offset)) => {
            let naive = parse_timestamp(local).map_err(|_| invalid())?;
            offset
                .from_local_datetime(&naive)
                .single()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(invalid)
        }
        None => {
            let naive = parse_timestamp(trimmed).map_err(|_| invalid())?;
            Ok(Utc.from_utc_datetime(&naive))
        }
    }
}

/// Splits a trailing `Z`, `UTC`, `+hh`, `+hh:mm` or `+hhmm` off a timestamp.
fn split_offset(input: &str) -> Option<(&str, FixedOffset)> {
    if let Some(local) = input.strip_suffix('Z').or_else(|| input.strip_suffix(" UTC")) {
        return Some((local.trim_end(), FixedOffset::east_opt(0)?));
    }
    // The offset sign must come after the time part, not inside the date.
    let time_start = input.find([' ', 'T'])?;
    let sign_pos = input[time_start..].rfind(['+', '-'])? + time_start;
    let (local, zone) = input.split_at(sign_pos);
    let negative = zone.starts_with('-');
    let digits: String = zone[1..].chars().filter(|c| c.is_ascii_digit()).collect();
    let (hours, minutes) = match digits.len() {
        1 | 2 => (digits.parse::<i32>().ok()?, 0),
        4 => (digits[..2].parse::<i32>().ok()?, digits[2..].parse::<i32>().ok()?),
        _ => return None,
    };
    let seconds = (hours * 3600 + minutes * 60) * if negative { -1 } else { 1 };
    Some((local.trim_end(), FixedOffset::east_opt(seconds)?))
}

fn push_fraction(out: &mut String, nanos: u32) {
    let micros = nanos / 1000;
    if micros > 0 {
        let frac = format!("{micros:06}");
        out.push('.');
        out.push_str(frac.trim_end_matches('0'));
    }
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn format_time(time: &NaiveTime) -> String {
    let mut out = time.format("%H:%M:%S").to_string();
    push_fraction(&mut out, time.nanosecond());
    out
}

pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    let mut out = ts.format("%Y-%m-%d %H:%M:%S").to_string();
    push_fraction(&mut out, ts.nanosecond());
    out
}

pub fn format_timestamptz(ts: &DateTime<Utc>) -> String {
    let mut out = format_timestamp(&ts.naive_utc());
    out.push_str("+00");
    out
}

pub fn date_to_pg_days(date: &NaiveDate) -> i32 {
    (*date - pg_epoch_date()).num_days() as i32
}

pub fn pg_days_to_date(days: i32) -> PgResult<NaiveDate> {
    pg_epoch_date()
        .checked_add_signed(Duration::days(days as i64))
        .ok_or_else(|| PgError::out_of_range("date"))
}

pub fn time_to_pg_micros(time: &NaiveTime) -> i64 {
    time.num_seconds_from_midnight() as i64 * USECS_PER_SEC + (time.nanosecond() / 1000) as i64
}

pub fn pg_micros_to_time(micros: i64) -> PgResult<NaiveTime> {
    if !(0..24 * USECS_PER_HOUR).contains(&micros) {
        return Err(PgError::out_of_range("time without time zone"));
    }
    NaiveTime::from_num_seconds_from_midnight_opt(
        (micros / USECS_PER_SEC) as u32,
        ((micros % USECS_PER_SEC) * 1000) as u32,
    )
    .ok_or_else(|| PgError::out_of_range("time without time zone"))
}

pub fn timestamp_to_pg_micros(ts: &NaiveDateTime) -> i64 {
    let delta = *ts - pg_epoch();
    delta
        .num_microseconds()
        .unwrap_or(if delta < Duration::zero() { i64::MIN } else { i64::MAX })
}

pub fn pg_micros_to_timestamp(micros: i64) -> PgResult<NaiveDateTime> {
    pg_epoch()
        .checked_add_signed(Duration::microseconds(micros))
        .ok_or_else(|| PgError::out_of_range("timestamp"))
}

/// PostgreSQL interval: months, days and microseconds kept separately since
/// neither converts exactly into the others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl Interval {
    pub fn new(months: i32, days: i32, micros: i64) -> Self {
        Self { months, days, micros }
    }

    /// Parses the postgres output style (`1 year 2 mons 3 days 04:05:06`)
    /// and the common verbose unit forms (`90 minutes`, `-1 day`, `@ 2 hours`).
    pub fn parse(input: &str) -> PgResult<Interval> {
        let invalid = || PgError::invalid_text("interval", input);
        let mut interval = Interval::default();
        let lowered = input.trim().trim_start_matches('@').to_ascii_lowercase();
        let mut tokens = lowered.split_whitespace();
        let mut seen = false;

        while let Some(token) = tokens.next() {
            seen = true;
            if token.contains(':') {
                interval.micros += parse_clock(token).ok_or_else(invalid)?;
                continue;
            }
            if token == "ago" {
                interval = Interval::new(-interval.months, -interval.days, -interval.micros);
                continue;
            }
            let amount: f64 = token.parse().map_err(|_| invalid())?;
            let unit = tokens.next().ok_or_else(invalid)?;
            let unit = unit.trim_end_matches(',');
            match unit {
                "year" | "years" | "yr" | "yrs" | "y" => {
                    interval.months += (amount * 12.0).round() as i32
                }
                "mon" | "mons" | "month" | "months" => {
                    let whole = amount.trunc();
                    interval.months += whole as i32;
                    interval.days += ((amount - whole) * 30.0).round() as i32;
                }
                "week" | "weeks" | "w" => interval.days += (amount * 7.0).round() as i32,
                "day" | "days" | "d" => {
                    let whole = amount.trunc();
                    interval.days += whole as i32;
                    interval.micros += ((amount - whole) * 24.0 * USECS_PER_HOUR as f64).round() as i64;
                }
                "hour" | "hours" | "hr" | "hrs" | "h" => {
                    interval.micros += (amount * USECS_PER_HOUR as f64).round() as i64
                }
                "minute" | "minutes" | "min" | "mins" | "m" => {
                    interval.micros += (amount * USECS_PER_MINUTE as f64).round() as i64
                }
                "second" | "seconds" | "sec" | "secs" | "s" => {
                    interval.micros += (amount * USECS_PER_SEC as f64).round() as i64
                }
                "millisecond" | "milliseconds" | "ms" => {
                    interval.micros += (amount * 1000.0).round() as i64
                }
                "microsecond" | "microseconds" | "us" => interval.micros += amount.round() as i64,
                _ => return Err(invalid()),
            }
        }
        if !seen {
            return Err(invalid());
        }
        Ok(interval)
    }
}

fn parse_clock(token: &str) -> Option<i64> {
    let (negative, body) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    let mut parts = body.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: f64 = match parts.next() {
        Some(s) => s.parse().ok()?,
        None => 0.0,
    };
    if parts.next().is_some() {
        return None;
    }
    let total = hours * USECS_PER_HOUR + minutes * USECS_PER_MINUTE + (seconds * USECS_PER_SEC as f64).round() as i64;
    Some(if negative { -total } else { total })
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        let years = self.months / 12;
        let months = self.months % 12;
        let plural = |n: i32, unit: &str, units: &str| {
            format!("{} {}", n, if n == 1 { unit } else { units })
        };
        if years != 0 {
            parts.push(plural(years, "year", "years"));
        }
        if months != 0 {
            parts.push(plural(months, "mon", "mons"));
        }
        if self.days != 0 {
            parts.push(plural(self.days, "day", "days"));
        }
        if self.micros != 0 || parts.is_empty() {
            let sign = if self.micros < 0 { "-" } else { "" };
            let abs = self.micros.unsigned_abs() as i64;
            let hours = abs / USECS_PER_HOUR;
            let minutes = (abs % USECS_PER_HOUR) / USECS_PER_MINUTE;
            let seconds = (abs % USECS_PER_MINUTE) / USECS_PER_SEC;
            let micros = abs % USECS_PER_SEC;
            let mut clock = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
            if micros > 0 {
                clock.push('.');
                clock.push_str(format!("{micros:06}").trim_end_matches('0'));
            }
            parts.push(clock);
        }
        f.write_str(&parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_accept_common_layouts() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_micro_opt(12, 30, 0, 250_000)
            .unwrap();
        assert_eq!(parse_timestamp("2024-03-01 12:30:00.25").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01T12:30:00.25").unwrap(), expected);
        assert_eq!(format_timestamp(&expected), "2024-03-01 12:30:00.25");
    }

    #[test]
    fn timestamptz_normalizes_to_utc() {
        let ts = parse_timestamptz("2024-03-01 12:00:00+02").unwrap();
        assert_eq!(format_timestamptz(&ts), "2024-03-01 10:00:00+00");
        let ts = parse_timestamptz("2024-03-01 12:00:00-05:30").unwrap();
        assert_eq!(format_timestamptz(&ts), "2024-03-01 17:30:00+00");
        let ts = parse_timestamptz("2024-03-01 12:00:00").unwrap();
        assert_eq!(format_timestamptz(&ts), "2024-03-01 12:00:00+00");
    }

    #[test]
    fn epoch_arithmetic() {
        assert_eq!(date_to_pg_days(&pg_epoch_date()), 0);
        let date = NaiveDate::from_ymd_opt(1999, 12, 31).unwrap();
        assert_eq!(date_to_pg_days(&date), -1);
        assert_eq!(pg_days_to_date(-1).unwrap(), date);

        let ts = parse_timestamp("2000-01-01 00:00:01").unwrap();
        assert_eq!(timestamp_to_pg_micros(&ts), 1_000_000);
        assert_eq!(pg_micros_to_timestamp(1_000_000).unwrap(), ts);
    }

    #[test]
    fn interval_text_round_trip() {
        let interval = Interval::parse("1 year 2 mons 3 days 04:05:06.5").unwrap();
        assert_eq!(interval.months, 14);
        assert_eq!(interval.days, 3);
        assert_eq!(interval.micros, 4 * USECS_PER_HOUR + 5 * USECS_PER_MINUTE + 6_500_000);
        assert_eq!(interval.to_string(), "1 year 2 mons 3 days 04:05:06.5");
        assert_eq!(Interval::parse(&interval.to_string()).unwrap(), interval);

        assert_eq!(Interval::parse("90 minutes").unwrap().to_string(), "01:30:00");
        assert_eq!(Interval::parse("-1 day").unwrap().to_string(), "-1 days");
        assert_eq!(Interval::default().to_string(), "00:00:00");
        assert!(Interval::parse("soon").is_err());
    }
}
