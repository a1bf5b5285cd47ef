//! Bucket interval type.
//!
//! A [`BucketInterval`] is the width of the time window a task instance covers.
//! It combines a calendar part (months, days) with a fixed sub-day part
//! (microseconds), matching the shape of a PostgreSQL `INTERVAL` so values
//! round-trip through the `bucket_interval` column unchanged.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, Months, TimeDelta, Utc};
use serde::{Serialize, Serializer};
use sqlx::postgres::types::PgInterval;
use thiserror::Error;

pub const SECONDS_PER_DAY: i64 = 86_400;
/// Fixed 365-day year used by the approximate-length helpers.
pub const DAYS_PER_YEAR: i64 = 365;
pub const SECONDS_PER_YEAR: i64 = DAYS_PER_YEAR * SECONDS_PER_DAY;
/// One twelfth of the fixed year, not any real calendar month.
pub const SECONDS_PER_MONTH: i64 = SECONDS_PER_YEAR / 12;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Width of a task's time bucket: a calendar period plus a fixed duration.
///
/// The representation mirrors PostgreSQL's `INTERVAL` storage: whole months,
/// whole days, and microseconds. Months and days are calendar units whose
/// real length depends on where they land; the microsecond part is exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketInterval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

impl BucketInterval {
    pub const fn new(months: i32, days: i32, micros: i64) -> Self {
        Self {
            months,
            days,
            micros,
        }
    }

    pub const fn of_years(years: i32) -> Self {
        Self::new(years * 12, 0, 0)
    }

    pub const fn of_months(months: i32) -> Self {
        Self::new(months, 0, 0)
    }

    pub const fn of_days(days: i32) -> Self {
        Self::new(0, days, 0)
    }

    pub const fn of_hours(hours: i64) -> Self {
        Self::new(0, 0, hours * 3600 * MICROS_PER_SECOND)
    }

    pub const fn of_minutes(minutes: i64) -> Self {
        Self::new(0, 0, minutes * 60 * MICROS_PER_SECOND)
    }

    pub const fn of_seconds(seconds: i64) -> Self {
        Self::new(0, 0, seconds * MICROS_PER_SECOND)
    }

    pub const fn of_millis(millis: i64) -> Self {
        Self::new(0, 0, millis * 1_000)
    }

    /// Build from a fixed duration. Returns `None` when the duration does not
    /// fit in whole microseconds.
    pub fn from_duration(duration: TimeDelta) -> Option<Self> {
        Some(Self::new(0, 0, duration.num_microseconds()?))
    }

    /// True when every component is non-negative and at least one is non-zero.
    pub fn is_positive(&self) -> bool {
        self.months >= 0
            && self.days >= 0
            && self.micros >= 0
            && (self.months > 0 || self.days > 0 || self.micros > 0)
    }

    /// True when the interval carries a calendar part (months or days), which
    /// means its real length varies and alignment must step rather than divide.
    pub fn has_calendar_part(&self) -> bool {
        self.months != 0 || self.days != 0
    }

    /// Approximate total length in seconds, using a fixed 365-day year and a
    /// year/12 month. This is an estimate for sizing jumps and backlog math;
    /// it is wrong for exact calendar-month arithmetic and must never be
    /// treated as the interval's true length.
    pub fn approx_total_seconds(&self) -> i64 {
        self.months as i64 * SECONDS_PER_MONTH
            + self.days as i64 * SECONDS_PER_DAY
            + self.micros / MICROS_PER_SECOND
    }

    /// Multiply every component, failing on overflow.
    pub(crate) fn checked_mul(&self, n: i64) -> Option<Self> {
        let months = i32::try_from((self.months as i64).checked_mul(n)?).ok()?;
        let days = i32::try_from((self.days as i64).checked_mul(n)?).ok()?;
        let micros = self.micros.checked_mul(n)?;
        Some(Self::new(months, days, micros))
    }

    /// `t + self`, calendar-aware. Months are added first, then days, then the
    /// fixed part, matching how PostgreSQL adds an `INTERVAL` to a timestamp.
    pub fn add_to(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let t = add_months(t, self.months)?;
        let t = add_days(t, self.days)?;
        t.checked_add_signed(TimeDelta::microseconds(self.micros))
    }

    /// `t - self`, calendar-aware.
    pub fn sub_from(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let t = add_months(t, self.months.checked_neg()?)?;
        let t = add_days(t, self.days.checked_neg()?)?;
        t.checked_sub_signed(TimeDelta::microseconds(self.micros))
    }
}

fn add_months(t: DateTime<Utc>, months: i32) -> Option<DateTime<Utc>> {
    if months >= 0 {
        t.checked_add_months(Months::new(months as u32))
    } else {
        t.checked_sub_months(Months::new(months.unsigned_abs()))
    }
}

fn add_days(t: DateTime<Utc>, days: i32) -> Option<DateTime<Utc>> {
    if days >= 0 {
        t.checked_add_days(Days::new(days as u64))
    } else {
        t.checked_sub_days(Days::new(days.unsigned_abs() as u64))
    }
}

impl From<BucketInterval> for PgInterval {
    fn from(value: BucketInterval) -> Self {
        PgInterval {
            months: value.months,
            days: value.days,
            microseconds: value.micros,
        }
    }
}

impl From<PgInterval> for BucketInterval {
    fn from(value: PgInterval) -> Self {
        BucketInterval::new(value.months, value.days, value.microseconds)
    }
}

impl fmt::Display for BucketInterval {
    /// ISO-8601 period-duration text, e.g. `P1M`, `P2DT12H`, `PT5M`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.months == 0 && self.days == 0 && self.micros == 0 {
            return write!(f, "PT0S");
        }
        write!(f, "P")?;
        let years = self.months / 12;
        let months = self.months % 12;
        if years != 0 {
            write!(f, "{years}Y")?;
        }
        if months != 0 {
            write!(f, "{months}M")?;
        }
        if self.days != 0 {
            write!(f, "{}D", self.days)?;
        }
        if self.micros != 0 {
            write!(f, "T")?;
            let mut micros = self.micros;
            let hours = micros / (3600 * MICROS_PER_SECOND);
            micros -= hours * 3600 * MICROS_PER_SECOND;
            let minutes = micros / (60 * MICROS_PER_SECOND);
            micros -= minutes * 60 * MICROS_PER_SECOND;
            let seconds = micros / MICROS_PER_SECOND;
            let frac = micros % MICROS_PER_SECOND;
            if hours != 0 {
                write!(f, "{hours}H")?;
            }
            if minutes != 0 {
                write!(f, "{minutes}M")?;
            }
            if frac != 0 {
                let text = format!("{frac:06}");
                write!(f, "{seconds}.{}S", text.trim_end_matches('0'))?;
            } else if seconds != 0 {
                write!(f, "{seconds}S")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid bucket interval {text:?}: {reason}")]
pub struct ParseIntervalError {
    text: String,
    reason: &'static str,
}

impl ParseIntervalError {
    fn new(text: &str, reason: &'static str) -> Self {
        Self {
            text: text.to_string(),
            reason,
        }
    }
}

impl FromStr for BucketInterval {
    type Err = ParseIntervalError;

    /// Parse ISO-8601 period-duration text (`P1Y2M3DT4H5M6.5S`). Weeks are
    /// accepted and folded into days. Negative components are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let body = s
            .strip_prefix('P')
            .ok_or_else(|| ParseIntervalError::new(s, "must start with 'P'"))?;
        let (date_part, time_part) = match body.split_once('T') {
            Some((d, t)) => (d, Some(t)),
            None => (body, None),
        };
        if date_part.is_empty() && time_part.is_none() {
            return Err(ParseIntervalError::new(s, "empty interval"));
        }

        let mut months: i64 = 0;
        let mut days: i64 = 0;
        let mut micros: i64 = 0;

        for (value, frac, unit) in components(s, date_part)? {
            if frac != 0 {
                return Err(ParseIntervalError::new(s, "fractional date component"));
            }
            match unit {
                'Y' => months += value * 12,
                'M' => months += value,
                'W' => days += value * 7,
                'D' => days += value,
                _ => return Err(ParseIntervalError::new(s, "unknown date unit")),
            }
        }
        if let Some(time_part) = time_part {
            if time_part.is_empty() {
                return Err(ParseIntervalError::new(s, "empty time part"));
            }
            for (value, frac, unit) in components(s, time_part)? {
                if frac != 0 && unit != 'S' {
                    return Err(ParseIntervalError::new(s, "fraction only allowed on seconds"));
                }
                match unit {
                    'H' => micros += value * 3600 * MICROS_PER_SECOND,
                    'M' => micros += value * 60 * MICROS_PER_SECOND,
                    'S' => micros += value * MICROS_PER_SECOND + frac,
                    _ => return Err(ParseIntervalError::new(s, "unknown time unit")),
                }
            }
        }

        let months =
            i32::try_from(months).map_err(|_| ParseIntervalError::new(s, "months overflow"))?;
        let days = i32::try_from(days).map_err(|_| ParseIntervalError::new(s, "days overflow"))?;
        Ok(BucketInterval::new(months, days, micros))
    }
}

/// Split `part` into (value, fractional micros, unit) triples.
fn components(full: &str, part: &str) -> Result<Vec<(i64, i64, char)>, ParseIntervalError> {
    let mut out = Vec::new();
    let mut digits = String::new();
    let mut fraction = String::new();
    let mut in_fraction = false;
    for c in part.chars() {
        if c.is_ascii_digit() {
            if in_fraction {
                fraction.push(c);
            } else {
                digits.push(c);
            }
        } else if c == '.' || c == ',' {
            if in_fraction || digits.is_empty() {
                return Err(ParseIntervalError::new(full, "malformed fraction"));
            }
            in_fraction = true;
        } else {
            if digits.is_empty() {
                return Err(ParseIntervalError::new(full, "missing digits before unit"));
            }
            let value: i64 = digits
                .parse()
                .map_err(|_| ParseIntervalError::new(full, "component overflow"))?;
            let frac = if fraction.is_empty() {
                0
            } else {
                if fraction.len() > 6 {
                    return Err(ParseIntervalError::new(full, "fraction finer than microseconds"));
                }
                let scaled = format!("{fraction:0<6}");
                scaled
                    .parse()
                    .map_err(|_| ParseIntervalError::new(full, "malformed fraction"))?
            };
            out.push((value, frac, c));
            digits.clear();
            fraction.clear();
            in_fraction = false;
        }
    }
    if !digits.is_empty() || !fraction.is_empty() {
        return Err(ParseIntervalError::new(full, "trailing digits without unit"));
    }
    Ok(out)
}

impl Serialize for BucketInterval {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(text: &str) -> DateTime<Utc> {
        text.parse().expect("valid timestamp")
    }

    #[test]
    fn test_display() {
        assert_eq!(BucketInterval::of_minutes(5).to_string(), "PT5M");
        assert_eq!(BucketInterval::of_months(14).to_string(), "P1Y2M");
        assert_eq!(BucketInterval::new(1, 2, 3_600_000_000).to_string(), "P1M2DT1H");
        assert_eq!(BucketInterval::of_millis(500).to_string(), "PT0.5S");
        assert_eq!(BucketInterval::new(0, 0, 0).to_string(), "PT0S");
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            "P1Y2M3DT4H5M6S".parse::<BucketInterval>().unwrap(),
            BucketInterval::new(14, 3, (4 * 3600 + 5 * 60 + 6) * 1_000_000)
        );
        assert_eq!(
            "PT0.25S".parse::<BucketInterval>().unwrap(),
            BucketInterval::of_millis(250)
        );
        assert_eq!("P2W".parse::<BucketInterval>().unwrap(), BucketInterval::of_days(14));
        assert!("PT".parse::<BucketInterval>().is_err());
        assert!("5M".parse::<BucketInterval>().is_err());
        assert!("P1.5M".parse::<BucketInterval>().is_err());
    }

    #[test]
    fn test_display_parse_roundtrip() {
        for interval in [
            BucketInterval::of_minutes(5),
            BucketInterval::of_hours(2),
            BucketInterval::of_months(1),
            BucketInterval::of_years(1),
            BucketInterval::new(3, 10, 90_000_000),
            BucketInterval::of_millis(100),
        ] {
            let text = interval.to_string();
            assert_eq!(text.parse::<BucketInterval>().unwrap(), interval, "{text}");
        }
    }

    #[test]
    fn test_approx_total_seconds() {
        assert_eq!(BucketInterval::of_years(1).approx_total_seconds(), 31_536_000);
        assert_eq!(BucketInterval::of_months(1).approx_total_seconds(), 2_628_000);
        assert_eq!(BucketInterval::of_days(1).approx_total_seconds(), 86_400);
        assert_eq!(BucketInterval::of_minutes(5).approx_total_seconds(), 300);
    }

    #[test]
    fn test_pg_interval_roundtrip() {
        let interval = BucketInterval::new(13, 4, 42_000_000);
        let pg: PgInterval = interval.into();
        assert_eq!(BucketInterval::from(pg), interval);
    }

    #[test]
    fn test_add_to_handles_month_lengths() {
        let jan31 = Utc.with_ymd_and_hms(2021, 1, 31, 0, 0, 0).unwrap();
        let feb28 = Utc.with_ymd_and_hms(2021, 2, 28, 0, 0, 0).unwrap();
        assert_eq!(BucketInterval::of_months(1).add_to(jan31), Some(feb28));
    }

    #[test]
    fn test_sub_from() {
        let t = utc("2021-03-31T12:00:00Z");
        assert_eq!(
            BucketInterval::of_months(1).sub_from(t),
            Some(utc("2021-02-28T12:00:00Z"))
        );
        assert_eq!(
            BucketInterval::of_hours(12).sub_from(t),
            Some(utc("2021-03-31T00:00:00Z"))
        );
    }

    #[test]
    fn test_is_positive() {
        assert!(BucketInterval::of_seconds(1).is_positive());
        assert!(BucketInterval::of_months(1).is_positive());
        assert!(!BucketInterval::new(0, 0, 0).is_positive());
        assert!(!BucketInterval::new(1, 0, -1).is_positive());
        assert!(!BucketInterval::of_seconds(-5).is_positive());
    }
}
