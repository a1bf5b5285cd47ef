//! Time-bucket alignment.
//!
//! Maps an instant to the start of its enclosing bucket relative to an origin.
//! Fixed-length intervals divide; calendar intervals (months, days) cannot be
//! divided because their real length varies, so alignment jumps to an estimate
//! and then steps one interval at a time until the bucket brackets the
//! timestamp. All arithmetic is carried out at microsecond precision.

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::interval::BucketInterval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BucketError {
    #[error("bucket interval must be a positive amount of time")]
    NonPositiveInterval,
    #[error("bucket arithmetic overflowed the representable time range")]
    Overflow,
}

/// Align `timestamp` to the start of its bucket.
///
/// The result `start` satisfies `start <= timestamp < start + interval` and is
/// reachable from `origin` by a whole number of interval steps. When
/// `timestamp == origin` the origin itself is returned.
pub fn align(
    timestamp: DateTime<Utc>,
    origin: DateTime<Utc>,
    interval: &BucketInterval,
) -> Result<DateTime<Utc>, BucketError> {
    if !interval.is_positive() {
        return Err(BucketError::NonPositiveInterval);
    }
    if timestamp == origin {
        return Ok(origin);
    }
    if interval.has_calendar_part() {
        align_calendar(timestamp, origin, interval)
    } else {
        align_fixed(timestamp, origin, interval.micros)
    }
}

/// Align against the Unix epoch, the conventional origin for recurring tasks.
pub fn align_to_epoch(
    timestamp: DateTime<Utc>,
    interval: &BucketInterval,
) -> Result<DateTime<Utc>, BucketError> {
    align(timestamp, DateTime::<Utc>::UNIX_EPOCH, interval)
}

/// Both ends of the enclosing bucket, `[start, start + interval)`.
pub fn bucket_bounds(
    timestamp: DateTime<Utc>,
    origin: DateTime<Utc>,
    interval: &BucketInterval,
) -> Result<(DateTime<Utc>, DateTime<Utc>), BucketError> {
    let start = align(timestamp, origin, interval)?;
    let end = interval.add_to(start).ok_or(BucketError::Overflow)?;
    Ok((start, end))
}

/// Fixed-length intervals: floor division gives the step count, but the
/// boundary direction still gets settled by single-step nudges.
fn align_fixed(
    timestamp: DateTime<Utc>,
    origin: DateTime<Utc>,
    step_micros: i64,
) -> Result<DateTime<Utc>, BucketError> {
    let delta = timestamp.timestamp_micros() - origin.timestamp_micros();
    let steps = delta.div_euclid(step_micros);
    let offset = steps.checked_mul(step_micros).ok_or(BucketError::Overflow)?;
    let mut start = origin
        .checked_add_signed(TimeDelta::microseconds(offset))
        .ok_or(BucketError::Overflow)?;

    let step = TimeDelta::microseconds(step_micros);
    while start > timestamp {
        start = start.checked_sub_signed(step).ok_or(BucketError::Overflow)?;
    }
    loop {
        let next = start.checked_add_signed(step).ok_or(BucketError::Overflow)?;
        if next <= timestamp {
            start = next;
        } else {
            break;
        }
    }
    Ok(start)
}

/// Calendar intervals: jump near the target using the approximate interval
/// length, then walk single periods until the bucket brackets the timestamp.
fn align_calendar(
    timestamp: DateTime<Utc>,
    origin: DateTime<Utc>,
    interval: &BucketInterval,
) -> Result<DateTime<Utc>, BucketError> {
    let approx_seconds = interval.approx_total_seconds().max(1);
    let delta = timestamp.timestamp() - origin.timestamp();
    let steps = delta.div_euclid(approx_seconds);

    let jump = interval.checked_mul(steps).ok_or(BucketError::Overflow)?;
    let mut start = jump.add_to(origin).ok_or(BucketError::Overflow)?;

    while start > timestamp {
        start = interval.sub_from(start).ok_or(BucketError::Overflow)?;
    }
    loop {
        let next = interval.add_to(start).ok_or(BucketError::Overflow)?;
        if next <= timestamp {
            start = next;
        } else {
            break;
        }
    }
    Ok(start)
}
