//! Loop-time ↔ timestamp conversion.
//!
//! In memory, every time the reactor deals with (consistency time, next retry
//! time, handler start) is a float number of seconds on a monotonic clock.
//! When persisted, those offsets are rendered as microsecond-precision
//! timestamps anchored at the wall-clock time the monotonic clock started.
//! After a restart a new anchor is taken, and previously stored timestamps
//! decode into offsets relative to it (possibly negative).

use chrono::{DateTime, FixedOffset, NaiveDateTime, SubsecRound, TimeDelta, Utc};
use tokio::time::Instant;

use crate::error::CodecError;

const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const AWARE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";
const NAIVE_PARSE: &str = "%Y-%m-%dT%H:%M:%S%.f";
const AWARE_PARSE: &str = "%Y-%m-%dT%H:%M:%S%.f%:z";

/// The wall-clock anchor of a [`Clock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseTime {
    /// No timezone; encoded timestamps carry no suffix.
    Naive(NaiveDateTime),
    /// Timezone-aware; encoded timestamps end with `±HH:MM`.
    Aware(DateTime<FixedOffset>),
}

impl BaseTime {
    /// The current UTC time, timezone-aware, truncated to whole microseconds.
    pub fn now() -> Self {
        Self::Aware(Utc::now().trunc_subsecs(6).fixed_offset())
    }
}

impl From<NaiveDateTime> for BaseTime {
    fn from(value: NaiveDateTime) -> Self {
        Self::Naive(value)
    }
}

impl From<DateTime<FixedOffset>> for BaseTime {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Self::Aware(value)
    }
}

impl From<DateTime<Utc>> for BaseTime {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Aware(value.fixed_offset())
    }
}

fn to_micros(offset: f64) -> Result<i64, CodecError> {
    let micros = (offset * 1_000_000.0).round();
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return Err(CodecError::OutOfRange { offset });
    }
    Ok(micros as i64)
}

/// Render `base + offset` seconds as a timestamp.
///
/// `None` maps to `None`. Offsets are rounded to whole microseconds.
pub fn format_iso8601(offset: Option<f64>, base: &BaseTime) -> Result<Option<String>, CodecError> {
    let Some(offset) = offset else {
        return Ok(None);
    };
    let delta = TimeDelta::microseconds(to_micros(offset)?);
    let rendered = match base {
        BaseTime::Naive(base) => base
            .checked_add_signed(delta)
            .map(|dt| dt.format(NAIVE_FORMAT).to_string()),
        BaseTime::Aware(base) => base
            .checked_add_signed(delta)
            .map(|dt| dt.format(AWARE_FORMAT).to_string()),
    };
    rendered
        .map(Some)
        .ok_or(CodecError::OutOfRange { offset })
}

/// Inverse of [`format_iso8601`]: seconds between `base` and the timestamp.
pub fn parse_iso8601(value: Option<&str>, base: &BaseTime) -> Result<Option<f64>, CodecError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let delta = match base {
        BaseTime::Naive(base) => match NaiveDateTime::parse_from_str(value, NAIVE_PARSE) {
            Ok(dt) => dt.signed_duration_since(*base),
            Err(_) if DateTime::parse_from_str(value, AWARE_PARSE).is_ok() => {
                return Err(CodecError::Mismatch { value: value.into() })
            }
            Err(_) => return Err(CodecError::Unparseable { value: value.into() }),
        },
        BaseTime::Aware(base) => match DateTime::parse_from_str(value, AWARE_PARSE) {
            Ok(dt) => dt.signed_duration_since(*base),
            Err(_) if NaiveDateTime::parse_from_str(value, NAIVE_PARSE).is_ok() => {
                return Err(CodecError::Mismatch { value: value.into() })
            }
            Err(_) => return Err(CodecError::Unparseable { value: value.into() }),
        },
    };
    let micros = delta
        .num_microseconds()
        .ok_or_else(|| CodecError::Unparseable { value: value.into() })?;
    Ok(Some(micros as f64 / 1_000_000.0))
}

/// Monotonic clock with a wall-clock anchor.
///
/// Built on [`tokio::time::Instant`], so a paused test runtime controls it.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor: Instant,
    base: BaseTime,
}

impl Clock {
    /// Anchor a new clock at the current instant and UTC time.
    pub fn new() -> Self {
        Self::with_base(BaseTime::now())
    }

    /// Anchor a new clock at the current instant with an explicit base.
    pub fn with_base(base: BaseTime) -> Self {
        Self {
            anchor: Instant::now(),
            base,
        }
    }

    /// Seconds elapsed since the anchor.
    pub fn now(&self) -> f64 {
        self.anchor.elapsed().as_secs_f64()
    }

    pub fn base(&self) -> &BaseTime {
        &self.base
    }

    /// The instant corresponding to a loop time; clamped to the anchor.
    pub fn instant_at(&self, time: f64) -> Instant {
        if time.is_finite() && time > 0.0 {
            self.anchor + std::time::Duration::from_secs_f64(time)
        } else {
            self.anchor
        }
    }

    pub fn format(&self, time: Option<f64>) -> Result<Option<String>, CodecError> {
        format_iso8601(time, &self.base)
    }

    pub fn parse(&self, value: Option<&str>) -> Result<Option<f64>, CodecError> {
        parse_iso8601(value, &self.base)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
