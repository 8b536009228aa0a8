//! Wall-clock view of reservations.
//!
//! Reservations are stored as UTC instants; waitlists are keyed by what a
//! member sees on the facility's clock (date plus start/end time of day).
//! Everything here converts between the two using the facility timezone.

use chrono::{DateTime, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::SchedulingError;
use crate::model::{Ms, Span};

const LOCAL_INPUT_FORMAT: &str = "%Y-%m-%dT%H:%M";

/// A bookable interval as a facility-local date and times of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl Slot {
    pub fn new(date: NaiveDate, start_time: NaiveTime, end_time: NaiveTime) -> Result<Self, SchedulingError> {
        if start_time >= end_time {
            return Err(SchedulingError::validation(
                "target_end_time",
                "must be after the start time",
            ));
        }
        Ok(Self { date, start_time, end_time })
    }

    /// Normalize a reservation span: the date is the local calendar day of
    /// the start, the times are the local wall-clock of start and end.
    ///
    /// `None` when the span does not fit inside one local day, ending at
    /// midnight included; no slot can describe it.
    pub fn from_span(span: &Span, tz: Tz) -> Option<Self> {
        let start = local(span.start, tz);
        let end = local(span.end, tz);
        if end.date_naive() != start.date_naive() {
            return None;
        }
        Self::new(start.date_naive(), start.time(), end.time()).ok()
    }

    /// Instant the slot starts at, resolving DST ambiguity to the earliest.
    pub fn start_instant(&self, tz: Tz) -> Result<Ms, SchedulingError> {
        resolve_local(self.date.and_time(self.start_time), tz, "target_start_time")
    }
}

fn local(ms: Ms, tz: Tz) -> DateTime<Tz> {
    match Utc.timestamp_millis_opt(ms) {
        LocalResult::Single(utc) => utc.with_timezone(&tz),
        // Out-of-range instants are rejected by span validation before they get here.
        _ => DateTime::<Utc>::default().with_timezone(&tz),
    }
}

pub fn parse_timezone(name: &str) -> Result<Tz, SchedulingError> {
    name.parse::<Tz>()
        .map_err(|_| SchedulingError::validation("timezone", format!("unknown timezone {name:?}")))
}

/// Parse an RFC3339 instant or a facility-local `YYYY-MM-DDTHH:MM`.
pub fn parse_instant(field: &'static str, raw: &str, tz: Tz) -> Result<Ms, SchedulingError> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    let naive = NaiveDateTime::parse_from_str(raw, LOCAL_INPUT_FORMAT).map_err(|_| {
        SchedulingError::validation(field, "expected RFC3339 or YYYY-MM-DDTHH:MM")
    })?;
    resolve_local(naive, tz, field)
}

fn resolve_local(naive: NaiveDateTime, tz: Tz, field: &'static str) -> Result<Ms, SchedulingError> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Ok(dt.timestamp_millis()),
        LocalResult::Ambiguous(earliest, _) => Ok(earliest.timestamp_millis()),
        LocalResult::None => Err(SchedulingError::validation(
            field,
            "local time does not exist in the facility timezone",
        )),
    }
}

pub fn parse_date(field: &'static str, raw: &str) -> Result<NaiveDate, SchedulingError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| SchedulingError::validation(field, "expected YYYY-MM-DD"))
}

/// Accepts `HH:MM` or `HH:MM:SS`.
pub fn parse_time_of_day(field: &'static str, raw: &str) -> Result<NaiveTime, SchedulingError> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|_| SchedulingError::validation(field, "expected HH:MM"))
}
