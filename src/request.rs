//! Boundary types for an HTTP front end: request bodies in JSON or form
//! encoding, and the payloads returned for errors and fee confirmations.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::engine::{FeeDetails, ReservationRequest};
use crate::error::SchedulingError;
use crate::model::Id;
use crate::slot::parse_instant;

/// A reservation body as submitted. Times are RFC3339 or facility-local
/// `YYYY-MM-DDTHH:MM`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReservationForm {
    pub facility_id: Id,
    pub reservation_type_id: Id,
    pub start_time: String,
    pub end_time: String,
    #[serde(default)]
    pub court_ids: Vec<Id>,
    #[serde(default)]
    pub participant_ids: Vec<Id>,
    #[serde(default)]
    pub primary_user_id: Option<Id>,
    #[serde(default)]
    pub pro_id: Option<Id>,
    #[serde(default)]
    pub open_play_rule_id: Option<Id>,
    #[serde(default)]
    pub recurrence_rule: Option<String>,
    #[serde(default)]
    pub is_open_event: bool,
    #[serde(default)]
    pub teams_per_court: Option<u32>,
    #[serde(default)]
    pub people_per_team: Option<u32>,
    #[serde(default)]
    pub package_id: Option<Id>,
}

fn parse_field<T: std::str::FromStr>(field: &'static str, raw: &str) -> Result<T, SchedulingError> {
    raw.trim()
        .parse()
        .map_err(|_| SchedulingError::validation(field, format!("cannot parse {raw:?}")))
}

fn parse_flag(field: &'static str, raw: &str) -> Result<bool, SchedulingError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "on" | "yes" => Ok(true),
        "false" | "0" | "off" | "no" | "" => Ok(false),
        _ => Err(SchedulingError::validation(field, "expected a boolean")),
    }
}

/// Repeated keys and comma-separated values both accumulate.
fn push_ids(field: &'static str, raw: &str, into: &mut Vec<Id>) -> Result<(), SchedulingError> {
    for part in raw.split(',').filter(|p| !p.trim().is_empty()) {
        into.push(parse_field(field, part)?);
    }
    Ok(())
}

fn required<T>(field: &'static str, value: Option<T>) -> Result<T, SchedulingError> {
    value.ok_or_else(|| SchedulingError::validation(field, "is required"))
}

fn optional(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    (!raw.is_empty()).then_some(raw)
}

impl ReservationForm {
    pub fn from_json(body: &str) -> Result<Self, SchedulingError> {
        serde_json::from_str(body).map_err(|e| SchedulingError::validation("body", e.to_string()))
    }

    /// Decode `application/x-www-form-urlencoded`. Unknown keys are ignored.
    pub fn from_form(body: &str) -> Result<Self, SchedulingError> {
        let mut facility_id = None;
        let mut reservation_type_id = None;
        let mut start_time = None;
        let mut end_time = None;
        let mut form = ReservationForm::default();

        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            match key.as_ref() {
                "facility_id" => facility_id = Some(parse_field("facility_id", &value)?),
                "reservation_type_id" => reservation_type_id = Some(parse_field("reservation_type_id", &value)?),
                "start_time" => start_time = Some(value.into_owned()),
                "end_time" => end_time = Some(value.into_owned()),
                "court_ids" | "court_ids[]" => push_ids("court_ids", &value, &mut form.court_ids)?,
                "participant_ids" | "participant_ids[]" => {
                    push_ids("participant_ids", &value, &mut form.participant_ids)?
                }
                "primary_user_id" => {
                    form.primary_user_id = optional(&value).map(|v| parse_field("primary_user_id", v)).transpose()?
                }
                "pro_id" => form.pro_id = optional(&value).map(|v| parse_field("pro_id", v)).transpose()?,
                "open_play_rule_id" => {
                    form.open_play_rule_id = optional(&value)
                        .map(|v| parse_field("open_play_rule_id", v))
                        .transpose()?
                }
                "recurrence_rule" => form.recurrence_rule = optional(&value).map(str::to_string),
                "is_open_event" => form.is_open_event = parse_flag("is_open_event", &value)?,
                "teams_per_court" => {
                    form.teams_per_court = optional(&value).map(|v| parse_field("teams_per_court", v)).transpose()?
                }
                "people_per_team" => {
                    form.people_per_team = optional(&value).map(|v| parse_field("people_per_team", v)).transpose()?
                }
                "package_id" => form.package_id = optional(&value).map(|v| parse_field("package_id", v)).transpose()?,
                _ => {}
            }
        }

        Ok(ReservationForm {
            facility_id: required("facility_id", facility_id)?,
            reservation_type_id: required("reservation_type_id", reservation_type_id)?,
            start_time: required("start_time", start_time)?,
            end_time: required("end_time", end_time)?,
            ..form
        })
    }

    /// Resolve times in the facility's timezone.
    pub fn into_request(self, tz: Tz) -> Result<ReservationRequest, SchedulingError> {
        Ok(ReservationRequest {
            reservation_type_id: self.reservation_type_id,
            start: parse_instant("start_time", &self.start_time, tz)?,
            end: parse_instant("end_time", &self.end_time, tz)?,
            court_ids: self.court_ids,
            participant_ids: self.participant_ids,
            primary_user_id: self.primary_user_id,
            pro_id: self.pro_id,
            open_play_rule_id: self.open_play_rule_id,
            recurrence_rule: self.recurrence_rule,
            is_open_event: self.is_open_event,
            teams_per_court: self.teams_per_court,
            people_per_team: self.people_per_team,
            package_id: self.package_id,
        })
    }
}

/// Cancellation body. `waive_fee` answers a previous confirmation prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CancelForm {
    #[serde(default)]
    pub waive_fee: Option<bool>,
}

impl CancelForm {
    pub fn from_json(body: &str) -> Result<Self, SchedulingError> {
        if body.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(body).map_err(|e| SchedulingError::validation("body", e.to_string()))
    }

    pub fn from_form(body: &str) -> Result<Self, SchedulingError> {
        let mut form = Self::default();
        for (key, value) in url::form_urlencoded::parse(body.as_bytes()) {
            if key == "waive_fee" && optional(&value).is_some() {
                form.waive_fee = Some(parse_flag("waive_fee", &value)?);
            }
        }
        Ok(form)
    }
}

/// Error body. Storage and timeout details stay in the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    #[serde(skip)]
    pub status: u16,
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub court_id: Option<Id>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<Id>,
}

impl From<&SchedulingError> for ErrorPayload {
    fn from(err: &SchedulingError) -> Self {
        let mut payload = ErrorPayload {
            status: err.status_code(),
            error: "",
            message: err.to_string(),
            field: None,
            court_id: None,
            reservation_id: None,
        };
        payload.error = match err {
            SchedulingError::Validation { field, .. } => {
                payload.field = Some(*field);
                "validation"
            }
            SchedulingError::Conflict {
                court_id,
                reservation_id,
            } => {
                payload.court_id = Some(*court_id);
                payload.reservation_id = Some(*reservation_id);
                "conflict"
            }
            SchedulingError::NotFound { .. } => "not_found",
            SchedulingError::Forbidden(_) => "forbidden",
            SchedulingError::LimitExceeded(_) => "limit_exceeded",
            SchedulingError::Storage(_) => {
                payload.message = "internal error".into();
                "internal"
            }
            SchedulingError::Timeout(_) => {
                payload.message = "the request timed out".into();
                "timeout"
            }
        };
        payload
    }
}

/// Returned when staff must decide whether to waive a cancellation fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationPayload {
    #[serde(skip)]
    pub status: u16,
    pub requires_confirmation: bool,
    pub message: String,
    #[serde(flatten)]
    pub fee: FeeDetails,
}

impl From<FeeDetails> for ConfirmationPayload {
    fn from(fee: FeeDetails) -> Self {
        ConfirmationPayload {
            status: 409,
            requires_confirmation: true,
            message: format!(
                "cancelling {} hours before start carries a {}% fee; resubmit with waive_fee",
                fee.hours_before_start, fee.fee_percentage
            ),
            fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const CHICAGO: Tz = chrono_tz::America::Chicago;

    #[test]
    fn json_body_becomes_request() {
        let body = r#"{
            "facility_id": 1,
            "reservation_type_id": 1,
            "start_time": "2025-06-01T10:00",
            "end_time": "2025-06-01T15:00:00Z",
            "court_ids": [5, 6],
            "participant_ids": [10]
        }"#;
        let form = ReservationForm::from_json(body).unwrap();
        assert_eq!(form.facility_id, 1);
        let request = form.into_request(CHICAGO).unwrap();
        // 10:00 CDT is 15:00 UTC.
        assert_eq!(request.end - request.start, 0);
        assert_eq!(request.court_ids, vec![5, 6]);
        assert_eq!(request.participant_ids, vec![10]);
    }

    #[test]
    fn form_body_accepts_repeated_and_comma_ids() {
        let body = "facility_id=1&reservation_type_id=2&start_time=2025-06-01T10%3A00\
                    &end_time=2025-06-01T11%3A00&court_ids=5&court_ids=6,7&participant_ids%5B%5D=10\
                    &pro_id=&is_open_event=on&utm_source=mail";
        let form = ReservationForm::from_form(body).unwrap();
        assert_eq!(form.court_ids, vec![5, 6, 7]);
        assert_eq!(form.participant_ids, vec![10]);
        assert_eq!(form.pro_id, None);
        assert!(form.is_open_event);
        let request = form.into_request(CHICAGO).unwrap();
        assert_eq!(request.end - request.start, 3_600_000);
    }

    #[test]
    fn missing_and_malformed_fields_are_named() {
        let err = ReservationForm::from_form("facility_id=1&reservation_type_id=1&start_time=x").unwrap_err();
        assert!(matches!(err, SchedulingError::Validation { field: "end_time", .. }));

        let err = ReservationForm::from_form("facility_id=one").unwrap_err();
        assert!(matches!(err, SchedulingError::Validation { field: "facility_id", .. }));

        let form = ReservationForm::from_form(
            "facility_id=1&reservation_type_id=1&start_time=tomorrow&end_time=2025-06-01T11:00",
        )
        .unwrap();
        let err = form.into_request(CHICAGO).unwrap_err();
        assert!(matches!(err, SchedulingError::Validation { field: "start_time", .. }));

        let err = ReservationForm::from_json("{").unwrap_err();
        assert!(matches!(err, SchedulingError::Validation { field: "body", .. }));
    }

    #[test]
    fn cancel_forms() {
        assert_eq!(CancelForm::from_json("").unwrap().waive_fee, None);
        assert_eq!(CancelForm::from_json(r#"{"waive_fee": true}"#).unwrap().waive_fee, Some(true));
        assert_eq!(CancelForm::from_form("waive_fee=false").unwrap().waive_fee, Some(false));
        assert_eq!(CancelForm::from_form("other=1").unwrap().waive_fee, None);
        assert!(CancelForm::from_form("waive_fee=maybe").is_err());
    }

    #[test]
    fn conflict_payload_names_the_court() {
        let payload = ErrorPayload::from(&SchedulingError::Conflict {
            court_id: 5,
            reservation_id: 41,
        });
        assert_eq!(payload.status, 409);
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "error": "conflict",
                "message": "court 5 is already booked by reservation 41 for that time",
                "court_id": 5,
                "reservation_id": 41,
            })
        );
    }

    #[test]
    fn validation_payload_names_the_field() {
        let payload = ErrorPayload::from(&SchedulingError::validation("court_ids", "must not be empty"));
        assert_eq!(payload.status, 400);
        assert_eq!(payload.field, Some("court_ids"));
    }

    #[test]
    fn internal_errors_are_opaque() {
        let payload = ErrorPayload::from(&SchedulingError::Storage("disk full at /var/lib".into()));
        assert_eq!(payload.status, 500);
        assert!(!payload.message.contains("disk"));
        let payload = ErrorPayload::from(&SchedulingError::Timeout("begin transaction"));
        assert_eq!(payload.status, 504);
    }

    #[test]
    fn confirmation_payload_carries_fee() {
        let payload = ConfirmationPayload::from(FeeDetails {
            refund_percentage: 50,
            fee_percentage: 50,
            hours_before_start: 30,
        });
        assert_eq!(payload.status, 409);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["requires_confirmation"], true);
        assert_eq!(value["fee_percentage"], 50);
        assert_eq!(value["hours_before_start"], 30);
    }
}
