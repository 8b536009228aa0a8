use std::collections::BTreeSet;

use tracing::info;

use crate::error::SchedulingError;
use crate::limits::*;
use crate::model::*;
use crate::slot::Slot;
use crate::store::FacilityState;

use super::availability::{check_courts_bookable, check_courts_free, normalize_court_ids};
use super::cancellation::{
    applicable_refund_percentage, hours_before_start, resolve_cancellation, CancellationInput,
    FeeDetails, Resolution,
};
use super::effects::SideEffect;
use super::{Actor, Engine};

/// A create or update request after boundary parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationRequest {
    pub reservation_type_id: Id,
    pub start: Ms,
    pub end: Ms,
    pub court_ids: Vec<Id>,
    pub participant_ids: Vec<Id>,
    /// Member the booking is for; defaults to the actor.
    pub primary_user_id: Option<Id>,
    pub pro_id: Option<Id>,
    pub open_play_rule_id: Option<Id>,
    pub recurrence_rule: Option<String>,
    pub is_open_event: bool,
    pub teams_per_court: Option<u32>,
    pub people_per_team: Option<u32>,
    /// Lesson package to draw one credit from.
    pub package_id: Option<Id>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingReceipt {
    pub reservation: Reservation,
    /// Post-commit follow-ups that failed. The booking itself stands.
    pub soft_failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancellationReceipt {
    pub cancellation: ReservationCancellation,
    pub soft_failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancellationOutcome {
    Committed(CancellationReceipt),
    /// Nothing was written; ask the caller whether to waive the fee.
    NeedsConfirmation(FeeDetails),
}

struct ValidRequest {
    span: Span,
    court_ids: Vec<Id>,
    participant_ids: BTreeSet<Id>,
}

fn positive(field: &'static str, id: Option<Id>) -> Result<(), SchedulingError> {
    match id {
        Some(id) if id <= 0 => Err(SchedulingError::validation(field, "must be positive")),
        _ => Ok(()),
    }
}

/// Shape checks that need no facility data. Runs before any transaction.
fn validate_request(request: &ReservationRequest) -> Result<ValidRequest, SchedulingError> {
    if request.reservation_type_id <= 0 {
        return Err(SchedulingError::validation("reservation_type_id", "must be positive"));
    }
    let span = Span::try_new(request.start, request.end)
        .ok_or_else(|| SchedulingError::validation("end_time", "must be after start_time"))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(SchedulingError::validation("start_time", "timestamp out of range"));
    }
    if span.duration_ms() > MAX_RESERVATION_DURATION_MS {
        return Err(SchedulingError::validation("end_time", "reservation is too long"));
    }
    let court_ids = normalize_court_ids(&request.court_ids)?;

    if let Some(bad) = request.participant_ids.iter().find(|id| **id <= 0) {
        return Err(SchedulingError::validation(
            "participant_ids",
            format!("participant id {bad} must be positive"),
        ));
    }
    let mut participant_ids: BTreeSet<Id> = request.participant_ids.iter().copied().collect();
    if let Some(primary) = request.primary_user_id {
        participant_ids.insert(primary);
    }
    if participant_ids.len() > MAX_PARTICIPANTS_PER_RESERVATION {
        return Err(SchedulingError::LimitExceeded("too many participants"));
    }

    positive("primary_user_id", request.primary_user_id)?;
    positive("pro_id", request.pro_id)?;
    positive("open_play_rule_id", request.open_play_rule_id)?;
    positive("package_id", request.package_id)?;
    if request
        .recurrence_rule
        .as_ref()
        .is_some_and(|r| r.len() > MAX_RECURRENCE_RULE_LEN)
    {
        return Err(SchedulingError::validation("recurrence_rule", "too long"));
    }
    if request.teams_per_court == Some(0) {
        return Err(SchedulingError::validation("teams_per_court", "must be positive"));
    }
    if request.people_per_team == Some(0) {
        return Err(SchedulingError::validation("people_per_team", "must be positive"));
    }
    Ok(ValidRequest {
        span,
        court_ids,
        participant_ids,
    })
}

/// Limits that apply when a member books without staff involvement.
fn check_member_limits(
    state: &FacilityState,
    actor: &Actor,
    request: &ReservationRequest,
    span: &Span,
    now: Ms,
    counts_toward_limit: bool,
) -> Result<(), SchedulingError> {
    if request.primary_user_id.is_some_and(|p| p != actor.user_id) {
        return Err(SchedulingError::Forbidden("members may only book for themselves"));
    }
    if span.start < now {
        return Err(SchedulingError::validation("start_time", "must not be in the past"));
    }
    if let Some(days) = state
        .facility
        .advance_days_for(actor.membership_level.as_deref())
        && span.start > now + Ms::from(days) * DAY_MS
    {
        return Err(SchedulingError::LimitExceeded("beyond the advance booking window"));
    }
    if counts_toward_limit
        && let Some(max) = state.facility.max_member_reservations
        && state.upcoming_reservations_of(actor.user_id, now) >= max as usize
    {
        return Err(SchedulingError::LimitExceeded("member reservation limit reached"));
    }
    Ok(())
}

fn check_references(state: &FacilityState, request: &ReservationRequest) -> Result<ReservationType, SchedulingError> {
    let reservation_type = state.reservation_type(request.reservation_type_id)?.clone();
    if let Some(rule_id) = request.open_play_rule_id {
        state.rule(rule_id)?;
    }
    if request.package_id.is_some() && !reservation_type.is_lesson() {
        return Err(SchedulingError::validation(
            "package_id",
            "only lessons can draw on a lesson package",
        ));
    }
    Ok(reservation_type)
}

/// The package after one credit is drawn for `owner_id`.
fn draw_credit(state: &FacilityState, package_id: Id, owner_id: Id) -> Result<LessonPackage, SchedulingError> {
    let package = state.package(package_id)?;
    if package.user_id != owner_id {
        return Err(SchedulingError::Forbidden("lesson package belongs to another member"));
    }
    let remaining_credits = package
        .remaining_credits
        .checked_sub(1)
        .ok_or(SchedulingError::LimitExceeded("lesson package has no credits left"))?;
    Ok(LessonPackage {
        remaining_credits,
        ..package.clone()
    })
}

fn describe(span: &Span, tz: chrono_tz::Tz) -> String {
    match Slot::from_span(span, tz) {
        Some(slot) => format!(
            "{} {}-{}",
            slot.date,
            slot.start_time.format("%H:%M"),
            slot.end_time.format("%H:%M")
        ),
        None => format!("{} to {}", local_minute(span.start, tz), local_minute(span.end, tz)),
    }
}

fn local_minute(ms: Ms, tz: chrono_tz::Tz) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|utc| utc.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

impl Engine {
    pub async fn create_reservation(
        &self,
        actor: &Actor,
        facility_id: Id,
        request: ReservationRequest,
    ) -> Result<BookingReceipt, SchedulingError> {
        let valid = validate_request(&request)?;
        let now = self.now();

        let mut tx = self.begin(facility_id).await?;
        let state = tx.state();
        let reservation_type = check_references(state, &request)?;
        check_courts_bookable(state, &valid.court_ids)?;
        if !actor.is_staff() {
            check_member_limits(state, actor, &request, &valid.span, now, true)?;
        }
        let owner_id = request.primary_user_id.unwrap_or(actor.user_id);
        let drawn = match request.package_id {
            Some(package_id) => Some(draw_credit(state, package_id, owner_id)?),
            None => None,
        };
        check_courts_free(state, None, &valid.span, &valid.court_ids)?;
        let tz = state.timezone()?;

        if let Some(package) = drawn {
            tx.stage(Event::PackageUpserted { package });
        }
        let reservation = Reservation {
            id: tx.next_id(),
            reservation_type_id: request.reservation_type_id,
            recurrence_rule: request.recurrence_rule,
            primary_user_id: request.primary_user_id,
            created_by: actor.user_id,
            pro_id: request.pro_id,
            open_play_rule_id: request.open_play_rule_id,
            span: valid.span,
            is_open_event: request.is_open_event,
            teams_per_court: request.teams_per_court,
            people_per_team: request.people_per_team,
            package_id: request.package_id,
            court_ids: valid.court_ids.into_iter().collect(),
            participant_ids: valid.participant_ids,
            created_at: now,
            cancelled: false,
        };
        tx.stage(Event::ReservationCreated {
            reservation: reservation.clone(),
        });
        tx.commit().await?;
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "op" => "create").increment(1);
        info!(facility_id, reservation_id = reservation.id, "reservation created");

        let mut effects = Vec::new();
        if reservation_type.is_lesson()
            && let Some(pro_id) = reservation.pro_id
        {
            effects.push(SideEffect::NotifyPro {
                pro_id,
                message: format!("New {} booked for {}", reservation_type.name, describe(&reservation.span, tz)),
            });
        }
        let soft_failures = self.run_side_effects(facility_id, effects).await;
        Ok(BookingReceipt {
            reservation,
            soft_failures,
        })
    }

    /// Replace a reservation's details. Courts it no longer holds, at the
    /// old time, are offered to the waitlist after commit.
    pub async fn update_reservation(
        &self,
        actor: &Actor,
        facility_id: Id,
        reservation_id: Id,
        request: ReservationRequest,
    ) -> Result<BookingReceipt, SchedulingError> {
        let valid = validate_request(&request)?;
        let now = self.now();

        let mut tx = self.begin(facility_id).await?;
        let state = tx.state();
        let existing = state.live_reservation(reservation_id)?.clone();
        if !actor.is_staff() && !existing.is_managed_by(actor.user_id) {
            return Err(SchedulingError::Forbidden("only the booker or staff may change a reservation"));
        }
        check_references(state, &request)?;
        if request.package_id != existing.package_id {
            return Err(SchedulingError::validation(
                "package_id",
                "cannot change on an existing reservation",
            ));
        }
        check_courts_bookable(state, &valid.court_ids)?;
        if !actor.is_staff() {
            check_member_limits(state, actor, &request, &valid.span, now, false)?;
        }
        check_courts_free(state, Some(reservation_id), &valid.span, &valid.court_ids)?;

        let updated = Reservation {
            reservation_type_id: request.reservation_type_id,
            recurrence_rule: request.recurrence_rule,
            primary_user_id: request.primary_user_id,
            pro_id: request.pro_id,
            open_play_rule_id: request.open_play_rule_id,
            span: valid.span,
            is_open_event: request.is_open_event,
            teams_per_court: request.teams_per_court,
            people_per_team: request.people_per_team,
            court_ids: valid.court_ids.into_iter().collect(),
            participant_ids: valid.participant_ids,
            ..existing.clone()
        };
        let freed: Vec<Id> = if updated.span == existing.span {
            existing.court_ids.difference(&updated.court_ids).copied().collect()
        } else {
            existing.court_ids.iter().copied().collect()
        };
        tx.stage(Event::ReservationUpdated {
            reservation: updated.clone(),
        });
        tx.commit().await?;
        metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "op" => "update").increment(1);
        info!(facility_id, reservation_id, "reservation updated");

        let effects = if freed.is_empty() {
            Vec::new()
        } else {
            vec![SideEffect::NotifyWaitlist {
                reservation: existing,
                court_ids: freed,
            }]
        };
        let soft_failures = self.run_side_effects(facility_id, effects).await;
        Ok(BookingReceipt {
            reservation: updated,
            soft_failures,
        })
    }

    /// Cancel a reservation.
    ///
    /// `waive_fee` is the caller's answer to a previous
    /// [`CancellationOutcome::NeedsConfirmation`]; `None` means unanswered.
    pub async fn cancel_reservation(
        &self,
        actor: &Actor,
        facility_id: Id,
        reservation_id: Id,
        waive_fee: Option<bool>,
    ) -> Result<CancellationOutcome, SchedulingError> {
        let now = self.now();

        let mut tx = self.begin(facility_id).await?;
        let state = tx.state();
        let reservation = state.live_reservation(reservation_id)?.clone();
        if !actor.is_staff() && !reservation.is_managed_by(actor.user_id) {
            return Err(SchedulingError::Forbidden("only the booker or staff may cancel a reservation"));
        }
        let reservation_type = state.reservation_type(reservation.reservation_type_id).ok().cloned();
        let hours = hours_before_start(reservation.span.start, now);
        let refund = applicable_refund_percentage(state.tiers.values(), hours, reservation.reservation_type_id);
        let (refund_percentage, fee_waived) = match resolve_cancellation(
            CancellationInput {
                refund_percentage: refund,
                hours_before_start: hours,
                is_staff: actor.is_staff(),
            },
            waive_fee,
        )? {
            Resolution::NeedsConfirmation(details) => {
                return Ok(CancellationOutcome::NeedsConfirmation(details));
            }
            Resolution::Proceed {
                refund_percentage,
                fee_waived,
            } => (refund_percentage, fee_waived),
        };
        let tz = state.timezone()?;
        let restored = reservation
            .package_id
            .and_then(|id| state.packages.get(&id))
            .map(|p| LessonPackage {
                remaining_credits: p.remaining_credits.saturating_add(1),
                ..p.clone()
            });

        let cancellation = ReservationCancellation {
            id: tx.next_id(),
            reservation_id,
            cancelled_by: actor.user_id,
            cancelled_at: now,
            refund_percentage,
            fee_waived,
            hours_before_start: hours,
        };
        tx.stage(Event::ReservationCancelled {
            cancellation: cancellation.clone(),
        });
        if let Some(package) = restored {
            tx.stage(Event::PackageUpserted { package });
        }
        tx.commit().await?;
        metrics::counter!(crate::observability::CANCELLATIONS_TOTAL).increment(1);
        info!(
            facility_id,
            reservation_id, refund_percentage, fee_waived, "reservation cancelled"
        );

        let when = describe(&reservation.span, tz);
        let mut recipients: BTreeSet<Id> = reservation.participant_ids.clone();
        recipients.insert(reservation.owner_id());
        recipients.remove(&actor.user_id);

        let mut effects = vec![SideEffect::NotifyWaitlist {
            court_ids: reservation.court_ids.iter().copied().collect(),
            reservation: reservation.clone(),
        }];
        if !recipients.is_empty() {
            effects.push(SideEffect::CancellationEmail {
                recipient_ids: recipients.into_iter().collect(),
                message: format!("Your reservation on {when} has been cancelled. Refund: {refund_percentage}%."),
            });
        }
        if let Some(rt) = reservation_type.filter(|rt| rt.is_lesson())
            && let Some(pro_id) = reservation.pro_id
        {
            effects.push(SideEffect::NotifyPro {
                pro_id,
                message: format!("{} on {when} has been cancelled", rt.name),
            });
        }
        let soft_failures = self.run_side_effects(facility_id, effects).await;
        Ok(CancellationOutcome::Committed(CancellationReceipt {
            cancellation,
            soft_failures,
        }))
    }
}
