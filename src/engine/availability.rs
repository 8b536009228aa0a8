use std::collections::BTreeSet;

use crate::error::SchedulingError;
use crate::limits::MAX_COURTS_PER_RESERVATION;
use crate::model::*;
use crate::store::FacilityState;

use super::Engine;

/// Deduplicate and validate requested courts. Output is ascending.
pub fn normalize_court_ids(court_ids: &[Id]) -> Result<Vec<Id>, SchedulingError> {
    if court_ids.is_empty() {
        return Err(SchedulingError::validation("court_ids", "at least one court is required"));
    }
    if let Some(bad) = court_ids.iter().find(|id| **id <= 0) {
        return Err(SchedulingError::validation(
            "court_ids",
            format!("court id {bad} must be positive"),
        ));
    }
    let unique: BTreeSet<Id> = court_ids.iter().copied().collect();
    if unique.len() > MAX_COURTS_PER_RESERVATION {
        return Err(SchedulingError::LimitExceeded("too many courts in one reservation"));
    }
    Ok(unique.into_iter().collect())
}

/// First committed reservation occupying one of `court_ids` during `span`,
/// as `(court_id, reservation_id)`. Cancelled reservations are not indexed.
pub fn find_conflict(
    state: &FacilityState,
    exclude_reservation_id: Option<Id>,
    span: &Span,
    court_ids: &[Id],
) -> Option<(Id, Id)> {
    court_ids.iter().find_map(|court_id| {
        state
            .court_timeline(*court_id)?
            .overlapping(span)
            .find(|b| Some(b.reservation_id) != exclude_reservation_id)
            .map(|b| (*court_id, b.reservation_id))
    })
}

/// [`find_conflict`] as an error.
pub fn check_courts_free(
    state: &FacilityState,
    exclude_reservation_id: Option<Id>,
    span: &Span,
    court_ids: &[Id],
) -> Result<(), SchedulingError> {
    match find_conflict(state, exclude_reservation_id, span, court_ids) {
        None => Ok(()),
        Some((court_id, reservation_id)) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(SchedulingError::Conflict {
                court_id,
                reservation_id,
            })
        }
    }
}

/// Every requested court exists and is open for booking.
pub(super) fn check_courts_bookable(state: &FacilityState, court_ids: &[Id]) -> Result<(), SchedulingError> {
    for court_id in court_ids {
        let court = state.court(*court_id)?;
        if court.status != CourtStatus::Active {
            return Err(SchedulingError::validation(
                "court_ids",
                format!("court {} is not active", court.number),
            ));
        }
    }
    Ok(())
}

impl Engine {
    /// Standalone availability check. Booking paths call
    /// [`check_courts_free`] inside their own transaction instead.
    pub async fn ensure_available(
        &self,
        facility_id: Id,
        exclude_reservation_id: Option<Id>,
        span: Span,
        court_ids: &[Id],
    ) -> Result<(), SchedulingError> {
        let court_ids = normalize_court_ids(court_ids)?;
        self.read(facility_id, |state| {
            check_courts_free(state, exclude_reservation_id, &span, &court_ids)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn court_ids_are_deduplicated_and_sorted() {
        assert_eq!(normalize_court_ids(&[5, 2, 5, 2]).unwrap(), vec![2, 5]);
    }

    #[test]
    fn non_positive_court_ids_are_rejected() {
        let err = normalize_court_ids(&[3, 0]).unwrap_err();
        assert!(matches!(err, SchedulingError::Validation { field: "court_ids", .. }));
        assert!(normalize_court_ids(&[-1]).is_err());
        assert!(normalize_court_ids(&[]).is_err());
    }

    #[test]
    fn too_many_courts_is_a_limit() {
        let ids: Vec<Id> = (1..=(MAX_COURTS_PER_RESERVATION as Id + 1)).collect();
        assert!(matches!(
            normalize_court_ids(&ids).unwrap_err(),
            SchedulingError::LimitExceeded(_)
        ));
    }
}
