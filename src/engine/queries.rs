use crate::error::SchedulingError;
use crate::model::*;

use super::Engine;

impl Engine {
    pub async fn facility(&self, facility_id: Id) -> Result<Facility, SchedulingError> {
        self.read(facility_id, |state| state.facility.clone()).await
    }

    pub async fn courts(&self, facility_id: Id) -> Result<Vec<Court>, SchedulingError> {
        self.read(facility_id, |state| state.courts.values().cloned().collect())
            .await
    }

    /// A reservation by id, cancelled or not.
    pub async fn reservation(&self, facility_id: Id, reservation_id: Id) -> Result<Reservation, SchedulingError> {
        self.read(facility_id, |state| {
            state
                .reservations
                .get(&reservation_id)
                .cloned()
                .ok_or(SchedulingError::not_found("reservation", reservation_id))
        })
        .await?
    }

    /// Live reservations overlapping `window`, by start time.
    pub async fn reservations_between(&self, facility_id: Id, window: Span) -> Result<Vec<Reservation>, SchedulingError> {
        self.read(facility_id, |state| {
            let mut hits: Vec<Reservation> = state
                .reservations
                .values()
                .filter(|r| !r.cancelled && r.span.overlaps(&window))
                .cloned()
                .collect();
            hits.sort_by_key(|r| (r.span.start, r.id));
            hits
        })
        .await
    }

    pub async fn cancellations(
        &self,
        facility_id: Id,
        reservation_id: Id,
    ) -> Result<Vec<ReservationCancellation>, SchedulingError> {
        self.read(facility_id, |state| state.cancellations_for(reservation_id).cloned().collect())
            .await
    }

    pub async fn offers_for_entry(&self, facility_id: Id, waitlist_id: Id) -> Result<Vec<WaitlistOffer>, SchedulingError> {
        self.read(facility_id, |state| {
            state
                .offers
                .values()
                .filter(|o| o.waitlist_id == waitlist_id)
                .cloned()
                .collect()
        })
        .await
    }

    pub async fn session(&self, facility_id: Id, session_id: Id) -> Result<OpenPlaySession, SchedulingError> {
        self.read(facility_id, |state| state.session(session_id).cloned())
            .await?
    }

    pub async fn rule(&self, facility_id: Id, rule_id: Id) -> Result<OpenPlayRule, SchedulingError> {
        self.read(facility_id, |state| state.rule(rule_id).cloned()).await?
    }

    pub async fn package(&self, facility_id: Id, package_id: Id) -> Result<LessonPackage, SchedulingError> {
        self.read(facility_id, |state| state.package(package_id).cloned())
            .await?
    }
}
