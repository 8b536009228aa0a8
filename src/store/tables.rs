use std::collections::BTreeMap;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::SchedulingError;
use crate::model::*;
use crate::slot::parse_timezone;

use super::timeline::CourtTimeline;

/// Every table of one facility. Mutated only through [`FacilityState::apply`],
/// so replaying a log reproduces the live state exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityState {
    pub facility: Facility,
    /// Highest id handed out so far; ids are never reused.
    pub last_id: Id,
    pub courts: BTreeMap<Id, Court>,
    pub reservation_types: BTreeMap<Id, ReservationType>,
    pub packages: BTreeMap<Id, LessonPackage>,
    pub reservations: BTreeMap<Id, Reservation>,
    pub cancellations: Vec<ReservationCancellation>,
    pub tiers: BTreeMap<Id, CancellationPolicyTier>,
    pub waitlist_config: Option<WaitlistConfig>,
    pub waitlists: BTreeMap<Id, WaitlistEntry>,
    pub offers: BTreeMap<Id, WaitlistOffer>,
    pub rules: BTreeMap<Id, OpenPlayRule>,
    pub sessions: BTreeMap<Id, OpenPlaySession>,
    pub audit_log: Vec<OpenPlayAuditLog>,
    #[serde(skip)]
    court_timelines: BTreeMap<Id, CourtTimeline>,
}

impl FacilityState {
    fn provisioned(facility: &Facility) -> Self {
        let mut state = Self {
            facility: facility.clone(),
            last_id: 0,
            courts: BTreeMap::new(),
            reservation_types: BTreeMap::new(),
            packages: BTreeMap::new(),
            reservations: BTreeMap::new(),
            cancellations: Vec::new(),
            tiers: BTreeMap::new(),
            waitlist_config: None,
            waitlists: BTreeMap::new(),
            offers: BTreeMap::new(),
            rules: BTreeMap::new(),
            sessions: BTreeMap::new(),
            audit_log: Vec::new(),
            court_timelines: BTreeMap::new(),
        };
        for rt in system_reservation_types() {
            state.last_id = state.last_id.max(rt.id);
            state.reservation_types.insert(rt.id, rt);
        }
        state
    }

    /// Rebuild from a replayed log. The first record must be the
    /// provisioning record or a compaction snapshot.
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let (first, rest) = events.split_first()?;
        let mut state = match first {
            Event::FacilityProvisioned { facility } => Self::provisioned(facility),
            Event::Snapshot { state } => {
                let mut s = (**state).clone();
                s.rebuild_indexes();
                s
            }
            _ => return None,
        };
        for event in rest {
            state.apply(event);
        }
        Some(state)
    }

    /// Recompute the per-court timelines from the reservation table.
    pub fn rebuild_indexes(&mut self) {
        self.court_timelines.clear();
        for r in self.reservations.values().filter(|r| !r.cancelled) {
            for court_id in &r.court_ids {
                self.court_timelines
                    .entry(*court_id)
                    .or_default()
                    .insert(r.id, r.span);
            }
        }
    }

    /// Apply a committed (or staged) event. Caller holds the write lock.
    pub fn apply(&mut self, event: &Event) {
        if let Some(id) = event_row_id(event) {
            self.last_id = self.last_id.max(id);
        }
        match event {
            Event::FacilityProvisioned { facility } | Event::FacilityUpdated { facility } => {
                self.facility = facility.clone();
            }
            Event::CourtUpserted { court } => {
                self.courts.insert(court.id, court.clone());
            }
            Event::ReservationTypeAdded { reservation_type } => {
                self.reservation_types
                    .insert(reservation_type.id, reservation_type.clone());
            }
            Event::ReservationTypeRemoved { id } => {
                self.reservation_types.remove(id);
            }
            Event::PackageUpserted { package } => {
                self.packages.insert(package.id, package.clone());
            }
            Event::ReservationCreated { reservation } => {
                for court_id in &reservation.court_ids {
                    self.court_timelines
                        .entry(*court_id)
                        .or_default()
                        .insert(reservation.id, reservation.span);
                }
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationUpdated { reservation } => {
                if let Some(old) = self.reservations.get(&reservation.id) {
                    let span_moved = old.span != reservation.span;
                    for court_id in &old.court_ids {
                        if span_moved || !reservation.court_ids.contains(court_id) {
                            if let Some(t) = self.court_timelines.get_mut(court_id) {
                                t.remove(reservation.id);
                            }
                        }
                    }
                    for court_id in &reservation.court_ids {
                        if span_moved || !old.court_ids.contains(court_id) {
                            self.court_timelines
                                .entry(*court_id)
                                .or_default()
                                .insert(reservation.id, reservation.span);
                        }
                    }
                }
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationCancelled { cancellation } => {
                if let Some(r) = self.reservations.get_mut(&cancellation.reservation_id) {
                    for court_id in &r.court_ids {
                        if let Some(t) = self.court_timelines.get_mut(court_id) {
                            t.remove(r.id);
                        }
                    }
                    r.cancelled = true;
                    r.court_ids.clear();
                    r.participant_ids.clear();
                }
                self.cancellations.push(cancellation.clone());
            }
            Event::TierUpserted { tier } => {
                self.tiers.insert(tier.id, tier.clone());
            }
            Event::TierRemoved { id } => {
                self.tiers.remove(id);
            }
            Event::WaitlistConfigured { config } => {
                self.waitlist_config = Some(config.clone());
            }
            Event::WaitlistJoined { entry } => {
                self.waitlists.insert(entry.id, entry.clone());
            }
            Event::WaitlistStatusChanged { id, status } => {
                if let Some(entry) = self.waitlists.get_mut(id) {
                    entry.status = *status;
                }
            }
            Event::OfferCreated { offer } => {
                self.offers.insert(offer.id, offer.clone());
            }
            Event::OfferStatusChanged { id, status } => {
                if let Some(offer) = self.offers.get_mut(id) {
                    offer.status = *status;
                }
            }
            Event::RuleUpserted { rule } => {
                self.rules.insert(rule.id, rule.clone());
            }
            Event::SessionUpserted { session } => {
                self.sessions.insert(session.id, session.clone());
            }
            Event::AuditAppended { entry } => {
                self.audit_log.push(entry.clone());
            }
            Event::Snapshot { state } => {
                *self = (**state).clone();
                self.rebuild_indexes();
            }
        }
    }

    // ── Lookups ──────────────────────────────────────────

    pub fn timezone(&self) -> Result<Tz, SchedulingError> {
        parse_timezone(&self.facility.timezone)
    }

    pub fn court_timeline(&self, court_id: Id) -> Option<&CourtTimeline> {
        self.court_timelines.get(&court_id)
    }

    pub fn court(&self, id: Id) -> Result<&Court, SchedulingError> {
        self.courts
            .get(&id)
            .ok_or(SchedulingError::not_found("court", id))
    }

    pub fn reservation_type(&self, id: Id) -> Result<&ReservationType, SchedulingError> {
        self.reservation_types
            .get(&id)
            .ok_or(SchedulingError::not_found("reservation type", id))
    }

    /// A reservation that exists and has not been cancelled.
    pub fn live_reservation(&self, id: Id) -> Result<&Reservation, SchedulingError> {
        self.reservations
            .get(&id)
            .filter(|r| !r.cancelled)
            .ok_or(SchedulingError::not_found("reservation", id))
    }

    pub fn rule(&self, id: Id) -> Result<&OpenPlayRule, SchedulingError> {
        self.rules
            .get(&id)
            .ok_or(SchedulingError::not_found("open play rule", id))
    }

    pub fn session(&self, id: Id) -> Result<&OpenPlaySession, SchedulingError> {
        self.sessions
            .get(&id)
            .ok_or(SchedulingError::not_found("open play session", id))
    }

    pub fn package(&self, id: Id) -> Result<&LessonPackage, SchedulingError> {
        self.packages
            .get(&id)
            .ok_or(SchedulingError::not_found("lesson package", id))
    }

    /// Non-cancelled reservations owned by `user_id` that have not ended yet.
    pub fn upcoming_reservations_of(&self, user_id: Id, now: Ms) -> usize {
        self.reservations
            .values()
            .filter(|r| !r.cancelled && r.owner_id() == user_id && r.span.end > now)
            .count()
    }

    pub fn cancellations_for(&self, reservation_id: Id) -> impl Iterator<Item = &ReservationCancellation> {
        self.cancellations
            .iter()
            .filter(move |c| c.reservation_id == reservation_id)
    }

    pub fn waitlist_config(&self) -> WaitlistConfig {
        self.waitlist_config.clone().unwrap_or_default()
    }
}

/// The id of the row an event creates, used to keep `last_id` ahead of
/// everything already in the log.
fn event_row_id(event: &Event) -> Option<Id> {
    match event {
        Event::CourtUpserted { court } => Some(court.id),
        Event::ReservationTypeAdded { reservation_type } => Some(reservation_type.id),
        Event::PackageUpserted { package } => Some(package.id),
        Event::ReservationCreated { reservation } => Some(reservation.id),
        Event::ReservationCancelled { cancellation } => Some(cancellation.id),
        Event::TierUpserted { tier } => Some(tier.id),
        Event::WaitlistJoined { entry } => Some(entry.id),
        Event::OfferCreated { offer } => Some(offer.id),
        Event::RuleUpserted { rule } => Some(rule.id),
        Event::SessionUpserted { session } => Some(session.id),
        Event::AuditAppended { entry } => Some(entry.id),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn reservation(id: Id, courts: &[Id], start: Ms, end: Ms) -> Reservation {
        Reservation {
            id,
            reservation_type_id: 1,
            recurrence_rule: None,
            primary_user_id: None,
            created_by: 100,
            pro_id: None,
            open_play_rule_id: None,
            span: Span::new(start, end),
            is_open_event: false,
            teams_per_court: None,
            people_per_team: None,
            package_id: None,
            court_ids: courts.iter().copied().collect(),
            participant_ids: BTreeSet::from([100]),
            created_at: 0,
            cancelled: false,
        }
    }

    fn provisioned() -> FacilityState {
        FacilityState::from_events(&[Event::FacilityProvisioned {
            facility: Facility::new(1, "Club", "UTC"),
        }])
        .unwrap()
    }

    #[test]
    fn provisioning_seeds_system_types() {
        let state = provisioned();
        assert_eq!(state.reservation_types.len(), 5);
        assert_eq!(state.last_id, 5);
    }

    #[test]
    fn log_must_start_with_provisioning() {
        assert!(FacilityState::from_events(&[]).is_none());
        assert!(FacilityState::from_events(&[Event::TierRemoved { id: 1 }]).is_none());
    }

    #[test]
    fn created_reservation_lands_on_every_court_timeline() {
        let mut state = provisioned();
        state.apply(&Event::ReservationCreated {
            reservation: reservation(10, &[5, 6], 0, 100),
        });
        assert_eq!(state.court_timeline(5).unwrap().len(), 1);
        assert_eq!(state.court_timeline(6).unwrap().len(), 1);
        assert_eq!(state.last_id, 10);
    }

    #[test]
    fn update_reconciles_courts() {
        let mut state = provisioned();
        state.apply(&Event::ReservationCreated {
            reservation: reservation(10, &[5, 6], 0, 100),
        });
        state.apply(&Event::ReservationUpdated {
            reservation: reservation(10, &[6, 7], 0, 100),
        });
        assert!(state.court_timeline(5).unwrap().is_empty());
        assert_eq!(state.court_timeline(6).unwrap().len(), 1);
        assert_eq!(state.court_timeline(7).unwrap().len(), 1);
    }

    #[test]
    fn update_moving_span_reindexes_kept_courts() {
        let mut state = provisioned();
        state.apply(&Event::ReservationCreated {
            reservation: reservation(10, &[5], 0, 100),
        });
        state.apply(&Event::ReservationUpdated {
            reservation: reservation(10, &[5], 500, 600),
        });
        let timeline = state.court_timeline(5).unwrap();
        assert_eq!(timeline.overlapping(&Span::new(0, 100)).count(), 0);
        assert_eq!(timeline.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn cancellation_detaches_and_records() {
        let mut state = provisioned();
        state.apply(&Event::ReservationCreated {
            reservation: reservation(10, &[5], 0, 100),
        });
        state.apply(&Event::ReservationCancelled {
            cancellation: ReservationCancellation {
                id: 11,
                reservation_id: 10,
                cancelled_by: 100,
                cancelled_at: 0,
                refund_percentage: 100,
                fee_waived: false,
                hours_before_start: 0,
            },
        });
        let r = &state.reservations[&10];
        assert!(r.cancelled);
        assert!(r.court_ids.is_empty());
        assert!(r.participant_ids.is_empty());
        assert!(state.court_timeline(5).unwrap().is_empty());
        assert!(state.live_reservation(10).is_err());
        assert_eq!(state.cancellations_for(10).count(), 1);
    }

    #[test]
    fn snapshot_restores_tables_and_indexes() {
        let mut state = provisioned();
        state.apply(&Event::ReservationCreated {
            reservation: reservation(10, &[5], 0, 100),
        });
        let bytes = bincode::serialize(&Event::Snapshot {
            state: Box::new(state.clone()),
        })
        .unwrap();
        let snapshot: Event = bincode::deserialize(&bytes).unwrap();

        let restored = FacilityState::from_events(&[snapshot]).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.court_timeline(5).unwrap().len(), 1);
    }
}
