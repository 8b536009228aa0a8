use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::slot::Slot;
use crate::store::FacilityState;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Row identifier. Allocated per facility by the store; always positive.
pub type Id = i64;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;
pub const DAY_MS: Ms = 24 * HOUR_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Facility reference data ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Id,
    pub name: String,
    /// IANA zone name, e.g. `America/Chicago`.
    pub timezone: String,
    pub max_advance_booking_days: Option<u32>,
    pub max_member_reservations: Option<u32>,
    /// Gates `tier_advance_days`.
    pub tier_overrides_enabled: bool,
    /// membership level → max advance days
    pub tier_advance_days: BTreeMap<String, u32>,
}

impl Facility {
    pub fn new(id: Id, name: impl Into<String>, timezone: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            timezone: timezone.into(),
            max_advance_booking_days: None,
            max_member_reservations: None,
            tier_overrides_enabled: false,
            tier_advance_days: BTreeMap::new(),
        }
    }

    /// Advance window for a member, honouring the per-tier table when enabled.
    pub fn advance_days_for(&self, membership_level: Option<&str>) -> Option<u32> {
        if self.tier_overrides_enabled
            && let Some(days) = membership_level.and_then(|l| self.tier_advance_days.get(l))
        {
            return Some(*days);
        }
        self.max_advance_booking_days
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CourtStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: Id,
    pub number: u32,
    pub status: CourtStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationKind {
    Game,
    ProSession,
    OpenPlay,
    League,
    Clinic,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationType {
    pub id: Id,
    pub name: String,
    pub kind: ReservationKind,
    /// Seeded at provisioning; cannot be removed.
    pub is_system: bool,
}

impl ReservationType {
    /// Lesson types consume package credits and notify their pro.
    pub fn is_lesson(&self) -> bool {
        matches!(self.kind, ReservationKind::ProSession | ReservationKind::Clinic)
    }
}

/// The catalog every facility starts with, ids 1..=5.
pub fn system_reservation_types() -> Vec<ReservationType> {
    [
        ("GAME", ReservationKind::Game),
        ("PRO_SESSION", ReservationKind::ProSession),
        ("OPEN_PLAY", ReservationKind::OpenPlay),
        ("LEAGUE", ReservationKind::League),
        ("CLINIC", ReservationKind::Clinic),
    ]
    .into_iter()
    .zip(1..)
    .map(|((name, kind), id)| ReservationType {
        id,
        name: name.to_string(),
        kind,
        is_system: true,
    })
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonPackage {
    pub id: Id,
    pub user_id: Id,
    pub remaining_credits: u32,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Id,
    pub reservation_type_id: Id,
    pub recurrence_rule: Option<String>,
    pub primary_user_id: Option<Id>,
    pub created_by: Id,
    pub pro_id: Option<Id>,
    pub open_play_rule_id: Option<Id>,
    pub span: Span,
    pub is_open_event: bool,
    pub teams_per_court: Option<u32>,
    pub people_per_team: Option<u32>,
    pub package_id: Option<Id>,
    pub court_ids: BTreeSet<Id>,
    pub participant_ids: BTreeSet<Id>,
    pub created_at: Ms,
    pub cancelled: bool,
}

impl Reservation {
    /// Member the reservation counts against.
    pub fn owner_id(&self) -> Id {
        self.primary_user_id.unwrap_or(self.created_by)
    }

    pub fn is_managed_by(&self, user_id: Id) -> bool {
        self.created_by == user_id || self.primary_user_id == Some(user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationCancellation {
    pub id: Id,
    pub reservation_id: Id,
    pub cancelled_by: Id,
    pub cancelled_at: Ms,
    pub refund_percentage: u8,
    pub fee_waived: bool,
    /// Whole hours between cancellation and start, floored at zero.
    pub hours_before_start: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPolicyTier {
    pub id: Id,
    /// `None` is the facility default.
    pub reservation_type_id: Option<Id>,
    pub min_hours_before: u32,
    pub refund_percentage: u8,
}

// ── Waitlist ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Pending,
    Notified,
    Expired,
    Fulfilled,
}

impl WaitlistStatus {
    pub fn is_active(self) -> bool {
        matches!(self, WaitlistStatus::Pending | WaitlistStatus::Notified)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Id,
    pub user_id: Id,
    /// `None` accepts any court.
    pub court_id: Option<Id>,
    pub slot: Slot,
    pub position: u32,
    pub status: WaitlistStatus,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfferStatus {
    Pending,
    Accepted,
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistOffer {
    pub id: Id,
    pub waitlist_id: Id,
    pub offered_at: Ms,
    pub expires_at: Ms,
    pub status: OfferStatus,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationMode {
    #[default]
    Broadcast,
    Sequential,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistConfig {
    /// Active entries allowed per slot scope; 0 means unlimited.
    pub max_waitlist_size: u32,
    pub notification_mode: NotificationMode,
    /// 0 falls back to the default expiry.
    pub offer_expiry_minutes: u32,
    /// 0 disables the window restriction.
    pub notification_window_minutes: u32,
}

// ── Open play ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPlayRule {
    pub id: Id,
    pub name: String,
    pub min_participants: i32,
    pub max_participants_per_court: i32,
    pub cancellation_cutoff_minutes: i32,
    pub auto_scale_enabled: bool,
    pub min_courts: i32,
    pub max_courts: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    Scheduled,
    Cancelled,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPlaySession {
    pub id: Id,
    pub rule_id: Id,
    pub span: Span,
    pub status: SessionStatus,
    pub current_court_count: u32,
    /// Unset inherits the rule's `auto_scale_enabled`.
    pub auto_scale_override: Option<bool>,
    pub cancelled_at: Option<Ms>,
    pub cancellation_reason: Option<String>,
}

impl OpenPlaySession {
    pub fn effective_auto_scale(&self, rule: &OpenPlayRule) -> bool {
        self.auto_scale_override.unwrap_or(rule.auto_scale_enabled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    AutoScaleOverride,
    RuleAutoScaleDisabled,
    CourtsScaled,
    SessionCancelled,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::AutoScaleOverride => "auto_scale_override",
            AuditAction::RuleAutoScaleDisabled => "rule_auto_scale_disabled",
            AuditAction::CourtsScaled => "courts_scaled",
            AuditAction::SessionCancelled => "session_cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenPlayAuditLog {
    pub id: Id,
    pub session_id: Id,
    pub action: AuditAction,
    /// JSON text.
    pub before: String,
    /// JSON text.
    pub after: String,
    pub reason: Option<String>,
    pub created_at: Ms,
}

/// WAL record format. One facility log holds only that facility's events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    FacilityProvisioned { facility: Facility },
    FacilityUpdated { facility: Facility },
    CourtUpserted { court: Court },
    ReservationTypeAdded { reservation_type: ReservationType },
    ReservationTypeRemoved { id: Id },
    PackageUpserted { package: LessonPackage },
    ReservationCreated { reservation: Reservation },
    /// Full replacement; courts and participants are reconciled by set difference.
    ReservationUpdated { reservation: Reservation },
    /// Marks the reservation cancelled and detaches its courts and participants.
    ReservationCancelled { cancellation: ReservationCancellation },
    TierUpserted { tier: CancellationPolicyTier },
    TierRemoved { id: Id },
    WaitlistConfigured { config: WaitlistConfig },
    WaitlistJoined { entry: WaitlistEntry },
    WaitlistStatusChanged { id: Id, status: WaitlistStatus },
    OfferCreated { offer: WaitlistOffer },
    OfferStatusChanged { id: Id, status: OfferStatus },
    RuleUpserted { rule: OpenPlayRule },
    SessionUpserted { session: OpenPlaySession },
    AuditAppended { entry: OpenPlayAuditLog },
    /// Written by compaction; replaces everything before it.
    Snapshot { state: Box<FacilityState> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_is_half_open() {
        let ten = 10 * HOUR_MS;
        let eleven = 11 * HOUR_MS;
        let a = Span::new(ten, eleven);
        let back_to_back = Span::new(eleven, 12 * HOUR_MS);
        let half_past = Span::new(ten + 30 * MINUTE_MS, eleven + 30 * MINUTE_MS);
        assert!(!a.overlaps(&back_to_back));
        assert!(!back_to_back.overlaps(&a));
        assert!(a.overlaps(&half_past));
        assert!(half_past.overlaps(&a));
        assert!(a.overlaps(&a));
    }

    #[test]
    fn span_try_new_rejects_empty_and_inverted() {
        assert!(Span::try_new(5, 5).is_none());
        assert!(Span::try_new(6, 5).is_none());
        assert_eq!(Span::try_new(5, 6), Some(Span::new(5, 6)));
    }

    #[test]
    fn system_types_are_seeded_in_order() {
        let types = system_reservation_types();
        let names: Vec<_> = types.iter().map(|t| (t.id, t.name.as_str())).collect();
        assert_eq!(
            names,
            vec![
                (1, "GAME"),
                (2, "PRO_SESSION"),
                (3, "OPEN_PLAY"),
                (4, "LEAGUE"),
                (5, "CLINIC")
            ]
        );
        assert!(types.iter().all(|t| t.is_system));
        assert!(types[1].is_lesson());
        assert!(types[4].is_lesson());
        assert!(!types[0].is_lesson());
    }

    #[test]
    fn advance_days_prefers_tier_override_only_when_enabled() {
        let mut facility = Facility::new(1, "Club", "UTC");
        facility.max_advance_booking_days = Some(7);
        facility.tier_advance_days.insert("gold".into(), 14);

        assert_eq!(facility.advance_days_for(Some("gold")), Some(7));
        facility.tier_overrides_enabled = true;
        assert_eq!(facility.advance_days_for(Some("gold")), Some(14));
        assert_eq!(facility.advance_days_for(Some("silver")), Some(7));
        assert_eq!(facility.advance_days_for(None), Some(7));
    }

    #[test]
    fn effective_auto_scale_inherits_rule_default() {
        let rule = OpenPlayRule {
            id: 1,
            name: "Drop-in".into(),
            min_participants: 4,
            max_participants_per_court: 4,
            cancellation_cutoff_minutes: 60,
            auto_scale_enabled: true,
            min_courts: 1,
            max_courts: 3,
        };
        let mut session = OpenPlaySession {
            id: 2,
            rule_id: 1,
            span: Span::new(0, HOUR_MS),
            status: SessionStatus::Scheduled,
            current_court_count: 1,
            auto_scale_override: None,
            cancelled_at: None,
            cancellation_reason: None,
        };
        assert!(session.effective_auto_scale(&rule));
        session.auto_scale_override = Some(false);
        assert!(!session.effective_auto_scale(&rule));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::CourtUpserted {
            court: Court {
                id: 5,
                number: 5,
                status: CourtStatus::Active,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
