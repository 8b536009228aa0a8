mod availability;
mod cancellation;
mod effects;
mod facility;
mod open_play;
mod queries;
mod reservations;
mod waitlist;

pub use availability::{check_courts_free, find_conflict, normalize_court_ids};
pub use cancellation::{
    applicable_refund_percentage, hours_before_start, resolve_cancellation, CancellationInput,
    FeeDetails, Resolution, TierInput,
};
pub use effects::{EmailError, EmailSender, LogEmailSender, SideEffect, SideEffectError};
pub use facility::{CourtInput, FacilitySettings};
pub use open_play::{validate_rule, RuleInput, SessionDecision, SessionInput};
pub use reservations::{
    BookingReceipt, CancellationOutcome, CancellationReceipt, ReservationRequest,
};
pub use waitlist::{select_candidates, JoinRequest};

use std::sync::Arc;
use std::time::Duration;

use mockable::Clock;

use crate::error::SchedulingError;
use crate::model::{Id, Ms};
use crate::registry::FacilityRegistry;
use crate::store::{FacilityState, Tx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Member,
    Staff,
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Id,
    pub role: Role,
    pub membership_level: Option<String>,
}

impl Actor {
    pub fn member(user_id: Id) -> Self {
        Self {
            user_id,
            role: Role::Member,
            membership_level: None,
        }
    }

    pub fn staff(user_id: Id) -> Self {
        Self {
            user_id,
            role: Role::Staff,
            membership_level: None,
        }
    }

    pub fn with_membership_level(mut self, level: impl Into<String>) -> Self {
        self.membership_level = Some(level.into());
        self
    }

    pub fn is_staff(&self) -> bool {
        self.role == Role::Staff
    }

    pub(crate) fn require_staff(&self, operation: &'static str) -> Result<(), SchedulingError> {
        if self.is_staff() {
            Ok(())
        } else {
            Err(SchedulingError::Forbidden(operation))
        }
    }
}

/// Deadlines for the short, request-scoped operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Waiting for a facility's write lock.
    pub query: Duration,
    /// Each email send, per recipient.
    pub email: Duration,
    /// The follow-up waitlist transaction after a cancellation.
    pub waitlist: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            query: Duration::from_secs(5),
            email: Duration::from_secs(10),
            waitlist: Duration::from_secs(5),
        }
    }
}

/// Entry point for every scheduling operation. Cheap to share behind an `Arc`.
pub struct Engine {
    registry: Arc<FacilityRegistry>,
    clock: Arc<dyn Clock + Send + Sync>,
    email: Arc<dyn EmailSender>,
    timeouts: Timeouts,
    from_address: String,
}

impl Engine {
    pub fn new(
        registry: Arc<FacilityRegistry>,
        clock: Arc<dyn Clock + Send + Sync>,
        email: Arc<dyn EmailSender>,
    ) -> Self {
        Self {
            registry,
            clock,
            email,
            timeouts: Timeouts::default(),
            from_address: "noreply@courtside.local".to_string(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_from_address(mut self, from_address: impl Into<String>) -> Self {
        self.from_address = from_address.into();
        self
    }

    pub fn registry(&self) -> &Arc<FacilityRegistry> {
        &self.registry
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    pub fn now(&self) -> Ms {
        self.clock.utc().timestamp_millis()
    }

    /// Open a transaction on one facility, bounded by the query deadline.
    pub(crate) async fn begin(&self, facility_id: Id) -> Result<Tx, SchedulingError> {
        let store = self.registry.get(facility_id)?;
        tokio::time::timeout(self.timeouts.query, store.begin())
            .await
            .map_err(|_| SchedulingError::Timeout("begin transaction"))
    }

    /// Run a read-only closure against one facility's tables.
    pub async fn read<T>(
        &self,
        facility_id: Id,
        f: impl FnOnce(&FacilityState) -> T,
    ) -> Result<T, SchedulingError> {
        let store = self.registry.get(facility_id)?;
        let guard = tokio::time::timeout(self.timeouts.query, store.read())
            .await
            .map_err(|_| SchedulingError::Timeout("read facility"))?;
        Ok(f(&guard))
    }
}
