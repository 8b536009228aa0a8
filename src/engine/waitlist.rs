use tracing::{debug, info};

use crate::error::SchedulingError;
use crate::limits::DEFAULT_OFFER_EXPIRY_MINUTES;
use crate::model::*;
use crate::slot::Slot;
use crate::store::FacilityState;

use super::{Actor, Engine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub user_id: Id,
    /// `None` accepts any court.
    pub court_id: Option<Id>,
    pub slot: Slot,
}

/// Pending entries that may claim a freed slot, in offer order.
///
/// An entry matches when it targets the same slot and is either pinned to
/// one of `freed_courts` or accepts any court. Order is position, then
/// creation time, then id. With a notification window configured, nobody
/// matches unless the slot starts within `[now, now + window]`.
pub fn select_candidates<'a>(
    state: &'a FacilityState,
    slot: &Slot,
    slot_start: Ms,
    freed_courts: &[Id],
    now: Ms,
) -> Vec<&'a WaitlistEntry> {
    let config = state.waitlist_config();
    if config.notification_window_minutes > 0 {
        let window_end = now + Ms::from(config.notification_window_minutes) * MINUTE_MS;
        if slot_start < now || slot_start > window_end {
            debug!(
                facility_id = state.facility.id,
                "freed slot starts outside the notification window"
            );
            return Vec::new();
        }
    }

    // BTreeMap iteration yields each entry once, so no further dedup is needed.
    let mut candidates: Vec<&WaitlistEntry> = state
        .waitlists
        .values()
        .filter(|w| w.status == WaitlistStatus::Pending && w.slot == *slot)
        .filter(|w| match w.court_id {
            None => true,
            Some(court_id) => freed_courts.contains(&court_id),
        })
        .collect();
    candidates.sort_by_key(|w| (w.position, w.created_at, w.id));

    if config.notification_mode == NotificationMode::Sequential {
        candidates.truncate(1);
    }
    candidates
}

fn offer_expiry_ms(config: &WaitlistConfig) -> Ms {
    let minutes = match config.offer_expiry_minutes {
        0 => DEFAULT_OFFER_EXPIRY_MINUTES,
        m => m,
    };
    Ms::from(minutes) * MINUTE_MS
}

impl Engine {
    pub async fn configure_waitlist(
        &self,
        actor: &Actor,
        facility_id: Id,
        config: WaitlistConfig,
    ) -> Result<(), SchedulingError> {
        actor.require_staff("only staff may configure the waitlist")?;
        let mut tx = self.begin(facility_id).await?;
        tx.stage(Event::WaitlistConfigured { config });
        tx.commit().await
    }

    /// Add a member to the waitlist of one slot scope (slot plus court-or-any).
    pub async fn join_waitlist(
        &self,
        actor: &Actor,
        facility_id: Id,
        request: JoinRequest,
    ) -> Result<WaitlistEntry, SchedulingError> {
        if request.user_id <= 0 {
            return Err(SchedulingError::validation("user_id", "must be positive"));
        }
        if !actor.is_staff() && request.user_id != actor.user_id {
            return Err(SchedulingError::Forbidden("members may only join the waitlist for themselves"));
        }
        if let Some(court_id) = request.court_id
            && court_id <= 0
        {
            return Err(SchedulingError::validation("target_court_id", "must be positive"));
        }
        let now = self.now();

        let mut tx = self.begin(facility_id).await?;
        let state = tx.state();
        if let Some(court_id) = request.court_id {
            state.court(court_id)?;
        }
        let tz = state.timezone()?;
        if request.slot.start_instant(tz)? < now {
            return Err(SchedulingError::validation("target_start_time", "must not be in the past"));
        }

        let scope: Vec<&WaitlistEntry> = state
            .waitlists
            .values()
            .filter(|w| w.slot == request.slot && w.court_id == request.court_id)
            .collect();
        if scope
            .iter()
            .any(|w| w.user_id == request.user_id && w.status.is_active())
        {
            return Err(SchedulingError::validation(
                "user_id",
                "already waiting for this slot",
            ));
        }
        let max = state.waitlist_config().max_waitlist_size;
        if max > 0 && scope.iter().filter(|w| w.status.is_active()).count() >= max as usize {
            return Err(SchedulingError::LimitExceeded("waitlist for this slot is full"));
        }
        let position = scope.iter().map(|w| w.position).max().unwrap_or(0) + 1;

        let entry = WaitlistEntry {
            id: tx.next_id(),
            user_id: request.user_id,
            court_id: request.court_id,
            slot: request.slot,
            position,
            status: WaitlistStatus::Pending,
            created_at: now,
        };
        tx.stage(Event::WaitlistJoined { entry: entry.clone() });
        tx.commit().await?;
        info!(facility_id, entry_id = entry.id, position, "joined waitlist");
        Ok(entry)
    }

    /// Withdraw an active entry. Members may only withdraw their own.
    pub async fn leave_waitlist(&self, actor: &Actor, facility_id: Id, entry_id: Id) -> Result<(), SchedulingError> {
        let mut tx = self.begin(facility_id).await?;
        let entry = tx
            .state()
            .waitlists
            .get(&entry_id)
            .filter(|w| w.status.is_active())
            .ok_or(SchedulingError::not_found("waitlist entry", entry_id))?;
        if !actor.is_staff() && entry.user_id != actor.user_id {
            return Err(SchedulingError::Forbidden("members may only leave their own waitlist entries"));
        }
        tx.stage(Event::WaitlistStatusChanged {
            id: entry_id,
            status: WaitlistStatus::Expired,
        });
        tx.commit().await
    }

    /// Offer a just-freed slot to the waitlist. Runs in its own transaction,
    /// after the cancellation that freed it has committed.
    pub async fn notify_waitlist_for_freed_slot(
        &self,
        facility_id: Id,
        freed: &Reservation,
        freed_courts: &[Id],
    ) -> Result<Vec<WaitlistOffer>, SchedulingError> {
        let now = self.now();
        let mut tx = self.begin(facility_id).await?;
        let state = tx.state();
        let tz = state.timezone()?;
        let Some(slot) = Slot::from_span(&freed.span, tz) else {
            debug!(
                facility_id,
                reservation_id = freed.id,
                "freed span crosses local midnight, no waitlist slot matches"
            );
            return Ok(Vec::new());
        };
        let expiry = offer_expiry_ms(&state.waitlist_config());

        let notify: Vec<Id> = select_candidates(state, &slot, freed.span.start, freed_courts, now)
            .into_iter()
            .map(|w| w.id)
            .collect();
        if notify.is_empty() {
            return Ok(Vec::new());
        }

        let mut offers = Vec::with_capacity(notify.len());
        for waitlist_id in notify {
            tx.stage(Event::WaitlistStatusChanged {
                id: waitlist_id,
                status: WaitlistStatus::Notified,
            });
            let offer = WaitlistOffer {
                id: tx.next_id(),
                waitlist_id,
                offered_at: now,
                expires_at: now + expiry,
                status: OfferStatus::Pending,
            };
            tx.stage(Event::OfferCreated { offer: offer.clone() });
            offers.push(offer);
        }
        tx.commit().await?;
        metrics::counter!(crate::observability::WAITLIST_OFFERS_TOTAL).increment(offers.len() as u64);
        Ok(offers)
    }

    /// Claim a pending offer. The entry becomes fulfilled; the member still
    /// books the court through the normal reservation path.
    pub async fn accept_offer(&self, actor: &Actor, facility_id: Id, offer_id: Id) -> Result<WaitlistOffer, SchedulingError> {
        let now = self.now();
        let mut tx = self.begin(facility_id).await?;
        let state = tx.state();
        let offer = state
            .offers
            .get(&offer_id)
            .filter(|o| o.status == OfferStatus::Pending && o.expires_at > now)
            .ok_or(SchedulingError::not_found("waitlist offer", offer_id))?
            .clone();
        let entry = state
            .waitlists
            .get(&offer.waitlist_id)
            .ok_or(SchedulingError::not_found("waitlist entry", offer.waitlist_id))?;
        if !actor.is_staff() && entry.user_id != actor.user_id {
            return Err(SchedulingError::Forbidden("offer belongs to another member"));
        }
        tx.stage(Event::OfferStatusChanged {
            id: offer_id,
            status: OfferStatus::Accepted,
        });
        tx.stage(Event::WaitlistStatusChanged {
            id: offer.waitlist_id,
            status: WaitlistStatus::Fulfilled,
        });
        tx.commit().await?;
        Ok(WaitlistOffer {
            status: OfferStatus::Accepted,
            ..offer
        })
    }

    /// Expire pending offers past their deadline, and their entries with them.
    pub async fn expire_offers(&self, facility_id: Id, now: Ms) -> Result<usize, SchedulingError> {
        let mut tx = self.begin(facility_id).await?;
        let expired: Vec<(Id, Id)> = tx
            .state()
            .offers
            .values()
            .filter(|o| o.status == OfferStatus::Pending && o.expires_at <= now)
            .map(|o| (o.id, o.waitlist_id))
            .collect();
        for (offer_id, waitlist_id) in &expired {
            tx.stage(Event::OfferStatusChanged {
                id: *offer_id,
                status: OfferStatus::Expired,
            });
            let entry_notified = tx
                .state()
                .waitlists
                .get(waitlist_id)
                .is_some_and(|w| w.status == WaitlistStatus::Notified);
            if entry_notified {
                tx.stage(Event::WaitlistStatusChanged {
                    id: *waitlist_id,
                    status: WaitlistStatus::Expired,
                });
            }
        }
        tx.commit().await?;
        Ok(expired.len())
    }

    /// Entries of one slot, in queue order.
    pub async fn waitlist_for_slot(&self, facility_id: Id, slot: Slot) -> Result<Vec<WaitlistEntry>, SchedulingError> {
        self.read(facility_id, |state| {
            let mut entries: Vec<_> = state
                .waitlists
                .values()
                .filter(|w| w.slot == slot)
                .cloned()
                .collect();
            entries.sort_by_key(|w| (w.position, w.created_at, w.id));
            entries
        })
        .await
    }
}
