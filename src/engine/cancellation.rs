use serde::Serialize;
use tracing::info;

use crate::error::SchedulingError;
use crate::limits::{MAX_REFUND_PERCENTAGE, MAX_TIERS_PER_FACILITY};
use crate::model::*;

use super::{Actor, Engine};

/// Refund for a cancellation `hours_before_start` hours ahead of the start.
///
/// Tiers scoped to the reservation type win over the facility defaults; the
/// defaults apply only when the type has no tiers at all. The qualifying tier
/// with the largest `min_hours_before` decides. A scope with no tiers refunds
/// in full; a cancellation earlier than the scope's lowest threshold refunds
/// nothing, so the refund never shrinks as the lead time grows.
pub fn applicable_refund_percentage<'a>(
    tiers: impl IntoIterator<Item = &'a CancellationPolicyTier>,
    hours_before_start: u32,
    reservation_type_id: Id,
) -> u8 {
    let (typed, defaults): (Vec<_>, Vec<_>) = tiers
        .into_iter()
        .filter(|t| t.reservation_type_id.is_none() || t.reservation_type_id == Some(reservation_type_id))
        .partition(|t| t.reservation_type_id.is_some());
    let applicable = if typed.is_empty() { defaults } else { typed };
    if applicable.is_empty() {
        return MAX_REFUND_PERCENTAGE;
    }
    applicable
        .into_iter()
        .filter(|t| t.min_hours_before <= hours_before_start)
        .max_by_key(|t| t.min_hours_before)
        .map_or(0, |t| t.refund_percentage)
}

/// Whole hours from `now` until `start`, zero once the start has passed.
pub fn hours_before_start(start: Ms, now: Ms) -> u32 {
    let hours = (start - now).max(0) / HOUR_MS;
    u32::try_from(hours).unwrap_or(u32::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancellationInput {
    pub refund_percentage: u8,
    pub hours_before_start: u32,
    pub is_staff: bool,
}

/// What the caller is asked to confirm before a fee is charged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeeDetails {
    pub refund_percentage: u8,
    pub fee_percentage: u8,
    pub hours_before_start: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Proceed { refund_percentage: u8, fee_waived: bool },
    NeedsConfirmation(FeeDetails),
}

/// Decide how a cancellation proceeds given the caller's waive decision.
///
/// `waive_fee` is `None` when the caller has not answered yet. Staff are asked
/// before a fee is charged; members get the computed refund and may not waive.
pub fn resolve_cancellation(
    input: CancellationInput,
    waive_fee: Option<bool>,
) -> Result<Resolution, SchedulingError> {
    let charges_fee = input.refund_percentage < MAX_REFUND_PERCENTAGE;
    match waive_fee {
        Some(true) if !input.is_staff => {
            Err(SchedulingError::Forbidden("only staff may waive cancellation fees"))
        }
        Some(true) => Ok(Resolution::Proceed {
            refund_percentage: MAX_REFUND_PERCENTAGE,
            fee_waived: charges_fee,
        }),
        None if input.is_staff && charges_fee => Ok(Resolution::NeedsConfirmation(FeeDetails {
            refund_percentage: input.refund_percentage,
            fee_percentage: MAX_REFUND_PERCENTAGE - input.refund_percentage,
            hours_before_start: input.hours_before_start,
        })),
        _ => Ok(Resolution::Proceed {
            refund_percentage: input.refund_percentage,
            fee_waived: false,
        }),
    }
}

/// Unvalidated tier fields as they arrive from the settings form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierInput {
    pub reservation_type_id: Option<Id>,
    pub min_hours_before: i64,
    pub refund_percentage: i64,
}

fn validate_tier(input: &TierInput) -> Result<(u32, u8), SchedulingError> {
    let min_hours = u32::try_from(input.min_hours_before)
        .map_err(|_| SchedulingError::validation("min_hours_before", "must be zero or more"))?;
    let refund = u8::try_from(input.refund_percentage)
        .ok()
        .filter(|p| *p <= MAX_REFUND_PERCENTAGE)
        .ok_or_else(|| SchedulingError::validation("refund_percentage", "must be between 0 and 100"))?;
    Ok((min_hours, refund))
}

/// Within one scope, a longer lead time never refunds less.
fn check_monotonic<'a>(scope: impl Iterator<Item = &'a CancellationPolicyTier>) -> Result<(), SchedulingError> {
    let mut tiers: Vec<_> = scope.collect();
    tiers.sort_by_key(|t| t.min_hours_before);
    if tiers
        .windows(2)
        .any(|w| w[1].refund_percentage < w[0].refund_percentage)
    {
        return Err(SchedulingError::validation(
            "refund_percentage",
            "must not decrease as min_hours_before grows",
        ));
    }
    Ok(())
}

impl Engine {
    /// Insert a tier, or replace the one with the same scope and threshold.
    pub async fn upsert_tier(
        &self,
        actor: &Actor,
        facility_id: Id,
        input: TierInput,
    ) -> Result<CancellationPolicyTier, SchedulingError> {
        actor.require_staff("only staff may edit cancellation policy")?;
        let (min_hours_before, refund_percentage) = validate_tier(&input)?;

        let mut tx = self.begin(facility_id).await?;
        if let Some(type_id) = input.reservation_type_id {
            tx.state().reservation_type(type_id)?;
        }
        let existing = tx
            .state()
            .tiers
            .values()
            .find(|t| {
                t.reservation_type_id == input.reservation_type_id && t.min_hours_before == min_hours_before
            })
            .map(|t| t.id);
        if existing.is_none() && tx.state().tiers.len() >= MAX_TIERS_PER_FACILITY {
            return Err(SchedulingError::LimitExceeded("too many cancellation tiers"));
        }

        let tier = CancellationPolicyTier {
            id: match existing {
                Some(id) => id,
                None => tx.next_id(),
            },
            reservation_type_id: input.reservation_type_id,
            min_hours_before,
            refund_percentage,
        };
        let scope = input.reservation_type_id;
        check_monotonic(
            tx.state()
                .tiers
                .values()
                .filter(|t| t.reservation_type_id == scope && t.id != tier.id)
                .chain(std::iter::once(&tier)),
        )?;

        tx.stage(Event::TierUpserted { tier: tier.clone() });
        tx.commit().await?;
        info!(
            facility_id,
            tier_id = tier.id,
            "cancellation tier {}h -> {}%",
            tier.min_hours_before,
            tier.refund_percentage
        );
        Ok(tier)
    }

    pub async fn remove_tier(&self, actor: &Actor, facility_id: Id, tier_id: Id) -> Result<(), SchedulingError> {
        actor.require_staff("only staff may edit cancellation policy")?;
        let mut tx = self.begin(facility_id).await?;
        if !tx.state().tiers.contains_key(&tier_id) {
            return Err(SchedulingError::not_found("cancellation tier", tier_id));
        }
        tx.stage(Event::TierRemoved { id: tier_id });
        tx.commit().await
    }

    /// Tiers of one scope (`None` = facility defaults), by threshold.
    pub async fn list_tiers(
        &self,
        facility_id: Id,
        reservation_type_id: Option<Id>,
    ) -> Result<Vec<CancellationPolicyTier>, SchedulingError> {
        self.read(facility_id, |state| {
            let mut tiers: Vec<_> = state
                .tiers
                .values()
                .filter(|t| t.reservation_type_id == reservation_type_id)
                .cloned()
                .collect();
            tiers.sort_by_key(|t| t.min_hours_before);
            tiers
        })
        .await
    }

    /// Refund a cancellation of `reservation_id` would get right now.
    pub async fn preview_refund(&self, facility_id: Id, reservation_id: Id) -> Result<u8, SchedulingError> {
        let now = self.now();
        self.read(facility_id, |state| {
            let r = state.live_reservation(reservation_id)?;
            Ok::<_, SchedulingError>(applicable_refund_percentage(
                state.tiers.values(),
                hours_before_start(r.span.start, now),
                r.reservation_type_id,
            ))
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(id: Id, reservation_type_id: Option<Id>, min_hours_before: u32, refund_percentage: u8) -> CancellationPolicyTier {
        CancellationPolicyTier {
            id,
            reservation_type_id,
            min_hours_before,
            refund_percentage,
        }
    }

    fn scenario_b() -> Vec<CancellationPolicyTier> {
        vec![tier(1, None, 0, 0), tier(2, None, 24, 50), tier(3, None, 72, 100)]
    }

    #[test]
    fn largest_qualifying_threshold_wins() {
        let tiers = scenario_b();
        assert_eq!(applicable_refund_percentage(&tiers, 30, 1), 50);
        assert_eq!(applicable_refund_percentage(&tiers, 24, 1), 50);
        assert_eq!(applicable_refund_percentage(&tiers, 23, 1), 0);
        assert_eq!(applicable_refund_percentage(&tiers, 72, 1), 100);
        assert_eq!(applicable_refund_percentage(&tiers, 0, 1), 0);
    }

    #[test]
    fn refund_never_decreases_with_lead_time() {
        let tiers = scenario_b();
        let refunds: Vec<u8> = (0..200).map(|h| applicable_refund_percentage(&tiers, h, 1)).collect();
        assert!(refunds.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn type_tiers_shadow_defaults() {
        let mut tiers = scenario_b();
        tiers.push(tier(4, Some(2), 0, 25));
        // Type 2 has its own table, even though it only covers 0h.
        assert_eq!(applicable_refund_percentage(&tiers, 100, 2), 25);
        // Other types still use the defaults.
        assert_eq!(applicable_refund_percentage(&tiers, 100, 1), 100);
    }

    #[test]
    fn no_policy_means_full_refund() {
        assert_eq!(applicable_refund_percentage(std::iter::empty(), 0, 1), 100);
        assert_eq!(applicable_refund_percentage(std::iter::empty(), 500, 1), 100);
    }

    #[test]
    fn below_lowest_threshold_refunds_nothing() {
        let only_late = vec![tier(1, None, 48, 80)];
        assert_eq!(applicable_refund_percentage(&only_late, 10, 1), 0);
        assert_eq!(applicable_refund_percentage(&only_late, 48, 1), 80);
    }

    #[test]
    fn monotonic_without_a_zero_hour_tier() {
        let tiers = vec![tier(1, None, 24, 50), tier(2, None, 72, 100)];
        let refunds: Vec<u8> = (0..=100)
            .map(|hours| applicable_refund_percentage(&tiers, hours, 1))
            .collect();
        assert!(refunds.windows(2).all(|w| w[0] <= w[1]), "{refunds:?}");
        assert_eq!(refunds[10], 0);
        assert_eq!(refunds[30], 50);
        assert_eq!(refunds[80], 100);
    }

    #[test]
    fn hours_are_floored_at_zero() {
        assert_eq!(hours_before_start(0, 5 * HOUR_MS), 0);
        assert_eq!(hours_before_start(30 * HOUR_MS + 59 * MINUTE_MS, 0), 30);
    }

    fn input(refund_percentage: u8, is_staff: bool) -> CancellationInput {
        CancellationInput {
            refund_percentage,
            hours_before_start: 10,
            is_staff,
        }
    }

    #[test]
    fn staff_must_confirm_a_fee() {
        let outcome = resolve_cancellation(input(50, true), None).unwrap();
        assert_eq!(
            outcome,
            Resolution::NeedsConfirmation(FeeDetails {
                refund_percentage: 50,
                fee_percentage: 50,
                hours_before_start: 10,
            })
        );
    }

    #[test]
    fn staff_waiver_forces_full_refund() {
        assert_eq!(
            resolve_cancellation(input(50, true), Some(true)).unwrap(),
            Resolution::Proceed {
                refund_percentage: 100,
                fee_waived: true
            }
        );
        assert_eq!(
            resolve_cancellation(input(50, true), Some(false)).unwrap(),
            Resolution::Proceed {
                refund_percentage: 50,
                fee_waived: false
            }
        );
    }

    #[test]
    fn members_cannot_waive() {
        assert!(matches!(
            resolve_cancellation(input(50, false), Some(true)),
            Err(SchedulingError::Forbidden(_))
        ));
        assert_eq!(
            resolve_cancellation(input(50, false), None).unwrap(),
            Resolution::Proceed {
                refund_percentage: 50,
                fee_waived: false
            }
        );
    }

    #[test]
    fn full_refund_needs_no_confirmation() {
        assert_eq!(
            resolve_cancellation(input(100, true), None).unwrap(),
            Resolution::Proceed {
                refund_percentage: 100,
                fee_waived: false
            }
        );
    }

    #[test]
    fn tier_input_ranges() {
        let ok = TierInput {
            reservation_type_id: None,
            min_hours_before: 24,
            refund_percentage: 50,
        };
        assert_eq!(validate_tier(&ok).unwrap(), (24, 50));
        assert!(matches!(
            validate_tier(&TierInput { min_hours_before: -1, ..ok }),
            Err(SchedulingError::Validation { field: "min_hours_before", .. })
        ));
        assert!(matches!(
            validate_tier(&TierInput { refund_percentage: 101, ..ok }),
            Err(SchedulingError::Validation { field: "refund_percentage", .. })
        ));
    }

    #[test]
    fn decreasing_refund_is_rejected() {
        let tiers = [tier(1, None, 0, 50), tier(2, None, 24, 40)];
        assert!(check_monotonic(tiers.iter()).is_err());
        assert!(check_monotonic(scenario_b().iter()).is_ok());
    }
}
