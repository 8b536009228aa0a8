use futures::future::join_all;
use serde_json::json;
use tracing::info;

use crate::error::SchedulingError;
use crate::limits::*;
use crate::model::*;

use super::{Actor, Engine};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleInput {
    pub name: String,
    pub min_participants: i32,
    pub max_participants_per_court: i32,
    pub cancellation_cutoff_minutes: i32,
    pub auto_scale_enabled: bool,
    pub min_courts: i32,
    pub max_courts: i32,
}

/// Checks run in a fixed order; the first failure is reported.
pub fn validate_rule(rule: &RuleInput) -> Result<(), SchedulingError> {
    if rule.name.trim().is_empty() || rule.name.len() > MAX_NAME_LEN {
        return Err(SchedulingError::validation("name", "must be 1 to 256 characters"));
    }
    if rule.min_participants <= 0 {
        return Err(SchedulingError::validation("min_participants", "must be greater than zero"));
    }
    if rule.max_participants_per_court <= 0 {
        return Err(SchedulingError::validation(
            "max_participants_per_court",
            "must be greater than zero",
        ));
    }
    if rule.cancellation_cutoff_minutes < 0 {
        return Err(SchedulingError::validation(
            "cancellation_cutoff_minutes",
            "must be zero or more",
        ));
    }
    if rule.min_courts <= 0 {
        return Err(SchedulingError::validation("min_courts", "must be greater than zero"));
    }
    if rule.max_courts <= 0 {
        return Err(SchedulingError::validation("max_courts", "must be greater than zero"));
    }
    if rule.min_courts > rule.max_courts {
        return Err(SchedulingError::validation("min_courts", "must not exceed max_courts"));
    }
    let capacity = i64::from(rule.max_participants_per_court) * i64::from(rule.max_courts);
    if i64::from(rule.min_participants) > capacity {
        return Err(SchedulingError::validation(
            "min_participants",
            format!("cannot exceed the {capacity} players max_courts can hold"),
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInput {
    pub rule_id: Id,
    pub span: Span,
    pub court_count: u32,
}

/// What an evaluator decided for a session approaching its cutoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecision {
    Keep,
    ScaleTo(u32),
    Cancel { reason: String },
}

fn court_bounds(rule: &OpenPlayRule) -> (u32, u32) {
    // validate_rule guarantees both are positive.
    (rule.min_courts.max(0) as u32, rule.max_courts.max(0) as u32)
}

fn session_json(session: &OpenPlaySession) -> String {
    json!({
        "status": format!("{:?}", session.status).to_lowercase(),
        "current_court_count": session.current_court_count,
        "auto_scale_override": session.auto_scale_override,
    })
    .to_string()
}

fn audit(
    id: Id,
    session_id: Id,
    action: AuditAction,
    before: String,
    after: String,
    reason: Option<String>,
    now: Ms,
) -> Event {
    Event::AuditAppended {
        entry: OpenPlayAuditLog {
            id,
            session_id,
            action,
            before,
            after,
            reason,
            created_at: now,
        },
    }
}

fn check_reason(reason: &Option<String>) -> Result<(), SchedulingError> {
    match reason {
        Some(r) if r.len() > MAX_REASON_LEN => Err(SchedulingError::validation("reason", "too long")),
        _ => Ok(()),
    }
}

impl Engine {
    pub async fn create_rule(&self, actor: &Actor, facility_id: Id, input: RuleInput) -> Result<OpenPlayRule, SchedulingError> {
        actor.require_staff("only staff may manage open play rules")?;
        validate_rule(&input)?;
        let mut tx = self.begin(facility_id).await?;
        let rule = rule_from_input(tx.next_id(), input);
        tx.stage(Event::RuleUpserted { rule: rule.clone() });
        tx.commit().await?;
        Ok(rule)
    }

    pub async fn update_rule(
        &self,
        actor: &Actor,
        facility_id: Id,
        rule_id: Id,
        input: RuleInput,
    ) -> Result<OpenPlayRule, SchedulingError> {
        actor.require_staff("only staff may manage open play rules")?;
        validate_rule(&input)?;
        let mut tx = self.begin(facility_id).await?;
        tx.state().rule(rule_id)?;
        let rule = rule_from_input(rule_id, input);
        tx.stage(Event::RuleUpserted { rule: rule.clone() });
        tx.commit().await?;
        Ok(rule)
    }

    pub async fn schedule_session(
        &self,
        actor: &Actor,
        facility_id: Id,
        input: SessionInput,
    ) -> Result<OpenPlaySession, SchedulingError> {
        actor.require_staff("only staff may schedule open play")?;
        if input.span.start < MIN_VALID_TIMESTAMP_MS || input.span.end > MAX_VALID_TIMESTAMP_MS {
            return Err(SchedulingError::validation("start_time", "timestamp out of range"));
        }
        if input.span.duration_ms() > MAX_SESSION_DURATION_MS {
            return Err(SchedulingError::validation("end_time", "session is too long"));
        }
        let mut tx = self.begin(facility_id).await?;
        let rule = tx.state().rule(input.rule_id)?;
        let (min, max) = court_bounds(rule);
        if input.court_count < min || input.court_count > max {
            return Err(SchedulingError::validation(
                "court_count",
                format!("must be between {min} and {max}"),
            ));
        }
        let session = OpenPlaySession {
            id: tx.next_id(),
            rule_id: input.rule_id,
            span: input.span,
            status: SessionStatus::Scheduled,
            current_court_count: input.court_count,
            auto_scale_override: None,
            cancelled_at: None,
            cancellation_reason: None,
        };
        tx.stage(Event::SessionUpserted { session: session.clone() });
        tx.commit().await?;
        Ok(session)
    }

    /// Flip the session's auto-scale relative to what is in effect now.
    /// With `disable_for_rule` the rule's own flag is switched off as well,
    /// audited separately. Returns the session's new effective value.
    pub async fn toggle_auto_scale(
        &self,
        actor: &Actor,
        facility_id: Id,
        session_id: Id,
        disable_for_rule: bool,
        reason: Option<String>,
    ) -> Result<bool, SchedulingError> {
        actor.require_staff("only staff may change auto-scaling")?;
        check_reason(&reason)?;
        let now = self.now();
        let mut tx = self.begin(facility_id).await?;
        let session = tx.state().session(session_id)?.clone();
        let rule = tx.state().rule(session.rule_id)?.clone();

        let enabled = !session.effective_auto_scale(&rule);
        let updated = OpenPlaySession {
            auto_scale_override: Some(enabled),
            ..session.clone()
        };
        let audit_id = tx.next_id();
        tx.stage(Event::SessionUpserted { session: updated.clone() });
        tx.stage(audit(
            audit_id,
            session_id,
            AuditAction::AutoScaleOverride,
            session_json(&session),
            session_json(&updated),
            reason.clone(),
            now,
        ));

        if disable_for_rule && rule.auto_scale_enabled {
            let rule_audit_id = tx.next_id();
            tx.stage(Event::RuleUpserted {
                rule: OpenPlayRule {
                    auto_scale_enabled: false,
                    ..rule.clone()
                },
            });
            tx.stage(audit(
                rule_audit_id,
                session_id,
                AuditAction::RuleAutoScaleDisabled,
                json!({ "rule_id": rule.id, "auto_scale_enabled": true }).to_string(),
                json!({ "rule_id": rule.id, "auto_scale_enabled": false }).to_string(),
                reason,
                now,
            ));
        }
        tx.commit().await?;
        info!(facility_id, session_id, enabled, disable_for_rule, "auto-scale toggled");
        Ok(enabled)
    }

    /// Scheduled sessions whose cancellation cutoff has been reached but that
    /// have not started yet.
    pub async fn sessions_approaching_cutoff(
        &self,
        facility_id: Id,
        now: Ms,
    ) -> Result<Vec<OpenPlaySession>, SchedulingError> {
        self.read(facility_id, |state| {
            state
                .sessions
                .values()
                .filter(|s| s.status == SessionStatus::Scheduled && s.span.start > now)
                .filter(|s| {
                    state.rules.get(&s.rule_id).is_some_and(|rule| {
                        let cutoff = Ms::from(rule.cancellation_cutoff_minutes.max(0)) * MINUTE_MS;
                        s.span.start - cutoff <= now
                    })
                })
                .cloned()
                .collect()
        })
        .await
    }

    /// Whether the facility has a scheduled session starting after `now`.
    pub async fn has_upcoming_sessions(&self, facility_id: Id, now: Ms) -> Result<bool, SchedulingError> {
        self.read(facility_id, |state| {
            state
                .sessions
                .values()
                .any(|s| s.status == SessionStatus::Scheduled && s.span.start > now)
        })
        .await
    }

    /// Facilities with at least one scheduled session starting after `now`.
    /// A facility that cannot be read is reported alongside its error and
    /// does not hide the others. Facilities are checked concurrently.
    pub async fn facilities_with_upcoming_sessions(&self, now: Ms) -> Vec<Result<Id, (Id, SchedulingError)>> {
        let facility_ids = self.registry.facility_ids();
        let checks = facility_ids
            .iter()
            .map(|&facility_id| self.has_upcoming_sessions(facility_id, now));
        join_all(checks)
            .await
            .into_iter()
            .zip(facility_ids)
            .filter_map(|(checked, facility_id)| match checked {
                Ok(true) => Some(Ok(facility_id)),
                Ok(false) => None,
                Err(e) => Some(Err((facility_id, e))),
            })
            .collect()
    }

    /// Record an evaluator's decision for a scheduled session.
    pub async fn apply_session_decision(
        &self,
        facility_id: Id,
        session_id: Id,
        decision: SessionDecision,
    ) -> Result<OpenPlaySession, SchedulingError> {
        let now = self.now();
        let mut tx = self.begin(facility_id).await?;
        let session = tx.state().session(session_id)?.clone();
        if session.status != SessionStatus::Scheduled {
            return Err(SchedulingError::validation("session_id", "session is not scheduled"));
        }
        let rule = tx.state().rule(session.rule_id)?.clone();

        let (updated, action, reason) = match decision {
            SessionDecision::Keep => return Ok(session),
            SessionDecision::ScaleTo(courts) => {
                if !session.effective_auto_scale(&rule) {
                    return Err(SchedulingError::Forbidden("auto-scaling is disabled for this session"));
                }
                let (min, max) = court_bounds(&rule);
                if courts < min || courts > max {
                    return Err(SchedulingError::validation(
                        "court_count",
                        format!("must be between {min} and {max}"),
                    ));
                }
                if courts == session.current_court_count {
                    return Ok(session);
                }
                let updated = OpenPlaySession {
                    current_court_count: courts,
                    ..session.clone()
                };
                (updated, AuditAction::CourtsScaled, None)
            }
            SessionDecision::Cancel { reason } => {
                let reason = Some(reason);
                check_reason(&reason)?;
                let updated = OpenPlaySession {
                    status: SessionStatus::Cancelled,
                    cancelled_at: Some(now),
                    cancellation_reason: reason.clone(),
                    ..session.clone()
                };
                (updated, AuditAction::SessionCancelled, reason)
            }
        };

        let audit_id = tx.next_id();
        tx.stage(Event::SessionUpserted { session: updated.clone() });
        tx.stage(audit(
            audit_id,
            session_id,
            action,
            session_json(&session),
            session_json(&updated),
            reason,
            now,
        ));
        tx.commit().await?;
        info!(facility_id, session_id, action = action.as_str(), "open play decision applied");
        Ok(updated)
    }

    pub async fn audit_log(&self, facility_id: Id, session_id: Id) -> Result<Vec<OpenPlayAuditLog>, SchedulingError> {
        self.read(facility_id, |state| {
            state
                .audit_log
                .iter()
                .filter(|a| a.session_id == session_id)
                .cloned()
                .collect()
        })
        .await
    }
}

fn rule_from_input(id: Id, input: RuleInput) -> OpenPlayRule {
    OpenPlayRule {
        id,
        name: input.name,
        min_participants: input.min_participants,
        max_participants_per_court: input.max_participants_per_court,
        cancellation_cutoff_minutes: input.cancellation_cutoff_minutes,
        auto_scale_enabled: input.auto_scale_enabled,
        min_courts: input.min_courts,
        max_courts: input.max_courts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> RuleInput {
        RuleInput {
            name: "Morning drop-in".into(),
            min_participants: 8,
            max_participants_per_court: 4,
            cancellation_cutoff_minutes: 120,
            auto_scale_enabled: true,
            min_courts: 1,
            max_courts: 2,
        }
    }

    fn field_of(result: Result<(), SchedulingError>) -> &'static str {
        match result {
            Err(SchedulingError::Validation { field, .. }) => field,
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn capacity_bound_accepts_exact_fit() {
        assert!(validate_rule(&rule()).is_ok());
    }

    #[test]
    fn capacity_bound_rejects_overflow() {
        let input = RuleInput {
            min_participants: 9,
            ..rule()
        };
        assert_eq!(field_of(validate_rule(&input)), "min_participants");
    }

    #[test]
    fn checks_run_in_order() {
        let all_bad = RuleInput {
            min_participants: 0,
            max_participants_per_court: 0,
            cancellation_cutoff_minutes: -1,
            min_courts: 0,
            max_courts: 0,
            ..rule()
        };
        assert_eq!(field_of(validate_rule(&all_bad)), "min_participants");
        let input = RuleInput {
            min_participants: 1,
            ..all_bad
        };
        assert_eq!(field_of(validate_rule(&input)), "max_participants_per_court");
        let input = RuleInput {
            max_participants_per_court: 1,
            ..input
        };
        assert_eq!(field_of(validate_rule(&input)), "cancellation_cutoff_minutes");
        let input = RuleInput {
            cancellation_cutoff_minutes: 0,
            ..input
        };
        assert_eq!(field_of(validate_rule(&input)), "min_courts");
        let input = RuleInput { min_courts: 3, ..input };
        assert_eq!(field_of(validate_rule(&input)), "max_courts");
        let input = RuleInput { max_courts: 2, ..input };
        assert_eq!(field_of(validate_rule(&input)), "min_courts");
    }

    #[test]
    fn capacity_does_not_overflow_i32() {
        let input = RuleInput {
            min_participants: i32::MAX,
            max_participants_per_court: i32::MAX,
            max_courts: i32::MAX,
            min_courts: 1,
            ..rule()
        };
        assert!(validate_rule(&input).is_ok());
    }

    #[test]
    fn session_snapshot_is_json() {
        let session = OpenPlaySession {
            id: 1,
            rule_id: 2,
            span: Span::new(0, HOUR_MS),
            status: SessionStatus::Scheduled,
            current_court_count: 2,
            auto_scale_override: Some(false),
            cancelled_at: None,
            cancellation_reason: None,
        };
        let value: serde_json::Value = serde_json::from_str(&session_json(&session)).unwrap();
        assert_eq!(value["status"], "scheduled");
        assert_eq!(value["current_court_count"], 2);
        assert_eq!(value["auto_scale_override"], false);
    }
}
