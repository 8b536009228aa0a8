//! Best-effort work that runs after a transaction commits.
//!
//! Nothing here can undo a commit. Each effect gets its own deadline; a
//! failure is logged, counted and reported back as a soft failure while the
//! remaining effects still run. Emails leave on their own tasks, one per
//! recipient, so the request never waits on delivery.

use std::future::Future;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{Id, Reservation};

use super::Engine;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("recipient {0} has no deliverable address")]
    Undeliverable(Id),
    #[error("email transport failed: {0}")]
    Transport(String),
}

/// Outbound mail. Delivery mechanics live outside this crate.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_cancellation_email(
        &self,
        recipient_id: Id,
        message: &str,
        from_address: &str,
    ) -> Result<(), EmailError>;

    /// Tells a pro about a lesson booked or cancelled on their schedule.
    async fn send_pro_notice(&self, pro_id: Id, message: &str, from_address: &str) -> Result<(), EmailError>;
}

/// Writes every message to the log instead of sending it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send_cancellation_email(
        &self,
        recipient_id: Id,
        message: &str,
        from_address: &str,
    ) -> Result<(), EmailError> {
        info!(recipient_id, from_address, "cancellation email: {message}");
        Ok(())
    }

    async fn send_pro_notice(&self, pro_id: Id, message: &str, from_address: &str) -> Result<(), EmailError> {
        info!(pro_id, from_address, "pro notice: {message}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Offer the freed courts of `reservation` to its slot's waitlist.
    NotifyWaitlist { reservation: Reservation, court_ids: Vec<Id> },
    CancellationEmail { recipient_ids: Vec<Id>, message: String },
    NotifyPro { pro_id: Id, message: String },
}

impl SideEffect {
    fn label(&self) -> &'static str {
        match self {
            SideEffect::NotifyWaitlist { .. } => "notify_waitlist",
            SideEffect::CancellationEmail { .. } => "cancellation_email",
            SideEffect::NotifyPro { .. } => "notify_pro",
        }
    }
}

#[derive(Debug, Error)]
pub enum SideEffectError {
    #[error("{0} timed out")]
    Timeout(&'static str),
    #[error("waitlist notification failed: {0}")]
    Waitlist(#[from] crate::error::SchedulingError),
    #[error("email to {recipient_id} failed: {source}")]
    Email {
        recipient_id: Id,
        #[source]
        source: EmailError,
    },
}

impl Engine {
    /// Drain post-commit effects in order. Returns one message per failure.
    pub async fn run_side_effects(&self, facility_id: Id, effects: Vec<SideEffect>) -> Vec<String> {
        let mut failures = Vec::new();
        for effect in effects {
            let label = effect.label();
            for err in self.run_side_effect(facility_id, effect).await {
                warn!(facility_id, effect = label, "side effect failed: {err}");
                metrics::counter!(crate::observability::SIDE_EFFECT_FAILURES_TOTAL, "effect" => label)
                    .increment(1);
                failures.push(err.to_string());
            }
        }
        failures
    }

    async fn run_side_effect(&self, facility_id: Id, effect: SideEffect) -> Vec<SideEffectError> {
        match effect {
            SideEffect::NotifyWaitlist { reservation, court_ids } => {
                let notify = self.notify_waitlist_for_freed_slot(facility_id, &reservation, &court_ids);
                match tokio::time::timeout(self.timeouts.waitlist, notify).await {
                    Ok(Ok(offers)) => {
                        if !offers.is_empty() {
                            info!(
                                facility_id,
                                reservation_id = reservation.id,
                                "offered freed slot to {} waitlisted members",
                                offers.len()
                            );
                        }
                        Vec::new()
                    }
                    Ok(Err(e)) => vec![SideEffectError::Waitlist(e)],
                    Err(_) => vec![SideEffectError::Timeout("waitlist notification")],
                }
            }
            SideEffect::CancellationEmail { recipient_ids, message } => {
                for recipient_id in recipient_ids {
                    let email = self.email.clone();
                    let message = message.clone();
                    let from = self.from_address.clone();
                    self.spawn_email(facility_id, "cancellation_email", recipient_id, async move {
                        email.send_cancellation_email(recipient_id, &message, &from).await
                    });
                }
                Vec::new()
            }
            SideEffect::NotifyPro { pro_id, message } => {
                let email = self.email.clone();
                let from = self.from_address.clone();
                self.spawn_email(facility_id, "notify_pro", pro_id, async move {
                    email.send_pro_notice(pro_id, &message, &from).await
                });
                Vec::new()
            }
        }
    }

    /// Deliver one email in the background under the email deadline.
    /// Failures only reach the log and the failure counter.
    fn spawn_email<F>(&self, facility_id: Id, label: &'static str, recipient_id: Id, send: F)
    where
        F: Future<Output = Result<(), EmailError>> + Send + 'static,
    {
        let deadline = self.timeouts.email;
        tokio::spawn(async move {
            let failure = match tokio::time::timeout(deadline, send).await {
                Ok(Ok(())) => return,
                Ok(Err(source)) => SideEffectError::Email { recipient_id, source },
                Err(_) => SideEffectError::Timeout("email delivery"),
            };
            warn!(facility_id, recipient_id, effect = label, "side effect failed: {failure}");
            metrics::counter!(crate::observability::SIDE_EFFECT_FAILURES_TOTAL, "effect" => label).increment(1);
        });
    }
}
