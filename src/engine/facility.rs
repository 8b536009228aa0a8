use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::error::SchedulingError;
use crate::limits::MAX_NAME_LEN;
use crate::model::*;
use crate::slot::parse_timezone;
use crate::store::FacilityStore;

use super::{Actor, Engine};

/// Settings staff may change after provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilitySettings {
    pub name: String,
    pub timezone: String,
    pub max_advance_booking_days: Option<u32>,
    pub max_member_reservations: Option<u32>,
    pub tier_overrides_enabled: bool,
    pub tier_advance_days: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CourtInput {
    /// `None` adds a new court.
    pub court_id: Option<Id>,
    pub number: u32,
    pub status: CourtStatus,
}

fn validate_name(field: &'static str, name: &str) -> Result<(), SchedulingError> {
    if name.trim().is_empty() {
        return Err(SchedulingError::validation(field, "must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(SchedulingError::validation(field, "too long"));
    }
    Ok(())
}

impl Engine {
    /// Create a facility, its log and the system reservation types.
    pub fn provision_facility(&self, facility: Facility) -> Result<Arc<FacilityStore>, SchedulingError> {
        validate_name("name", &facility.name)?;
        parse_timezone(&facility.timezone)?;
        self.registry.provision(facility)
    }

    pub async fn update_facility(
        &self,
        actor: &Actor,
        facility_id: Id,
        settings: FacilitySettings,
    ) -> Result<Facility, SchedulingError> {
        actor.require_staff("only staff may change facility settings")?;
        validate_name("name", &settings.name)?;
        parse_timezone(&settings.timezone)?;
        let mut tx = self.begin(facility_id).await?;
        let facility = Facility {
            id: facility_id,
            name: settings.name,
            timezone: settings.timezone,
            max_advance_booking_days: settings.max_advance_booking_days,
            max_member_reservations: settings.max_member_reservations,
            tier_overrides_enabled: settings.tier_overrides_enabled,
            tier_advance_days: settings.tier_advance_days,
        };
        tx.stage(Event::FacilityUpdated {
            facility: facility.clone(),
        });
        tx.commit().await?;
        info!(facility_id, "facility settings updated");
        Ok(facility)
    }

    /// Add a court, or change an existing court's number or status.
    /// Court numbers are unique within a facility.
    pub async fn upsert_court(&self, actor: &Actor, facility_id: Id, input: CourtInput) -> Result<Court, SchedulingError> {
        actor.require_staff("only staff may manage courts")?;
        if input.number == 0 {
            return Err(SchedulingError::validation("number", "must be positive"));
        }
        let mut tx = self.begin(facility_id).await?;
        if let Some(court_id) = input.court_id {
            tx.state().court(court_id)?;
        }
        let taken = tx
            .state()
            .courts
            .values()
            .any(|c| c.number == input.number && Some(c.id) != input.court_id);
        if taken {
            return Err(SchedulingError::validation(
                "number",
                format!("court {} already exists", input.number),
            ));
        }
        let court = Court {
            id: match input.court_id {
                Some(id) => id,
                None => tx.next_id(),
            },
            number: input.number,
            status: input.status,
        };
        tx.stage(Event::CourtUpserted { court: court.clone() });
        tx.commit().await?;
        Ok(court)
    }

    pub async fn add_reservation_type(
        &self,
        actor: &Actor,
        facility_id: Id,
        name: &str,
        kind: ReservationKind,
    ) -> Result<ReservationType, SchedulingError> {
        actor.require_staff("only staff may manage reservation types")?;
        validate_name("name", name)?;
        let mut tx = self.begin(facility_id).await?;
        if tx
            .state()
            .reservation_types
            .values()
            .any(|t| t.name.eq_ignore_ascii_case(name))
        {
            return Err(SchedulingError::validation("name", "reservation type already exists"));
        }
        let reservation_type = ReservationType {
            id: tx.next_id(),
            name: name.to_string(),
            kind,
            is_system: false,
        };
        tx.stage(Event::ReservationTypeAdded {
            reservation_type: reservation_type.clone(),
        });
        tx.commit().await?;
        Ok(reservation_type)
    }

    /// System types cannot be removed.
    pub async fn remove_reservation_type(
        &self,
        actor: &Actor,
        facility_id: Id,
        reservation_type_id: Id,
    ) -> Result<(), SchedulingError> {
        actor.require_staff("only staff may manage reservation types")?;
        let mut tx = self.begin(facility_id).await?;
        if tx.state().reservation_type(reservation_type_id)?.is_system {
            return Err(SchedulingError::Forbidden("system reservation types cannot be removed"));
        }
        tx.stage(Event::ReservationTypeRemoved {
            id: reservation_type_id,
        });
        tx.commit().await
    }

    /// Sell a member a package of lesson credits.
    pub async fn add_lesson_package(
        &self,
        actor: &Actor,
        facility_id: Id,
        user_id: Id,
        credits: u32,
    ) -> Result<LessonPackage, SchedulingError> {
        actor.require_staff("only staff may sell lesson packages")?;
        if user_id <= 0 {
            return Err(SchedulingError::validation("user_id", "must be positive"));
        }
        if credits == 0 {
            return Err(SchedulingError::validation("credits", "must be positive"));
        }
        let mut tx = self.begin(facility_id).await?;
        let package = LessonPackage {
            id: tx.next_id(),
            user_id,
            remaining_credits: credits,
        };
        tx.stage(Event::PackageUpserted {
            package: package.clone(),
        });
        tx.commit().await?;
        Ok(package)
    }
}
