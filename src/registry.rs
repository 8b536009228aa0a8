use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{info, warn};

use crate::error::SchedulingError;
use crate::limits::MAX_FACILITIES;
use crate::model::{Facility, Id};
use crate::store::FacilityStore;

/// Owns every facility store. Each facility gets its own log file under
/// `data_dir`, named `facility-<id>.wal`.
pub struct FacilityRegistry {
    stores: DashMap<Id, Arc<FacilityStore>>,
    data_dir: PathBuf,
}

fn wal_file_name(facility_id: Id) -> String {
    format!("facility-{facility_id}.wal")
}

fn parse_wal_file_name(name: &str) -> Option<Id> {
    name.strip_prefix("facility-")?
        .strip_suffix(".wal")?
        .parse()
        .ok()
        .filter(|id: &Id| *id > 0)
}

impl FacilityRegistry {
    /// Load every facility log found in `data_dir`, creating the directory if
    /// needed. Must be called inside a tokio runtime.
    pub fn open(data_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        let registry = Self {
            stores: DashMap::new(),
            data_dir,
        };

        for entry in std::fs::read_dir(&registry.data_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(facility_id) = name.to_str().and_then(parse_wal_file_name) else {
                continue;
            };
            match FacilityStore::open(&entry.path()) {
                Ok(store) if store.facility_id() == facility_id => {
                    registry.stores.insert(facility_id, Arc::new(store));
                }
                Ok(store) => warn!(
                    "skipping {}: log belongs to facility {}",
                    entry.path().display(),
                    store.facility_id()
                ),
                Err(e) => warn!("skipping {}: {e}", entry.path().display()),
            }
        }

        metrics::gauge!(crate::observability::FACILITIES_ACTIVE).set(registry.stores.len() as f64);
        info!(
            "loaded {} facilities from {}",
            registry.stores.len(),
            registry.data_dir.display()
        );
        Ok(registry)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Create a new facility with its log. Fails if the id is taken.
    pub fn provision(&self, facility: Facility) -> Result<Arc<FacilityStore>, SchedulingError> {
        if facility.id <= 0 {
            return Err(SchedulingError::validation("facility_id", "must be positive"));
        }
        if self.stores.len() >= MAX_FACILITIES {
            return Err(SchedulingError::LimitExceeded("too many facilities"));
        }
        let facility_id = facility.id;
        let store = match self.stores.entry(facility_id) {
            Entry::Occupied(_) => {
                return Err(SchedulingError::validation(
                    "facility_id",
                    format!("facility {facility_id} already exists"),
                ));
            }
            Entry::Vacant(slot) => {
                let path = self.data_dir.join(wal_file_name(facility_id));
                let store = FacilityStore::create(&path, facility)
                    .map_err(|e| SchedulingError::Storage(format!("provision facility {facility_id}: {e}")))?;
                let store = Arc::new(store);
                slot.insert(store.clone());
                store
            }
        };
        // The shard lock is released by now; len() takes every shard's read lock.
        metrics::gauge!(crate::observability::FACILITIES_ACTIVE).set(self.stores.len() as f64);
        info!("provisioned facility {facility_id}");
        Ok(store)
    }

    pub fn get(&self, facility_id: Id) -> Result<Arc<FacilityStore>, SchedulingError> {
        self.stores
            .get(&facility_id)
            .map(|e| e.value().clone())
            .ok_or(SchedulingError::not_found("facility", facility_id))
    }

    /// Ids of every loaded facility, ascending.
    pub fn facility_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.stores.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtside_test_registry").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn wal_file_names_round_trip() {
        assert_eq!(wal_file_name(42), "facility-42.wal");
        assert_eq!(parse_wal_file_name("facility-42.wal"), Some(42));
        assert_eq!(parse_wal_file_name("facility-0.wal"), None);
        assert_eq!(parse_wal_file_name("facility-42.wal.tmp"), None);
        assert_eq!(parse_wal_file_name("other.wal"), None);
    }

    #[tokio::test]
    async fn facilities_are_isolated() {
        let dir = test_data_dir("isolation");
        let registry = FacilityRegistry::open(&dir).unwrap();
        let a = registry.provision(Facility::new(1, "North", "UTC")).unwrap();
        let b = registry.provision(Facility::new(2, "South", "UTC")).unwrap();

        let mut tx = a.begin().await;
        let id = tx.next_id();
        tx.stage(crate::model::Event::CourtUpserted {
            court: crate::model::Court {
                id,
                number: 1,
                status: crate::model::CourtStatus::Active,
            },
        });
        tx.commit().await.unwrap();

        assert_eq!(a.read().await.courts.len(), 1);
        assert!(b.read().await.courts.is_empty());
        assert!(dir.join("facility-1.wal").exists());
        assert!(dir.join("facility-2.wal").exists());
    }

    #[tokio::test]
    async fn duplicate_provision_is_rejected() {
        let dir = test_data_dir("duplicate");
        let registry = FacilityRegistry::open(&dir).unwrap();
        registry.provision(Facility::new(1, "North", "UTC")).unwrap();
        let err = registry.provision(Facility::new(1, "Again", "UTC")).err().unwrap();
        assert!(matches!(err, SchedulingError::Validation { field: "facility_id", .. }));
    }

    #[tokio::test]
    async fn reopen_loads_existing_logs() {
        let dir = test_data_dir("reopen");
        {
            let registry = FacilityRegistry::open(&dir).unwrap();
            registry.provision(Facility::new(3, "East", "UTC")).unwrap();
            registry.provision(Facility::new(9, "West", "UTC")).unwrap();
        }
        fs::write(dir.join("notes.txt"), b"ignored").unwrap();

        let registry = FacilityRegistry::open(&dir).unwrap();
        assert_eq!(registry.facility_ids(), vec![3, 9]);
        assert_eq!(registry.get(9).unwrap().read().await.facility.name, "West");
    }

    #[tokio::test]
    async fn unknown_facility_is_not_found() {
        let dir = test_data_dir("unknown");
        let registry = FacilityRegistry::open(&dir).unwrap();
        assert!(matches!(
            registry.get(77).err().unwrap(),
            SchedulingError::NotFound { entity: "facility", id: 77 }
        ));
    }
}
