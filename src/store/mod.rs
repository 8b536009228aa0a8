//! Per-facility table store.
//!
//! Each facility's tables live in memory behind one async read/write lock and
//! are made durable by an append-only log. A [`Tx`] holds the write lock from
//! its first read to commit, so transactions on one facility are serializable.
//! Staged events reach the tables only after the log has them on disk.

mod tables;
mod timeline;

pub use tables::FacilityState;
pub use timeline::{Booked, CourtTimeline};

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock, RwLockReadGuard};
use tracing::error;

use crate::error::SchedulingError;
use crate::model::{Event, Facility, Id};
use crate::wal::Wal;

// ── Log writer ───────────────────────────────────────────

enum WalCommand {
    /// Answered with the events once they are durable.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<Vec<Event>>>,
    },
    Compact {
        snapshot: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the facility log. Commands are handled strictly in arrival order.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let started = Instant::now();
                let result = wal.append(&events);
                metrics::histogram!(crate::observability::WAL_APPEND_DURATION_SECONDS)
                    .record(started.elapsed().as_secs_f64());
                if let Err(e) = &result {
                    error!(path = %wal.path().display(), "log append failed: {e}");
                }
                let _ = response.send(result.map(|()| events));
            }
            WalCommand::Compact { snapshot, response } => {
                let result = wal.rewrite(std::slice::from_ref(&snapshot));
                if let Err(e) = &result {
                    error!(path = %wal.path().display(), "log compaction failed: {e}");
                }
                let _ = response.send(result);
            }
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

fn storage(context: &str, e: impl std::fmt::Display) -> SchedulingError {
    SchedulingError::Storage(format!("{context}: {e}"))
}

// ── Store ────────────────────────────────────────────────

/// One facility's tables plus the writer task that makes them durable.
pub struct FacilityStore {
    facility_id: Id,
    state: Arc<RwLock<FacilityState>>,
    wal_tx: mpsc::Sender<WalCommand>,
    path: PathBuf,
}

impl FacilityStore {
    /// Start a new facility log. The provisioning record is fsynced before
    /// the store is returned. Must be called inside a tokio runtime.
    pub fn create(path: &Path, facility: Facility) -> io::Result<Self> {
        if path.exists() && std::fs::metadata(path)?.len() > 0 {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("facility log {} already exists", path.display()),
            ));
        }
        let provisioned = Event::FacilityProvisioned { facility };
        let mut wal = Wal::open(path)?;
        wal.append(std::slice::from_ref(&provisioned))?;
        let state = FacilityState::from_events(std::slice::from_ref(&provisioned))
            .ok_or_else(|| io::Error::other("provisioning record rejected"))?;
        Ok(Self::spawn(state, wal))
    }

    /// Replay an existing facility log. Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (wal, events) = Wal::recover(path)?;
        let state = FacilityState::from_events(&events).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{} does not begin with a provisioning record", path.display()),
            )
        })?;
        Ok(Self::spawn(state, wal))
    }

    fn spawn(state: FacilityState, wal: Wal) -> Self {
        let path = wal.path().to_path_buf();
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));
        Self {
            facility_id: state.facility.id,
            state: Arc::new(RwLock::new(state)),
            wal_tx,
            path,
        }
    }

    pub fn facility_id(&self) -> Id {
        self.facility_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a transaction. Waits for the facility's write lock.
    pub async fn begin(&self) -> Tx {
        let guard = self.state.clone().write_owned().await;
        Tx {
            last_id: guard.last_id,
            guard,
            staged: Vec::new(),
            wal_tx: self.wal_tx.clone(),
        }
    }

    /// Shared read access for queries that do not write.
    pub async fn read(&self) -> RwLockReadGuard<'_, FacilityState> {
        self.state.read().await
    }

    /// Rewrite the log as a single snapshot record.
    pub async fn compact(&self) -> Result<(), SchedulingError> {
        // The read guard keeps commits out until the snapshot is on disk.
        let guard = self.state.read().await;
        let snapshot = Event::Snapshot {
            state: Box::new(guard.clone()),
        };
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { snapshot, response: tx })
            .await
            .map_err(|_| storage("compact", "WAL writer shut down"))?;
        rx.await
            .map_err(|_| storage("compact", "WAL writer dropped response"))?
            .map_err(|e| storage("compact", e))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

// ── Transaction ──────────────────────────────────────────

/// Exclusive access to one facility's tables.
///
/// Writes are staged and become visible only when [`Tx::commit`] has put
/// them in the log, so `state()` always shows committed rows. Dropping a
/// transaction discards what it staged.
pub struct Tx {
    guard: OwnedRwLockWriteGuard<FacilityState>,
    staged: Vec<Event>,
    last_id: Id,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Tx {
    pub fn state(&self) -> &FacilityState {
        &self.guard
    }

    /// Allocate a fresh row id.
    pub fn next_id(&mut self) -> Id {
        self.last_id += 1;
        self.last_id
    }

    pub fn stage(&mut self, event: Event) {
        self.staged.push(event);
    }

    pub fn staged(&self) -> &[Event] {
        &self.staged
    }

    /// Append the staged events as one log record, apply them and release
    /// the lock.
    ///
    /// Once the record is queued the writer makes it durable whether or not
    /// anyone is still waiting, so the rest of the commit runs on its own
    /// task. Dropping the returned future early cannot leave the tables
    /// behind the log.
    pub async fn commit(self) -> Result<(), SchedulingError> {
        let Tx {
            mut guard,
            staged,
            wal_tx,
            ..
        } = self;
        if staged.is_empty() {
            return Ok(());
        }
        let (response, reply) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                events: staged,
                response,
            })
            .await
            .map_err(|_| storage("commit", "log writer shut down"))?;
        let applied = tokio::spawn(async move {
            let events = reply
                .await
                .map_err(|_| storage("commit", "log writer dropped the reply"))?
                .map_err(|e| storage("commit", e))?;
            for event in &events {
                guard.apply(event);
            }
            Ok(())
        });
        applied.await.map_err(|e| storage("commit", e))?
    }
}
