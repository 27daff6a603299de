mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{candidate_slots, generate_slots, merge_overlapping, subtract_intervals, working_windows};
pub use conflict::local_now;
pub use error::{ConflictReason, EngineError};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::config::SlotPolicy;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

/// One lock per instructor: writers for different instructors never contend.
pub type SharedInstructorState = Arc<RwLock<InstructorState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// wait for one append, drain whatever else is already queued, fsync once,
/// then answer every sender in the batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;

        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so half-written bytes don't leak
    // into the next batch.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The scheduling engine: per-instructor state, WAL, and change notifications.
pub struct Engine {
    pub state: DashMap<Ulid, SharedInstructorState>,
    pub policy: SlotPolicy,
    pub notify: Arc<NotifyHub>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: entity (schedule entry, time-off, custom, booking) id → instructor id
    pub(super) entity_to_instructor: DashMap<Ulid, Ulid>,
    /// Taken exclusively to add or drop an instructor, and by compaction from
    /// snapshot to swap. Always acquired before any instructor lock.
    pub(super) registry: RwLock<()>,
}

/// Apply an event to an instructor (no locking, caller holds the lock).
fn apply_to_instructor(st: &mut InstructorState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ScheduleEntrySet { entry } => {
            entity_map.insert(entry.id, entry.instructor_id);
            st.upsert_schedule_entry(entry.clone());
        }
        Event::ScheduleEntryRemoved { id, .. } => {
            st.remove_schedule_entry(*id);
            entity_map.remove(id);
        }
        Event::TimeOffAdded { exception } => {
            entity_map.insert(exception.id, exception.instructor_id);
            st.insert_time_off(exception.clone());
        }
        Event::TimeOffRemoved { id, .. } => {
            st.remove_time_off(*id);
            entity_map.remove(id);
        }
        Event::CustomAvailabilitySet { entry } => {
            entity_map.insert(entry.id, entry.instructor_id);
            st.upsert_custom_availability(entry.clone());
        }
        Event::CustomAvailabilityRemoved { id, .. } => {
            st.remove_custom_availability(*id);
            entity_map.remove(id);
        }
        Event::BookingCreated { booking } => {
            entity_map.insert(booking.id, booking.instructor_id);
            if let Err(other) = st.insert_booking(booking.clone()) {
                // Only reachable when replaying a log written by a buggy build.
                warn!("booking {} overlaps {other}, not applied", booking.id);
                entity_map.remove(&booking.id);
            }
        }
        Event::BookingStatusChanged { id, status, .. } => {
            st.set_booking_status(*id, *status);
        }
        Event::InstructorRegistered { name, .. } => {
            st.name = name.clone();
        }
        // removal is handled at the DashMap level
        Event::InstructorRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, policy: SlotPolicy) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            policy,
            notify,
            wal_tx,
            entity_to_instructor: DashMap::new(),
            registry: RwLock::new(()),
        };

        // Replay: we're the sole owner of these Arcs, so try_write never
        // contends. blocking_write would panic inside the runtime.
        for event in &events {
            match event {
                Event::InstructorRegistered { id, name } => {
                    let st = InstructorState::new(*id, name.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(st)));
                }
                Event::InstructorRemoved { id } => {
                    if let Some((_, st)) = engine.state.remove(id)
                        && let Ok(guard) = st.try_read()
                    {
                        engine.forget_entities(&guard);
                    }
                }
                other => {
                    let Some(entry) = engine.state.get(&other.instructor_id()) else {
                        continue;
                    };
                    let st = entry.value().clone();
                    drop(entry);
                    if let Ok(mut guard) = st.try_write() {
                        apply_to_instructor(&mut guard, other, &engine.entity_to_instructor);
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_instructor(&self, id: &Ulid) -> Option<SharedInstructorState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_instructor_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_instructor.get(entity_id).map(|e| *e.value())
    }

    fn forget_entities(&self, st: &InstructorState) {
        let ids = st
            .schedule
            .iter()
            .map(|e| e.id)
            .chain(st.time_off.iter().map(|t| t.id))
            .chain(st.custom.iter().map(|c| c.id))
            .chain(st.bookings.iter().map(|b| b.id));
        for id in ids {
            self.entity_to_instructor.remove(&id);
        }
    }

    /// WAL-append + apply + notify. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        st: &mut InstructorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_instructor(st, event, &self.entity_to_instructor);
        self.notify.send(st.id, event);
        Ok(())
    }

    /// True while `st` is still the registered state for `instructor_id`.
    /// A lock waited on across `remove_instructor` comes back detached.
    fn is_live(&self, instructor_id: &Ulid, st: &SharedInstructorState) -> bool {
        self.state
            .get(instructor_id)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), st))
    }

    /// Resolve the instructor owning `entity_id` and take their write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<InstructorState>, EngineError> {
        let instructor_id = self
            .get_instructor_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.instructor_write(&instructor_id)
            .await
            .map_err(|_| EngineError::NotFound(*entity_id))
    }

    pub(super) async fn instructor_write(
        &self,
        instructor_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<InstructorState>, EngineError> {
        let st = self
            .get_instructor(instructor_id)
            .ok_or(EngineError::NotFound(*instructor_id))?;
        let guard = st.clone().write_owned().await;
        if !self.is_live(instructor_id, &st) {
            return Err(EngineError::NotFound(*instructor_id));
        }
        Ok(guard)
    }

    pub(super) async fn instructor_read(
        &self,
        instructor_id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<InstructorState>, EngineError> {
        let st = self
            .get_instructor(instructor_id)
            .ok_or(EngineError::NotFound(*instructor_id))?;
        let guard = st.clone().read_owned().await;
        if !self.is_live(instructor_id, &st) {
            return Err(EngineError::NotFound(*instructor_id));
        }
        Ok(guard)
    }
}
