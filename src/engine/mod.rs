mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod occupancy;
mod queries;
mod store;
#[cfg(test)]
mod tests;

pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use lifecycle::SoftHoldRequest;
pub use mutations::{NewReservation, ReservationPatch};
pub use occupancy::{Calendar, LoadSegment, load_profile, peak_load};
pub use store::InMemoryStore;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{
    OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot,
};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedServiceState = Arc<RwLock<ServiceState>>;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// Events of one mutation; they share a single outcome.
    Append {
        events: Vec<Event>,
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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared outcome.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} mutation(s): {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
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

/// Exclusive access to one service for a check-then-act sequence.
///
/// Holds a shared commit permit for its whole lifetime so that compaction,
/// which takes the permit exclusively, never snapshots a half-applied write.
pub(super) struct ServiceWrite {
    _permit: OwnedRwLockReadGuard<()>,
    state: OwnedRwLockWriteGuard<ServiceState>,
}

impl Deref for ServiceWrite {
    type Target = ServiceState;

    fn deref(&self) -> &ServiceState {
        &self.state
    }
}

impl DerefMut for ServiceWrite {
    fn deref_mut(&mut self) -> &mut ServiceState {
        &mut self.state
    }
}

pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Writers share it; compaction takes it exclusively. Always acquired
    /// before any service lock.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) store_timeout: Duration,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::with_timeout(wal_path, notify, DEFAULT_STORE_TIMEOUT)
    }

    pub fn with_timeout(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        store_timeout: Duration,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                "{}: discarding {} trailing byte(s) of truncated or corrupt WAL",
                wal_path.display(),
                replay.discarded_bytes
            );
            Wal::truncate(&wal_path, replay.valid_len)?;
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            notify,
            commit_gate: Arc::new(RwLock::new(())),
            store_timeout,
        };

        // We're the sole owner of these Arcs, so try_write always succeeds.
        // Never use blocking_write here: this may run inside an async context
        // (lazy tenant creation).
        for event in &replay.events {
            engine.replay_event(event);
        }

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        match event {
            Event::ServiceRegistered { config } if !self.store.contains_service(&config.id) => {
                self.store.insert_service(
                    config.id,
                    Arc::new(RwLock::new(ServiceState::new(config.clone()))),
                );
            }
            Event::ServiceRemoved { id } => {
                if let Some(rs) = self.store.remove_service(id)
                    && let Ok(guard) = rs.try_read()
                {
                    self.store.forget_service(&guard);
                }
            }
            other => {
                if let Some(rs) = self.store.get_service(&other.service_id())
                    && let Ok(mut guard) = rs.try_write()
                {
                    self.store.apply_event(&mut guard, other);
                }
            }
        }
    }

    /// Hand events to the group-commit writer and wait for their fsync.
    ///
    /// Only the hand-off is bounded: once the writer owns the events, their
    /// outcome must be awaited or memory and log could diverge.
    pub(super) async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            events,
            response: tx,
        };
        match tokio::time::timeout(self.store_timeout, self.wal_tx.send(cmd)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(EngineError::StoreUnavailable("WAL writer shut down".into())),
            Err(_) => return Err(EngineError::StoreUnavailable("WAL writer backlogged".into())),
        }
        rx.await
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(format!("WAL error: {e}")))
    }

    pub(super) async fn commit_permit(&self) -> Result<OwnedRwLockReadGuard<()>, EngineError> {
        tokio::time::timeout(self.store_timeout, self.commit_gate.clone().read_owned())
            .await
            .map_err(|_| EngineError::StoreUnavailable("timed out waiting for commit gate".into()))
    }

    pub(super) async fn lock_service(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ServiceState>, EngineError> {
        let rs = self.store.get_service(id).ok_or(EngineError::NotFound(*id))?;
        tokio::time::timeout(self.store_timeout, rs.write_owned())
            .await
            .map_err(|_| EngineError::StoreUnavailable(format!("timed out locking service {id}")))
    }

    /// Serialized write access to one service.
    pub(super) async fn write_service(&self, id: &Ulid) -> Result<ServiceWrite, EngineError> {
        let permit = self.commit_permit().await?;
        let state = self.lock_service(id).await?;
        // Removed while we waited for the lock.
        if !self.store.contains_service(id) {
            return Err(EngineError::NotFound(*id));
        }
        Ok(ServiceWrite {
            _permit: permit,
            state,
        })
    }

    /// Read access for pure queries; a timed-out acquisition is retried once.
    pub(super) async fn read_service(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockReadGuard<ServiceState>, EngineError> {
        let rs = self.store.get_service(id).ok_or(EngineError::NotFound(*id))?;
        for attempt in 0..2 {
            match tokio::time::timeout(self.store_timeout, rs.clone().read_owned()).await {
                Ok(guard) => return Ok(guard),
                Err(_) => tracing::debug!("read lock on service {id} timed out (attempt {attempt})"),
            }
        }
        Err(EngineError::StoreUnavailable(format!(
            "timed out reading service {id}"
        )))
    }

    /// Lookup reservation → service, then take the service write lock.
    pub(super) async fn resolve_reservation_write(
        &self,
        reservation_id: &Ulid,
    ) -> Result<ServiceWrite, EngineError> {
        let service_id = self
            .store
            .service_for_reservation(reservation_id)
            .ok_or(EngineError::NotFound(*reservation_id))?;
        let guard = self.write_service(&service_id).await?;
        // Purged between lookup and lock.
        if guard.get(*reservation_id).is_none() {
            return Err(EngineError::NotFound(*reservation_id));
        }
        Ok(guard)
    }

    /// WAL-append + apply + notify. Memory changes only after the append succeeded.
    pub(super) async fn persist_and_apply(
        &self,
        ss: &mut ServiceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(vec![event.clone()]).await?;
        self.store.apply_event(ss, event);
        self.notify.publish(event);
        Ok(())
    }
}
