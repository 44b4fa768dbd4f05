mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{free_slots, merge_overlapping, subtract_intervals};
pub use conflict::{check_availability, proposed_span};
pub use error::EngineError;
pub use store::{DirectoryClaim, InMemoryStore, PractitionerDirectory, SubjectDirectory};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::audit::{AuditEntry, AuditSink};
use crate::model::*;
use crate::wal::Wal;

pub type SharedPractitionerState = Arc<RwLock<PractitionerState>>;

// ── WAL writer ───────────────────────────────────────────

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

/// Sole owner of the WAL file. Appends that are already queued when the
/// first one arrives share a single fsync; every waiter hears back after it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Non-append commands run after the batch is durable.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for {} events: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
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
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The scheduling engine of one clinic.
///
/// Every agenda mutation holds the practitioner's write lock across the
/// conflict check, the WAL append and the in-memory apply, so two writers
/// can never both pass the check for overlapping slots.
pub struct Engine {
    pub store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub audit: Arc<dyn AuditSink>,
    /// Mutations hold this shared, compaction holds it exclusive, so the
    /// compacted snapshot never misses an in-flight append.
    pub(super) compact_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, audit: Arc<dyn AuditSink>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            audit,
            compact_gate: RwLock::new(()),
        };

        for event in &events {
            engine.replay_event(event);
        }

        if !events.is_empty() {
            tracing::info!(
                "replayed {} events ({} practitioners, {} subjects)",
                events.len(),
                engine.store.practitioner_count(),
                engine.store.subject_count()
            );
        }

        Ok(engine)
    }

    /// Replay runs before any caller holds a lock, so `try_write` always
    /// succeeds. Never block here: tenants are created lazily from async code.
    fn replay_event(&self, event: &Event) {
        if let Event::Batch { events } = event {
            for inner in events {
                self.replay_event(inner);
            }
            return;
        }
        if self.store.apply_directory_event(event) {
            return;
        }
        let Some(ps) = event
            .practitioner_id()
            .and_then(|pid| self.store.get_practitioner(&pid))
        else {
            tracing::warn!("replay: skipping event for unknown practitioner: {event:?}");
            return;
        };
        if let Ok(mut guard) = ps.try_write() {
            self.store.apply_event(&mut guard, event);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_submit(event.clone()).await
    }

    pub(super) async fn wal_submit(&self, event: Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_practitioner(&self, id: &Ulid) -> Option<SharedPractitionerState> {
        self.store.get_practitioner(id)
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut PractitionerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(ps, event);
        Ok(())
    }

    /// Lookup booking → practitioner, acquire the practitioner's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<PractitionerState>, EngineError> {
        let practitioner_id = self
            .store
            .practitioner_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ps = self
            .get_practitioner(&practitioner_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        Ok(ps.write_owned().await)
    }

    pub(super) fn record_audit(&self, entry: AuditEntry) {
        self.audit.record(entry);
    }
}
