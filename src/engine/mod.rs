mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use conflict::{ConflictScope, find_conflict, has_conflict, validate_draft};
pub use error::EngineError;
pub use store::{IdSequence, InMemoryStore, Table};

use std::io;
use std::path::PathBuf;

use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{error, info, warn};

use crate::model::*;
use crate::wal::Wal;

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a flush is being prepared share
/// one fsync; each sender learns the outcome of the batch it was part of.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
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

        commit_batch(&mut wal, batch);
        if let Some(other) = deferred {
            handle_control(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    // Every sender hears of the failure, so none of the batch may survive on
    // disk to be replayed later.
    if let Err(e) = &result {
        warn!(error = %e, records = batch.len(), "WAL batch failed, rolling back");
    }
    if result.is_err()
        && let Err(rollback) = wal.rollback()
    {
        error!(error = %rollback, "WAL rollback failed");
        result = Err(rollback);
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let outcome = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(outcome);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// The clinic's state and the rules that guard it.
///
/// Every mutation is logged before it is applied. Mutations pass through
/// `commit_gate`: inserts that cannot invalidate anything (new doctors,
/// patients, appointment deletes) share it, while anything that reads the
/// store and then decides (bookings, room inserts, reference-checked deletes,
/// compaction) holds it exclusively. The snapshot a conflict scan sees thus
/// cannot change before the new appointment is stored.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) commit_gate: RwLock<()>,
    pub(super) conflict_scope: ConflictScope,
}

impl Engine {
    /// Replay the log at `wal_path` and start its writer task.
    /// Must be called inside a Tokio runtime.
    pub fn new(wal_path: PathBuf, conflict_scope: ConflictScope) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for event in &events {
            store.apply(event);
        }
        info!(
            events = events.len(),
            appointments = store.appointments.len(),
            %conflict_scope,
            "engine ready"
        );

        Ok(Self {
            store,
            wal_tx,
            commit_gate: RwLock::new(()),
            conflict_scope,
        })
    }

    pub fn conflict_scope(&self) -> ConflictScope {
        self.conflict_scope
    }

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

    /// Log, then apply. Nothing is applied if the log write fails.
    pub(super) async fn persist_and_apply(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply(event);
        Ok(())
    }
}
