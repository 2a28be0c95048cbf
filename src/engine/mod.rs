//! The reservation engine.
//!
//! Stateless between calls: every mutating operation runs as one
//! transaction — acquire locks, validate against current state, append
//! a single commit record to the WAL, apply it in memory, broadcast.
//! A failure anywhere before the WAL append aborts with zero partial
//! mutation; the WAL append is the commit point.
//!
//! Lock-acquisition order is fixed: box locks in ascending box id,
//! then the apartment-key lock, then waitlist-entry state. Operations
//! touching two boxes (move, switch) sort both ids before locking, so
//! no two transactions can deadlock against each other. Reads for
//! status displays are lock-free snapshot reads; anything that decides
//! a box's fate re-validates under its locks.

mod error;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;
pub use queries::AuditFilter;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

use store::{AuditLog, LedgerStore, Outbox, WaitlistStore};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as Ms
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        record: WalRecord,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<WalRecord>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task owning the WAL. Appends arriving while a flush is
/// pending are batched into one fsync (group commit): block for the
/// first append, drain whatever else is immediately queued, flush once,
/// then answer every waiter.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { record, response } => {
                let mut batch = vec![(record, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { record, response }) => {
                            batch.push((record, response));
                        }
                        Ok(other) => {
                            // Flush before handling a non-append command.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<(WalRecord, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    for (record, _) in &batch {
        if let Err(e) = wal.append_buffered(record) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes don't
    // leak into the next batch (these callers are all told the batch failed).
    let flush_err = wal.flush_sync().err();
    let result: io::Result<()> = match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    };

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    /// Box rows. Snapshot reads go straight here; mutation happens only
    /// at commit time while the box's transaction lock is held.
    boxes: DashMap<BoxId, PlanterBox>,
    /// Per-box transaction locks (the row locks of a register/move/
    /// remove/assign transaction).
    box_locks: DashMap<BoxId, Arc<Mutex<()>>>,
    /// Per-apartment-key locks: the uniqueness space for active
    /// registrations and waiting entries.
    apartment_locks: DashMap<String, Arc<Mutex<()>>>,
    ledger: LedgerStore,
    waitlist: WaitlistStore,
    audit: AuditLog,
    outbox: Outbox,
    opens_at: std::sync::RwLock<Option<Ms>>,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    /// Open the engine, replaying the WAL at `wal_path` into memory and
    /// starting the group-commit writer. Must run inside a Tokio runtime.
    pub fn open(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            boxes: DashMap::new(),
            box_locks: DashMap::new(),
            apartment_locks: DashMap::new(),
            ledger: LedgerStore::default(),
            waitlist: WaitlistStore::default(),
            audit: AuditLog::default(),
            outbox: Outbox::default(),
            opens_at: std::sync::RwLock::new(None),
            wal_tx,
            notify,
        };

        for record in records {
            match record {
                WalRecord::Snapshot(snapshot) => engine.load_snapshot(snapshot),
                WalRecord::Commit(commit) => engine.apply(&commit),
            }
        }

        Ok(engine)
    }

    // ── Locking ──────────────────────────────────────────

    /// Acquire transaction locks for the given boxes in ascending id
    /// order. Fails NOT_FOUND before locking anything unknown.
    pub(super) async fn lock_boxes(
        &self,
        ids: &[BoxId],
    ) -> Result<Vec<OwnedMutexGuard<()>>, EngineError> {
        let mut sorted: Vec<BoxId> = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        for id in &sorted {
            if !self.boxes.contains_key(id) {
                return Err(EngineError::BoxNotFound(*id));
            }
        }

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            let lock = self.box_locks.entry(id).or_default().clone();
            guards.push(lock.lock_owned().await);
        }
        Ok(guards)
    }

    /// Acquire the apartment-key lock. Always taken after box locks.
    pub(super) async fn lock_apartment(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.apartment_locks.entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    // ── Commit path ──────────────────────────────────────

    async fn wal_append(&self, record: &WalRecord) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                record: record.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Persist one commit record and apply it. The caller holds every
    /// lock the change needs; a WAL failure here means nothing was
    /// applied and the caller rolls back its claims.
    pub(super) async fn commit(&self, commit: Commit) -> Result<(), EngineError> {
        self.wal_append(&WalRecord::Commit(commit.clone())).await?;
        self.apply(&commit);

        metrics::counter!(
            crate::observability::COMMITS_TOTAL,
            "op" => commit.change.label()
        )
        .increment(1);
        metrics::gauge!(crate::observability::BOXES_AVAILABLE)
            .set(self.available_box_count() as f64);
        metrics::gauge!(crate::observability::WAITLIST_WAITING)
            .set(self.waitlist.waiting_count() as f64);

        for box_id in commit.change.touched_boxes() {
            if let Some(row) = self.box_row(box_id) {
                self.notify.send(box_id, &row);
            }
        }
        Ok(())
    }

    /// Apply a committed change to the in-memory state. Shared between
    /// the live commit path (locks held by the caller) and replay
    /// (single-threaded, uncontended).
    fn apply(&self, commit: &Commit) {
        let at = commit.at;
        match &commit.change {
            Change::Provisioned { boxes } => {
                for b in boxes {
                    self.boxes.insert(b.id, b.clone());
                }
            }
            Change::Registered { registration } => {
                self.ledger.insert_active(registration.clone());
                self.set_box(registration.box_id, BoxState::Occupied, None, at);
            }
            Change::Switched {
                old_registration_id,
                old_box_id,
                registration,
            } => {
                self.ledger.update(old_registration_id, |r| {
                    r.status = RegistrationStatus::Switched;
                    r.updated_at = at;
                });
                self.ledger.release_box(*old_box_id);
                self.ledger.insert_active(registration.clone());
                self.set_box(*old_box_id, BoxState::Available, None, at);
                self.set_box(registration.box_id, BoxState::Occupied, None, at);
            }
            Change::Moved {
                registration_id,
                old_box_id,
                new_box_id,
            } => {
                self.ledger.update(registration_id, |r| {
                    r.box_id = *new_box_id;
                    r.updated_at = at;
                });
                self.ledger.release_box(*old_box_id);
                self.ledger.index_box(*new_box_id, *registration_id);
                self.set_box(*old_box_id, BoxState::Available, None, at);
                self.set_box(*new_box_id, BoxState::Occupied, None, at);
            }
            Change::Removed {
                registration_id,
                box_id,
                box_state,
                reserved_label,
            } => {
                if let Some(reg) = self.ledger.get(registration_id) {
                    self.ledger
                        .release_apartment(&reg.registrant.apartment_key);
                }
                self.ledger.release_box(*box_id);
                self.ledger.update(registration_id, |r| {
                    r.status = RegistrationStatus::Removed;
                    r.updated_at = at;
                });
                self.set_box(*box_id, *box_state, reserved_label.clone(), at);
            }
            Change::WaitlistJoined { entry } => {
                self.waitlist.insert_waiting(entry.clone());
            }
            Change::WaitlistPreserved { .. } => {}
            Change::WaitlistAssigned {
                entry_id,
                registration,
            } => {
                if let Some(entry) = self.waitlist.get(entry_id) {
                    self.waitlist
                        .release_waiting(&entry.registrant.apartment_key);
                }
                self.waitlist.update(entry_id, |e| {
                    e.status = WaitlistStatus::Assigned;
                    e.updated_at = at;
                });
                self.ledger.insert_active(registration.clone());
                self.set_box(registration.box_id, BoxState::Occupied, None, at);
            }
            Change::WaitlistCancelled { entry_id } => {
                if let Some(entry) = self.waitlist.get(entry_id) {
                    self.waitlist
                        .release_waiting(&entry.registrant.apartment_key);
                }
                self.waitlist.update(entry_id, |e| {
                    e.status = WaitlistStatus::Cancelled;
                    e.updated_at = at;
                });
            }
            Change::BoxHoldSet {
                box_id,
                state,
                reserved_label,
            } => {
                self.set_box(*box_id, *state, reserved_label.clone(), at);
            }
            Change::OpeningChanged { opens_at } => {
                *self.opens_at.write().expect("settings poisoned") = *opens_at;
            }
            Change::NoticeSettled { notice_id, status } => {
                self.outbox.update(notice_id, |n| {
                    n.status = *status;
                    n.attempts += 1;
                    if *status == NoticeStatus::Sent {
                        n.sent_at = Some(at);
                    }
                });
            }
        }

        for event in &commit.audit {
            self.audit.append(event.clone());
        }
        for notice in &commit.notices {
            self.outbox.insert(notice.clone());
        }
    }

    fn load_snapshot(&self, snapshot: Snapshot) {
        self.boxes.clear();
        for b in snapshot.boxes {
            self.boxes.insert(b.id, b);
        }
        self.ledger.clear();
        for r in snapshot.registrations {
            self.ledger.insert_row(r);
        }
        self.waitlist.clear();
        for e in snapshot.waitlist {
            self.waitlist.insert_row(e);
        }
        self.audit.load(snapshot.audit);
        self.outbox.clear();
        for n in snapshot.notices {
            self.outbox.insert(n);
        }
        *self.opens_at.write().expect("settings poisoned") = snapshot.opens_at;
    }

    fn set_box(&self, id: BoxId, state: BoxState, reserved_label: Option<String>, at: Ms) {
        if let Some(mut row) = self.boxes.get_mut(&id) {
            row.state = state;
            row.reserved_label = reserved_label;
            row.updated_at = at;
        }
    }

    // ── Shared reads ─────────────────────────────────────

    pub(super) fn box_row(&self, id: BoxId) -> Option<PlanterBox> {
        self.boxes.get(&id).map(|r| r.value().clone())
    }

    pub(super) fn available_box_count(&self) -> usize {
        self.boxes
            .iter()
            .filter(|r| r.value().state == BoxState::Available)
            .count()
    }

    fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    fn waitlist(&self) -> &WaitlistStore {
        &self.waitlist
    }

    fn audit_log(&self) -> &AuditLog {
        &self.audit
    }

    fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub(super) fn opening(&self) -> Option<Ms> {
        *self.opens_at.read().expect("settings poisoned")
    }

    // ── Provisioning & compaction ────────────────────────

    /// Seed the box catalog. Idempotent per id: already-provisioned
    /// boxes are skipped untouched. Returns how many boxes were added.
    pub async fn provision(&self, actor: Actor, specs: &[BoxSpec]) -> Result<usize, EngineError> {
        let at = now_ms();
        let mut seen = std::collections::HashSet::new();
        let new_boxes: Vec<PlanterBox> = specs
            .iter()
            .filter(|s| seen.insert(s.id) && !self.boxes.contains_key(&s.id))
            .map(|s| PlanterBox {
                id: s.id,
                name: s.name.clone(),
                greenhouse: s.greenhouse.clone(),
                state: BoxState::Available,
                reserved_label: None,
                updated_at: at,
            })
            .collect();

        if new_boxes.is_empty() {
            return Ok(0);
        }
        if self.boxes.len() + new_boxes.len() > crate::limits::MAX_BOXES {
            return Err(EngineError::LimitExceeded("too many boxes"));
        }

        let added = new_boxes.len();
        self.commit(Commit {
            at,
            actor,
            change: Change::Provisioned { boxes: new_boxes },
            audit: Vec::new(),
            notices: Vec::new(),
        })
        .await?;
        Ok(added)
    }

    /// Rewrite the WAL as a single snapshot of current state. The audit
    /// trail is carried whole — compaction discards no history.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut boxes: Vec<PlanterBox> = self.boxes.iter().map(|r| r.value().clone()).collect();
        boxes.sort_by_key(|b| b.id);

        let snapshot = Snapshot {
            boxes,
            registrations: self.ledger.all(),
            waitlist: self.waitlist.all(),
            audit: self.audit.all(),
            notices: self.outbox.all(),
            opens_at: self.opening(),
        };

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                records: vec![WalRecord::Snapshot(snapshot)],
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
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

    /// Audit helper: one event row attributed to `actor`.
    pub(super) fn audit_event(
        actor: &Actor,
        at: Ms,
        action: AuditAction,
        entity_type: EntityType,
        entity_id: String,
        before: Option<serde_json::Value>,
        after: Option<serde_json::Value>,
        reason: Option<String>,
    ) -> AuditEvent {
        AuditEvent {
            id: Ulid::new(),
            at,
            actor_type: actor.actor_type,
            actor_id: actor.actor_id.clone(),
            action,
            entity_type,
            entity_id,
            before: before.map(|v| v.to_string()),
            after: after.map(|v| v.to_string()),
            reason,
        }
    }
}
