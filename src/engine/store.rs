use std::sync::RwLock;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

/// Registration rows plus the two partial unique indexes: at most one
/// active registration per apartment key and per box. `claim_*` uses the
/// map entry API, so a claim either takes the slot atomically or reports
/// the holder — this is the storage-level constraint backstop behind the
/// engine's pre-checks.
#[derive(Default)]
pub(super) struct LedgerStore {
    rows: DashMap<Ulid, Registration>,
    active_by_apartment: DashMap<String, Ulid>,
    active_by_box: DashMap<BoxId, Ulid>,
}

impl LedgerStore {
    pub fn get(&self, id: &Ulid) -> Option<Registration> {
        self.rows.get(id).map(|r| r.value().clone())
    }

    pub fn active_for_apartment(&self, key: &str) -> Option<Registration> {
        let id = *self.active_by_apartment.get(key)?.value();
        self.get(&id)
    }

    pub fn active_for_box(&self, box_id: BoxId) -> Option<Registration> {
        let id = *self.active_by_box.get(&box_id)?.value();
        self.get(&id)
    }

    /// Claim the apartment's active slot. Err carries the current holder.
    pub fn claim_apartment(&self, key: &str, id: Ulid) -> Result<(), Ulid> {
        match self.active_by_apartment.entry(key.to_string()) {
            Entry::Occupied(e) if *e.get() != id => Err(*e.get()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }

    /// Claim the box's active slot. Err carries the current holder.
    pub fn claim_box(&self, box_id: BoxId, id: Ulid) -> Result<(), Ulid> {
        match self.active_by_box.entry(box_id) {
            Entry::Occupied(e) if *e.get() != id => Err(*e.get()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }

    pub fn release_apartment(&self, key: &str) {
        self.active_by_apartment.remove(key);
    }

    pub fn release_box(&self, box_id: BoxId) {
        self.active_by_box.remove(&box_id);
    }

    /// Point the box index at a row unconditionally (apply/replay of a
    /// validated move).
    pub fn index_box(&self, box_id: BoxId, id: Ulid) {
        self.active_by_box.insert(box_id, id);
    }

    /// Insert an active row and index it. Used at apply/replay time;
    /// overwrites an identical claim made during validation.
    pub fn insert_active(&self, reg: Registration) {
        self.active_by_apartment
            .insert(reg.registrant.apartment_key.clone(), reg.id);
        self.active_by_box.insert(reg.box_id, reg.id);
        self.rows.insert(reg.id, reg);
    }

    /// Insert a non-active historical row (snapshot load).
    pub fn insert_row(&self, reg: Registration) {
        if reg.status == RegistrationStatus::Active {
            self.insert_active(reg);
        } else {
            self.rows.insert(reg.id, reg);
        }
    }

    pub fn update(&self, id: &Ulid, f: impl FnOnce(&mut Registration)) -> bool {
        match self.rows.get_mut(id) {
            Some(mut row) => {
                f(&mut row);
                true
            }
            None => false,
        }
    }

    pub fn all(&self) -> Vec<Registration> {
        self.rows.iter().map(|r| r.value().clone()).collect()
    }

    pub fn clear(&self) {
        self.rows.clear();
        self.active_by_apartment.clear();
        self.active_by_box.clear();
    }
}

/// Waitlist rows plus the at-most-one-waiting-per-apartment index.
#[derive(Default)]
pub(super) struct WaitlistStore {
    rows: DashMap<Ulid, WaitlistEntry>,
    waiting_by_apartment: DashMap<String, Ulid>,
}

impl WaitlistStore {
    pub fn get(&self, id: &Ulid) -> Option<WaitlistEntry> {
        self.rows.get(id).map(|r| r.value().clone())
    }

    pub fn waiting_for_apartment(&self, key: &str) -> Option<WaitlistEntry> {
        let id = *self.waiting_by_apartment.get(key)?.value();
        self.get(&id)
    }

    pub fn claim_waiting(&self, key: &str, id: Ulid) -> Result<(), Ulid> {
        match self.waiting_by_apartment.entry(key.to_string()) {
            Entry::Occupied(e) if *e.get() != id => Err(*e.get()),
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(e) => {
                e.insert(id);
                Ok(())
            }
        }
    }

    pub fn release_waiting(&self, key: &str) {
        self.waiting_by_apartment.remove(key);
    }

    pub fn insert_waiting(&self, entry: WaitlistEntry) {
        self.waiting_by_apartment
            .insert(entry.registrant.apartment_key.clone(), entry.id);
        self.rows.insert(entry.id, entry);
    }

    pub fn insert_row(&self, entry: WaitlistEntry) {
        if entry.status == WaitlistStatus::Waiting {
            self.insert_waiting(entry);
        } else {
            self.rows.insert(entry.id, entry);
        }
    }

    pub fn update(&self, id: &Ulid, f: impl FnOnce(&mut WaitlistEntry)) -> bool {
        match self.rows.get_mut(id) {
            Some(mut row) => {
                f(&mut row);
                true
            }
            None => false,
        }
    }

    /// Waiting entries in FIFO order: `created_at` ascending, ties
    /// broken by id.
    pub fn waiting_ordered(&self) -> Vec<WaitlistEntry> {
        let mut waiting: Vec<WaitlistEntry> = self
            .rows
            .iter()
            .filter(|r| r.value().status == WaitlistStatus::Waiting)
            .map(|r| r.value().clone())
            .collect();
        waiting.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        waiting
    }

    /// 1-based FIFO rank of the apartment's waiting entry.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.waiting_ordered()
            .iter()
            .position(|e| e.registrant.apartment_key == key)
            .map(|i| i + 1)
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting_by_apartment.len()
    }

    pub fn all(&self) -> Vec<WaitlistEntry> {
        self.rows.iter().map(|r| r.value().clone()).collect()
    }

    pub fn clear(&self) {
        self.rows.clear();
        self.waiting_by_apartment.clear();
    }
}

/// The append-only audit trail. There is deliberately no update or
/// delete path — immutability is enforced by this API surface, the way
/// the backing table would enforce it with a trigger.
#[derive(Default)]
pub(super) struct AuditLog {
    rows: RwLock<Vec<AuditEvent>>,
}

impl AuditLog {
    pub fn append(&self, event: AuditEvent) {
        self.rows.write().expect("audit log poisoned").push(event);
    }

    pub fn len(&self) -> usize {
        self.rows.read().expect("audit log poisoned").len()
    }

    /// Newest-first scan with a caller-supplied predicate and cap.
    pub fn filtered(
        &self,
        limit: usize,
        pred: impl Fn(&AuditEvent) -> bool,
    ) -> Vec<AuditEvent> {
        self.rows
            .read()
            .expect("audit log poisoned")
            .iter()
            .rev()
            .filter(|e| pred(e))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<AuditEvent> {
        self.rows.read().expect("audit log poisoned").clone()
    }

    pub fn load(&self, events: Vec<AuditEvent>) {
        *self.rows.write().expect("audit log poisoned") = events;
    }
}

/// Durable notice queue drained by the dispatcher after commit.
#[derive(Default)]
pub(super) struct Outbox {
    rows: DashMap<Ulid, Notice>,
}

impl Outbox {
    pub fn insert(&self, notice: Notice) {
        self.rows.insert(notice.id, notice);
    }

    pub fn get(&self, id: &Ulid) -> Option<Notice> {
        self.rows.get(id).map(|r| r.value().clone())
    }

    pub fn update(&self, id: &Ulid, f: impl FnOnce(&mut Notice)) -> bool {
        match self.rows.get_mut(id) {
            Some(mut row) => {
                f(&mut row);
                true
            }
            None => false,
        }
    }

    /// Notices still owed a delivery attempt, oldest first. Failed
    /// notices are retried until the attempt cap.
    pub fn deliverable(&self, max_attempts: u32) -> Vec<Notice> {
        let mut due: Vec<Notice> = self
            .rows
            .iter()
            .map(|r| r.value().clone())
            .filter(|n| match n.status {
                NoticeStatus::Pending => true,
                NoticeStatus::Failed => n.attempts < max_attempts,
                NoticeStatus::Sent => false,
            })
            .collect();
        due.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        due
    }

    pub fn all(&self) -> Vec<Notice> {
        self.rows.iter().map(|r| r.value().clone()).collect()
    }

    pub fn clear(&self) {
        self.rows.clear();
    }
}
