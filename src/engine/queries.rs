use ulid::Ulid;

use crate::limits;
use crate::model::*;

use super::{Engine, now_ms};

/// Filters for the audit timeline. All optional; unset means match-all.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub action: Option<AuditAction>,
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub actor_type: Option<ActorType>,
    /// Only events strictly before this timestamp.
    pub before: Option<Ms>,
    /// Only events at or after this timestamp.
    pub after: Option<Ms>,
    /// Page size, clamped to `limits::MAX_AUDIT_PAGE`.
    pub limit: Option<usize>,
}

/// Snapshot reads. None of these take transaction locks — staleness is
/// acceptable for status displays, and anything that matters re-checks
/// under lock inside its mutation.
impl Engine {
    /// Public status banner: whether registration has opened and
    /// whether any box is left.
    pub fn status(&self) -> PublicStatus {
        let opens_at = self.opening();
        PublicStatus {
            is_open: opens_at.is_some_and(|t| t <= now_ms()),
            opens_at,
            available_boxes: self.available_box_count(),
        }
    }

    pub fn planter_box(&self, id: BoxId) -> Option<PlanterBox> {
        self.box_row(id)
    }

    /// All boxes ordered by id.
    pub fn list_boxes(&self) -> Vec<PlanterBox> {
        let mut boxes: Vec<PlanterBox> = self.boxes.iter().map(|r| r.value().clone()).collect();
        boxes.sort_by_key(|b| b.id);
        boxes
    }

    /// Per-greenhouse occupancy counts, ordered by each greenhouse's
    /// lowest box id.
    pub fn greenhouse_summaries(&self) -> Vec<GreenhouseSummary> {
        let boxes = self.list_boxes();
        let mut summaries: Vec<GreenhouseSummary> = Vec::new();
        for b in &boxes {
            let idx = match summaries.iter().position(|s| s.name == b.greenhouse) {
                Some(i) => i,
                None => {
                    summaries.push(GreenhouseSummary {
                        name: b.greenhouse.clone(),
                        total: 0,
                        available: 0,
                        occupied: 0,
                        reserved: 0,
                    });
                    summaries.len() - 1
                }
            };
            let summary = &mut summaries[idx];
            summary.total += 1;
            match b.state {
                BoxState::Available => summary.available += 1,
                BoxState::Occupied => summary.occupied += 1,
                BoxState::Reserved => summary.reserved += 1,
            }
        }
        summaries
    }

    pub fn registration(&self, id: Ulid) -> Option<Registration> {
        self.ledger().get(&id)
    }

    /// The active registration occupying a box, if any.
    pub fn occupant(&self, box_id: BoxId) -> Option<Registration> {
        self.ledger().active_for_box(box_id)
    }

    pub fn active_registration_for(&self, apartment_key: &str) -> Option<Registration> {
        self.ledger().active_for_apartment(apartment_key)
    }

    /// Every registration row, newest first (the admin listing).
    pub fn list_registrations(&self) -> Vec<Registration> {
        let mut regs = self.ledger().all();
        regs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        regs
    }

    pub fn waitlist_entry(&self, id: Ulid) -> Option<WaitlistEntry> {
        self.waitlist().get(&id)
    }

    /// Waiting entries in FIFO order.
    pub fn list_waitlist(&self) -> Vec<WaitlistEntry> {
        self.waitlist().waiting_ordered()
    }

    /// The apartment's place in the queue, if it is waiting. Rank is
    /// 1-based: one plus the number of strictly earlier waiting entries.
    pub fn waitlist_position(&self, apartment_key: &str) -> Option<WaitlistPosition> {
        let entry = self.waitlist().waiting_for_apartment(apartment_key)?;
        let position = self.waitlist().position(apartment_key)?;
        Some(WaitlistPosition {
            entry_id: entry.id,
            position,
            joined_at: entry.created_at,
        })
    }

    /// Audit timeline, newest first.
    pub fn audit_events(&self, filter: &AuditFilter) -> Vec<AuditEvent> {
        let limit = filter
            .limit
            .unwrap_or(limits::DEFAULT_AUDIT_PAGE)
            .clamp(1, limits::MAX_AUDIT_PAGE);
        self.audit_log().filtered(limit, |e| {
            filter.action.is_none_or(|a| e.action == a)
                && filter.entity_type.is_none_or(|t| e.entity_type == t)
                && filter
                    .entity_id
                    .as_deref()
                    .is_none_or(|id| e.entity_id == id)
                && filter.actor_type.is_none_or(|t| e.actor_type == t)
                && filter.before.is_none_or(|t| e.at < t)
                && filter.after.is_none_or(|t| e.at >= t)
        })
    }

    pub fn audit_len(&self) -> usize {
        self.audit_log().len()
    }

    pub fn notice(&self, id: Ulid) -> Option<Notice> {
        self.outbox().get(&id)
    }

    /// Notices owed a delivery attempt, oldest first. Consumed by the
    /// dispatcher.
    pub fn pending_notices(&self, max_attempts: u32) -> Vec<Notice> {
        self.outbox().deliverable(max_attempts)
    }
}
