use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// Planter box identifier. Small fixed integers assigned at provisioning.
pub type BoxId = u32;

/// Label applied to a box held back by an admin when none is given.
pub const DEFAULT_HOLD_LABEL: &str = "Admin Hold";

/// Occupancy state of a planter box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxState {
    Available,
    Occupied,
    Reserved,
}

impl BoxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoxState::Available => "available",
            BoxState::Occupied => "occupied",
            BoxState::Reserved => "reserved",
        }
    }
}

impl std::fmt::Display for BoxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One allocatable planter box. Provisioned once, never deleted; `state`
/// and `reserved_label` change only through engine commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanterBox {
    pub id: BoxId,
    pub name: String,
    pub greenhouse: String,
    pub state: BoxState,
    pub reserved_label: Option<String>,
    pub updated_at: Ms,
}

/// Catalog entry used to provision a box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxSpec {
    pub id: BoxId,
    pub name: String,
    pub greenhouse: String,
}

impl BoxSpec {
    pub fn new(id: BoxId, name: impl Into<String>, greenhouse: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            greenhouse: greenhouse.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Da,
    En,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Da => "da",
            Language::En => "en",
        }
    }
}

/// Consumer identity as delivered by the upstream validation layer:
/// fields are already shape-checked and `apartment_key` is already
/// normalized. The engine treats all of this as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registrant {
    pub name: String,
    pub email: String,
    pub street: String,
    pub house_number: u32,
    pub floor: Option<String>,
    pub door: Option<String>,
    pub language: Language,
    pub apartment_key: String,
}

/// Registration lifecycle. Transitions are forward-only: a removed or
/// switched registration is never reactivated — the apartment registers
/// again, creating a new row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationStatus {
    Active,
    Switched,
    Removed,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStatus::Active => "active",
            RegistrationStatus::Switched => "switched",
            RegistrationStatus::Removed => "removed",
        }
    }
}

/// The binding between an apartment and a box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub id: Ulid,
    pub box_id: BoxId,
    pub registrant: Registrant,
    pub status: RegistrationStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitlistStatus {
    Waiting,
    Assigned,
    Cancelled,
}

impl WaitlistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitlistStatus::Waiting => "waiting",
            WaitlistStatus::Assigned => "assigned",
            WaitlistStatus::Cancelled => "cancelled",
        }
    }
}

/// A pending request for a box. `created_at` defines the FIFO order;
/// ties are broken by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub registrant: Registrant,
    pub status: WaitlistStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    Public,
    Admin,
    System,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Public => "public",
            ActorType::Admin => "admin",
            ActorType::System => "system",
        }
    }
}

/// Who initiated an operation, for audit attribution. Supplied by the
/// caller's identity context and trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
}

impl Actor {
    pub fn public() -> Self {
        Self {
            actor_type: ActorType::Public,
            actor_id: None,
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            actor_type: ActorType::Admin,
            actor_id: Some(id.into()),
        }
    }

    pub fn system() -> Self {
        Self {
            actor_type: ActorType::System,
            actor_id: None,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.actor_type == ActorType::Admin
    }
}

/// The auditable action vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    RegistrationCreate,
    RegistrationSwitch,
    RegistrationMove,
    RegistrationRemove,
    WaitlistAdd,
    WaitlistRemove,
    WaitlistAssign,
    WaitlistReorderPreserve,
    BoxStateChange,
    OpeningDatetimeChange,
    EmailSent,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RegistrationCreate => "registration_create",
            AuditAction::RegistrationSwitch => "registration_switch",
            AuditAction::RegistrationMove => "registration_move",
            AuditAction::RegistrationRemove => "registration_remove",
            AuditAction::WaitlistAdd => "waitlist_add",
            AuditAction::WaitlistRemove => "waitlist_remove",
            AuditAction::WaitlistAssign => "waitlist_assign",
            AuditAction::WaitlistReorderPreserve => "waitlist_reorder_preserve",
            AuditAction::BoxStateChange => "box_state_change",
            AuditAction::OpeningDatetimeChange => "opening_datetime_change",
            AuditAction::EmailSent => "email_sent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityType {
    PlanterBox,
    Registration,
    WaitlistEntry,
    Settings,
    Notice,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::PlanterBox => "planter_box",
            EntityType::Registration => "registration",
            EntityType::WaitlistEntry => "waitlist_entry",
            EntityType::Settings => "settings",
            EntityType::Notice => "notice",
        }
    }
}

/// One immutable record of a committed mutation. `before` and `after`
/// hold JSON text snapshots (the WAL codec is not self-describing, so
/// structured values are stored serialized).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Ulid,
    pub at: Ms,
    pub actor_type: ActorType,
    pub actor_id: Option<String>,
    pub action: AuditAction,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub before: Option<String>,
    pub after: Option<String>,
    pub reason: Option<String>,
}

/// What happens to the box when a registration is removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleasePolicy {
    /// Box returns to the public pool.
    MakePublic,
    /// Box is held back by the admin, shown as reserved with a label.
    AdminHold { label: Option<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Registered,
    Switched,
    Moved,
    Removed,
    WaitlistAssigned,
}

impl NoticeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoticeKind::Registered => "registered",
            NoticeKind::Switched => "switched",
            NoticeKind::Moved => "moved",
            NoticeKind::Removed => "removed",
            NoticeKind::WaitlistAssigned => "waitlist_assigned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeStatus {
    Pending,
    Sent,
    Failed,
}

/// A queued consumer notification. Created inside the committing
/// transaction; delivered by the dispatcher after commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: Ulid,
    pub kind: NoticeKind,
    pub recipient_name: String,
    pub recipient_email: String,
    pub language: Language,
    pub box_id: BoxId,
    pub old_box_id: Option<BoxId>,
    pub status: NoticeStatus,
    pub attempts: u32,
    pub created_at: Ms,
    pub sent_at: Option<Ms>,
}

/// The state change carried by one commit. Each variant holds everything
/// replay needs to rebuild the rows it touches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Provisioned {
        boxes: Vec<PlanterBox>,
    },
    Registered {
        registration: Registration,
    },
    Switched {
        old_registration_id: Ulid,
        old_box_id: BoxId,
        registration: Registration,
    },
    Moved {
        registration_id: Ulid,
        old_box_id: BoxId,
        new_box_id: BoxId,
    },
    Removed {
        registration_id: Ulid,
        box_id: BoxId,
        box_state: BoxState,
        reserved_label: Option<String>,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    /// The idempotent re-join: nothing mutates, but the fairness event
    /// is durably audited.
    WaitlistPreserved {
        entry_id: Ulid,
    },
    WaitlistAssigned {
        entry_id: Ulid,
        registration: Registration,
    },
    WaitlistCancelled {
        entry_id: Ulid,
    },
    BoxHoldSet {
        box_id: BoxId,
        state: BoxState,
        reserved_label: Option<String>,
    },
    OpeningChanged {
        opens_at: Option<Ms>,
    },
    NoticeSettled {
        notice_id: Ulid,
        status: NoticeStatus,
    },
}

impl Change {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Change::Provisioned { .. } => "provision",
            Change::Registered { .. } => "register",
            Change::Switched { .. } => "switch",
            Change::Moved { .. } => "move",
            Change::Removed { .. } => "remove",
            Change::WaitlistJoined { .. } => "waitlist_join",
            Change::WaitlistPreserved { .. } => "waitlist_preserve",
            Change::WaitlistAssigned { .. } => "waitlist_assign",
            Change::WaitlistCancelled { .. } => "waitlist_cancel",
            Change::BoxHoldSet { .. } => "box_hold",
            Change::OpeningChanged { .. } => "opening_change",
            Change::NoticeSettled { .. } => "notice_settle",
        }
    }

    /// Box ids whose rows this change rewrites.
    pub fn touched_boxes(&self) -> Vec<BoxId> {
        match self {
            Change::Registered { registration } => vec![registration.box_id],
            Change::Switched {
                old_box_id,
                registration,
                ..
            } => vec![*old_box_id, registration.box_id],
            Change::Moved {
                old_box_id,
                new_box_id,
                ..
            } => vec![*old_box_id, *new_box_id],
            Change::Removed { box_id, .. } => vec![*box_id],
            Change::WaitlistAssigned { registration, .. } => vec![registration.box_id],
            Change::BoxHoldSet { box_id, .. } => vec![*box_id],
            Change::Provisioned { boxes } => boxes.iter().map(|b| b.id).collect(),
            _ => Vec::new(),
        }
    }
}

/// One committed transaction: the state change, its audit rows, and any
/// notices queued alongside it. This is the WAL unit — either the whole
/// record replays or none of it does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub at: Ms,
    pub actor: Actor,
    pub change: Change,
    pub audit: Vec<AuditEvent>,
    pub notices: Vec<Notice>,
}

/// Full engine state, written by compaction. The audit trail is carried
/// whole — compaction never discards history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub boxes: Vec<PlanterBox>,
    pub registrations: Vec<Registration>,
    pub waitlist: Vec<WaitlistEntry>,
    pub audit: Vec<AuditEvent>,
    pub notices: Vec<Notice>,
    pub opens_at: Option<Ms>,
}

/// The on-disk WAL record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    Commit(Commit),
    Snapshot(Snapshot),
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicStatus {
    pub is_open: bool,
    pub opens_at: Option<Ms>,
    pub available_boxes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreenhouseSummary {
    pub name: String,
    pub total: usize,
    pub available: usize,
    pub occupied: usize,
    pub reserved: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitlistPosition {
    pub entry_id: Ulid,
    pub position: usize,
    pub joined_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterOutcome {
    pub registration_id: Ulid,
    pub box_id: BoxId,
    pub apartment_key: String,
    /// Set when the registration replaced an existing one via switch.
    pub switched_from: Option<BoxId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined {
        entry_id: Ulid,
        position: usize,
    },
    /// The apartment was already waiting: no new row, original
    /// arrival time preserved.
    AlreadyWaiting {
        entry_id: Ulid,
        position: usize,
        joined_at: Ms,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignOutcome {
    pub registration_id: Ulid,
    pub entry_id: Ulid,
    pub box_id: BoxId,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registrant(key: &str) -> Registrant {
        Registrant {
            name: "Astrid Holm".into(),
            email: "astrid@example.com".into(),
            street: "Else Alfelts Vej".into(),
            house_number: 130,
            floor: None,
            door: None,
            language: Language::Da,
            apartment_key: key.into(),
        }
    }

    #[test]
    fn enum_labels() {
        assert_eq!(BoxState::Reserved.as_str(), "reserved");
        assert_eq!(RegistrationStatus::Switched.as_str(), "switched");
        assert_eq!(WaitlistStatus::Waiting.as_str(), "waiting");
        assert_eq!(ActorType::Public.as_str(), "public");
        assert_eq!(
            AuditAction::WaitlistReorderPreserve.as_str(),
            "waitlist_reorder_preserve"
        );
    }

    #[test]
    fn touched_boxes_per_change() {
        let reg = Registration {
            id: Ulid::new(),
            box_id: 7,
            registrant: registrant("else alfelts vej 130"),
            status: RegistrationStatus::Active,
            created_at: 1000,
            updated_at: 1000,
        };
        assert_eq!(
            Change::Registered {
                registration: reg.clone()
            }
            .touched_boxes(),
            vec![7]
        );
        assert_eq!(
            Change::Switched {
                old_registration_id: Ulid::new(),
                old_box_id: 3,
                registration: reg,
            }
            .touched_boxes(),
            vec![3, 7]
        );
        assert!(
            Change::OpeningChanged { opens_at: None }
                .touched_boxes()
                .is_empty()
        );
    }

    #[test]
    fn commit_serialization_roundtrip() {
        let record = WalRecord::Commit(Commit {
            at: 1234,
            actor: Actor::admin("a1"),
            change: Change::Registered {
                registration: Registration {
                    id: Ulid::new(),
                    box_id: 1,
                    registrant: registrant("else alfelts vej 130"),
                    status: RegistrationStatus::Active,
                    created_at: 1234,
                    updated_at: 1234,
                },
            },
            audit: vec![AuditEvent {
                id: Ulid::new(),
                at: 1234,
                actor_type: ActorType::Admin,
                actor_id: Some("a1".into()),
                action: AuditAction::RegistrationCreate,
                entity_type: EntityType::Registration,
                entity_id: "x".into(),
                before: None,
                after: Some(r#"{"box_id":1}"#.into()),
                reason: None,
            }],
            notices: Vec::new(),
        });
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: WalRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn snapshot_serialization_roundtrip() {
        let record = WalRecord::Snapshot(Snapshot {
            boxes: vec![PlanterBox {
                id: 1,
                name: "Linaria".into(),
                greenhouse: "Kronen".into(),
                state: BoxState::Available,
                reserved_label: None,
                updated_at: 99,
            }],
            registrations: Vec::new(),
            waitlist: Vec::new(),
            audit: Vec::new(),
            notices: Vec::new(),
            opens_at: Some(5000),
        });
        let bytes = bincode::serialize(&record).unwrap();
        let decoded: WalRecord = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
