use serde_json::json;
use ulid::Ulid;

use crate::limits;
use crate::model::*;

use super::{Engine, EngineError, now_ms};

/// How often an operation re-discovers state after losing a race
/// between its snapshot read and its lock acquisition.
const LOCK_RETRIES: usize = 3;

fn notice(
    kind: NoticeKind,
    registrant: &Registrant,
    box_id: BoxId,
    old_box_id: Option<BoxId>,
    at: Ms,
) -> Notice {
    Notice {
        id: Ulid::new(),
        kind,
        recipient_name: registrant.name.clone(),
        recipient_email: registrant.email.clone(),
        language: registrant.language,
        box_id,
        old_box_id,
        status: NoticeStatus::Pending,
        attempts: 0,
        created_at: at,
        sent_at: None,
    }
}

impl Engine {
    /// Register an apartment on a box.
    ///
    /// If the apartment already holds an active registration the call
    /// fails with `SWITCH_REQUIRED` carrying the held box — unless
    /// `confirm_switch` is set, in which case the old registration is
    /// marked switched, its box freed, and the new one created, all in
    /// one transaction.
    pub async fn register(
        &self,
        actor: Actor,
        box_id: BoxId,
        registrant: Registrant,
        confirm_switch: bool,
    ) -> Result<RegisterOutcome, EngineError> {
        self.register_inner(actor, box_id, registrant, confirm_switch, false)
            .await
    }

    /// Self-service switch keyed by apartment: re-register on a
    /// different box, atomically replacing the current registration.
    /// Fails NOT_FOUND if the apartment holds nothing to switch from.
    pub async fn switch(
        &self,
        actor: Actor,
        new_box_id: BoxId,
        registrant: Registrant,
    ) -> Result<RegisterOutcome, EngineError> {
        self.register_inner(actor, new_box_id, registrant, true, true)
            .await
    }

    async fn register_inner(
        &self,
        actor: Actor,
        box_id: BoxId,
        registrant: Registrant,
        confirm_switch: bool,
        require_existing: bool,
    ) -> Result<RegisterOutcome, EngineError> {
        let key = registrant.apartment_key.clone();

        // The snapshot read decides which boxes to lock; if the
        // apartment's registration moved before the locks were ours,
        // rediscover and relock.
        for _ in 0..LOCK_RETRIES {
            let existing = self.ledger().active_for_apartment(&key);
            let lock_ids: Vec<BoxId> = match &existing {
                Some(reg) if confirm_switch => vec![reg.box_id, box_id],
                _ => vec![box_id],
            };
            let _box_guards = self.lock_boxes(&lock_ids).await?;
            let _apt_guard = self.lock_apartment(&key).await;

            let current = self.ledger().active_for_apartment(&key);
            let stable = match (&existing, &current) {
                (None, None) => true,
                (Some(a), Some(b)) => a.id == b.id && a.box_id == b.box_id,
                _ => false,
            };
            if !stable {
                continue;
            }

            return match current {
                None if require_existing => Err(EngineError::NoActiveRegistration(key)),
                None => {
                    self.create_registration(&actor, box_id, registrant)
                        .await
                }
                Some(cur) if !confirm_switch => Err(EngineError::SwitchRequired {
                    existing_box: cur.box_id,
                }),
                Some(cur) => {
                    self.switch_registration(&actor, box_id, registrant, cur)
                        .await
                }
            };
        }

        match self.ledger().active_for_apartment(&key) {
            Some(cur) => Err(EngineError::SwitchRequired {
                existing_box: cur.box_id,
            }),
            None => Err(EngineError::Contended("register")),
        }
    }

    /// Plain create. Caller holds the box lock and the apartment lock
    /// and has verified the apartment holds nothing active.
    async fn create_registration(
        &self,
        actor: &Actor,
        box_id: BoxId,
        registrant: Registrant,
    ) -> Result<RegisterOutcome, EngineError> {
        let row = self
            .box_row(box_id)
            .ok_or(EngineError::BoxNotFound(box_id))?;
        match row.state {
            BoxState::Occupied => return Err(EngineError::BoxOccupied(box_id)),
            BoxState::Reserved if !actor.is_admin() => {
                return Err(EngineError::BoxReserved(box_id));
            }
            _ => {}
        }

        let at = now_ms();
        let reg_id = Ulid::new();
        let key = registrant.apartment_key.clone();

        // Constraint backstop. Both detection paths — this claim and the
        // pre-check above — surface the identical conflict codes.
        if let Err(holder) = self.ledger().claim_apartment(&key, reg_id) {
            return Err(EngineError::ApartmentHasRegistration {
                apartment_key: key,
                registration_id: holder,
            });
        }
        if self.ledger().claim_box(box_id, reg_id).is_err() {
            self.ledger().release_apartment(&key);
            return Err(EngineError::BoxOccupied(box_id));
        }

        let registration = Registration {
            id: reg_id,
            box_id,
            registrant,
            status: RegistrationStatus::Active,
            created_at: at,
            updated_at: at,
        };

        let audit = vec![
            Self::audit_event(
                actor,
                at,
                AuditAction::RegistrationCreate,
                EntityType::Registration,
                reg_id.to_string(),
                None,
                Some(json!({
                    "box_id": box_id,
                    "apartment_key": key,
                    "name": registration.registrant.name,
                    "email": registration.registrant.email,
                })),
                None,
            ),
            Self::audit_event(
                actor,
                at,
                AuditAction::BoxStateChange,
                EntityType::PlanterBox,
                box_id.to_string(),
                Some(json!({"state": row.state.as_str()})),
                Some(json!({"state": "occupied"})),
                None,
            ),
        ];
        let notices = vec![notice(
            NoticeKind::Registered,
            &registration.registrant,
            box_id,
            None,
            at,
        )];

        let commit = Commit {
            at,
            actor: actor.clone(),
            change: Change::Registered { registration },
            audit,
            notices,
        };
        if let Err(e) = self.commit(commit).await {
            self.ledger().release_apartment(&key);
            self.ledger().release_box(box_id);
            return Err(e);
        }

        Ok(RegisterOutcome {
            registration_id: reg_id,
            box_id,
            apartment_key: key,
            switched_from: None,
        })
    }

    /// Confirmed switch. Caller holds both box locks and the apartment
    /// lock; `cur` is the apartment's active registration re-read under
    /// those locks.
    async fn switch_registration(
        &self,
        actor: &Actor,
        new_box_id: BoxId,
        registrant: Registrant,
        cur: Registration,
    ) -> Result<RegisterOutcome, EngineError> {
        if cur.box_id == new_box_id {
            return Err(EngineError::SameBox(new_box_id));
        }
        let new_row = self
            .box_row(new_box_id)
            .ok_or(EngineError::BoxNotFound(new_box_id))?;
        match new_row.state {
            BoxState::Occupied => return Err(EngineError::BoxOccupied(new_box_id)),
            BoxState::Reserved if !actor.is_admin() => {
                return Err(EngineError::BoxReserved(new_box_id));
            }
            _ => {}
        }

        let at = now_ms();
        let reg_id = Ulid::new();
        let key = registrant.apartment_key.clone();

        // The apartment slot transfers from cur to the new row inside
        // the commit; only the new box needs a claim here.
        if self.ledger().claim_box(new_box_id, reg_id).is_err() {
            return Err(EngineError::BoxOccupied(new_box_id));
        }

        let registration = Registration {
            id: reg_id,
            box_id: new_box_id,
            registrant,
            status: RegistrationStatus::Active,
            created_at: at,
            updated_at: at,
        };

        let audit = vec![
            Self::audit_event(
                actor,
                at,
                AuditAction::RegistrationSwitch,
                EntityType::Registration,
                cur.id.to_string(),
                Some(json!({"box_id": cur.box_id, "status": "active"})),
                Some(json!({"status": "switched", "new_box_id": new_box_id})),
                None,
            ),
            Self::audit_event(
                actor,
                at,
                AuditAction::RegistrationCreate,
                EntityType::Registration,
                reg_id.to_string(),
                None,
                Some(json!({
                    "box_id": new_box_id,
                    "apartment_key": key,
                    "from_switch": cur.id.to_string(),
                })),
                None,
            ),
            Self::audit_event(
                actor,
                at,
                AuditAction::BoxStateChange,
                EntityType::PlanterBox,
                cur.box_id.to_string(),
                Some(json!({"state": "occupied"})),
                Some(json!({"state": "available"})),
                None,
            ),
            Self::audit_event(
                actor,
                at,
                AuditAction::BoxStateChange,
                EntityType::PlanterBox,
                new_box_id.to_string(),
                Some(json!({"state": new_row.state.as_str()})),
                Some(json!({"state": "occupied"})),
                None,
            ),
        ];
        let notices = vec![notice(
            NoticeKind::Switched,
            &registration.registrant,
            new_box_id,
            Some(cur.box_id),
            at,
        )];

        let commit = Commit {
            at,
            actor: actor.clone(),
            change: Change::Switched {
                old_registration_id: cur.id,
                old_box_id: cur.box_id,
                registration,
            },
            audit,
            notices,
        };
        if let Err(e) = self.commit(commit).await {
            self.ledger().release_box(new_box_id);
            return Err(e);
        }

        Ok(RegisterOutcome {
            registration_id: reg_id,
            box_id: new_box_id,
            apartment_key: key,
            switched_from: Some(cur.box_id),
        })
    }

    /// Relocate an active registration to a different box. All three
    /// writes — registration row, old box, new box — land in one commit.
    pub async fn move_registration(
        &self,
        actor: Actor,
        registration_id: Ulid,
        new_box_id: BoxId,
    ) -> Result<(), EngineError> {
        for _ in 0..LOCK_RETRIES {
            let reg = self
                .ledger()
                .get(&registration_id)
                .ok_or(EngineError::RegistrationNotFound(registration_id))?;
            if reg.status != RegistrationStatus::Active {
                return Err(EngineError::NotActive(registration_id));
            }
            if reg.box_id == new_box_id {
                return Err(EngineError::SameBox(new_box_id));
            }

            let _box_guards = self.lock_boxes(&[reg.box_id, new_box_id]).await?;
            let _apt_guard = self.lock_apartment(&reg.registrant.apartment_key).await;

            let cur = self
                .ledger()
                .get(&registration_id)
                .ok_or(EngineError::RegistrationNotFound(registration_id))?;
            if cur.status != RegistrationStatus::Active {
                return Err(EngineError::NotActive(registration_id));
            }
            if cur.box_id != reg.box_id {
                continue;
            }
            let old_box_id = cur.box_id;

            let new_row = self
                .box_row(new_box_id)
                .ok_or(EngineError::BoxNotFound(new_box_id))?;
            match new_row.state {
                BoxState::Occupied => return Err(EngineError::BoxOccupied(new_box_id)),
                BoxState::Reserved if !actor.is_admin() => {
                    return Err(EngineError::BoxReserved(new_box_id));
                }
                _ => {}
            }

            let at = now_ms();
            if self.ledger().claim_box(new_box_id, registration_id).is_err() {
                return Err(EngineError::BoxOccupied(new_box_id));
            }

            let audit = vec![
                Self::audit_event(
                    &actor,
                    at,
                    AuditAction::RegistrationMove,
                    EntityType::Registration,
                    registration_id.to_string(),
                    Some(json!({"box_id": old_box_id})),
                    Some(json!({"box_id": new_box_id})),
                    None,
                ),
                Self::audit_event(
                    &actor,
                    at,
                    AuditAction::BoxStateChange,
                    EntityType::PlanterBox,
                    old_box_id.to_string(),
                    Some(json!({"state": "occupied"})),
                    Some(json!({"state": "available"})),
                    None,
                ),
                Self::audit_event(
                    &actor,
                    at,
                    AuditAction::BoxStateChange,
                    EntityType::PlanterBox,
                    new_box_id.to_string(),
                    Some(json!({"state": new_row.state.as_str()})),
                    Some(json!({"state": "occupied"})),
                    None,
                ),
            ];
            let notices = vec![notice(
                NoticeKind::Moved,
                &cur.registrant,
                new_box_id,
                Some(old_box_id),
                at,
            )];

            let commit = Commit {
                at,
                actor,
                change: Change::Moved {
                    registration_id,
                    old_box_id,
                    new_box_id,
                },
                audit,
                notices,
            };
            if let Err(e) = self.commit(commit).await {
                self.ledger().release_box(new_box_id);
                return Err(e);
            }
            return Ok(());
        }
        Err(EngineError::Contended("move"))
    }

    /// End an active registration. The freed box either returns to the
    /// pool or stays reserved under an admin label, per `release`.
    pub async fn remove_registration(
        &self,
        actor: Actor,
        registration_id: Ulid,
        release: ReleasePolicy,
    ) -> Result<(), EngineError> {
        if let ReleasePolicy::AdminHold { label: Some(l) } = &release
            && l.len() > limits::MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("hold label too long"));
        }

        for _ in 0..LOCK_RETRIES {
            let reg = self
                .ledger()
                .get(&registration_id)
                .ok_or(EngineError::RegistrationNotFound(registration_id))?;
            if reg.status != RegistrationStatus::Active {
                return Err(EngineError::NotActive(registration_id));
            }

            let _box_guards = self.lock_boxes(&[reg.box_id]).await?;
            let _apt_guard = self.lock_apartment(&reg.registrant.apartment_key).await;

            let cur = self
                .ledger()
                .get(&registration_id)
                .ok_or(EngineError::RegistrationNotFound(registration_id))?;
            if cur.status != RegistrationStatus::Active {
                return Err(EngineError::NotActive(registration_id));
            }
            if cur.box_id != reg.box_id {
                continue;
            }
            let box_id = cur.box_id;

            let (box_state, reserved_label) = match &release {
                ReleasePolicy::MakePublic => (BoxState::Available, None),
                ReleasePolicy::AdminHold { label } => (
                    BoxState::Reserved,
                    Some(label.clone().unwrap_or_else(|| DEFAULT_HOLD_LABEL.to_string())),
                ),
            };

            let at = now_ms();
            let audit = vec![
                Self::audit_event(
                    &actor,
                    at,
                    AuditAction::RegistrationRemove,
                    EntityType::Registration,
                    registration_id.to_string(),
                    Some(json!({
                        "box_id": box_id,
                        "status": "active",
                        "name": cur.registrant.name,
                    })),
                    Some(json!({"status": "removed"})),
                    None,
                ),
                Self::audit_event(
                    &actor,
                    at,
                    AuditAction::BoxStateChange,
                    EntityType::PlanterBox,
                    box_id.to_string(),
                    Some(json!({"state": "occupied"})),
                    Some(json!({
                        "state": box_state.as_str(),
                        "reserved_label": reserved_label,
                    })),
                    None,
                ),
            ];
            let notices = vec![notice(NoticeKind::Removed, &cur.registrant, box_id, None, at)];

            self.commit(Commit {
                at,
                actor,
                change: Change::Removed {
                    registration_id,
                    box_id,
                    box_state,
                    reserved_label,
                },
                audit,
                notices,
            })
            .await?;
            return Ok(());
        }
        Err(EngineError::Contended("remove"))
    }

    /// Join the waitlist. Only permitted while zero boxes are available;
    /// the check is a point-in-time read — the registration
    /// preconditions remain the authoritative guard against a
    /// fast-following registration.
    ///
    /// Joining while already waiting is not an error: the existing entry
    /// is returned with its original arrival time, and the distinct
    /// reorder-preserve action is audited. Queue positions are earned
    /// once, not refreshed.
    pub async fn join_waitlist(
        &self,
        actor: Actor,
        registrant: Registrant,
    ) -> Result<JoinOutcome, EngineError> {
        let key = registrant.apartment_key.clone();
        let _apt_guard = self.lock_apartment(&key).await;

        let available = self.available_box_count();
        if available > 0 {
            return Err(EngineError::BoxesStillAvailable(available));
        }

        if let Some(existing) = self.waitlist().waiting_for_apartment(&key) {
            let at = now_ms();
            let audit = vec![Self::audit_event(
                &actor,
                at,
                AuditAction::WaitlistReorderPreserve,
                EntityType::WaitlistEntry,
                existing.id.to_string(),
                None,
                Some(json!({"apartment_key": key, "joined_at": existing.created_at})),
                None,
            )];
            self.commit(Commit {
                at,
                actor,
                change: Change::WaitlistPreserved {
                    entry_id: existing.id,
                },
                audit,
                notices: Vec::new(),
            })
            .await?;
            let position = self.waitlist().position(&key).unwrap_or(0);
            return Ok(JoinOutcome::AlreadyWaiting {
                entry_id: existing.id,
                position,
                joined_at: existing.created_at,
            });
        }

        if self.waitlist().waiting_count() >= limits::MAX_WAITLIST_DEPTH {
            return Err(EngineError::LimitExceeded("waitlist full"));
        }

        let at = now_ms();
        let entry_id = Ulid::new();
        if let Err(holder) = self.waitlist().claim_waiting(&key, entry_id) {
            // Raced past the pre-check: fold into the same fairness
            // outcome the pre-check produces.
            if let Some(existing) = self.waitlist().get(&holder) {
                let position = self.waitlist().position(&key).unwrap_or(0);
                return Ok(JoinOutcome::AlreadyWaiting {
                    entry_id: existing.id,
                    position,
                    joined_at: existing.created_at,
                });
            }
            return Err(EngineError::Contended("join_waitlist"));
        }

        let entry = WaitlistEntry {
            id: entry_id,
            registrant,
            status: WaitlistStatus::Waiting,
            created_at: at,
            updated_at: at,
        };
        let audit = vec![Self::audit_event(
            &actor,
            at,
            AuditAction::WaitlistAdd,
            EntityType::WaitlistEntry,
            entry_id.to_string(),
            None,
            Some(json!({
                "email": entry.registrant.email,
                "apartment_key": key,
            })),
            None,
        )];

        let commit = Commit {
            at,
            actor,
            change: Change::WaitlistJoined { entry },
            audit,
            notices: Vec::new(),
        };
        if let Err(e) = self.commit(commit).await {
            self.waitlist().release_waiting(&key);
            return Err(e);
        }

        let position = self.waitlist().position(&key).unwrap_or(0);
        Ok(JoinOutcome::Joined { entry_id, position })
    }

    /// Hand a freed box to a waiting entry: create the registration,
    /// occupy the box, mark the entry assigned — one transaction.
    /// Re-checks that the entry's apartment still has no active
    /// registration, guarding against drift since the entry was created.
    pub async fn assign_from_waitlist(
        &self,
        actor: Actor,
        entry_id: Ulid,
        box_id: BoxId,
    ) -> Result<AssignOutcome, EngineError> {
        let entry = self
            .waitlist()
            .get(&entry_id)
            .ok_or(EngineError::WaitlistEntryNotFound(entry_id))?;
        let key = entry.registrant.apartment_key.clone();

        let _box_guards = self.lock_boxes(&[box_id]).await?;
        let _apt_guard = self.lock_apartment(&key).await;

        let entry = self
            .waitlist()
            .get(&entry_id)
            .ok_or(EngineError::WaitlistEntryNotFound(entry_id))?;
        if entry.status != WaitlistStatus::Waiting {
            return Err(EngineError::NotWaiting(entry_id));
        }

        let row = self
            .box_row(box_id)
            .ok_or(EngineError::BoxNotFound(box_id))?;
        match row.state {
            BoxState::Occupied => return Err(EngineError::BoxOccupied(box_id)),
            BoxState::Reserved if !actor.is_admin() => {
                return Err(EngineError::BoxReserved(box_id));
            }
            _ => {}
        }

        if let Some(existing) = self.ledger().active_for_apartment(&key) {
            return Err(EngineError::ApartmentHasRegistration {
                apartment_key: key,
                registration_id: existing.id,
            });
        }

        let at = now_ms();
        let reg_id = Ulid::new();
        if let Err(holder) = self.ledger().claim_apartment(&key, reg_id) {
            return Err(EngineError::ApartmentHasRegistration {
                apartment_key: key,
                registration_id: holder,
            });
        }
        if self.ledger().claim_box(box_id, reg_id).is_err() {
            self.ledger().release_apartment(&key);
            return Err(EngineError::BoxOccupied(box_id));
        }

        let registration = Registration {
            id: reg_id,
            box_id,
            registrant: entry.registrant.clone(),
            status: RegistrationStatus::Active,
            created_at: at,
            updated_at: at,
        };

        let audit = vec![
            Self::audit_event(
                &actor,
                at,
                AuditAction::WaitlistAssign,
                EntityType::WaitlistEntry,
                entry_id.to_string(),
                Some(json!({"status": "waiting"})),
                Some(json!({
                    "status": "assigned",
                    "registration_id": reg_id.to_string(),
                    "box_id": box_id,
                })),
                None,
            ),
            Self::audit_event(
                &actor,
                at,
                AuditAction::RegistrationCreate,
                EntityType::Registration,
                reg_id.to_string(),
                None,
                Some(json!({
                    "box_id": box_id,
                    "apartment_key": key,
                    "from_waitlist": entry_id.to_string(),
                })),
                None,
            ),
            Self::audit_event(
                &actor,
                at,
                AuditAction::BoxStateChange,
                EntityType::PlanterBox,
                box_id.to_string(),
                Some(json!({"state": row.state.as_str()})),
                Some(json!({"state": "occupied"})),
                None,
            ),
        ];
        let notices = vec![notice(
            NoticeKind::WaitlistAssigned,
            &entry.registrant,
            box_id,
            None,
            at,
        )];

        let commit = Commit {
            at,
            actor,
            change: Change::WaitlistAssigned {
                entry_id,
                registration,
            },
            audit,
            notices,
        };
        if let Err(e) = self.commit(commit).await {
            self.ledger().release_apartment(&key);
            self.ledger().release_box(box_id);
            return Err(e);
        }

        Ok(AssignOutcome {
            registration_id: reg_id,
            entry_id,
            box_id,
        })
    }

    /// Take a waiting entry out of the queue.
    pub async fn cancel_waitlist(
        &self,
        actor: Actor,
        entry_id: Ulid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(r) = &reason
            && r.len() > limits::MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }

        let entry = self
            .waitlist()
            .get(&entry_id)
            .ok_or(EngineError::WaitlistEntryNotFound(entry_id))?;
        let key = entry.registrant.apartment_key.clone();
        let _apt_guard = self.lock_apartment(&key).await;

        let entry = self
            .waitlist()
            .get(&entry_id)
            .ok_or(EngineError::WaitlistEntryNotFound(entry_id))?;
        if entry.status != WaitlistStatus::Waiting {
            return Err(EngineError::NotWaiting(entry_id));
        }

        let at = now_ms();
        let audit = vec![Self::audit_event(
            &actor,
            at,
            AuditAction::WaitlistRemove,
            EntityType::WaitlistEntry,
            entry_id.to_string(),
            Some(json!({"status": "waiting"})),
            Some(json!({"status": "cancelled"})),
            reason,
        )];

        self.commit(Commit {
            at,
            actor,
            change: Change::WaitlistCancelled { entry_id },
            audit,
            notices: Vec::new(),
        })
        .await
    }

    /// Hold an available box back from the public pool. No-op when the
    /// box is already reserved under the same label.
    pub async fn hold_box(
        &self,
        actor: Actor,
        box_id: BoxId,
        label: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(l) = &label
            && l.len() > limits::MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("hold label too long"));
        }

        let _box_guards = self.lock_boxes(&[box_id]).await?;
        let row = self
            .box_row(box_id)
            .ok_or(EngineError::BoxNotFound(box_id))?;
        if row.state == BoxState::Occupied {
            return Err(EngineError::BoxOccupied(box_id));
        }

        let label = Some(label.unwrap_or_else(|| DEFAULT_HOLD_LABEL.to_string()));
        if row.state == BoxState::Reserved && row.reserved_label == label {
            return Ok(());
        }

        let at = now_ms();
        let audit = vec![Self::audit_event(
            &actor,
            at,
            AuditAction::BoxStateChange,
            EntityType::PlanterBox,
            box_id.to_string(),
            Some(json!({
                "state": row.state.as_str(),
                "reserved_label": row.reserved_label,
            })),
            Some(json!({"state": "reserved", "reserved_label": label})),
            None,
        )];

        self.commit(Commit {
            at,
            actor,
            change: Change::BoxHoldSet {
                box_id,
                state: BoxState::Reserved,
                reserved_label: label,
            },
            audit,
            notices: Vec::new(),
        })
        .await
    }

    /// Return a reserved box to the public pool. No-op when already
    /// available.
    pub async fn release_box_hold(&self, actor: Actor, box_id: BoxId) -> Result<(), EngineError> {
        let _box_guards = self.lock_boxes(&[box_id]).await?;
        let row = self
            .box_row(box_id)
            .ok_or(EngineError::BoxNotFound(box_id))?;
        if row.state == BoxState::Occupied {
            return Err(EngineError::BoxOccupied(box_id));
        }
        if row.state == BoxState::Available {
            return Ok(());
        }

        let at = now_ms();
        let audit = vec![Self::audit_event(
            &actor,
            at,
            AuditAction::BoxStateChange,
            EntityType::PlanterBox,
            box_id.to_string(),
            Some(json!({
                "state": "reserved",
                "reserved_label": row.reserved_label,
            })),
            Some(json!({"state": "available"})),
            None,
        )];

        self.commit(Commit {
            at,
            actor,
            change: Change::BoxHoldSet {
                box_id,
                state: BoxState::Available,
                reserved_label: None,
            },
            audit,
            notices: Vec::new(),
        })
        .await
    }

    /// Change (or clear) the registration opening datetime.
    pub async fn set_opening(&self, actor: Actor, opens_at: Option<Ms>) -> Result<(), EngineError> {
        let before = self.opening();
        if before == opens_at {
            return Ok(());
        }

        let at = now_ms();
        let audit = vec![Self::audit_event(
            &actor,
            at,
            AuditAction::OpeningDatetimeChange,
            EntityType::Settings,
            "opening".to_string(),
            Some(json!({"opens_at": before})),
            Some(json!({"opens_at": opens_at})),
            None,
        )];

        self.commit(Commit {
            at,
            actor,
            change: Change::OpeningChanged { opens_at },
            audit,
            notices: Vec::new(),
        })
        .await
    }

    /// Record a delivery attempt's outcome on a queued notice. Called by
    /// the dispatcher after commit; a failure never touches the
    /// reservation state that queued the notice. Settling an
    /// already-sent notice is a no-op.
    pub async fn settle_notice(&self, notice_id: Ulid, delivered: bool) -> Result<(), EngineError> {
        let n = self
            .outbox()
            .get(&notice_id)
            .ok_or(EngineError::NoticeNotFound(notice_id))?;
        if n.status == NoticeStatus::Sent {
            return Ok(());
        }

        let at = now_ms();
        let actor = Actor::system();
        let status = if delivered {
            NoticeStatus::Sent
        } else {
            NoticeStatus::Failed
        };
        let audit = if delivered {
            vec![Self::audit_event(
                &actor,
                at,
                AuditAction::EmailSent,
                EntityType::Notice,
                notice_id.to_string(),
                None,
                Some(json!({
                    "recipient": n.recipient_email,
                    "kind": n.kind.as_str(),
                    "box_id": n.box_id,
                })),
                None,
            )]
        } else {
            Vec::new()
        };

        self.commit(Commit {
            at,
            actor,
            change: Change::NoticeSettled { notice_id, status },
            audit,
            notices: Vec::new(),
        })
        .await
    }
}
