//! End-to-end exercise of the engine through its public API: the whole
//! life of a season — opening, registrations, a full pool, the
//! waitlist, an admin hold, a switch, notice delivery, and a restart.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use greenbox::engine::{AuditFilter, Engine, EngineError};
use greenbox::model::*;
use greenbox::notify::{DeliveryError, Notifier, NotifyHub};
use greenbox::tasks;

fn wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("greenbox_test_flow");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn catalog() -> Vec<BoxSpec> {
    vec![
        BoxSpec::new(1, "Linaria", "Kronen"),
        BoxSpec::new(2, "Harebell", "Kronen"),
        BoxSpec::new(3, "Robin", "Søen"),
    ]
}

fn resident(key: &str, name: &str, email: &str) -> Registrant {
    Registrant {
        name: name.into(),
        email: email.into(),
        street: "Else Alfelts Vej".into(),
        house_number: 150,
        floor: None,
        door: None,
        language: Language::Da,
        apartment_key: key.into(),
    }
}

struct CapturingNotifier {
    delivered: Mutex<Vec<Notice>>,
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn deliver(&self, notice: &Notice) -> Result<(), DeliveryError> {
        self.delivered.lock().unwrap().push(notice.clone());
        Ok(())
    }
}

#[tokio::test]
async fn full_reservation_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();
    let path = wal_path("lifecycle.wal");
    let admin = Actor::admin("elise");

    let engine = Arc::new(Engine::open(path.clone(), Arc::new(NotifyHub::new())).unwrap());
    engine.provision(Actor::system(), &catalog()).await.unwrap();
    engine.set_opening(admin.clone(), Some(1)).await.unwrap();
    assert!(engine.status().is_open);

    // Three apartments fill the pool.
    let a = engine
        .register(
            Actor::public(),
            1,
            resident("vej 150", "Astrid Holm", "astrid@example.com"),
            false,
        )
        .await
        .unwrap();
    let b = engine
        .register(
            Actor::public(),
            2,
            resident("vej 152", "Jonas Friis", "jonas@example.com"),
            false,
        )
        .await
        .unwrap();
    let c = engine
        .register(
            Actor::public(),
            3,
            resident("vej 154", "Mette Krog", "mette@example.com"),
            false,
        )
        .await
        .unwrap();
    assert_eq!(engine.status().available_boxes, 0);

    // A fourth apartment has to wait.
    let join = engine
        .join_waitlist(
            Actor::public(),
            resident("vej 156", "Lars Dahl", "lars@example.com"),
        )
        .await
        .unwrap();
    let JoinOutcome::Joined { entry_id, position } = join else {
        panic!("expected fresh join, got {join:?}");
    };
    assert_eq!(position, 1);
    assert_eq!(
        engine.waitlist_position("vej 156").unwrap().entry_id,
        entry_id
    );

    // Admin ends one registration but keeps the box held back, then
    // hands the held box to the waiting apartment. Claiming a reserved
    // box is an admin privilege.
    engine
        .remove_registration(
            admin.clone(),
            c.registration_id,
            ReleasePolicy::AdminHold { label: None },
        )
        .await
        .unwrap();
    let held = engine.planter_box(3).unwrap();
    assert_eq!(held.state, BoxState::Reserved);
    assert_eq!(held.reserved_label.as_deref(), Some(DEFAULT_HOLD_LABEL));
    assert_eq!(
        engine
            .register(
                Actor::public(),
                3,
                resident("vej 158", "Eva Lund", "eva@example.com"),
                false
            )
            .await
            .unwrap_err(),
        EngineError::BoxReserved(3)
    );

    let assigned = engine
        .assign_from_waitlist(admin.clone(), entry_id, 3)
        .await
        .unwrap();
    assert_eq!(assigned.box_id, 3);
    assert_eq!(
        engine.waitlist_entry(entry_id).unwrap().status,
        WaitlistStatus::Assigned
    );
    assert!(engine.waitlist_position("vej 156").is_none());

    // One resident leaves; another switches into the freed box.
    engine
        .remove_registration(admin.clone(), b.registration_id, ReleasePolicy::MakePublic)
        .await
        .unwrap();
    let switched = engine
        .switch(
            Actor::public(),
            2,
            resident("vej 150", "Astrid Holm", "astrid@example.com"),
        )
        .await
        .unwrap();
    assert_eq!(switched.switched_from, Some(1));
    assert_eq!(
        engine
            .registration(a.registration_id)
            .unwrap()
            .status,
        RegistrationStatus::Switched
    );
    assert_eq!(engine.planter_box(1).unwrap().state, BoxState::Available);
    assert_eq!(engine.planter_box(2).unwrap().state, BoxState::Occupied);

    // Every committed outcome gets delivered exactly once here, and the
    // sends land in the audit trail as system actions.
    let notifier = CapturingNotifier {
        delivered: Mutex::new(Vec::new()),
    };
    let sent = tasks::dispatch_once(&engine, &notifier, 5).await;
    assert_eq!(sent, 7); // 3 registered, removed+assigned, removed+switched
    assert!(engine.pending_notices(5).is_empty());
    let kinds: Vec<NoticeKind> = notifier
        .delivered
        .lock()
        .unwrap()
        .iter()
        .map(|n| n.kind)
        .collect();
    assert_eq!(kinds.iter().filter(|k| **k == NoticeKind::Registered).count(), 3);
    assert!(kinds.contains(&NoticeKind::WaitlistAssigned));
    assert!(kinds.contains(&NoticeKind::Switched));

    let email_audit = engine.audit_events(&AuditFilter {
        action: Some(AuditAction::EmailSent),
        ..Default::default()
    });
    assert_eq!(email_audit.len(), 7);
    assert!(email_audit.iter().all(|e| e.actor_type == ActorType::System));

    // Repeating a pass delivers nothing further (at-least-once settled).
    assert_eq!(tasks::dispatch_once(&engine, &notifier, 5).await, 0);

    let audit_total = engine.audit_len();

    // A restart replays the WAL into the identical committed state.
    drop(engine);
    let reopened = Engine::open(path, Arc::new(NotifyHub::new())).unwrap();
    assert_eq!(reopened.audit_len(), audit_total);
    assert_eq!(reopened.status().opens_at, Some(1));
    assert_eq!(reopened.active_registration_for("vej 150").unwrap().box_id, 2);
    assert_eq!(reopened.active_registration_for("vej 156").unwrap().box_id, 3);
    assert!(reopened.active_registration_for("vej 152").is_none());
    assert!(reopened.list_waitlist().is_empty());
    assert!(reopened.pending_notices(5).is_empty());

    // The rebuilt engine still enforces one-occupant-per-box.
    assert_eq!(
        reopened
            .register(
                Actor::public(),
                2,
                resident("vej 160", "Nina Beck", "nina@example.com"),
                false
            )
            .await
            .unwrap_err(),
        EngineError::BoxOccupied(2)
    );
}

#[tokio::test]
async fn waitlist_rejoin_keeps_the_queue_fair() {
    let path = wal_path("fairness.wal");
    let engine = Engine::open(path, Arc::new(NotifyHub::new())).unwrap();
    engine
        .provision(Actor::system(), &[BoxSpec::new(1, "Linaria", "Kronen")])
        .await
        .unwrap();
    engine
        .register(
            Actor::public(),
            1,
            resident("vej 150", "Astrid Holm", "astrid@example.com"),
            false,
        )
        .await
        .unwrap();

    let first = engine
        .join_waitlist(
            Actor::public(),
            resident("vej 152", "Jonas Friis", "jonas@example.com"),
        )
        .await
        .unwrap();
    let JoinOutcome::Joined { entry_id, .. } = first else {
        panic!("expected fresh join");
    };
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    engine
        .join_waitlist(
            Actor::public(),
            resident("vej 154", "Mette Krog", "mette@example.com"),
        )
        .await
        .unwrap();

    // An anxious resident re-submitting does not lose (or refresh)
    // their place.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let rejoin = engine
        .join_waitlist(
            Actor::public(),
            resident("vej 152", "Jonas Friis", "jonas@example.com"),
        )
        .await
        .unwrap();
    let JoinOutcome::AlreadyWaiting {
        entry_id: same,
        position,
        ..
    } = rejoin
    else {
        panic!("expected already-waiting outcome, got {rejoin:?}");
    };
    assert_eq!(same, entry_id);
    assert_eq!(position, 1);
    assert_eq!(engine.list_waitlist().len(), 2);
}
