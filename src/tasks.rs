use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::notify::Notifier;
use crate::observability;

/// One dispatcher pass: attempt delivery for every notice that is owed
/// one and settle the outcome. Returns how many notices were settled
/// as sent.
///
/// Delivery is at-least-once: a crash between deliver and settle means
/// the next pass delivers again.
pub async fn dispatch_once(engine: &Engine, notifier: &dyn Notifier, max_attempts: u32) -> usize {
    let mut sent = 0;
    for notice in engine.pending_notices(max_attempts) {
        match notifier.deliver(&notice).await {
            Ok(()) => {
                metrics::counter!(observability::NOTICES_DELIVERED_TOTAL, "outcome" => "sent")
                    .increment(1);
                match engine.settle_notice(notice.id, true).await {
                    Ok(()) => sent += 1,
                    Err(e) => warn!("failed to settle notice {}: {e}", notice.id),
                }
            }
            Err(e) => {
                metrics::counter!(observability::NOTICES_DELIVERED_TOTAL, "outcome" => "failed")
                    .increment(1);
                warn!(
                    "notice {} delivery failed (attempt {}): {e}",
                    notice.id,
                    notice.attempts + 1
                );
                if let Err(e) = engine.settle_notice(notice.id, false).await {
                    warn!("failed to settle notice {}: {e}", notice.id);
                }
            }
        }
    }
    sent
}

/// Background task draining the notice outbox on an interval.
pub async fn run_dispatcher(
    engine: Arc<Engine>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    max_attempts: u32,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let sent = dispatch_once(&engine, notifier.as_ref(), max_attempts).await;
        if sent > 0 {
            debug!("dispatched {sent} notices");
        }
    }
}

/// Background task rewriting the WAL as a snapshot once enough appends
/// have accumulated since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => warn!("WAL compaction failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::{DeliveryError, NotifyHub};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("greenbox_test_tasks");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn registrant(key: &str) -> Registrant {
        Registrant {
            name: "Mette Krog".into(),
            email: "mette@example.com".into(),
            street: "Else Alfelts Vej".into(),
            house_number: 124,
            floor: None,
            door: None,
            language: Language::Da,
            apartment_key: key.into(),
        }
    }

    /// Fails every delivery until flipped, then succeeds. Counts calls.
    struct FlakyNotifier {
        healthy: AtomicBool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn deliver(&self, _notice: &Notice) -> Result<(), DeliveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(DeliveryError("smtp down".into()))
            }
        }
    }

    #[tokio::test]
    async fn dispatcher_retries_until_delivery_succeeds() {
        let path = test_wal_path("dispatch_retry.wal");
        let engine = Engine::open(path, Arc::new(NotifyHub::new())).unwrap();
        engine
            .provision(Actor::system(), &[BoxSpec::new(1, "Linaria", "Kronen")])
            .await
            .unwrap();
        let outcome = engine
            .register(Actor::public(), 1, registrant("apt 1"), false)
            .await
            .unwrap();

        let notifier = FlakyNotifier {
            healthy: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        };

        // First pass fails; the notice stays queued as failed.
        assert_eq!(dispatch_once(&engine, &notifier, 5).await, 0);
        let pending = engine.pending_notices(5);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, NoticeStatus::Failed);
        assert_eq!(pending[0].attempts, 1);

        // Delivery recovers; the retry settles the notice as sent.
        notifier.healthy.store(true, Ordering::SeqCst);
        assert_eq!(dispatch_once(&engine, &notifier, 5).await, 1);
        assert!(engine.pending_notices(5).is_empty());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);

        // The delivery failure never touched the reservation.
        assert!(engine.registration(outcome.registration_id).is_some());
    }

    #[tokio::test]
    async fn dispatcher_gives_up_after_attempt_cap() {
        let path = test_wal_path("dispatch_cap.wal");
        let engine = Engine::open(path, Arc::new(NotifyHub::new())).unwrap();
        engine
            .provision(Actor::system(), &[BoxSpec::new(1, "Linaria", "Kronen")])
            .await
            .unwrap();
        engine
            .register(Actor::public(), 1, registrant("apt 1"), false)
            .await
            .unwrap();

        let notifier = FlakyNotifier {
            healthy: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        };

        for _ in 0..3 {
            dispatch_once(&engine, &notifier, 3).await;
        }
        // Attempts exhausted: nothing left to deliver, no further calls.
        assert!(engine.pending_notices(3).is_empty());
        dispatch_once(&engine, &notifier, 3).await;
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
    }
}
