#![forbid(unsafe_code)]

use custody_contracts::audit::AuditAction;
use custody_contracts::delivery::{
    DeliveryEventType, DeliveryTarget, DeliveryTaskInput, DeliveryTaskStatus,
};
use custody_contracts::{ActorRef, MonotonicTimeNs};
use custody_storage::{LedgerError, LedgerStore};

fn task_input(key: &str, at: u64, max_attempts: u16) -> DeliveryTaskInput {
    DeliveryTaskInput::v1(
        MonotonicTimeNs(at),
        DeliveryEventType::ArtifactCreated,
        "{\"artifact_id\":1}".to_string(),
        DeliveryTarget::Webhook {
            url: "https://crm.example.com/hooks/evidence".to_string(),
        },
        key.to_string(),
        max_attempts,
    )
    .unwrap()
}

fn operator() -> ActorRef {
    ActorRef::Human {
        user_id: "ops_admin".to_string(),
    }
}

#[test]
fn at_delivery_db_01_enqueue_dedupes_on_idempotency_key() {
    let mut s = LedgerStore::new_in_memory();
    let (first, created_first) = s
        .enqueue_delivery_task(task_input("idem_abc", 10, 5), ActorRef::System)
        .unwrap();
    let (second, created_second) = s
        .enqueue_delivery_task(task_input("idem_abc", 11, 5), ActorRef::System)
        .unwrap();
    assert!(created_first);
    assert!(!created_second);
    assert_eq!(first.task_id, second.task_id);
    assert_eq!(s.delivery_tasks().count(), 1);
    // Exactly one enqueue audit entry despite two calls.
    let enqueued = s
        .audit_entries()
        .iter()
        .filter(|e| e.action == AuditAction::DeliveryEnqueued)
        .count();
    assert_eq!(enqueued, 1);
}

#[test]
fn at_delivery_db_02_terminally_failed_key_may_be_reenqueued() {
    let mut s = LedgerStore::new_in_memory();
    let (task, _) = s
        .enqueue_delivery_task(task_input("idem_dead", 10, 1), ActorRef::System)
        .unwrap();
    let claimed = s.claim_due_tasks(MonotonicTimeNs(20), 16, 30_000, "worker_a");
    assert_eq!(claimed.len(), 1);
    s.record_attempt_transient_failure(
        MonotonicTimeNs(21),
        task.task_id,
        "worker_a",
        "http status 503".to_string(),
        MonotonicTimeNs(22),
    )
    .unwrap();
    assert_eq!(
        s.delivery_task(task.task_id).unwrap().status,
        DeliveryTaskStatus::Failed
    );

    let (fresh, created) = s
        .enqueue_delivery_task(task_input("idem_dead", 30, 1), ActorRef::System)
        .unwrap();
    assert!(created);
    assert_ne!(fresh.task_id, task.task_id);
}

#[test]
fn at_delivery_db_03_claim_excludes_not_due_and_leased_rows() {
    let mut s = LedgerStore::new_in_memory();
    let (task, _) = s
        .enqueue_delivery_task(task_input("idem_claim", 100, 5), ActorRef::System)
        .unwrap();

    // Not yet due.
    assert!(s
        .claim_due_tasks(MonotonicTimeNs(50), 16, 30_000, "worker_a")
        .is_empty());

    // Due: first claim wins, second is blocked by the live lease.
    let claimed = s.claim_due_tasks(MonotonicTimeNs(100), 16, 30_000, "worker_a");
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].lease_owner.as_deref(), Some("worker_a"));
    assert!(s
        .claim_due_tasks(MonotonicTimeNs(101), 16, 30_000, "worker_b")
        .is_empty());

    // A crashed worker's lease expires and the task is claimable
    // again.
    let reclaimed = s.claim_due_tasks(
        MonotonicTimeNs(100).saturating_add_ms(30_001),
        16,
        30_000,
        "worker_b",
    );
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(
        s.delivery_task(task.task_id).unwrap().lease_owner.as_deref(),
        Some("worker_b")
    );
}

#[test]
fn at_delivery_db_04_attempt_outcomes_require_the_lease() {
    let mut s = LedgerStore::new_in_memory();
    let (task, _) = s
        .enqueue_delivery_task(task_input("idem_lease", 10, 5), ActorRef::System)
        .unwrap();
    s.claim_due_tasks(MonotonicTimeNs(20), 16, 30_000, "worker_a");

    let err = s
        .record_attempt_success(MonotonicTimeNs(21), task.task_id, "worker_b")
        .unwrap_err();
    assert!(matches!(err, LedgerError::LeaseViolation { .. }));

    let settled = s
        .record_attempt_success(MonotonicTimeNs(21), task.task_id, "worker_a")
        .unwrap();
    assert_eq!(settled.status, DeliveryTaskStatus::Succeeded);
    assert_eq!(settled.attempt_count, 1);
}

#[test]
fn at_delivery_db_05_attempt_count_reaches_budget_before_failed() {
    let mut s = LedgerStore::new_in_memory();
    let (task, _) = s
        .enqueue_delivery_task(task_input("idem_budget", 10, 3), ActorRef::System)
        .unwrap();

    let mut now = MonotonicTimeNs(20);
    let mut last_retry_at = MonotonicTimeNs(0);
    for attempt in 1..=3u16 {
        let claimed = s.claim_due_tasks(now, 16, 30_000, "worker_a");
        assert_eq!(claimed.len(), 1, "attempt {attempt} must claim");
        let next_retry_at = now.saturating_add_ms(1_000 * u64::from(attempt));
        let updated = s
            .record_attempt_transient_failure(
                now,
                task.task_id,
                "worker_a",
                "http status 503".to_string(),
                next_retry_at,
            )
            .unwrap();
        assert_eq!(updated.attempt_count, attempt);
        if attempt < 3 {
            assert_eq!(updated.status, DeliveryTaskStatus::Retrying);
            assert!(updated.next_retry_at > last_retry_at);
            last_retry_at = updated.next_retry_at;
            now = updated.next_retry_at;
        } else {
            assert_eq!(updated.status, DeliveryTaskStatus::Failed);
        }
    }
    // One structured error entry per failed attempt, and the final one
    // is the exhaustion record.
    let errors: Vec<_> = s
        .audit_entries()
        .iter()
        .filter(|e| e.action == AuditAction::Error)
        .collect();
    assert_eq!(errors.len(), 3);
    assert_eq!(
        errors.last().unwrap().error.as_ref().unwrap().code,
        "DELIVERY_RETRIES_EXHAUSTED"
    );
}

#[test]
fn at_delivery_db_06_operator_discard_is_terminal_and_audited() {
    let mut s = LedgerStore::new_in_memory();
    let (task, _) = s
        .enqueue_delivery_task(task_input("idem_discard", 10, 1), ActorRef::System)
        .unwrap();
    s.claim_due_tasks(MonotonicTimeNs(20), 16, 30_000, "worker_a");
    s.record_attempt_transient_failure(
        MonotonicTimeNs(21),
        task.task_id,
        "worker_a",
        "http status 503".to_string(),
        MonotonicTimeNs(22),
    )
    .unwrap();

    let discarded = s
        .discard_task(
            MonotonicTimeNs(30),
            task.task_id,
            "target decommissioned".to_string(),
            operator(),
        )
        .unwrap();
    assert_eq!(discarded.status, DeliveryTaskStatus::Discarded);

    let entry = s
        .audit_entries()
        .iter()
        .find(|e| e.action == AuditAction::DeliveryDiscarded)
        .unwrap();
    assert_eq!(entry.actor.actor_type(), "human");
    assert!(entry.after.as_ref().unwrap().contains("target decommissioned"));

    // Terminal: no further transitions.
    let err = s
        .force_retry(MonotonicTimeNs(40), task.task_id, operator())
        .unwrap_err();
    assert!(matches!(err, LedgerError::TransitionViolation { .. }));
}

#[test]
fn at_delivery_db_07_manual_review_then_forced_retry() {
    let mut s = LedgerStore::new_in_memory();
    let (task, _) = s
        .enqueue_delivery_task(task_input("idem_review", 10, 1), ActorRef::System)
        .unwrap();
    s.claim_due_tasks(MonotonicTimeNs(20), 16, 30_000, "worker_a");
    s.record_attempt_transient_failure(
        MonotonicTimeNs(21),
        task.task_id,
        "worker_a",
        "http status 503".to_string(),
        MonotonicTimeNs(22),
    )
    .unwrap();

    let review = s
        .promote_manual_review(MonotonicTimeNs(30), task.task_id, operator())
        .unwrap();
    assert_eq!(review.status, DeliveryTaskStatus::ManualReview);
    assert_eq!(s.tasks_by_status(DeliveryTaskStatus::ManualReview).len(), 1);

    let retried = s
        .force_retry(MonotonicTimeNs(40), task.task_id, operator())
        .unwrap();
    assert_eq!(retried.status, DeliveryTaskStatus::Retrying);
    assert_eq!(retried.attempt_count, 0);
    assert_eq!(retried.next_retry_at, MonotonicTimeNs(40));
    assert!(retried.last_error.is_none());
}

#[test]
fn at_delivery_db_08_pending_tasks_cannot_be_operator_discarded() {
    let mut s = LedgerStore::new_in_memory();
    let (task, _) = s
        .enqueue_delivery_task(task_input("idem_guard", 10, 5), ActorRef::System)
        .unwrap();
    let err = s
        .discard_task(
            MonotonicTimeNs(20),
            task.task_id,
            "premature".to_string(),
            operator(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        LedgerError::TransitionViolation {
            table: "delivery_tasks",
            from: "pending",
            to: "discarded",
        }
    ));
}
