#![forbid(unsafe_code)]

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;

use custody_contracts::delivery::{
    BackoffConfig, DeliveryTaskRecord, DeliveryTaskStatus,
};
use custody_contracts::MonotonicTimeNs;
use custody_engines::backoff;
use custody_engines::webhook::{
    DeliveryEnvelope, DeliveryErrorClass, DeliverySendFailure, DeliverySendReceipt, SenderRuntime,
};
use custody_storage::{LedgerError, LedgerStore};

pub const DELIVERY_WORKER_MAX_ITEMS: u16 = 16;
pub const DELIVERY_WORKER_LEASE_MS: u32 = 30_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryWorkerConfig {
    pub max_items: u16,
    pub lease_ms: u32,
}

impl DeliveryWorkerConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_items: DELIVERY_WORKER_MAX_ITEMS,
            lease_ms: DELIVERY_WORKER_LEASE_MS,
        }
    }

    pub fn from_env() -> Self {
        let max_items = env::var("CUSTODY_DELIVERY_MAX_ITEMS")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .filter(|v| (1..=256).contains(v))
            .unwrap_or(DELIVERY_WORKER_MAX_ITEMS);
        let lease_ms = env::var("CUSTODY_DELIVERY_LEASE_MS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .filter(|v| (1_000..=600_000).contains(v))
            .unwrap_or(DELIVERY_WORKER_LEASE_MS);
        Self {
            max_items,
            lease_ms,
        }
    }
}

/// Backoff parameters with environment overrides, bounds-checked so a
/// bad deployment value falls back to the default instead of wedging
/// the queue.
pub fn backoff_config_from_env() -> BackoffConfig {
    let defaults = BackoffConfig::mvp_v1();
    let base_delay_ms = env::var("CUSTODY_DELIVERY_BASE_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| (100..=60_000).contains(v))
        .unwrap_or(defaults.base_delay_ms);
    let max_delay_ms = env::var("CUSTODY_DELIVERY_MAX_DELAY_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v >= base_delay_ms && *v <= 3_600_000)
        .unwrap_or(defaults.max_delay_ms.max(base_delay_ms));
    let max_attempts = env::var("CUSTODY_DELIVERY_MAX_ATTEMPTS")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|v| (1..=100).contains(v))
        .unwrap_or(defaults.max_attempts);
    let jitter_fraction = env::var("CUSTODY_DELIVERY_JITTER_FRACTION")
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .filter(|v| v.is_finite() && (0.0..1.0).contains(v))
        .unwrap_or(defaults.jitter_fraction);
    BackoffConfig {
        base_delay_ms,
        max_delay_ms,
        max_attempts,
        jitter_fraction,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueMetrics {
    pub pending_count: u32,
    pub retrying_count: u32,
    pub succeeded_count: u32,
    pub failed_count: u32,
    pub manual_review_count: u32,
    pub discarded_count: u32,
    pub due_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerPassMetrics {
    pub claimed_count: u16,
    pub succeeded_count: u16,
    pub retry_scheduled_count: u16,
    pub failed_count: u16,
    pub queue_after: QueueMetrics,
}

/// One polling pass: claim due tasks under a lease, attempt each, and
/// settle the outcome. Ambiguous outcomes never mark a task succeeded;
/// they re-enter the retry path and rely on target-side idempotency.
pub fn run_delivery_worker_pass(
    store: &mut LedgerStore,
    now: MonotonicTimeNs,
    worker_id: String,
    sender: &SenderRuntime,
    policy: &BackoffConfig,
    config: &DeliveryWorkerConfig,
) -> Result<WorkerPassMetrics, LedgerError> {
    run_delivery_worker_pass_with_rng(
        store,
        now,
        worker_id,
        sender,
        policy,
        config,
        &mut rand::thread_rng(),
    )
}

pub fn run_delivery_worker_pass_with_rng<R: Rng>(
    store: &mut LedgerStore,
    now: MonotonicTimeNs,
    worker_id: String,
    sender: &SenderRuntime,
    policy: &BackoffConfig,
    config: &DeliveryWorkerConfig,
    rng: &mut R,
) -> Result<WorkerPassMetrics, LedgerError> {
    let claimed = store.claim_due_tasks(now, config.max_items, config.lease_ms, &worker_id);
    let mut metrics = WorkerPassMetrics {
        claimed_count: claimed.len() as u16,
        ..WorkerPassMetrics::default()
    };
    for task in claimed {
        let result = match DeliveryEnvelope::from_task(&task) {
            Ok(envelope) => sender.send(&task.target, &envelope),
            // A payload that cannot even be framed is permanent.
            Err(failure) => Err(failure),
        };
        match settle_attempt(store, now, &task, &worker_id, result, policy, rng)? {
            AttemptSettlement::Succeeded => {
                metrics.succeeded_count = metrics.succeeded_count.saturating_add(1)
            }
            AttemptSettlement::RetryScheduled => {
                metrics.retry_scheduled_count = metrics.retry_scheduled_count.saturating_add(1)
            }
            AttemptSettlement::Failed => {
                metrics.failed_count = metrics.failed_count.saturating_add(1)
            }
        }
    }
    metrics.queue_after = snapshot_queue_metrics(store, now);
    Ok(metrics)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptSettlement {
    Succeeded,
    RetryScheduled,
    Failed,
}

/// Writes one attempt outcome back to the queue. Shared by the
/// single-pass entry point and the pool loop (which sends without
/// holding the store).
fn settle_attempt<R: Rng>(
    store: &mut LedgerStore,
    now: MonotonicTimeNs,
    task: &DeliveryTaskRecord,
    worker_id: &str,
    result: Result<DeliverySendReceipt, DeliverySendFailure>,
    policy: &BackoffConfig,
    rng: &mut R,
) -> Result<AttemptSettlement, LedgerError> {
    match result {
        Ok(_receipt) => {
            store.record_attempt_success(now, task.task_id, worker_id)?;
            Ok(AttemptSettlement::Succeeded)
        }
        Err(failure) => match failure.class {
            DeliveryErrorClass::Permanent => {
                store.record_attempt_permanent_failure(
                    now,
                    task.task_id,
                    worker_id,
                    failure.message,
                )?;
                Ok(AttemptSettlement::Failed)
            }
            DeliveryErrorClass::Transient => {
                let backoff_ms = backoff::next_retry_delay_ms(policy, task.attempt_count, rng);
                // A target-provided Retry-After wins when it asks for
                // a longer pause than the computed backoff.
                let delay_ms = match failure.retry_after_ms {
                    Some(requested) => backoff_ms.max(u64::from(requested)),
                    None => backoff_ms,
                };
                let updated = store.record_attempt_transient_failure(
                    now,
                    task.task_id,
                    worker_id,
                    failure.message,
                    now.saturating_add_ms(delay_ms),
                )?;
                if updated.status == DeliveryTaskStatus::Failed {
                    Ok(AttemptSettlement::Failed)
                } else {
                    Ok(AttemptSettlement::RetryScheduled)
                }
            }
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryWorkerPoolConfig {
    pub workers: u8,
    pub poll_interval_ms: u64,
}

impl DeliveryWorkerPoolConfig {
    pub fn mvp_v1() -> Self {
        Self {
            workers: 4,
            poll_interval_ms: 2_000,
        }
    }
}

/// Fixed-size pool of polling workers over one shared store. Each
/// worker claims a batch under the store lock, performs the sends with
/// the lock released (the HTTP timeouts bound each attempt), then
/// settles outcomes under the lock again. Polling is the only
/// suspension point; `shutdown` stops the loops and joins.
pub struct DeliveryWorkerPool {
    stop: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl DeliveryWorkerPool {
    pub fn spawn(
        store: Arc<Mutex<LedgerStore>>,
        sender: SenderRuntime,
        policy: BackoffConfig,
        config: DeliveryWorkerConfig,
        pool: DeliveryWorkerPoolConfig,
        now_fn: Arc<dyn Fn() -> MonotonicTimeNs + Send + Sync>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for index in 0..pool.workers.max(1) {
            let store = Arc::clone(&store);
            let sender = sender.clone();
            let stop_flag = Arc::clone(&stop);
            let now_fn = Arc::clone(&now_fn);
            let worker_id = format!("delivery_worker_{index}");
            let poll_interval = Duration::from_millis(pool.poll_interval_ms.max(1));
            handles.push(thread::spawn(move || {
                let mut rng = rand::thread_rng();
                while !stop_flag.load(Ordering::Relaxed) {
                    let now = now_fn();
                    let claimed = match store.lock() {
                        Ok(mut guard) => guard.claim_due_tasks(
                            now,
                            config.max_items,
                            config.lease_ms,
                            &worker_id,
                        ),
                        Err(_) => break,
                    };
                    if claimed.is_empty() {
                        thread::sleep(poll_interval);
                        continue;
                    }
                    for task in claimed {
                        let result = match DeliveryEnvelope::from_task(&task) {
                            Ok(envelope) => sender.send(&task.target, &envelope),
                            Err(failure) => Err(failure),
                        };
                        let Ok(mut guard) = store.lock() else {
                            return;
                        };
                        // A lease lost to expiry mid-send surfaces as
                        // a lease violation here; the reclaiming
                        // worker owns the outcome, so drop ours.
                        let _ = settle_attempt(
                            &mut guard,
                            now_fn(),
                            &task,
                            &worker_id,
                            result,
                            &policy,
                            &mut rng,
                        );
                    }
                }
            }));
        }
        Self { stop, handles }
    }

    pub fn shutdown(self) {
        self.stop.store(true, Ordering::Relaxed);
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

pub fn snapshot_queue_metrics(store: &LedgerStore, now: MonotonicTimeNs) -> QueueMetrics {
    let mut out = QueueMetrics::default();
    for task in store.delivery_tasks() {
        match task.status {
            DeliveryTaskStatus::Pending => out.pending_count = out.pending_count.saturating_add(1),
            DeliveryTaskStatus::Retrying => {
                out.retrying_count = out.retrying_count.saturating_add(1)
            }
            DeliveryTaskStatus::Succeeded => {
                out.succeeded_count = out.succeeded_count.saturating_add(1)
            }
            DeliveryTaskStatus::Failed => out.failed_count = out.failed_count.saturating_add(1),
            DeliveryTaskStatus::ManualReview => {
                out.manual_review_count = out.manual_review_count.saturating_add(1)
            }
            DeliveryTaskStatus::Discarded => {
                out.discarded_count = out.discarded_count.saturating_add(1)
            }
        }
    }
    out.due_count = store.due_task_count(now) as u32;
    out
}
