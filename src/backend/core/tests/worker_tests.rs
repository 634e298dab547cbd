//! Integration tests for the worker loop.
//!
//! Tests cover:
//! - Successful execution removes the job
//! - Retry accounting, backoff and dead-lettering
//! - Mutual exclusion between workers
//! - Recovery of orphaned running jobs
//! - The background loop, its resilience to unreadable documents, and
//!   graceful shutdown

use async_trait::async_trait;
use chrono::Utc;
use queuectl_core::config::QueueConfig;
use queuectl_core::jobs::{
    CommandExecutor, CommandOutput, Job, JobDefaults, JobOutcome, JobQueue, JobStatus, JobWorker,
    SubmitRequest,
};
use queuectl_core::lock::{LockManager, LockMarker};
use queuectl_core::store::{Collection, Store};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Test Executors
// ============================================================================

/// Exits with a fixed code after an optional delay, counting invocations.
struct FixedExecutor {
    exit_code: i32,
    delay: Duration,
    calls: AtomicUsize,
}

impl FixedExecutor {
    fn new(exit_code: i32) -> Arc<Self> {
        Self::slow(exit_code, Duration::ZERO)
    }

    fn slow(exit_code: i32, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            exit_code,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CommandExecutor for FixedExecutor {
    async fn run(&self, _command: &str) -> CommandOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        CommandOutput {
            exit_code: Some(self.exit_code),
            ..CommandOutput::default()
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    _dir: TempDir,
    config: QueueConfig,
    store: Store,
    queue: JobQueue,
}

async fn setup() -> Fixture {
    let dir = TempDir::new().unwrap();
    let mut config = QueueConfig::with_data_dir(dir.path());
    config.worker.poll_interval = Duration::from_millis(20);
    config.worker.shutdown_timeout = Some(Duration::from_secs(5));
    let store = Store::open(&config).await.unwrap();
    let queue = JobQueue::new(store.clone());
    Fixture {
        _dir: dir,
        config,
        store,
        queue,
    }
}

impl Fixture {
    fn worker(&self, executor: Arc<dyn CommandExecutor>) -> JobWorker {
        JobWorker::from_config(self.store.clone(), &self.config).with_executor(executor)
    }

    /// Make every ready job due now, skipping the backoff wait.
    async fn make_due(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        self.store
            .update(Collection::Jobs, move |jobs: &mut Vec<Job>| {
                for job in jobs.iter_mut() {
                    job.next_attempt = past;
                }
            })
            .await
            .unwrap();
    }
}

// ============================================================================
// Success
// ============================================================================

#[cfg(unix)]
#[tokio::test]
async fn test_successful_shell_command_is_removed() {
    let fx = setup().await;
    let job = fx.queue.submit(SubmitRequest::parse("echo ok").unwrap()).await.unwrap();

    let worker = JobWorker::from_config(fx.store.clone(), &fx.config);
    let processed = worker.run_once().await.unwrap().unwrap();

    assert_eq!(processed.job_id, job.id);
    assert_eq!(processed.outcome, JobOutcome::Succeeded);
    assert_eq!(processed.output.stdout.trim(), "ok");
    assert!(fx.queue.list(None).await.unwrap().is_empty());
    assert!(fx.queue.dlq_list().await.unwrap().is_empty());
    assert_eq!(worker.stats().succeeded(), 1);

    let locks = LockManager::new(fx.store.lock_dir(), Duration::from_secs(60));
    assert!(!locks.is_locked(&job.id.lock_name()).await.unwrap());
}

#[tokio::test]
async fn test_nothing_to_claim() {
    let fx = setup().await;
    let worker = fx.worker(FixedExecutor::new(0));
    assert!(worker.run_once().await.unwrap().is_none());
}

// ============================================================================
// Failure and Retry
// ============================================================================

#[tokio::test]
async fn test_failure_defers_next_attempt() {
    let fx = setup().await;
    fx.queue.submit(SubmitRequest::new("exit 1").unwrap()).await.unwrap();
    let worker = fx.worker(FixedExecutor::new(1));

    let before = Utc::now();
    let processed = worker.run_once().await.unwrap().unwrap();
    let JobOutcome::Retrying { next_attempt } = processed.outcome else {
        panic!("expected retry, got {:?}", processed.outcome);
    };
    // backoffBase 2, retries 1
    assert!(next_attempt >= before + chrono::Duration::seconds(2));

    let jobs = fx.queue.list(None).await.unwrap();
    assert_eq!(jobs[0].retries, 1);
    assert_eq!(jobs[0].status, JobStatus::Ready);

    // Not due yet.
    assert!(worker.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_retries_count_failures() {
    let fx = setup().await;
    fx.queue.set_default("maxRetries", "10").await.unwrap();
    fx.queue.submit(SubmitRequest::new("exit 1").unwrap()).await.unwrap();
    let worker = fx.worker(FixedExecutor::new(1));

    for _ in 0..4 {
        fx.make_due().await;
        worker.run_once().await.unwrap().unwrap();
    }

    let jobs = fx.queue.list(None).await.unwrap();
    assert_eq!(jobs[0].retries, 4);
    assert_eq!(worker.stats().failed(), 4);
}

#[tokio::test]
async fn test_exhausted_job_is_dead_lettered() {
    let fx = setup().await;
    fx.queue.set_default("maxRetries", "2").await.unwrap();
    let job = fx.queue.submit(SubmitRequest::new("false").unwrap()).await.unwrap();
    let executor = FixedExecutor::new(1);
    let worker = fx.worker(executor.clone());

    let mut outcomes = Vec::new();
    for _ in 0..3 {
        fx.make_due().await;
        outcomes.push(worker.run_once().await.unwrap().unwrap().outcome);
    }

    assert!(matches!(outcomes[0], JobOutcome::Retrying { .. }));
    assert!(matches!(outcomes[1], JobOutcome::Retrying { .. }));
    assert_eq!(outcomes[2], JobOutcome::DeadLettered);
    assert_eq!(executor.calls(), 3);

    assert!(fx.queue.list(None).await.unwrap().is_empty());
    let dlq = fx.queue.dlq_list().await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].id, job.id);
    assert_eq!(dlq[0].retries, 3);
    assert_eq!(dlq[0].status, JobStatus::InDlq);
    assert_eq!(worker.stats().dead_lettered(), 1);

    // Dead-lettered jobs are never claimed again.
    assert!(worker.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_replayed_job_runs_again() {
    let fx = setup().await;
    fx.queue.set_default("maxRetries", "0").await.unwrap();
    let job = fx.queue.submit(SubmitRequest::new("flaky").unwrap()).await.unwrap();

    let failing = fx.worker(FixedExecutor::new(1));
    assert_eq!(failing.run_once().await.unwrap().unwrap().outcome, JobOutcome::DeadLettered);

    fx.queue.dlq_replay(&job.id).await.unwrap();
    let passing = fx.worker(FixedExecutor::new(0));
    let processed = passing.run_once().await.unwrap().unwrap();
    assert_eq!(processed.job_id, job.id);
    assert_eq!(processed.outcome, JobOutcome::Succeeded);
    assert!(fx.queue.list(None).await.unwrap().is_empty());
    assert!(fx.queue.dlq_list().await.unwrap().is_empty());
}

// ============================================================================
// Mutual Exclusion
// ============================================================================

#[tokio::test]
async fn test_two_workers_claim_once() {
    let fx = setup().await;
    fx.queue.submit(SubmitRequest::new("sleep 1").unwrap()).await.unwrap();

    let executor = FixedExecutor::slow(0, Duration::from_millis(200));
    let a = fx.worker(executor.clone());
    let b = fx.worker(executor.clone());

    let (ra, rb) = tokio::join!(a.run_once(), b.run_once());
    let ran = [ra.unwrap(), rb.unwrap()].into_iter().flatten().count();

    assert_eq!(ran, 1);
    assert_eq!(executor.calls(), 1);
    assert!(fx.queue.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_claimed_job_is_marked_running() {
    let fx = setup().await;
    let job = fx.queue.submit(SubmitRequest::new("x").unwrap()).await.unwrap();
    let worker = fx.worker(FixedExecutor::new(0));

    let claimed = worker.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.job.id, job.id);
    assert!(!claimed.recovered);
    let running = fx.queue.list(Some(JobStatus::Running)).await.unwrap();
    assert_eq!(running.len(), 1);

    // Held claim blocks a second worker.
    let other = fx.worker(FixedExecutor::new(0));
    assert!(other.claim_next().await.unwrap().is_none());

    worker.execute(claimed).await.unwrap();
    assert!(fx.queue.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_job_lives_in_one_collection() {
    let fx = setup().await;
    fx.queue.set_default("maxRetries", "1").await.unwrap();
    for i in 0..3 {
        fx.queue.submit(SubmitRequest::new(format!("job {}", i)).unwrap()).await.unwrap();
    }
    let worker = fx.worker(FixedExecutor::new(1));

    for _ in 0..6 {
        fx.make_due().await;
        worker.run_once().await.unwrap();

        let active = fx.queue.list(None).await.unwrap();
        let dlq = fx.queue.dlq_list().await.unwrap();
        for job in &dlq {
            assert!(active.iter().all(|j| j.id != job.id));
        }
    }

    assert!(fx.queue.list(None).await.unwrap().is_empty());
    assert_eq!(fx.queue.dlq_list().await.unwrap().len(), 3);
}

// ============================================================================
// Orphan Recovery
// ============================================================================

#[tokio::test]
async fn test_orphaned_running_job_is_recovered() {
    let fx = setup().await;
    let mut orphan = Job::new("echo again", &JobDefaults::default(), Utc::now());
    orphan.status = JobStatus::Running;
    orphan.retries = 1;
    fx.store.write(Collection::Jobs, &vec![orphan.clone()]).await.unwrap();

    let worker = fx.worker(FixedExecutor::new(0));
    let claimed = worker.claim_next().await.unwrap().unwrap();
    assert!(claimed.recovered);
    assert_eq!(claimed.job.retries, 1);

    let processed = worker.execute(claimed).await.unwrap();
    assert_eq!(processed.outcome, JobOutcome::Succeeded);
}

#[tokio::test]
async fn test_running_job_with_live_claim_is_left_alone() {
    let fx = setup().await;
    let mut job = Job::new("busy", &JobDefaults::default(), Utc::now());
    job.status = JobStatus::Running;
    fx.store.write(Collection::Jobs, &vec![job.clone()]).await.unwrap();

    let locks = LockManager::owner_bound(fx.store.lock_dir());
    let _held = locks.try_acquire(&job.id.lock_name()).await.unwrap().unwrap();

    let worker = fx.worker(FixedExecutor::new(0));
    assert!(worker.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_old_claim_of_live_worker_is_left_alone() {
    let fx = setup().await;
    let mut job = Job::new("busy", &JobDefaults::default(), Utc::now());
    job.status = JobStatus::Running;
    fx.store.write(Collection::Jobs, &vec![job.clone()]).await.unwrap();

    let locks = LockManager::owner_bound(fx.store.lock_dir());
    let marker = LockMarker {
        owner: std::process::id(),
        acquired_at: Utc::now() - chrono::Duration::days(2),
        token: uuid::Uuid::new_v4(),
    };
    std::fs::write(
        locks.marker_path(&job.id.lock_name()),
        serde_json::to_vec(&marker).unwrap(),
    )
    .unwrap();

    let executor = FixedExecutor::new(0);
    assert!(fx.worker(executor.clone()).run_once().await.unwrap().is_none());
    assert_eq!(executor.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_running_job_is_not_claimed_twice() {
    let fx = setup().await;
    fx.queue.submit(SubmitRequest::new("long").unwrap()).await.unwrap();

    let executor = FixedExecutor::slow(0, Duration::from_millis(800));
    let first = fx.worker(executor.clone());
    let running = tokio::spawn(async move { first.run_once().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while executor.calls() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(400)).await;

    let second = fx.worker(executor.clone());
    assert!(second.run_once().await.unwrap().is_none());

    let processed = running.await.unwrap().unwrap().unwrap();
    assert_eq!(processed.outcome, JobOutcome::Succeeded);
    assert_eq!(executor.calls(), 1);
}

#[tokio::test]
async fn test_interrupted_dead_lettering_is_completed_without_running() {
    let fx = setup().await;
    let mut job = Job::new("false", &JobDefaults { max_retries: 2, backoff_base: 2 }, Utc::now());
    job.status = JobStatus::Running;
    job.retries = 3;
    fx.store.write(Collection::Jobs, &vec![job.clone()]).await.unwrap();
    let mut parked = job.clone();
    parked.status = JobStatus::InDlq;
    fx.store.write(Collection::DeadLetter, &vec![parked]).await.unwrap();

    let executor = FixedExecutor::new(1);
    let worker = fx.worker(executor.clone());
    let processed = worker.run_once().await.unwrap().unwrap();

    assert_eq!(processed.job_id, job.id);
    assert_eq!(processed.outcome, JobOutcome::DeadLettered);
    assert_eq!(executor.calls(), 0);
    assert!(fx.queue.list(None).await.unwrap().is_empty());
    let dlq = fx.queue.dlq_list().await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].retries, 3);
}

// ============================================================================
// Background Loop
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_drains_queue_and_stops() {
    let fx = setup().await;
    for i in 0..5 {
        fx.queue.submit(SubmitRequest::new(format!("echo {}", i)).unwrap()).await.unwrap();
    }

    let executor = FixedExecutor::slow(0, Duration::from_millis(30));
    let handle = fx.worker(executor.clone()).start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !fx.queue.list(None).await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "queue not drained");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stats = handle.stop().await;
    assert_eq!(stats.succeeded(), 5);
    assert_eq!(stats.active(), 0);
    assert_eq!(executor.calls(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_waits_for_in_flight_job() {
    let fx = setup().await;
    fx.queue.submit(SubmitRequest::new("slow").unwrap()).await.unwrap();

    let executor = FixedExecutor::slow(0, Duration::from_millis(300));
    let handle = fx.worker(executor.clone()).start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while executor.calls() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = handle.stop().await;
    assert_eq!(stats.succeeded(), 1);
    assert!(fx.queue.list(None).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_loop_survives_unreadable_jobs_document() {
    let fx = setup().await;
    let executor = FixedExecutor::new(0);
    let handle = fx.worker(executor.clone()).start();

    std::fs::write(fx.store.path(Collection::Jobs), b"{ not json").unwrap();
    // Several scans fail while the document is unreadable.
    tokio::time::sleep(Duration::from_millis(150)).await;

    fx.store.write(Collection::Jobs, &Vec::<Job>::new()).await.unwrap();
    fx.queue.submit(SubmitRequest::new("after").unwrap()).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !fx.queue.list(None).await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "loop stopped after a read error");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stats = handle.stop().await;
    assert_eq!(stats.succeeded(), 1);
    assert_eq!(executor.calls(), 1);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_lets_shell_command_finish() {
    let mut fx = setup().await;
    fx.config.worker.shutdown_timeout = None;

    let done = fx.store.root().join("done");
    let command = format!("sleep 0.5; touch '{}'", done.display());
    fx.queue.submit(SubmitRequest::new(command).unwrap()).await.unwrap();

    let handle = JobWorker::from_config(fx.store.clone(), &fx.config).start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while handle.stats().active() == 0 {
        assert!(tokio::time::Instant::now() < deadline, "job never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stats = handle.stop().await;
    assert!(done.exists());
    assert_eq!(stats.succeeded(), 1);
    assert!(fx.queue.list(None).await.unwrap().is_empty());
}
