//! Integration tests for the queue manager.
//!
//! Tests cover:
//! - Empty queue state
//! - Submission, id uniqueness and payload validation
//! - Dead-letter listing, replay and clearing
//! - Job defaults get/set

use chrono::Utc;
use queuectl_core::config::QueueConfig;
use queuectl_core::jobs::{Job, JobDefaults, JobId, JobQueue, JobStatus, SubmitRequest};
use queuectl_core::store::{Collection, Store};
use queuectl_core::ErrorCode;
use std::collections::HashSet;
use tempfile::TempDir;

async fn setup() -> (TempDir, JobQueue) {
    let dir = TempDir::new().unwrap();
    let store = Store::open(&QueueConfig::with_data_dir(dir.path())).await.unwrap();
    (dir, JobQueue::new(store))
}

fn parked(command: &str, retries: u32) -> Job {
    let mut job = Job::new(command, &JobDefaults::default(), Utc::now());
    job.status = JobStatus::InDlq;
    job.retries = retries;
    job
}

// ============================================================================
// Initial State
// ============================================================================

#[tokio::test]
async fn test_fresh_queue_is_empty() {
    let (_dir, queue) = setup().await;

    let stats = queue.status().await.unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.dead_letter, 0);
    assert_eq!(stats.workers_registered, 0);
    assert!(queue.list(None).await.unwrap().is_empty());
    assert!(queue.dlq_list().await.unwrap().is_empty());
    assert_eq!(queue.defaults().await.unwrap(), JobDefaults::default());
}

// ============================================================================
// Submission
// ============================================================================

#[tokio::test]
async fn test_submit_creates_ready_job() {
    let (_dir, queue) = setup().await;

    let job = queue.submit(SubmitRequest::parse("echo hi").unwrap()).await.unwrap();
    assert_eq!(job.status, JobStatus::Ready);
    assert_eq!(job.retries, 0);
    assert_eq!(job.max_retries, 3);
    assert_eq!(job.backoff_base, 2);

    let listed = queue.list(None).await.unwrap();
    assert_eq!(listed, vec![job]);

    let stats = queue.status().await.unwrap();
    assert_eq!(stats.active, 1);
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.running, 0);
}

#[tokio::test]
async fn test_submitted_ids_are_unique_and_ordered() {
    let (_dir, queue) = setup().await;

    let mut ids = Vec::new();
    for i in 0..10 {
        let job = queue
            .submit(SubmitRequest::new(format!("echo {}", i)).unwrap())
            .await
            .unwrap();
        ids.push(job.id);
    }

    let unique: HashSet<JobId> = ids.iter().copied().collect();
    assert_eq!(unique.len(), 10);

    let listed: Vec<JobId> = queue.list(None).await.unwrap().into_iter().map(|j| j.id).collect();
    assert_eq!(listed, ids);
}

#[tokio::test]
async fn test_submit_uses_current_defaults() {
    let (_dir, queue) = setup().await;

    let before = queue.submit(SubmitRequest::new("a").unwrap()).await.unwrap();
    queue.set_default("maxRetries", "9").await.unwrap();
    let after = queue.submit(SubmitRequest::new("b").unwrap()).await.unwrap();

    assert_eq!(before.max_retries, 3);
    assert_eq!(after.max_retries, 9);
    let stored = queue.list(None).await.unwrap();
    assert_eq!(stored[0].max_retries, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_are_not_lost() {
    let (_dir, queue) = setup().await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            queue.submit(SubmitRequest::new(format!("echo {}", i)).unwrap()).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(queue.list(None).await.unwrap().len(), 20);
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let (_dir, queue) = setup().await;
    queue.submit(SubmitRequest::new("a").unwrap()).await.unwrap();
    let b = queue.submit(SubmitRequest::new("b").unwrap()).await.unwrap();

    queue
        .store()
        .update(Collection::Jobs, |jobs: &mut Vec<Job>| {
            if let Some(job) = jobs.iter_mut().find(|j| j.id == b.id) {
                job.status = JobStatus::Running;
            }
        })
        .await
        .unwrap();

    let running = queue.list(Some(JobStatus::Running)).await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, b.id);
    assert_eq!(queue.list(Some(JobStatus::Ready)).await.unwrap().len(), 1);
}

// ============================================================================
// Dead Letter Queue
// ============================================================================

#[tokio::test]
async fn test_replay_moves_job_back() {
    let (_dir, queue) = setup().await;
    let job = parked("exit 1", 4);
    queue.store().write(Collection::DeadLetter, &vec![job.clone()]).await.unwrap();

    let replayed = queue.dlq_replay(&job.id).await.unwrap();
    assert_eq!(replayed.id, job.id);
    assert_eq!(replayed.status, JobStatus::Ready);
    assert_eq!(replayed.retries, 0);

    let active = queue.list(None).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, job.id);
    assert!(active[0].next_attempt <= Utc::now());
    assert!(queue.dlq_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replay_unknown_id_mutates_nothing() {
    let (_dir, queue) = setup().await;
    let job = parked("exit 1", 4);
    queue.store().write(Collection::DeadLetter, &vec![job.clone()]).await.unwrap();

    let err = queue.dlq_replay(&JobId::new()).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(queue.dlq_list().await.unwrap(), vec![job]);
    assert!(queue.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replay_does_not_duplicate_active_job() {
    let (_dir, queue) = setup().await;
    let job = parked("exit 1", 4);
    queue.store().write(Collection::DeadLetter, &vec![job.clone()]).await.unwrap();
    queue.store().write(Collection::Jobs, &vec![job.reset_for_replay(Utc::now())]).await.unwrap();

    queue.dlq_replay(&job.id).await.unwrap();
    assert_eq!(queue.list(None).await.unwrap().len(), 1);
    assert!(queue.dlq_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dlq_clear_reports_count() {
    let (_dir, queue) = setup().await;
    queue
        .store()
        .write(Collection::DeadLetter, &vec![parked("a", 4), parked("b", 4)])
        .await
        .unwrap();

    assert_eq!(queue.dlq_clear().await.unwrap(), 2);
    assert!(queue.dlq_list().await.unwrap().is_empty());
    assert_eq!(queue.dlq_clear().await.unwrap(), 0);
}

// ============================================================================
// Defaults
// ============================================================================

#[tokio::test]
async fn test_set_default_persists() {
    let (_dir, queue) = setup().await;

    let updated = queue.set_default("backoffBase", "5").await.unwrap();
    assert_eq!(updated.backoff_base, 5);
    assert_eq!(queue.defaults().await.unwrap().backoff_base, 5);
}

#[tokio::test]
async fn test_set_default_rejects_bad_input() {
    let (_dir, queue) = setup().await;

    let err = queue.set_default("priority", "1").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidConfigKey);
    let err = queue.set_default("maxRetries", "-1").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidConfigValue);
    assert_eq!(queue.defaults().await.unwrap(), JobDefaults::default());
}
