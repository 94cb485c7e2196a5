//! CheckpointJobRunner (C3): external interface only (spec §6) — this core
//! calls `enqueue` and reacts to job events, it never executes checkpoint
//! jobs itself. [`InMemoryCheckpointJobRunner`] is a reference
//! implementation used by this crate's own tests and doctests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::rollback::CheckpointReason;

#[derive(Debug, Clone)]
pub struct CheckpointJobRequest {
    pub session_id: String,
    pub seed_entity_ids: Vec<String>,
    pub reason: CheckpointReason,
    pub hop_count: u32,
    pub sequence_number: u64,
    pub operation_id: Option<String>,
    pub event_id: Option<String>,
    pub actor: Option<String>,
    pub annotations: Option<serde_json::Value>,
    pub triggered_by: String,
    pub window: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CheckpointJobEvent {
    JobCompleted {
        job_id: String,
        session_id: String,
    },
    JobFailed {
        job_id: String,
        session_id: String,
        error: String,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointMetricsSnapshot {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job_id: String,
    pub session_id: String,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

/// The checkpoint job runner interface this core consumes (spec §6, §4.3.10).
#[async_trait]
pub trait CheckpointJobRunner: Send + Sync {
    /// Enqueues a job. Returns the generated job id, or `Err` if the
    /// runner's queue rejects the submission outright (spec S4: the
    /// coordinator falls back to `manual_intervention` on this path).
    async fn enqueue(&self, job: CheckpointJobRequest) -> std::result::Result<String, String>;

    fn metrics(&self) -> CheckpointMetricsSnapshot;

    fn dead_letters(&self) -> Vec<DeadLetterEntry>;

    fn subscribe(&self) -> broadcast::Receiver<CheckpointJobEvent>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Completed,
    Retrying,
    DeadLettered,
}

struct JobAttempt {
    attempts: u32,
    last_error: Option<String>,
}

/// Reference in-process implementation: runs each enqueued job through an
/// injected executor with exponential backoff (2s, 4s, 8s), matching the
/// retry math this core's own retry policy uses for operations.
pub struct InMemoryCheckpointJobRunner {
    executor: Arc<dyn Fn(&CheckpointJobRequest) -> std::result::Result<(), String> + Send + Sync>,
    max_attempts: u32,
    events: broadcast::Sender<CheckpointJobEvent>,
    metrics: Arc<RwLock<CheckpointMetricsSnapshot>>,
    dead_letters: Arc<RwLock<Vec<DeadLetterEntry>>>,
    attempts: Arc<RwLock<HashMap<String, JobAttempt>>>,
    reject_enqueue: std::sync::atomic::AtomicBool,
}

impl InMemoryCheckpointJobRunner {
    pub fn new<F>(executor: F) -> Self
    where
        F: Fn(&CheckpointJobRequest) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            executor: Arc::new(executor),
            max_attempts: 3,
            events: tx,
            metrics: Arc::new(RwLock::new(CheckpointMetricsSnapshot::default())),
            dead_letters: Arc::new(RwLock::new(Vec::new())),
            attempts: Arc::new(RwLock::new(HashMap::new())),
            reject_enqueue: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// An always-succeeding runner, useful as a default collaborator in tests.
    pub fn always_succeeds() -> Self {
        Self::new(|_job| Ok(()))
    }

    /// Simulates the runner's `enqueue` itself throwing (spec S4).
    pub fn set_reject_enqueue(&self, reject: bool) {
        self.reject_enqueue
            .store(reject, std::sync::atomic::Ordering::SeqCst);
    }

    async fn run_job(&self, job_id: String, job: CheckpointJobRequest) {
        {
            let mut metrics = self.metrics.write().await;
            metrics.running += 1;
        }

        let mut delay_secs = 0u64;
        loop {
            if delay_secs > 0 {
                tokio::time::sleep(std::time::Duration::from_secs(delay_secs)).await;
            }

            let outcome = match (self.executor)(&job) {
                Ok(()) => JobOutcome::Completed,
                Err(error) => {
                    let mut attempts = self.attempts.write().await;
                    let entry = attempts.entry(job_id.clone()).or_insert(JobAttempt {
                        attempts: 0,
                        last_error: None,
                    });
                    entry.attempts += 1;
                    entry.last_error = Some(error.clone());
                    if entry.attempts >= self.max_attempts {
                        JobOutcome::DeadLettered
                    } else {
                        delay_secs = 2u64.pow(entry.attempts - 1);
                        JobOutcome::Retrying
                    }
                }
            };

            match outcome {
                JobOutcome::Completed => {
                    let mut metrics = self.metrics.write().await;
                    metrics.running -= 1;
                    metrics.completed += 1;
                    let _ = self.events.send(CheckpointJobEvent::JobCompleted {
                        job_id: job_id.clone(),
                        session_id: job.session_id.clone(),
                    });
                    return;
                }
                JobOutcome::Retrying => continue,
                JobOutcome::DeadLettered => {
                    let last_error = self
                        .attempts
                        .read()
                        .await
                        .get(&job_id)
                        .and_then(|a| a.last_error.clone())
                        .unwrap_or_default();
                    {
                        let mut metrics = self.metrics.write().await;
                        metrics.running -= 1;
                        metrics.failed += 1;
                        metrics.dead_lettered += 1;
                    }
                    self.dead_letters.write().await.push(DeadLetterEntry {
                        job_id: job_id.clone(),
                        session_id: job.session_id.clone(),
                        attempts: self.max_attempts,
                        last_error: last_error.clone(),
                        failed_at: Utc::now(),
                    });
                    let _ = self.events.send(CheckpointJobEvent::JobFailed {
                        job_id: job_id.clone(),
                        session_id: job.session_id.clone(),
                        error: last_error,
                    });
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl CheckpointJobRunner for InMemoryCheckpointJobRunner {
    async fn enqueue(&self, job: CheckpointJobRequest) -> std::result::Result<String, String> {
        if self.reject_enqueue.load(std::sync::atomic::Ordering::SeqCst) {
            return Err("checkpoint runner queue rejected job".to_string());
        }

        let job_id = format!("ckpt_{}", Uuid::new_v4());
        {
            let mut metrics = self.metrics.write().await;
            metrics.queued += 1;
        }

        let this = self.clone_handles();
        let id_for_task = job_id.clone();
        tokio::spawn(async move { this.run_job(id_for_task, job).await });

        Ok(job_id)
    }

    fn metrics(&self) -> CheckpointMetricsSnapshot {
        // Best-effort snapshot without blocking: callers needing the latest
        // value should prefer `metrics_async`.
        self.metrics
            .try_read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.dead_letters.try_read().map(|d| d.clone()).unwrap_or_default()
    }

    fn subscribe(&self) -> broadcast::Receiver<CheckpointJobEvent> {
        self.events.subscribe()
    }
}

impl InMemoryCheckpointJobRunner {
    fn clone_handles(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            max_attempts: self.max_attempts,
            events: self.events.clone(),
            metrics: self.metrics.clone(),
            dead_letters: self.dead_letters.clone(),
            attempts: self.attempts.clone(),
            reject_enqueue: std::sync::atomic::AtomicBool::new(
                self.reject_enqueue.load(std::sync::atomic::Ordering::SeqCst),
            ),
        }
    }

    pub async fn metrics_async(&self) -> CheckpointMetricsSnapshot {
        self.metrics.read().await.clone()
    }
}
