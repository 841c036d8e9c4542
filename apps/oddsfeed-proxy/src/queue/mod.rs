//! Priority Job Queue
//!
//! Decouples "this entity needs a refresh" from "a refresh runs now".
//! Jobs carry a type, a priority, and a retry budget. Workers per type
//! run under a semaphore for bounded concurrency and a token bucket
//! for a jobs-per-second ceiling, so many simultaneous refresh demands
//! never translate into unbounded upstream pressure.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::admission::{RateBudget, TokenBucket};
use crate::domain::channel::DataKind;
use crate::fetch::FetchError;
use crate::infrastructure::metrics::set_queue_depth;

// ============================================================================
// Jobs
// ============================================================================

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Refresh odds for one entity.
    OddsRefresh,
    /// Refresh the scorecard for one entity.
    ScorecardRefresh,
    /// Synchronize the fixture list.
    FixtureSync,
}

impl JobType {
    /// All job types.
    pub const ALL: [Self; 3] = [Self::OddsRefresh, Self::ScorecardRefresh, Self::FixtureSync];

    /// The data kind this job refreshes.
    #[must_use]
    pub const fn data_kind(self) -> DataKind {
        match self {
            Self::OddsRefresh => DataKind::Odds,
            Self::ScorecardRefresh => DataKind::Scorecard,
            Self::FixtureSync => DataKind::Fixtures,
        }
    }

    /// Stable name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OddsRefresh => "odds_refresh",
            Self::ScorecardRefresh => "scorecard_refresh",
            Self::FixtureSync => "fixture_sync",
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of queued work.
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job id.
    pub id: Uuid,
    /// What the job does.
    pub job_type: JobType,
    /// Job-specific payload, typically an entity id.
    pub payload: Value,
    /// Higher runs first among due jobs of the same type.
    pub priority: u8,
    /// Attempts made so far.
    pub attempts: u32,
    /// Attempt ceiling before the job fails terminally.
    pub max_attempts: u32,
    /// Earliest time the job may run.
    pub not_before: Instant,
    /// Wall-clock enqueue time.
    pub enqueued_at: DateTime<Utc>,
}

/// Executes jobs pulled from the queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Run one job to completion.
    ///
    /// # Errors
    ///
    /// Any error counts as a failed attempt and triggers the queue's
    /// own retry schedule.
    async fn execute(&self, job: &Job) -> Result<(), FetchError>;
}

/// Record of a finished job kept in bounded history.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Job id.
    pub id: Uuid,
    /// Job type.
    pub job_type: JobType,
    /// Attempts consumed.
    pub attempts: u32,
    /// When the job finished.
    pub finished_at: DateTime<Utc>,
    /// Final error for failed jobs.
    pub error: Option<String>,
}

// ============================================================================
// Configuration
// ============================================================================

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Concurrent jobs allowed per type.
    pub workers_per_type: usize,
    /// Jobs per second allowed per type.
    pub jobs_per_sec: f64,
    /// Default attempt ceiling.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub retry_base: Duration,
    /// Retry delay ceiling.
    pub retry_max: Duration,
    /// Completed records retained.
    pub completed_history: usize,
    /// Failed records retained.
    pub failed_history: usize,
    /// Idle poll interval for dispatchers.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers_per_type: 4,
            jobs_per_sec: 10.0,
            max_attempts: 3,
            retry_base: Duration::from_secs(2),
            retry_max: Duration::from_secs(60),
            completed_history: 100,
            failed_history: 50,
            poll_interval: Duration::from_millis(50),
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

/// In-memory priority queue with per-type workers.
#[derive(Debug)]
pub struct JobQueue {
    config: QueueConfig,
    pending: Mutex<Vec<Job>>,
    /// Per-type jobs-per-second budget.
    buckets: HashMap<JobType, Mutex<TokenBucket>>,
    completed: Mutex<VecDeque<JobRecord>>,
    failed: Mutex<VecDeque<JobRecord>>,
    running: AtomicUsize,
    enqueued_total: AtomicU64,
    completed_total: AtomicU64,
    retried_total: AtomicU64,
    failed_total: AtomicU64,
}

impl JobQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new(config: QueueConfig) -> Self {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capacity = config.jobs_per_sec.ceil().max(1.0) as u32;
        let buckets = JobType::ALL
            .into_iter()
            .map(|job_type| {
                (
                    job_type,
                    Mutex::new(TokenBucket::new(RateBudget::new(capacity, config.jobs_per_sec))),
                )
            })
            .collect();
        Self {
            config,
            pending: Mutex::new(Vec::new()),
            buckets,
            completed: Mutex::new(VecDeque::new()),
            failed: Mutex::new(VecDeque::new()),
            running: AtomicUsize::new(0),
            enqueued_total: AtomicU64::new(0),
            completed_total: AtomicU64::new(0),
            retried_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
        }
    }

    /// Enqueue a job and return its id.
    pub fn enqueue(&self, job_type: JobType, payload: Value, priority: u8) -> Uuid {
        self.push_job(job_type, payload, priority, Duration::ZERO)
    }

    /// Enqueue a job that only becomes due after `delay`. Once due it
    /// competes on priority like any other pending job.
    pub fn enqueue_in(
        &self,
        job_type: JobType,
        payload: Value,
        priority: u8,
        delay: Duration,
    ) -> Uuid {
        self.push_job(job_type, payload, priority, delay)
    }

    fn push_job(&self, job_type: JobType, payload: Value, priority: u8, delay: Duration) -> Uuid {
        let job = Job {
            id: Uuid::new_v4(),
            job_type,
            payload,
            priority,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            not_before: Instant::now() + delay,
            enqueued_at: Utc::now(),
        };
        let id = job.id;
        self.pending.lock().push(job);
        self.enqueued_total.fetch_add(1, Ordering::Relaxed);
        self.publish_depth_gauge();
        tracing::debug!(
            job_id = %id,
            job_type = %job_type,
            priority,
            delay_ms = delay.as_millis() as u64,
            "Job enqueued"
        );
        id
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_depth_gauge(&self) {
        set_queue_depth(self.depth() as f64);
    }

    /// Pending jobs, due or not.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }

    /// Recently completed jobs, newest first.
    #[must_use]
    pub fn recent_completed(&self) -> Vec<JobRecord> {
        self.completed.lock().iter().cloned().collect()
    }

    /// Recently failed jobs, newest first.
    #[must_use]
    pub fn recent_failed(&self) -> Vec<JobRecord> {
        self.failed.lock().iter().cloned().collect()
    }

    /// Counter snapshot for diagnostics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            depth: self.depth(),
            running: self.running.load(Ordering::Relaxed),
            enqueued_total: self.enqueued_total.load(Ordering::Relaxed),
            completed_total: self.completed_total.load(Ordering::Relaxed),
            retried_total: self.retried_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
        }
    }

    /// Start one dispatcher per job type.
    ///
    /// Dispatchers stop draining when `cancel` fires; jobs already
    /// running are allowed to finish.
    pub fn run_workers(
        self: &Arc<Self>,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        JobType::ALL
            .into_iter()
            .map(|job_type| {
                let queue = Arc::clone(self);
                let handler = Arc::clone(&handler);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    queue.dispatch_loop(job_type, handler, cancel).await;
                })
            })
            .collect()
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        job_type: JobType,
        handler: Arc<dyn JobHandler>,
        cancel: CancellationToken,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.workers_per_type));
        tracing::info!(
            job_type = %job_type,
            workers = self.config.workers_per_type,
            "Job dispatcher started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Only draw a rate token once a job is actually due, so
            // idle polls never burn budget.
            let job = if self.has_due(job_type) && self.take_rate_token(job_type) {
                self.take_due(job_type)
            } else {
                None
            };

            let Some(mut job) = job else {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.config.poll_interval) => continue,
                }
            };

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let queue = Arc::clone(&self);
            let handler = Arc::clone(&handler);
            queue.running.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                job.attempts += 1;
                let result = handler.execute(&job).await;
                queue.settle(job, result);
                queue.running.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }

        tracing::info!(job_type = %job_type, "Job dispatcher stopped");
    }

    /// Whether any pending job of the type is due right now.
    fn has_due(&self, job_type: JobType) -> bool {
        let now = Instant::now();
        self.pending
            .lock()
            .iter()
            .any(|job| job.job_type == job_type && job.not_before <= now)
    }

    fn take_rate_token(&self, job_type: JobType) -> bool {
        self.buckets
            .get(&job_type)
            .is_some_and(|bucket| bucket.lock().try_acquire(1))
    }

    /// Remove and return the highest-priority due job of the type.
    fn take_due(&self, job_type: JobType) -> Option<Job> {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let index = pending
            .iter()
            .enumerate()
            .filter(|(_, job)| job.job_type == job_type && job.not_before <= now)
            .max_by_key(|(_, job)| (job.priority, std::cmp::Reverse(job.enqueued_at)))
            .map(|(index, _)| index)?;
        let job = pending.swap_remove(index);
        drop(pending);
        self.publish_depth_gauge();
        Some(job)
    }

    fn settle(&self, job: Job, result: Result<(), FetchError>) {
        match result {
            Ok(()) => {
                self.completed_total.fetch_add(1, Ordering::Relaxed);
                Self::push_history(
                    &mut self.completed.lock(),
                    self.config.completed_history,
                    JobRecord {
                        id: job.id,
                        job_type: job.job_type,
                        attempts: job.attempts,
                        finished_at: Utc::now(),
                        error: None,
                    },
                );
                tracing::debug!(job_id = %job.id, job_type = %job.job_type, "Job completed");
            }
            Err(error) if job.attempts < job.max_attempts => {
                let delay = self.retry_delay(job.attempts);
                self.retried_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempt = job.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Job failed, scheduling retry"
                );
                let mut retry = job;
                retry.not_before = Instant::now() + delay;
                self.pending.lock().push(retry);
                self.publish_depth_gauge();
            }
            Err(error) => {
                self.failed_total.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    error = %error,
                    "Job failed terminally"
                );
                Self::push_history(
                    &mut self.failed.lock(),
                    self.config.failed_history,
                    JobRecord {
                        id: job.id,
                        job_type: job.job_type,
                        attempts: job.attempts,
                        finished_at: Utc::now(),
                        error: Some(error.to_string()),
                    },
                );
            }
        }
    }

    /// base * 2^(attempt - 1), capped.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(10);
        let delay = self.config.retry_base.saturating_mul(1u32 << exponent);
        delay.min(self.config.retry_max)
    }

    fn push_history(history: &mut VecDeque<JobRecord>, cap: usize, record: JobRecord) {
        history.push_front(record);
        history.truncate(cap);
    }
}

/// Counter snapshot of the queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    /// Pending jobs.
    pub depth: usize,
    /// Jobs executing right now.
    pub running: usize,
    /// Jobs ever enqueued.
    pub enqueued_total: u64,
    /// Jobs completed successfully.
    pub completed_total: u64,
    /// Retry attempts scheduled.
    pub retried_total: u64,
    /// Jobs failed terminally.
    pub failed_total: u64,
}
