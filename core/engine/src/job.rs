//! Sync job lifecycle and the per-user job registry.
//!
//! At most one job may be running per user. The registry enforces this with
//! a check-and-set under a single write lock, so two simultaneous starts for
//! the same user cannot both pass the "no active job" check. Finished jobs
//! stay visible for a grace period (late status polling) and are reclaimed
//! by one background sweep task rather than per-job timers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use calsync_common::{Error, Result, UserId};

/// Job state machine: `Pending → Running → {Completed | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Which way a sync job moves data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Remote to local only.
    Pull,
    /// Local to remote only.
    Push,
    /// Pull to completion, then push, within one job.
    Bidirectional,
}

/// Counters and outcome for one sync phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    /// Whether the phase ran to completion (per-event failures still count
    /// as completion; only a phase-level abort clears this).
    pub succeeded: bool,
    pub total: u64,
    pub synced: u64,
    pub conflicts: u64,
    pub failed: u64,
    /// Per-event failure messages, in occurrence order.
    pub errors: Vec<String>,
}

/// Aggregated result of a sync job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub pull: Option<PhaseReport>,
    pub push: Option<PhaseReport>,
}

impl SyncReport {
    /// Total remote/local changes seen across phases.
    pub fn total(&self) -> u64 {
        self.phase_sum(|p| p.total)
    }

    /// Changes applied across phases.
    pub fn synced(&self) -> u64 {
        self.phase_sum(|p| p.synced)
    }

    /// Conflicts detected across phases.
    pub fn conflicts(&self) -> u64 {
        self.phase_sum(|p| p.conflicts)
    }

    /// Per-event failures across phases.
    pub fn failed(&self) -> u64 {
        self.phase_sum(|p| p.failed)
    }

    /// Whether every phase that ran completed.
    pub fn all_phases_succeeded(&self) -> bool {
        self.pull.iter().all(|p| p.succeeded) && self.push.iter().all(|p| p.succeeded)
    }

    fn phase_sum(&self, f: impl Fn(&PhaseReport) -> u64) -> u64 {
        self.pull.as_ref().map_or(0, &f) + self.push.as_ref().map_or(0, &f)
    }
}

/// A single orchestrated sync run. Transient: jobs are never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: String,
    pub user_id: UserId,
    pub direction: SyncDirection,
    pub status: JobStatus,
    /// Coarse progress, 0-100.
    pub progress: u8,
    /// Events processed so far.
    pub processed: u64,
    /// Events seen so far (grows as pages arrive).
    pub total: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<SyncReport>,
    pub error: Option<String>,
}

impl SyncJob {
    fn new(user_id: UserId, direction: SyncDirection) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            direction,
            status: JobStatus::Pending,
            progress: 0,
            processed: 0,
            total: 0,
            started_at: Utc::now(),
            finished_at: None,
            result: None,
            error: None,
        }
    }

    /// Whether the job still occupies the per-user slot.
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Running)
    }
}

/// Shared handle the runner task uses to update its job.
#[derive(Clone, Debug)]
pub struct JobHandle {
    job: Arc<RwLock<SyncJob>>,
    cancelled: Arc<AtomicBool>,
}

impl JobHandle {
    /// A handle outside any registry, for driving a single phase directly
    /// (tests, one-off maintenance runs).
    pub fn detached(user: UserId, direction: SyncDirection) -> Self {
        Self {
            job: Arc::new(RwLock::new(SyncJob::new(user, direction))),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Snapshot the job.
    pub async fn snapshot(&self) -> SyncJob {
        self.job.read().await.clone()
    }

    /// Whether cancellation was requested. Checked cooperatively between
    /// processing units; in-flight remote calls are allowed to finish.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Move the job to `Running`.
    pub async fn mark_running(&self) {
        let mut job = self.job.write().await;
        job.status = JobStatus::Running;
    }

    /// Update progress counters.
    pub async fn record_progress(&self, processed: u64, total: u64) {
        let mut job = self.job.write().await;
        job.processed = processed;
        job.total = total;
        job.progress = if total == 0 {
            0
        } else {
            ((processed * 100) / total).min(100) as u8
        };
    }

    /// Finish the job successfully.
    pub async fn complete(&self, report: SyncReport) {
        let mut job = self.job.write().await;
        job.status = JobStatus::Completed;
        job.progress = 100;
        job.result = Some(report);
        job.finished_at = Some(Utc::now());
    }

    /// Finish the job as failed, keeping any partial report.
    pub async fn fail(&self, error: impl Into<String>, report: Option<SyncReport>) {
        let mut job = self.job.write().await;
        job.status = JobStatus::Failed;
        job.error = Some(error.into());
        if report.is_some() {
            job.result = report;
        }
        job.finished_at = Some(Utc::now());
    }
}

struct RegisteredJob {
    handle: JobHandle,
    /// Set when the job finishes; swept once the retention window passes.
    finished_at: Option<DateTime<Utc>>,
}

/// Per-user registry of sync jobs.
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, RegisteredJob>>,
    retention: Duration,
}

impl JobRegistry {
    /// Create a registry retaining finished jobs for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Atomically claim the per-user slot and create a pending job.
    ///
    /// # Errors
    /// - `AlreadyRunning` if the user already has an active job
    pub async fn try_begin(
        &self,
        user: &UserId,
        direction: SyncDirection,
    ) -> Result<JobHandle> {
        let mut jobs = self.jobs.write().await;

        if let Some(existing) = jobs.get(user.as_str()) {
            let current = existing.handle.job.read().await;
            if current.is_active() {
                return Err(Error::AlreadyRunning(format!(
                    "user {user} already has sync job {}",
                    current.id
                )));
            }
        }

        let job = SyncJob::new(user.clone(), direction);
        debug!(user = %user, job = %job.id, "registered sync job");
        let handle = JobHandle {
            job: Arc::new(RwLock::new(job)),
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        jobs.insert(
            user.as_str().to_string(),
            RegisteredJob {
                handle: handle.clone(),
                finished_at: None,
            },
        );
        Ok(handle)
    }

    /// Mark a user's job finished so the sweeper can reclaim it later.
    pub async fn release(&self, user: &UserId) {
        let mut jobs = self.jobs.write().await;
        if let Some(entry) = jobs.get_mut(user.as_str()) {
            entry.finished_at = Some(Utc::now());
        }
    }

    /// The user's current job, if still registered.
    pub async fn job_for_user(&self, user: &UserId) -> Option<SyncJob> {
        let jobs = self.jobs.read().await;
        match jobs.get(user.as_str()) {
            Some(entry) => Some(entry.handle.snapshot().await),
            None => None,
        }
    }

    /// Look up a job by id.
    pub async fn job(&self, job_id: &str) -> Option<SyncJob> {
        let jobs = self.jobs.read().await;
        for entry in jobs.values() {
            let snapshot = entry.handle.snapshot().await;
            if snapshot.id == job_id {
                return Some(snapshot);
            }
        }
        None
    }

    /// Request cooperative cancellation of a running job.
    ///
    /// Work already committed is not rolled back; sync is resumable, not
    /// transactional across its whole duration.
    ///
    /// # Errors
    /// - `NotFound` if no job with that id is registered
    /// - `Validation` if the job already finished
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let jobs = self.jobs.read().await;
        for entry in jobs.values() {
            let snapshot = entry.handle.snapshot().await;
            if snapshot.id == job_id {
                if !snapshot.is_active() {
                    return Err(Error::Validation(format!(
                        "job {job_id} is not running"
                    )));
                }
                entry.handle.cancelled.store(true, Ordering::SeqCst);
                info!(job = %job_id, "cancellation requested");
                return Ok(());
            }
        }
        Err(Error::NotFound(format!("no job {job_id}")))
    }

    /// Drop finished jobs whose retention window has passed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let retention =
            chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, entry| match entry.finished_at {
            Some(finished) => now - finished < retention,
            None => true,
        });
        before - jobs.len()
    }

    /// Spawn the background sweep task.
    ///
    /// One task serves the whole registry, bounding cleanup cost under high
    /// job churn.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let swept = registry.sweep(Utc::now()).await;
                if swept > 0 {
                    debug!(swept, "swept finished sync jobs");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> UserId {
        UserId::new("u1").unwrap()
    }

    #[tokio::test]
    async fn test_try_begin_rejects_second_active_job() {
        let registry = JobRegistry::new(Duration::from_secs(60));

        let handle = registry
            .try_begin(&user(), SyncDirection::Pull)
            .await
            .unwrap();
        handle.mark_running().await;

        let err = registry
            .try_begin(&user(), SyncDirection::Push)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn test_finished_job_frees_the_slot() {
        let registry = JobRegistry::new(Duration::from_secs(60));

        let handle = registry
            .try_begin(&user(), SyncDirection::Pull)
            .await
            .unwrap();
        handle.complete(SyncReport::default()).await;
        registry.release(&user()).await;

        // Slot is free even before the sweeper runs.
        registry
            .try_begin(&user(), SyncDirection::Pull)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_completed_job_remains_visible_until_swept() {
        let registry = JobRegistry::new(Duration::from_millis(10));

        let handle = registry
            .try_begin(&user(), SyncDirection::Pull)
            .await
            .unwrap();
        let job_id = handle.snapshot().await.id;
        handle.complete(SyncReport::default()).await;
        registry.release(&user()).await;

        assert!(registry.job(&job_id).await.is_some());

        // Sweep before the window passes keeps the job.
        let kept = registry.sweep(Utc::now()).await;
        assert_eq!(kept, 0);

        // Past the retention window it is reclaimed.
        let swept = registry
            .sweep(Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(swept, 1);
        assert!(registry.job(&job_id).await.is_none());
    }

    #[tokio::test]
    async fn test_cancel_sets_cooperative_flag() {
        let registry = JobRegistry::new(Duration::from_secs(60));

        let handle = registry
            .try_begin(&user(), SyncDirection::Pull)
            .await
            .unwrap();
        handle.mark_running().await;
        let job_id = handle.snapshot().await.id;

        assert!(!handle.is_cancelled());
        registry.cancel(&job_id).await.unwrap();
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_finished_job_is_rejected() {
        let registry = JobRegistry::new(Duration::from_secs(60));

        let handle = registry
            .try_begin(&user(), SyncDirection::Pull)
            .await
            .unwrap();
        let job_id = handle.snapshot().await.id;
        handle.complete(SyncReport::default()).await;

        assert!(matches!(
            registry.cancel(&job_id).await.unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            registry.cancel("missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_progress_is_bounded() {
        let registry = JobRegistry::new(Duration::from_secs(60));
        let handle = registry
            .try_begin(&user(), SyncDirection::Pull)
            .await
            .unwrap();

        handle.record_progress(0, 0).await;
        assert_eq!(handle.snapshot().await.progress, 0);

        handle.record_progress(5, 10).await;
        assert_eq!(handle.snapshot().await.progress, 50);

        handle.record_progress(10, 10).await;
        assert_eq!(handle.snapshot().await.progress, 100);
    }

    #[tokio::test]
    async fn test_report_aggregates_phases() {
        let report = SyncReport {
            pull: Some(PhaseReport {
                succeeded: true,
                total: 5,
                synced: 4,
                conflicts: 1,
                failed: 0,
                errors: Vec::new(),
            }),
            push: Some(PhaseReport {
                succeeded: false,
                total: 2,
                synced: 1,
                conflicts: 0,
                failed: 1,
                errors: vec!["create failed".to_string()],
            }),
        };

        assert_eq!(report.total(), 7);
        assert_eq!(report.synced(), 5);
        assert_eq!(report.conflicts(), 1);
        assert_eq!(report.failed(), 1);
        assert!(!report.all_phases_succeeded());
    }
}
