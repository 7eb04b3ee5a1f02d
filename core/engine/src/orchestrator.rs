//! Top-level sync coordination.
//!
//! The orchestrator owns per-user job lifecycle, decides pull/push strategy,
//! drives the delta fetcher and conflict resolver, applies changes through
//! the local repositories and the remote gateway, and persists sync state.
//! Jobs run as independent tokio tasks; callers observe progress by polling
//! status, never by blocking on completion.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

use tracing::{debug, error, info, warn};

use calsync_common::{CalendarId, Error, Result, UserId};
use calsync_gateway::{CalendarGateway, ChangeKind, CredentialProvider, EventDraft, RemoteEvent};
use calsync_store::{
    CalendarEvent, ConflictRecordStore, LocalEventRepository, SyncState, SyncStateStore,
};

use crate::conflict::{event_with_remote_content, ConflictResolver, ResolutionStrategy};
use crate::delta::{DeltaFetcher, DeltaOptions, TaggedEvent};
use crate::job::{
    JobHandle, JobRegistry, PhaseReport, SyncDirection, SyncJob, SyncReport,
};
use crate::retry::{RetryConfig, RetryExecutor};

/// Configuration for the sync orchestrator.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Retry behavior for remote calls.
    pub retry: RetryConfig,
    /// Delta fetching options.
    pub delta: DeltaOptions,
    /// Worker-pool bound for per-event work within one page.
    pub concurrency_limit: usize,
    /// Deadline for a single remote write.
    pub call_timeout: Duration,
    /// How long finished jobs stay visible for late status polling.
    pub job_retention: Duration,
    /// Cadence of the job registry sweep task.
    pub sweep_interval: Duration,
    /// Resolve detected conflicts immediately instead of leaving them
    /// pending.
    pub auto_resolve_conflicts: bool,
    /// Strategy used when auto-resolving.
    pub conflict_strategy: ResolutionStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            delta: DeltaOptions::default(),
            concurrency_limit: 4,
            call_timeout: Duration::from_secs(30),
            job_retention: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            auto_resolve_conflicts: false,
            conflict_strategy: ResolutionStrategy::PreferLatest,
        }
    }
}

/// Options for one sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub direction: SyncDirection,
    pub calendar_id: CalendarId,
    /// Resolve conflicts in this run with the given strategy; `None` leaves
    /// them pending (unless the config enables auto-resolution).
    pub conflict_strategy: Option<ResolutionStrategy>,
    /// Ignore the stored continuation token and re-enumerate.
    pub force_full: bool,
    /// Only apply non-deleted remote events overlapping this window.
    pub date_range: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

impl SyncOptions {
    /// Options with defaults for a direction and calendar.
    pub fn new(direction: SyncDirection, calendar_id: CalendarId) -> Self {
        Self {
            direction,
            calendar_id,
            conflict_strategy: None,
            force_full: false,
            date_range: None,
        }
    }
}

/// Combined job and persisted-state view for status polling.
#[derive(Debug, Clone)]
pub struct SyncStatusView {
    /// The user's registered job, if one is still visible.
    pub job: Option<SyncJob>,
    /// Last persisted sync state, available even with no active job.
    pub state: Option<SyncState>,
}

/// How one remote change was applied locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Created,
    Updated,
    Deleted,
    Skipped,
    Conflicted,
}

/// Outcome of driving one pull enumeration.
#[derive(Debug, Default)]
struct PullOutcome {
    total: u64,
    synced: u64,
    conflicted: u64,
    failed: u64,
    errors: Vec<String>,
    /// Final delta token; present only when every page was fully applied.
    token: Option<String>,
}

/// Main coordinator for calendar synchronization.
pub struct SyncOrchestrator<G: CalendarGateway + ?Sized + 'static> {
    gateway: Arc<G>,
    credentials: Arc<dyn CredentialProvider>,
    events: Arc<dyn LocalEventRepository>,
    states: Arc<dyn SyncStateStore>,
    conflicts: Arc<dyn ConflictRecordStore>,
    resolver: Arc<ConflictResolver>,
    fetcher: DeltaFetcher<G>,
    jobs: Arc<JobRegistry>,
    retry: Arc<RetryExecutor>,
    config: SyncConfig,
}

impl<G: CalendarGateway + ?Sized + 'static> SyncOrchestrator<G> {
    /// Create a new orchestrator over its collaborators.
    pub fn new(
        gateway: Arc<G>,
        credentials: Arc<dyn CredentialProvider>,
        events: Arc<dyn LocalEventRepository>,
        states: Arc<dyn SyncStateStore>,
        conflicts: Arc<dyn ConflictRecordStore>,
        config: SyncConfig,
    ) -> Self {
        let retry = Arc::new(RetryExecutor::new(config.retry.clone()));
        let fetcher = DeltaFetcher::new(
            Arc::clone(&gateway),
            Arc::clone(&retry),
            config.delta.clone(),
        );
        let jobs = Arc::new(JobRegistry::new(config.job_retention));

        Self {
            gateway,
            credentials,
            events,
            states,
            conflicts,
            resolver: Arc::new(ConflictResolver::new()),
            fetcher,
            jobs,
            retry,
            config,
        }
    }

    /// Spawn the background job-registry sweeper.
    pub fn spawn_job_sweeper(&self) -> tokio::task::JoinHandle<()> {
        self.jobs.spawn_sweeper(self.config.sweep_interval)
    }

    /// The local event repository.
    pub fn events(&self) -> Arc<dyn LocalEventRepository> {
        Arc::clone(&self.events)
    }

    /// The conflict record store.
    pub fn conflicts(&self) -> Arc<dyn ConflictRecordStore> {
        Arc::clone(&self.conflicts)
    }

    /// The conflict resolver.
    pub fn resolver(&self) -> Arc<ConflictResolver> {
        Arc::clone(&self.resolver)
    }

    /// The delta fetcher.
    pub fn fetcher(&self) -> &DeltaFetcher<G> {
        &self.fetcher
    }

    /// Start a sync job for a user.
    ///
    /// Returns the job snapshot immediately; the reconciliation runs as an
    /// independent task.
    ///
    /// # Errors
    /// - `Validation` on malformed options
    /// - `NotAuthenticated` if no usable credential exists for the user
    /// - `AlreadyRunning` if the user already has an active job
    pub async fn start_sync(
        self: &Arc<Self>,
        user: &UserId,
        options: SyncOptions,
    ) -> Result<SyncJob> {
        if let Some((start, end)) = options.date_range {
            if start >= end {
                return Err(Error::Validation(format!(
                    "date range start ({start}) must precede end ({end})"
                )));
            }
        }

        if !self.credentials.is_valid(user).await {
            return Err(Error::NotAuthenticated(format!(
                "no usable credential for {user}"
            )));
        }

        let handle = self.jobs.try_begin(user, options.direction).await?;
        let snapshot = handle.snapshot().await;

        let orchestrator = Arc::clone(self);
        let user = user.clone();
        tokio::spawn(async move {
            orchestrator.run_job(handle, user, options).await;
        });

        Ok(snapshot)
    }

    /// Status for a user: active job (if any) plus last persisted state.
    pub async fn get_sync_status(
        &self,
        user: &UserId,
        calendar: &CalendarId,
    ) -> Result<SyncStatusView> {
        Ok(SyncStatusView {
            job: self.jobs.job_for_user(user).await,
            state: self.states.load(user, calendar).await?,
        })
    }

    /// Look up a job by id.
    pub async fn job(&self, job_id: &str) -> Option<SyncJob> {
        self.jobs.job(job_id).await
    }

    /// Request cooperative cancellation of a job.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        self.jobs.cancel(job_id).await
    }

    /// Past sync state snapshots for a user, newest first.
    pub async fn history(
        &self,
        user: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SyncState>> {
        self.states.history(user, limit, offset).await
    }

    /// Clear the stored continuation token, forcing the next run to
    /// full-sync.
    pub async fn reset_state(&self, user: &UserId, calendar: &CalendarId) -> Result<()> {
        info!(user = %user, calendar = %calendar, "resetting sync state");
        self.states.reset(user, calendar).await
    }

    /// Execute one job to completion. Runs on its own task.
    async fn run_job(self: Arc<Self>, handle: JobHandle, user: UserId, options: SyncOptions) {
        handle.mark_running().await;
        info!(user = %user, direction = ?options.direction, "sync job started");

        let mut report = SyncReport::default();
        let mut phase_error: Option<Error> = None;

        match options.direction {
            SyncDirection::Pull => {
                match self.pull_once(&user, &options, &handle).await {
                    Ok(phase) => report.pull = Some(phase),
                    Err(err) => phase_error = Some(err),
                }
            }
            SyncDirection::Push => {
                match self.push_once(&user, &options, &handle).await {
                    Ok(phase) => report.push = Some(phase),
                    Err(err) => phase_error = Some(err),
                }
            }
            SyncDirection::Bidirectional => {
                // Pull to completion, then push. A failed pull still lets
                // the push run; the report carries per-phase success flags.
                match self.pull_once(&user, &options, &handle).await {
                    Ok(phase) => report.pull = Some(phase),
                    Err(err) => {
                        report.pull = Some(PhaseReport {
                            succeeded: false,
                            errors: vec![err.to_string()],
                            ..PhaseReport::default()
                        });
                        phase_error = Some(err);
                    }
                }
                if !handle.is_cancelled() {
                    match self.push_once(&user, &options, &handle).await {
                        Ok(phase) => report.push = Some(phase),
                        Err(err) => {
                            report.push = Some(PhaseReport {
                                succeeded: false,
                                errors: vec![err.to_string()],
                                ..PhaseReport::default()
                            });
                            if phase_error.is_none() {
                                phase_error = Some(err);
                            }
                        }
                    }
                }
            }
        }

        let cancelled = handle.is_cancelled();
        self.finish_job(&handle, &user, &options, report, phase_error, cancelled)
            .await;
    }

    /// Persist the final state snapshot and close out the job record.
    async fn finish_job(
        &self,
        handle: &JobHandle,
        user: &UserId,
        options: &SyncOptions,
        report: SyncReport,
        phase_error: Option<Error>,
        cancelled: bool,
    ) {
        let mut state = match self.states.load(user, &options.calendar_id).await {
            Ok(Some(state)) => state,
            Ok(None) => SyncState::new(user.clone(), options.calendar_id.clone()),
            Err(err) => {
                error!(user = %user, "failed to load sync state: {}", err);
                SyncState::new(user.clone(), options.calendar_id.clone())
            }
        };

        state.total_events = report.total();
        state.synced_events = report.synced();
        state.conflicted_events = report.conflicts();
        state.failed_events = report.failed();

        if cancelled {
            state.record_failed("cancelled");
            handle.fail("cancelled", Some(report)).await;
        } else if let Some(err) = phase_error {
            state.record_failed(err.to_string());
            handle.fail(err.to_string(), Some(report)).await;
        } else {
            state.last_status = calsync_store::SyncRunStatus::Completed;
            state.last_error = None;
            state.last_sync_time = Some(Utc::now());
            handle.complete(report).await;
        }

        if let Err(err) = self.states.save(state.clone()).await {
            error!(user = %user, "failed to save sync state: {}", err);
        }
        if let Err(err) = self.states.append_history(state).await {
            error!(user = %user, "failed to append sync history: {}", err);
        }
        self.jobs.release(user).await;

        let job = handle.snapshot().await;
        info!(user = %user, job = %job.id, status = ?job.status, "sync job finished");
    }

    /// Run the pull phase: remote changes applied to the local store.
    pub async fn pull_once(
        &self,
        user: &UserId,
        options: &SyncOptions,
        handle: &JobHandle,
    ) -> Result<PhaseReport> {
        let calendar = &options.calendar_id;
        let mut state = match self.states.load(user, calendar).await? {
            Some(state) => state,
            None => SyncState::new(user.clone(), calendar.clone()),
        };
        state.mark_running();
        self.states.save(state.clone()).await?;

        // Incremental only when a token and a prior successful run exist.
        let incremental = state.continuation_token.is_some()
            && state.last_sync_time.is_some()
            && !options.force_full;
        let token = if incremental {
            state.continuation_token.clone()
        } else {
            None
        };
        let last_sync = state.last_sync_time;
        let strategy = options.conflict_strategy.or_else(|| {
            self.config
                .auto_resolve_conflicts
                .then_some(self.config.conflict_strategy)
        });

        debug!(
            user = %user,
            incremental,
            force_full = options.force_full,
            "starting pull"
        );

        let mut fell_back = false;
        let outcome = match self
            .pull_apply(user, calendar, token.clone(), options, last_sync, strategy, handle)
            .await
        {
            Ok(outcome) => outcome,
            Err(Error::TokenInvalid(reason)) if token.is_some() => {
                // Expired token: clear it and retry once as a full sync.
                // Only surfaced if the fallback also fails.
                warn!(user = %user, "continuation token rejected ({reason}); falling back to full sync");
                state.clear_token();
                self.states.save(state.clone()).await?;
                fell_back = true;
                self.pull_apply(user, calendar, None, options, last_sync, strategy, handle)
                    .await?
            }
            Err(err) => return Err(err),
        };

        let was_full = !incremental || fell_back;
        let completed = outcome.token.is_some();
        if completed {
            state.record_completed(
                outcome.token.clone(),
                outcome.total,
                outcome.synced,
                outcome.conflicted,
                outcome.failed,
                was_full,
            );
            self.states.save(state).await?;
        }

        Ok(PhaseReport {
            succeeded: completed,
            total: outcome.total,
            synced: outcome.synced,
            conflicts: outcome.conflicted,
            failed: outcome.failed,
            errors: outcome.errors,
        })
    }

    /// Drive the page sequence, applying each page in order.
    #[allow(clippy::too_many_arguments)]
    async fn pull_apply(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        token: Option<String>,
        options: &SyncOptions,
        last_sync: Option<DateTime<Utc>>,
        strategy: Option<ResolutionStrategy>,
        handle: &JobHandle,
    ) -> Result<PullOutcome> {
        let mut pages = self.fetcher.pages(user, calendar, token);
        let mut outcome = PullOutcome::default();

        while let Some(page) = pages.next().await {
            let page = page?;

            let mut tagged: Vec<TaggedEvent> = page
                .events
                .into_iter()
                .map(|event| TaggedEvent {
                    kind: event.change_kind(),
                    event,
                })
                .collect();
            if let Some((start, end)) = options.date_range {
                tagged = DeltaFetcher::<G>::window_filter(tagged, start, end);
            }

            outcome.total += tagged.len() as u64;

            // Events within one page are independent; fan the work out
            // through a bounded pool. Ordering across pages is preserved by
            // applying pages sequentially.
            let results: Vec<Result<Applied>> = stream::iter(tagged)
                .map(|event| self.apply_remote_event(user, calendar, event, last_sync, strategy))
                .buffer_unordered(self.config.concurrency_limit.max(1))
                .collect()
                .await;

            for result in results {
                match result {
                    Ok(Applied::Created) | Ok(Applied::Updated) | Ok(Applied::Deleted) => {
                        outcome.synced += 1;
                    }
                    Ok(Applied::Conflicted) => outcome.conflicted += 1,
                    Ok(Applied::Skipped) => {}
                    Err(err) => {
                        warn!(user = %user, "failed to apply remote change: {}", err);
                        outcome.failed += 1;
                        outcome.errors.push(err.to_string());
                    }
                }
            }

            let processed = outcome.synced + outcome.conflicted + outcome.failed;
            handle.record_progress(processed, outcome.total).await;

            // Cooperative cancellation between pages: the token is not
            // advanced, so the unfinished range is re-delivered next run.
            if handle.is_cancelled() {
                info!(user = %user, "pull cancelled between pages");
                return Ok(outcome);
            }
        }

        outcome.token = pages.continuation_token().map(str::to_string);
        if outcome.token.is_none() {
            return Err(Error::Transport(
                "delta enumeration ended without a delta token".to_string(),
            ));
        }
        Ok(outcome)
    }

    /// Apply one remote change to the local store.
    async fn apply_remote_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        tagged: TaggedEvent,
        last_sync: Option<DateTime<Utc>>,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<Applied> {
        let remote = &tagged.event;
        let existing = self
            .events
            .find_by_remote_id(user, calendar, &remote.id)
            .await?;

        if tagged.kind == ChangeKind::Deleted {
            return match existing {
                Some(local) => {
                    self.events.delete(&local.local_id).await?;
                    debug!(event = %remote.id, "applied remote deletion");
                    Ok(Applied::Deleted)
                }
                // Absence of a match is not an error.
                None => Ok(Applied::Skipped),
            };
        }

        match existing {
            None => {
                let event = local_event_from_remote(user, calendar, remote);
                self.events.insert(event).await?;
                Ok(Applied::Created)
            }
            Some(local) => {
                if let Some(info) = self.resolver.detect_conflict(&local, remote, last_sync) {
                    return self
                        .record_conflict(user, &local, remote, info, strategy)
                        .await;
                }

                let remote_changed = last_sync.is_none_or(|t| remote.last_modified > t);
                if remote_changed {
                    // Only the remote side changed (or neither side's content
                    // differs): the remote version wins.
                    let updated = event_with_remote_content(&local, remote);
                    self.events.update(updated).await?;
                    Ok(Applied::Updated)
                } else {
                    // Local-only change or no change at all; push handles it.
                    Ok(Applied::Skipped)
                }
            }
        }
    }

    /// Persist a conflict, optionally resolving it immediately.
    async fn record_conflict(
        &self,
        user: &UserId,
        local: &CalendarEvent,
        remote: &RemoteEvent,
        info: crate::conflict::ConflictInfo,
        strategy: Option<ResolutionStrategy>,
    ) -> Result<Applied> {
        let mut record = self.resolver.to_record(user, info, local, remote)?;

        if let Some(strategy) = strategy {
            match self.resolver.auto_resolve(&record, strategy, local, remote) {
                Ok((resolved, resolution, details)) => {
                    record.resolve(resolution, Some(details))?;
                    self.conflicts.insert(record).await?;
                    self.events.update(resolved).await?;
                    debug!(event = %local.local_id, ?resolution, "auto-resolved conflict");
                    return Ok(Applied::Conflicted);
                }
                Err(Error::ManualResolutionRequired(_)) => {
                    // Falls through to a pending record for human review.
                }
                Err(err) => return Err(err),
            }
        }

        info!(event = %local.local_id, "conflict detected, left pending");
        self.conflicts.insert(record).await?;
        Ok(Applied::Conflicted)
    }

    /// Run the push phase: locally modified events written to the remote.
    ///
    /// Partial-failure tolerant: one failed write is recorded against that
    /// event and the batch continues.
    pub async fn push_once(
        &self,
        user: &UserId,
        options: &SyncOptions,
        handle: &JobHandle,
    ) -> Result<PhaseReport> {
        let calendar = &options.calendar_id;
        let pending = self.events.find_locally_modified(user, calendar).await?;

        let mut report = PhaseReport {
            succeeded: true,
            total: pending.len() as u64,
            ..PhaseReport::default()
        };

        debug!(user = %user, pending = pending.len(), "starting push");

        for mut event in pending {
            if handle.is_cancelled() {
                info!(user = %user, "push cancelled between events");
                report.succeeded = false;
                break;
            }

            match self.push_event(user, calendar, &mut event).await {
                Ok(()) => report.synced += 1,
                Err(err) => {
                    warn!(event = %event.local_id, "push failed: {}", err);
                    report.failed += 1;
                    report.errors.push(format!("{}: {}", event.local_id, err));
                }
            }
            handle
                .record_progress(report.synced + report.failed, report.total)
                .await;
        }

        Ok(report)
    }

    /// Push one event: create it remotely if it has no identity yet,
    /// otherwise update the existing remote event.
    async fn push_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        event: &mut CalendarEvent,
    ) -> Result<()> {
        let draft = draft_from_event(event);
        let call_timeout = self.config.call_timeout;

        let remote = match event.remote_id.clone() {
            Some(remote_id) => {
                self.retry
                    .execute(|| {
                        let draft = draft.clone();
                        let remote_id = remote_id.clone();
                        async move {
                            timeout(
                                call_timeout,
                                self.gateway.update_event(user, calendar, &remote_id, &draft),
                            )
                            .await
                            .map_err(|_| Error::Timeout("update remote event".to_string()))?
                        }
                    })
                    .await?
            }
            None => {
                self.retry
                    .execute(|| {
                        let draft = draft.clone();
                        async move {
                            timeout(
                                call_timeout,
                                self.gateway.create_event(user, calendar, &draft),
                            )
                            .await
                            .map_err(|_| Error::Timeout("create remote event".to_string()))?
                        }
                    })
                    .await?
            }
        };

        event.mark_synced(remote.id, remote.version_tag);
        // Take the provider's write stamp so the next pull sees both sides
        // at the same instant.
        event.last_modified = remote.last_modified;
        self.events.update(event.clone()).await?;
        Ok(())
    }
}

/// Build a local event from a pulled remote event.
fn local_event_from_remote(
    user: &UserId,
    calendar: &CalendarId,
    remote: &RemoteEvent,
) -> CalendarEvent {
    CalendarEvent {
        local_id: Uuid::new_v4().to_string(),
        user_id: user.clone(),
        calendar_id: calendar.clone(),
        remote_id: Some(remote.id.clone()),
        subject: remote.subject.clone(),
        description: remote.description.clone(),
        location: remote.location.clone(),
        start: remote.start,
        end: remote.end,
        time_zone: remote.time_zone.clone(),
        is_all_day: remote.is_all_day,
        recurrence: remote.recurrence.clone(),
        last_modified: remote.last_modified,
        locally_modified: false,
        remote_version_tag: remote.version_tag.clone(),
    }
}

/// Content draft for pushing a local event.
fn draft_from_event(event: &CalendarEvent) -> EventDraft {
    EventDraft {
        subject: event.subject.clone(),
        description: event.description.clone(),
        location: event.location.clone(),
        start: event.start,
        end: event.end,
        time_zone: event.time_zone.clone(),
        is_all_day: event.is_all_day,
        recurrence: event.recurrence.clone(),
    }
}
