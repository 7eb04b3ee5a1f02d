//! Transport-agnostic operation surface.
//!
//! `SyncService` is what an API binding (REST or otherwise) calls into. It
//! validates inputs before any work starts, then delegates to the
//! orchestrator and the conflict store. Conflict-resolution failures are
//! surfaced distinctly from sync-transport failures so clients can route
//! them to different treatments (retry vs. "needs your decision").

use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use calsync_common::{CalendarId, Error, Result, UserId};
use calsync_gateway::{CalendarGateway, RemoteEvent};
use calsync_store::{
    CalendarEvent, ConflictRecordStore, LocalEventRepository, Resolution, SyncConflict, SyncState,
};

use crate::conflict::{event_with_remote_content, ConflictResolver};
use crate::job::SyncJob;
use crate::orchestrator::{SyncOptions, SyncOrchestrator, SyncStatusView};

/// Conflict counts over a time window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConflictStats {
    pub total: u64,
    pub pending: u64,
    pub resolved: u64,
    /// Resolved records broken down by resolution kind.
    pub by_resolution: BTreeMap<Resolution, u64>,
}

/// Public operation surface of the sync engine.
pub struct SyncService<G: CalendarGateway + ?Sized + 'static> {
    orchestrator: Arc<SyncOrchestrator<G>>,
    events: Arc<dyn LocalEventRepository>,
    conflicts: Arc<dyn ConflictRecordStore>,
    resolver: Arc<ConflictResolver>,
}

impl<G: CalendarGateway + ?Sized + 'static> SyncService<G> {
    /// Create the service over an orchestrator.
    pub fn new(orchestrator: Arc<SyncOrchestrator<G>>) -> Self {
        let events = orchestrator.events();
        let conflicts = orchestrator.conflicts();
        let resolver = orchestrator.resolver();
        Self {
            orchestrator,
            events,
            conflicts,
            resolver,
        }
    }

    /// Start a sync job. Returns the job snapshot immediately.
    pub async fn start_sync(&self, user: &UserId, options: SyncOptions) -> Result<SyncJob> {
        self.orchestrator.start_sync(user, options).await
    }

    /// Status of a job by id.
    pub async fn job_status(&self, job_id: &str) -> Result<SyncJob> {
        self.orchestrator
            .job(job_id)
            .await
            .ok_or_else(|| Error::NotFound(format!("no job {job_id}")))
    }

    /// Combined job and persisted-state view for a user.
    pub async fn sync_status(
        &self,
        user: &UserId,
        calendar: &CalendarId,
    ) -> Result<SyncStatusView> {
        self.orchestrator.get_sync_status(user, calendar).await
    }

    /// Past sync state snapshots, newest first.
    pub async fn sync_history(
        &self,
        user: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SyncState>> {
        if limit == 0 {
            return Err(Error::Validation("history limit must be positive".to_string()));
        }
        self.orchestrator.history(user, limit, offset).await
    }

    /// Request cooperative cancellation of a job.
    pub async fn cancel_sync(&self, job_id: &str) -> Result<()> {
        self.orchestrator.cancel(job_id).await
    }

    /// Clear the continuation token, forcing the next run to full-sync.
    pub async fn reset_sync_state(&self, user: &UserId, calendar: &CalendarId) -> Result<()> {
        self.orchestrator.reset_state(user, calendar).await
    }

    /// All pending conflicts for a user, oldest first.
    pub async fn pending_conflicts(&self, user: &UserId) -> Result<Vec<SyncConflict>> {
        self.conflicts.list_pending(user).await
    }

    /// Resolve a conflict with an explicit decision.
    ///
    /// Applies the decision to the local event: `PreferRemote` installs the
    /// remote snapshot, `PreferLocal` re-flags the local version for push,
    /// `Merged` installs the supplied payload and flags it for push.
    ///
    /// # Errors
    /// - `Validation` if `resolution` is `Pending`, or `Merged` without a
    ///   payload
    /// - `NotFound` if the record does not exist
    /// - `AlreadyExists` if the record was already resolved (resolution is
    ///   final; a fresh conflict spawns a new record)
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        resolution: Resolution,
        resolved_data: Option<serde_json::Value>,
    ) -> Result<SyncConflict> {
        if resolution == Resolution::Pending {
            return Err(Error::Validation(
                "cannot resolve a conflict to pending".to_string(),
            ));
        }

        let mut record = self.load_pending(conflict_id).await?;

        match self.events.get(&record.event_id).await? {
            None => {
                // The event disappeared since detection (e.g. a remote
                // deletion was applied). Finalize the record anyway.
                record.resolve(resolution, Some("event no longer present".to_string()))?;
            }
            Some(local) => match resolution {
                Resolution::PreferLocal => {
                    let mut event = local;
                    event.mark_locally_modified();
                    self.events.update(event).await?;
                    record.resolve(
                        Resolution::PreferLocal,
                        Some("kept local version, queued for push".to_string()),
                    )?;
                }
                Resolution::PreferRemote => {
                    let remote: RemoteEvent =
                        serde_json::from_value(record.remote_version.clone())?;
                    let event = event_with_remote_content(&local, &remote);
                    self.events.update(event).await?;
                    record.resolve(
                        Resolution::PreferRemote,
                        Some("applied remote version".to_string()),
                    )?;
                }
                Resolution::Merged => {
                    let data = resolved_data.ok_or_else(|| {
                        Error::Validation(
                            "merged resolution requires the merged event payload".to_string(),
                        )
                    })?;
                    let mut merged: CalendarEvent = serde_json::from_value(data)?;
                    // The payload decides content; identity stays ours.
                    merged.local_id = local.local_id.clone();
                    merged.user_id = local.user_id.clone();
                    merged.calendar_id = local.calendar_id.clone();
                    merged.remote_id = local.remote_id.clone();
                    merged.remote_version_tag = local.remote_version_tag.clone();
                    merged.locally_modified = true;
                    merged.last_modified = Utc::now();
                    self.events.update(merged).await?;
                    record.resolve(
                        Resolution::Merged,
                        Some("applied merged payload, queued for push".to_string()),
                    )?;
                }
                Resolution::Pending => unreachable!("rejected above"),
            },
        }

        self.conflicts.update(record.clone()).await?;
        info!(conflict = %record.id, resolution = ?record.resolution, "conflict resolved");
        Ok(record)
    }

    /// Resolve a conflict using the suggested strategy.
    ///
    /// # Errors
    /// - `ManualResolutionRequired` if the suggestion is manual review; the
    ///   conflict stays pending
    pub async fn auto_resolve_conflict(&self, conflict_id: &str) -> Result<SyncConflict> {
        let mut record = self.load_pending(conflict_id).await?;

        let strategy = self.resolver.suggest_resolution(&record.details);
        let local = self
            .events
            .get(&record.event_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no local event {}", record.event_id)))?;
        let remote: RemoteEvent = serde_json::from_value(record.remote_version.clone())?;

        let (resolved, resolution, details) =
            self.resolver.auto_resolve(&record, strategy, &local, &remote)?;

        self.events.update(resolved).await?;
        record.resolve(resolution, Some(details))?;
        self.conflicts.update(record.clone()).await?;
        info!(conflict = %record.id, resolution = ?record.resolution, "conflict auto-resolved");
        Ok(record)
    }

    /// Conflict counts over the last `days` days.
    pub async fn conflict_statistics(&self, user: &UserId, days: u32) -> Result<ConflictStats> {
        if days == 0 {
            return Err(Error::Validation(
                "statistics window must cover at least one day".to_string(),
            ));
        }

        let since = Utc::now() - Duration::days(i64::from(days));
        let records = self.conflicts.list_since(user, since).await?;

        let mut stats = ConflictStats {
            total: records.len() as u64,
            ..ConflictStats::default()
        };
        for record in records {
            if record.is_pending() {
                stats.pending += 1;
            } else {
                stats.resolved += 1;
                *stats.by_resolution.entry(record.resolution).or_insert(0) += 1;
            }
        }
        Ok(stats)
    }

    async fn load_pending(&self, conflict_id: &str) -> Result<SyncConflict> {
        let record = self
            .conflicts
            .get(conflict_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no conflict {conflict_id}")))?;
        if !record.is_pending() {
            return Err(Error::AlreadyExists(format!(
                "conflict {conflict_id} is already resolved"
            )));
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_gateway::{MemoryGateway, StaticCredentials};
    use calsync_store::{
        ConflictDetail, FieldConflict, MemoryConflictStore, MemoryEventRepository,
        MemorySyncStateStore,
    };
    use chrono::{DateTime, Duration as ChronoDuration};

    use crate::orchestrator::SyncConfig;

    struct Harness {
        events: Arc<MemoryEventRepository>,
        conflicts: Arc<MemoryConflictStore>,
        service: SyncService<MemoryGateway>,
        user: UserId,
        calendar: CalendarId,
    }

    fn harness() -> Harness {
        let gateway = Arc::new(MemoryGateway::new());
        let credentials = Arc::new(StaticCredentials::new());
        let events = Arc::new(MemoryEventRepository::new());
        let states = Arc::new(MemorySyncStateStore::new());
        let conflicts = Arc::new(MemoryConflictStore::new());

        let user = UserId::new("u1").unwrap();
        let calendar = CalendarId::new("primary").unwrap();
        credentials.insert(&user, "token");

        let orchestrator = Arc::new(SyncOrchestrator::new(
            gateway,
            credentials,
            Arc::clone(&events) as Arc<dyn LocalEventRepository>,
            states,
            Arc::clone(&conflicts) as Arc<dyn ConflictRecordStore>,
            SyncConfig::default(),
        ));

        Harness {
            events,
            conflicts,
            service: SyncService::new(orchestrator),
            user,
            calendar,
        }
    }

    fn synced_local_event(h: &Harness, subject: &str) -> CalendarEvent {
        let now = Utc::now();
        let mut event = CalendarEvent::new_local(
            h.user.clone(),
            h.calendar.clone(),
            subject,
            now + ChronoDuration::hours(2),
            now + ChronoDuration::hours(3),
        );
        event.mark_synced("remote-1", Some("tag-1".to_string()));
        event
    }

    fn remote_version(local: &CalendarEvent, subject: &str) -> RemoteEvent {
        RemoteEvent {
            id: "remote-1".to_string(),
            subject: subject.to_string(),
            description: None,
            location: None,
            start: local.start,
            end: local.end,
            time_zone: "UTC".to_string(),
            is_all_day: false,
            recurrence: None,
            created: None,
            last_modified: Utc::now(),
            removed: false,
            version_tag: Some("tag-2".to_string()),
        }
    }

    fn subject_conflict(
        h: &Harness,
        local: &CalendarEvent,
        remote: &RemoteEvent,
        local_modified: DateTime<Utc>,
        remote_modified: DateTime<Utc>,
    ) -> SyncConflict {
        SyncConflict::new(
            h.user.clone(),
            local.local_id.clone(),
            vec![ConflictDetail {
                field: FieldConflict::Subject {
                    local: local.subject.clone(),
                    remote: remote.subject.clone(),
                },
                local_modified,
                remote_modified,
            }],
            serde_json::to_value(local).unwrap(),
            serde_json::to_value(remote).unwrap(),
            local_modified,
            remote_modified,
        )
    }

    #[tokio::test]
    async fn test_resolve_prefer_remote_applies_snapshot() {
        let h = harness();
        let local = synced_local_event(&h, "Local title");
        let remote = remote_version(&local, "Remote title");
        h.events.insert(local.clone()).await.unwrap();

        let now = Utc::now();
        let conflict = subject_conflict(&h, &local, &remote, now, now);
        h.conflicts.insert(conflict.clone()).await.unwrap();

        let resolved = h
            .service
            .resolve_conflict(&conflict.id, Resolution::PreferRemote, None)
            .await
            .unwrap();

        assert_eq!(resolved.resolution, Resolution::PreferRemote);
        assert!(resolved.resolved_at.is_some());

        let stored = h.events.get(&local.local_id).await.unwrap().unwrap();
        assert_eq!(stored.subject, "Remote title");
        assert!(!stored.locally_modified);
        assert_eq!(stored.remote_version_tag.as_deref(), Some("tag-2"));
    }

    #[tokio::test]
    async fn test_resolve_prefer_local_requeues_push() {
        let h = harness();
        let local = synced_local_event(&h, "Local title");
        let remote = remote_version(&local, "Remote title");
        h.events.insert(local.clone()).await.unwrap();

        let now = Utc::now();
        let conflict = subject_conflict(&h, &local, &remote, now, now);
        h.conflicts.insert(conflict.clone()).await.unwrap();

        h.service
            .resolve_conflict(&conflict.id, Resolution::PreferLocal, None)
            .await
            .unwrap();

        let stored = h.events.get(&local.local_id).await.unwrap().unwrap();
        assert_eq!(stored.subject, "Local title");
        assert!(stored.locally_modified);
    }

    #[tokio::test]
    async fn test_resolve_merged_requires_and_applies_payload() {
        let h = harness();
        let local = synced_local_event(&h, "Local title");
        let remote = remote_version(&local, "Remote title");
        h.events.insert(local.clone()).await.unwrap();

        let now = Utc::now();
        let conflict = subject_conflict(&h, &local, &remote, now, now);
        h.conflicts.insert(conflict.clone()).await.unwrap();

        let err = h
            .service
            .resolve_conflict(&conflict.id, Resolution::Merged, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let mut merged = local.clone();
        merged.subject = "Merged title".to_string();
        let resolved = h
            .service
            .resolve_conflict(
                &conflict.id,
                Resolution::Merged,
                Some(serde_json::to_value(&merged).unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(resolved.resolution, Resolution::Merged);

        let stored = h.events.get(&local.local_id).await.unwrap().unwrap();
        assert_eq!(stored.subject, "Merged title");
        assert!(stored.locally_modified);
        // Identity is pinned regardless of the payload.
        assert_eq!(stored.local_id, local.local_id);
        assert_eq!(stored.remote_id, local.remote_id);
    }

    #[tokio::test]
    async fn test_resolution_is_final_through_the_service() {
        let h = harness();
        let local = synced_local_event(&h, "Local title");
        let remote = remote_version(&local, "Remote title");
        h.events.insert(local.clone()).await.unwrap();

        let now = Utc::now();
        let conflict = subject_conflict(&h, &local, &remote, now, now);
        h.conflicts.insert(conflict.clone()).await.unwrap();

        h.service
            .resolve_conflict(&conflict.id, Resolution::PreferLocal, None)
            .await
            .unwrap();

        let err = h
            .service
            .resolve_conflict(&conflict.id, Resolution::PreferRemote, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));

        let err = h
            .service
            .resolve_conflict(&conflict.id, Resolution::Pending, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_auto_resolve_follows_suggestion() {
        let h = harness();
        let local = synced_local_event(&h, "Local title");
        let remote = remote_version(&local, "Remote title");
        h.events.insert(local.clone()).await.unwrap();

        // Title conflict suggests prefer-latest; local is the later side.
        let now = Utc::now();
        let conflict = subject_conflict(
            &h,
            &local,
            &remote,
            now,
            now - ChronoDuration::minutes(5),
        );
        h.conflicts.insert(conflict.clone()).await.unwrap();

        let resolved = h
            .service
            .auto_resolve_conflict(&conflict.id)
            .await
            .unwrap();
        assert_eq!(resolved.resolution, Resolution::PreferLocal);

        let stored = h.events.get(&local.local_id).await.unwrap().unwrap();
        assert_eq!(stored.subject, "Local title");
    }

    #[tokio::test]
    async fn test_auto_resolve_rejects_manual_suggestions() {
        let h = harness();
        let local = synced_local_event(&h, "Same");
        let mut remote = remote_version(&local, "Same");
        remote.start = local.start + ChronoDuration::minutes(30);
        remote.end = local.end + ChronoDuration::minutes(30);
        remote.location = Some("Elsewhere".to_string());
        h.events.insert(local.clone()).await.unwrap();

        // Start, end and location: three non-content types, suggestion is
        // manual review.
        let now = Utc::now();
        let conflict = SyncConflict::new(
            h.user.clone(),
            local.local_id.clone(),
            vec![
                ConflictDetail {
                    field: FieldConflict::StartTime {
                        local: local.start,
                        remote: remote.start,
                    },
                    local_modified: now,
                    remote_modified: now,
                },
                ConflictDetail {
                    field: FieldConflict::EndTime {
                        local: local.end,
                        remote: remote.end,
                    },
                    local_modified: now,
                    remote_modified: now,
                },
                ConflictDetail {
                    field: FieldConflict::Location {
                        local: None,
                        remote: remote.location.clone(),
                    },
                    local_modified: now,
                    remote_modified: now,
                },
            ],
            serde_json::to_value(&local).unwrap(),
            serde_json::to_value(&remote).unwrap(),
            now,
            now,
        );
        h.conflicts.insert(conflict.clone()).await.unwrap();

        let err = h
            .service
            .auto_resolve_conflict(&conflict.id)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ManualResolutionRequired(_)));

        // The conflict stays pending for human review.
        let pending = h.service.pending_conflicts(&h.user).await.unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_statistics_breakdown() {
        let h = harness();
        let local = synced_local_event(&h, "Local");
        let remote = remote_version(&local, "Remote");
        h.events.insert(local.clone()).await.unwrap();

        let now = Utc::now();
        let pending = subject_conflict(&h, &local, &remote, now, now);
        let mut resolved_local = subject_conflict(&h, &local, &remote, now, now);
        resolved_local
            .resolve(Resolution::PreferLocal, None)
            .unwrap();
        let mut resolved_merged = subject_conflict(&h, &local, &remote, now, now);
        resolved_merged.resolve(Resolution::Merged, None).unwrap();

        h.conflicts.insert(pending).await.unwrap();
        h.conflicts.insert(resolved_local).await.unwrap();
        h.conflicts.insert(resolved_merged).await.unwrap();

        let stats = h.service.conflict_statistics(&h.user, 7).await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.resolved, 2);
        assert_eq!(stats.by_resolution.get(&Resolution::PreferLocal), Some(&1));
        assert_eq!(stats.by_resolution.get(&Resolution::Merged), Some(&1));

        assert!(matches!(
            h.service.conflict_statistics(&h.user, 0).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_lookups_are_not_found() {
        let h = harness();

        assert!(matches!(
            h.service.job_status("missing").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            h.service
                .resolve_conflict("missing", Resolution::PreferLocal, None)
                .await
                .unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(matches!(
            h.service.sync_history(&h.user, 0, 0).await.unwrap_err(),
            Error::Validation(_)
        ));
    }
}
