//! Per-calendar sync state tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use calsync_common::{CalendarId, UserId};

/// Outcome of the most recent sync run for a (user, calendar) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncRunStatus {
    /// No sync has run yet.
    Never,
    /// A sync run is in progress.
    Running,
    /// The last run completed.
    Completed,
    /// The last run failed.
    Failed,
}

/// Persisted sync state, one value per (user, calendar).
///
/// The continuation token is only advanced after a batch has been fully
/// applied; a partially-applied batch must never advance it, so a crash
/// mid-batch re-delivers that batch on the next run (at-least-once).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub user_id: UserId,
    pub calendar_id: CalendarId,
    /// Opaque provider cursor; `None` forces the next run to full-sync.
    pub continuation_token: Option<String>,
    /// Completion instant of the last successful run.
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Completion instant of the last successful full (non-incremental) run.
    pub last_full_sync_time: Option<DateTime<Utc>>,
    /// Remote changes seen in the last run.
    pub total_events: u64,
    /// Changes applied in the last run.
    pub synced_events: u64,
    /// Conflicts detected in the last run.
    pub conflicted_events: u64,
    /// Per-event failures in the last run.
    pub failed_events: u64,
    pub last_status: SyncRunStatus,
    pub last_error: Option<String>,
}

impl SyncState {
    /// Create a fresh state with no sync history.
    pub fn new(user_id: UserId, calendar_id: CalendarId) -> Self {
        Self {
            user_id,
            calendar_id,
            continuation_token: None,
            last_sync_time: None,
            last_full_sync_time: None,
            total_events: 0,
            synced_events: 0,
            conflicted_events: 0,
            failed_events: 0,
            last_status: SyncRunStatus::Never,
            last_error: None,
        }
    }

    /// Mark a run as started.
    pub fn mark_running(&mut self) {
        self.last_status = SyncRunStatus::Running;
        self.last_error = None;
    }

    /// Record a completed run.
    ///
    /// This is the only place the continuation token advances.
    pub fn record_completed(
        &mut self,
        continuation_token: Option<String>,
        total: u64,
        synced: u64,
        conflicted: u64,
        failed: u64,
        was_full_sync: bool,
    ) {
        let now = Utc::now();
        if let Some(token) = continuation_token {
            self.continuation_token = Some(token);
        }
        self.last_sync_time = Some(now);
        if was_full_sync {
            self.last_full_sync_time = Some(now);
        }
        self.total_events = total;
        self.synced_events = synced;
        self.conflicted_events = conflicted;
        self.failed_events = failed;
        self.last_status = SyncRunStatus::Completed;
        self.last_error = None;
    }

    /// Record a failed run. Counters keep whatever progress was made.
    pub fn record_failed(&mut self, error: impl Into<String>) {
        self.last_status = SyncRunStatus::Failed;
        self.last_error = Some(error.into());
    }

    /// Drop the continuation token, forcing the next run to full-sync.
    pub fn clear_token(&mut self) {
        self.continuation_token = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SyncState {
        SyncState::new(
            UserId::new("u1").unwrap(),
            CalendarId::new("primary").unwrap(),
        )
    }

    #[test]
    fn test_fresh_state_has_no_token() {
        let state = state();
        assert!(state.continuation_token.is_none());
        assert_eq!(state.last_status, SyncRunStatus::Never);
    }

    #[test]
    fn test_record_completed_advances_token() {
        let mut state = state();
        state.record_completed(Some("token-1".to_string()), 5, 4, 1, 0, true);

        assert_eq!(state.continuation_token.as_deref(), Some("token-1"));
        assert_eq!(state.last_status, SyncRunStatus::Completed);
        assert_eq!(state.total_events, 5);
        assert_eq!(state.synced_events, 4);
        assert_eq!(state.conflicted_events, 1);
        assert!(state.last_sync_time.is_some());
        assert!(state.last_full_sync_time.is_some());
    }

    #[test]
    fn test_record_completed_keeps_token_when_none_returned() {
        let mut state = state();
        state.record_completed(Some("token-1".to_string()), 1, 1, 0, 0, true);
        state.record_completed(None, 0, 0, 0, 0, false);
        assert_eq!(state.continuation_token.as_deref(), Some("token-1"));
    }

    #[test]
    fn test_record_failed_keeps_token() {
        let mut state = state();
        state.record_completed(Some("token-1".to_string()), 1, 1, 0, 0, true);
        state.record_failed("remote unreachable");

        assert_eq!(state.last_status, SyncRunStatus::Failed);
        assert_eq!(state.last_error.as_deref(), Some("remote unreachable"));
        assert_eq!(state.continuation_token.as_deref(), Some("token-1"));
    }

    #[test]
    fn test_clear_token() {
        let mut state = state();
        state.record_completed(Some("token-1".to_string()), 1, 1, 0, 0, true);
        state.clear_token();
        assert!(state.continuation_token.is_none());
    }
}
