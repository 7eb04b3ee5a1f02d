//! In-memory repository implementations for testing and development.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use calsync_common::{CalendarId, Error, Result, UserId};

use crate::conflict::SyncConflict;
use crate::event::CalendarEvent;
use crate::repository::{ConflictRecordStore, LocalEventRepository, SyncStateStore};
use crate::state::SyncState;

/// In-memory event repository.
///
/// All data is stored in memory and lost on drop.
#[derive(Default)]
pub struct MemoryEventRepository {
    events: Arc<RwLock<HashMap<String, CalendarEvent>>>,
}

impl MemoryEventRepository {
    /// Create a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored events, for test assertions.
    pub fn len(&self) -> usize {
        self.events.read().unwrap().len()
    }

    /// Whether the repository is empty.
    pub fn is_empty(&self) -> bool {
        self.events.read().unwrap().is_empty()
    }
}

#[async_trait]
impl LocalEventRepository for MemoryEventRepository {
    async fn get(&self, local_id: &str) -> Result<Option<CalendarEvent>> {
        Ok(self.events.read().unwrap().get(local_id).cloned())
    }

    async fn insert(&self, event: CalendarEvent) -> Result<()> {
        let mut events = self.events.write().unwrap();
        if events.contains_key(&event.local_id) {
            return Err(Error::AlreadyExists(format!(
                "event {} already exists",
                event.local_id
            )));
        }
        events.insert(event.local_id.clone(), event);
        Ok(())
    }

    async fn update(&self, event: CalendarEvent) -> Result<()> {
        let mut events = self.events.write().unwrap();
        if !events.contains_key(&event.local_id) {
            return Err(Error::NotFound(format!("no event {}", event.local_id)));
        }
        events.insert(event.local_id.clone(), event);
        Ok(())
    }

    async fn delete(&self, local_id: &str) -> Result<()> {
        self.events.write().unwrap().remove(local_id);
        Ok(())
    }

    async fn find_by_remote_id(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        remote_id: &str,
    ) -> Result<Option<CalendarEvent>> {
        Ok(self
            .events
            .read()
            .unwrap()
            .values()
            .find(|e| {
                e.user_id == *user
                    && e.calendar_id == *calendar
                    && e.remote_id.as_deref() == Some(remote_id)
            })
            .cloned())
    }

    async fn find_locally_modified(
        &self,
        user: &UserId,
        calendar: &CalendarId,
    ) -> Result<Vec<CalendarEvent>> {
        let mut pending: Vec<CalendarEvent> = self
            .events
            .read()
            .unwrap()
            .values()
            .filter(|e| e.user_id == *user && e.calendar_id == *calendar && e.locally_modified)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));
        Ok(pending)
    }

    async fn list(&self, user: &UserId, calendar: &CalendarId) -> Result<Vec<CalendarEvent>> {
        let mut all: Vec<CalendarEvent> = self
            .events
            .read()
            .unwrap()
            .values()
            .filter(|e| e.user_id == *user && e.calendar_id == *calendar)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.start.cmp(&b.start));
        Ok(all)
    }
}

/// In-memory sync state store with run history.
#[derive(Default)]
pub struct MemorySyncStateStore {
    inner: Arc<RwLock<StateInner>>,
}

#[derive(Default)]
struct StateInner {
    current: HashMap<(String, String), SyncState>,
    history: HashMap<String, Vec<SyncState>>,
}

impl MemorySyncStateStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(user: &UserId, calendar: &CalendarId) -> (String, String) {
        (user.as_str().to_string(), calendar.as_str().to_string())
    }
}

#[async_trait]
impl SyncStateStore for MemorySyncStateStore {
    async fn load(&self, user: &UserId, calendar: &CalendarId) -> Result<Option<SyncState>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .current
            .get(&Self::key(user, calendar))
            .cloned())
    }

    async fn save(&self, state: SyncState) -> Result<()> {
        let key = Self::key(&state.user_id, &state.calendar_id);
        self.inner.write().unwrap().current.insert(key, state);
        Ok(())
    }

    async fn append_history(&self, state: SyncState) -> Result<()> {
        let user = state.user_id.as_str().to_string();
        self.inner
            .write()
            .unwrap()
            .history
            .entry(user)
            .or_default()
            .push(state);
        Ok(())
    }

    async fn history(
        &self,
        user: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<SyncState>> {
        let inner = self.inner.read().unwrap();
        let Some(snapshots) = inner.history.get(user.as_str()) else {
            return Ok(Vec::new());
        };
        // Newest first.
        Ok(snapshots
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn reset(&self, user: &UserId, calendar: &CalendarId) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let Some(state) = inner.current.get_mut(&Self::key(user, calendar)) {
            state.clear_token();
        }
        Ok(())
    }
}

/// In-memory conflict record store.
#[derive(Default)]
pub struct MemoryConflictStore {
    conflicts: Arc<RwLock<HashMap<String, SyncConflict>>>,
}

impl MemoryConflictStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, for test assertions.
    pub fn len(&self) -> usize {
        self.conflicts.read().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.conflicts.read().unwrap().is_empty()
    }
}

#[async_trait]
impl ConflictRecordStore for MemoryConflictStore {
    async fn insert(&self, conflict: SyncConflict) -> Result<()> {
        let mut conflicts = self.conflicts.write().unwrap();
        if conflicts.contains_key(&conflict.id) {
            return Err(Error::AlreadyExists(format!(
                "conflict {} already exists",
                conflict.id
            )));
        }
        conflicts.insert(conflict.id.clone(), conflict);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<SyncConflict>> {
        Ok(self.conflicts.read().unwrap().get(id).cloned())
    }

    async fn update(&self, conflict: SyncConflict) -> Result<()> {
        let mut conflicts = self.conflicts.write().unwrap();
        if !conflicts.contains_key(&conflict.id) {
            return Err(Error::NotFound(format!("no conflict {}", conflict.id)));
        }
        conflicts.insert(conflict.id.clone(), conflict);
        Ok(())
    }

    async fn list_pending(&self, user: &UserId) -> Result<Vec<SyncConflict>> {
        let mut pending: Vec<SyncConflict> = self
            .conflicts
            .read()
            .unwrap()
            .values()
            .filter(|c| c.user_id == *user && c.is_pending())
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(pending)
    }

    async fn list_since(
        &self,
        user: &UserId,
        since: DateTime<Utc>,
    ) -> Result<Vec<SyncConflict>> {
        let mut matching: Vec<SyncConflict> = self
            .conflicts
            .read()
            .unwrap()
            .values()
            .filter(|c| c.user_id == *user && c.detected_at >= since)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.detected_at.cmp(&b.detected_at));
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictDetail, FieldConflict, Resolution};
    use chrono::Duration;

    fn ids() -> (UserId, CalendarId) {
        (
            UserId::new("u1").unwrap(),
            CalendarId::new("primary").unwrap(),
        )
    }

    fn sample_event(subject: &str) -> CalendarEvent {
        let (user, cal) = ids();
        let now = Utc::now();
        CalendarEvent::new_local(user, cal, subject, now, now + Duration::hours(1))
    }

    #[tokio::test]
    async fn test_event_insert_and_get() {
        let repo = MemoryEventRepository::new();
        let event = sample_event("Standup");
        let id = event.local_id.clone();

        repo.insert(event).await.unwrap();
        let loaded = repo.get(&id).await.unwrap().unwrap();
        assert_eq!(loaded.subject, "Standup");

        // Duplicate insert is rejected.
        let dup = loaded.clone();
        assert!(matches!(
            repo.insert(dup).await.unwrap_err(),
            Error::AlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn test_event_delete_is_idempotent() {
        let repo = MemoryEventRepository::new();
        let event = sample_event("Standup");
        let id = event.local_id.clone();
        repo.insert(event).await.unwrap();

        repo.delete(&id).await.unwrap();
        repo.delete(&id).await.unwrap();
        assert!(repo.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_remote_id() {
        let repo = MemoryEventRepository::new();
        let (user, cal) = ids();

        let mut event = sample_event("Standup");
        event.mark_synced("remote-1", Some("tag".to_string()));
        repo.insert(event).await.unwrap();
        repo.insert(sample_event("Other")).await.unwrap();

        let found = repo
            .find_by_remote_id(&user, &cal, "remote-1")
            .await
            .unwrap();
        assert_eq!(found.unwrap().subject, "Standup");

        let missing = repo.find_by_remote_id(&user, &cal, "remote-2").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_find_locally_modified_filters_synced() {
        let repo = MemoryEventRepository::new();
        let (user, cal) = ids();

        let mut synced = sample_event("Synced");
        synced.mark_synced("remote-1", Some("tag".to_string()));
        repo.insert(synced).await.unwrap();
        repo.insert(sample_event("Pending")).await.unwrap();

        let pending = repo.find_locally_modified(&user, &cal).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].subject, "Pending");
    }

    #[tokio::test]
    async fn test_state_history_pages_newest_first() {
        let store = MemorySyncStateStore::new();
        let (user, cal) = ids();

        for i in 0..5 {
            let mut state = SyncState::new(user.clone(), cal.clone());
            state.record_completed(Some(format!("token-{i}")), i, i, 0, 0, false);
            store.append_history(state).await.unwrap();
        }

        let page = store.history(&user, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].continuation_token.as_deref(), Some("token-4"));
        assert_eq!(page[1].continuation_token.as_deref(), Some("token-3"));

        let next = store.history(&user, 2, 2).await.unwrap();
        assert_eq!(next[0].continuation_token.as_deref(), Some("token-2"));
    }

    #[tokio::test]
    async fn test_state_reset_clears_token_only() {
        let store = MemorySyncStateStore::new();
        let (user, cal) = ids();

        let mut state = SyncState::new(user.clone(), cal.clone());
        state.record_completed(Some("token-1".to_string()), 3, 3, 0, 0, true);
        store.save(state).await.unwrap();

        store.reset(&user, &cal).await.unwrap();
        let loaded = store.load(&user, &cal).await.unwrap().unwrap();
        assert!(loaded.continuation_token.is_none());
        assert!(loaded.last_sync_time.is_some());

        // Resetting a missing pair is a no-op.
        let other = CalendarId::new("other").unwrap();
        store.reset(&user, &other).await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_store_pending_filter() {
        let store = MemoryConflictStore::new();
        let (user, _) = ids();
        let now = Utc::now();

        let detail = ConflictDetail {
            field: FieldConflict::Subject {
                local: "A".to_string(),
                remote: "B".to_string(),
            },
            local_modified: now,
            remote_modified: now,
        };

        let pending = SyncConflict::new(
            user.clone(),
            "event-1",
            vec![detail.clone()],
            serde_json::json!({}),
            serde_json::json!({}),
            now,
            now,
        );
        let mut resolved = SyncConflict::new(
            user.clone(),
            "event-2",
            vec![detail],
            serde_json::json!({}),
            serde_json::json!({}),
            now,
            now,
        );
        resolved.resolve(Resolution::PreferRemote, None).unwrap();

        store.insert(pending.clone()).await.unwrap();
        store.insert(resolved).await.unwrap();

        let listed = store.list_pending(&user).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, pending.id);

        let all = store.list_since(&user, now - Duration::days(1)).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
