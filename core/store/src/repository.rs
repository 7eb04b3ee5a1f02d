//! Repository trait definitions.
//!
//! The engine treats persistence as abstract keyed storage. Implementations
//! must provide single-row atomicity; the engine never requires multi-row
//! transactions, partial application is an accepted and recoverable state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use calsync_common::{CalendarId, Result, UserId};

use crate::conflict::SyncConflict;
use crate::event::CalendarEvent;
use crate::state::SyncState;

/// CRUD and query access to locally stored events.
#[async_trait]
pub trait LocalEventRepository: Send + Sync {
    /// Get an event by local id.
    async fn get(&self, local_id: &str) -> Result<Option<CalendarEvent>>;

    /// Insert a new event.
    ///
    /// # Errors
    /// - `AlreadyExists` if the local id is taken
    async fn insert(&self, event: CalendarEvent) -> Result<()>;

    /// Replace an existing event.
    ///
    /// # Errors
    /// - `NotFound` if no event with that local id exists
    async fn update(&self, event: CalendarEvent) -> Result<()>;

    /// Delete an event. Deleting an absent event is not an error; deletion
    /// markers from the remote side must be idempotent to apply.
    async fn delete(&self, local_id: &str) -> Result<()>;

    /// Look up an event by its provider identity.
    async fn find_by_remote_id(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        remote_id: &str,
    ) -> Result<Option<CalendarEvent>>;

    /// All events with pending local changes, for the push phase.
    async fn find_locally_modified(
        &self,
        user: &UserId,
        calendar: &CalendarId,
    ) -> Result<Vec<CalendarEvent>>;

    /// All events for a (user, calendar) pair.
    async fn list(&self, user: &UserId, calendar: &CalendarId) -> Result<Vec<CalendarEvent>>;
}

/// Keyed persistence for sync state and its history.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Load the current state for a (user, calendar) pair.
    async fn load(&self, user: &UserId, calendar: &CalendarId) -> Result<Option<SyncState>>;

    /// Persist the current state, replacing any previous value.
    async fn save(&self, state: SyncState) -> Result<()>;

    /// Append a snapshot to the run history, newest first on read.
    async fn append_history(&self, state: SyncState) -> Result<()>;

    /// Page through past snapshots for a user.
    async fn history(&self, user: &UserId, limit: usize, offset: usize)
        -> Result<Vec<SyncState>>;

    /// Clear the continuation token, forcing the next run to full-sync.
    /// A missing state row is not an error.
    async fn reset(&self, user: &UserId, calendar: &CalendarId) -> Result<()>;
}

/// Durable log of detected conflicts.
#[async_trait]
pub trait ConflictRecordStore: Send + Sync {
    /// Insert a new conflict record.
    ///
    /// # Errors
    /// - `AlreadyExists` if the id is taken
    async fn insert(&self, conflict: SyncConflict) -> Result<()>;

    /// Get a record by id.
    async fn get(&self, id: &str) -> Result<Option<SyncConflict>>;

    /// Replace an existing record.
    ///
    /// # Errors
    /// - `NotFound` if no record with that id exists
    async fn update(&self, conflict: SyncConflict) -> Result<()>;

    /// All pending conflicts for a user, oldest first.
    async fn list_pending(&self, user: &UserId) -> Result<Vec<SyncConflict>>;

    /// All conflicts detected at or after `since`, for statistics.
    async fn list_since(&self, user: &UserId, since: DateTime<Utc>) -> Result<Vec<SyncConflict>>;
}
