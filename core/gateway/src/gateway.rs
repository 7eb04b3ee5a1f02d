//! Calendar gateway trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use calsync_common::{CalendarId, Result, UserId};

/// Advisory classification of a remote change.
///
/// The orchestrator still reconciles by identity; this tag is a hint, not a
/// promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// An event as reported by the remote provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEvent {
    /// Provider-side identity.
    pub id: String,
    pub subject: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub time_zone: String,
    pub is_all_day: bool,
    /// Opaque recurrence rule, provider-shaped.
    pub recurrence: Option<serde_json::Value>,
    /// Creation instant as reported by the provider, when available.
    pub created: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
    /// Deletion marker: the provider removed this event. Tombstones carry
    /// identity but no meaningful content fields.
    pub removed: bool,
    /// Opaque provider change-stamp.
    pub version_tag: Option<String>,
}

impl RemoteEvent {
    /// Build a deletion marker for an event id.
    pub fn tombstone(id: impl Into<String>) -> Self {
        let epoch = DateTime::<Utc>::MIN_UTC;
        Self {
            id: id.into(),
            subject: String::new(),
            description: None,
            location: None,
            start: epoch,
            end: epoch,
            time_zone: "UTC".to_string(),
            is_all_day: false,
            recurrence: None,
            created: None,
            last_modified: Utc::now(),
            removed: true,
            version_tag: None,
        }
    }

    /// Classify this change: removed events are deletions; events whose
    /// reported creation instant equals their last modification are
    /// creations; everything else is an update.
    pub fn change_kind(&self) -> ChangeKind {
        if self.removed {
            ChangeKind::Deleted
        } else if self.created == Some(self.last_modified) {
            ChangeKind::Created
        } else {
            ChangeKind::Updated
        }
    }
}

/// Content fields for creating or updating a remote event.
///
/// The provider assigns identity and version tags; drafts never carry them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    pub subject: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub time_zone: String,
    pub is_all_day: bool,
    pub recurrence: Option<serde_json::Value>,
}

/// One page of a delta enumeration.
///
/// A well-formed page carries exactly one of `next_page_token` (more pages
/// follow) or `delta_token` (final page; the cursor for the next run).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaPage {
    pub events: Vec<RemoteEvent>,
    pub next_page_token: Option<String>,
    pub delta_token: Option<String>,
}

/// A calendar as listed by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarInfo {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}

/// Remote calendar provider trait.
///
/// Implementations must map token expiry to `Error::TokenInvalid` and
/// throttling to `Error::RateLimited`; the engine distinguishes failure
/// kinds by variant.
#[async_trait]
pub trait CalendarGateway: Send + Sync {
    /// Get the provider name (e.g. "graph", "memory").
    fn name(&self) -> &str;

    /// Fetch one page of the delta enumeration.
    ///
    /// # Preconditions
    /// - `token` is `None` to start a fresh enumeration, or a token
    ///   previously returned in `next_page_token` or `delta_token`
    ///
    /// # Postconditions
    /// - Returns the page's events in provider order
    ///
    /// # Errors
    /// - `TokenInvalid` if the provider rejected the token as expired
    /// - `NotAuthenticated` if no usable credential exists for the user
    /// - Transport errors
    async fn fetch_delta_page(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<DeltaPage>;

    /// Create an event remotely, returning its assigned identity.
    async fn create_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        draft: &EventDraft,
    ) -> Result<RemoteEvent>;

    /// Update an existing remote event, returning its new version.
    ///
    /// # Errors
    /// - `NotFound` if the remote event no longer exists
    async fn update_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        remote_id: &str,
        draft: &EventDraft,
    ) -> Result<RemoteEvent>;

    /// Delete a remote event.
    async fn delete_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        remote_id: &str,
    ) -> Result<()>;

    /// List all live events on a calendar, following provider pagination.
    async fn list_events(
        &self,
        user: &UserId,
        calendar: &CalendarId,
    ) -> Result<Vec<RemoteEvent>>;

    /// List the user's calendars.
    async fn list_calendars(&self, user: &UserId) -> Result<Vec<CalendarInfo>>;
}
