//! Locally stored calendar event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use calsync_common::{CalendarId, UserId};

/// A calendar event as held by the local store.
///
/// Remote identity is optional: an event created by direct user action has no
/// `remote_id` until its first push; an event created by a pull carries the
/// provider identity from birth. At rest, `remote_id` and `remote_version_tag`
/// are either both absent or both present (mid-creation-push is a transient
/// state).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    /// Local identity, stable for the lifetime of the row.
    pub local_id: String,
    /// Owner of the local store this event lives in.
    pub user_id: UserId,
    /// Calendar this event belongs to.
    pub calendar_id: CalendarId,
    /// Provider-side identity, absent until first pushed or pulled.
    pub remote_id: Option<String>,
    /// Event title.
    pub subject: String,
    /// Body text.
    pub description: Option<String>,
    /// Free-form location.
    pub location: Option<String>,
    /// Start instant.
    pub start: DateTime<Utc>,
    /// End instant.
    pub end: DateTime<Utc>,
    /// IANA timezone name the instants were authored in.
    pub time_zone: String,
    /// Whether this is an all-day event.
    pub is_all_day: bool,
    /// Opaque recurrence rule, provider-shaped.
    pub recurrence: Option<serde_json::Value>,
    /// Last modification instant, written by whichever side changed it last.
    pub last_modified: DateTime<Utc>,
    /// Local changes not yet pushed to the remote side.
    pub locally_modified: bool,
    /// Opaque provider change-stamp, used to detect remote mutation.
    pub remote_version_tag: Option<String>,
}

impl CalendarEvent {
    /// Create an event from direct user action.
    ///
    /// The event has no remote identity yet and is flagged for push.
    pub fn new_local(
        user_id: UserId,
        calendar_id: CalendarId,
        subject: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: Uuid::new_v4().to_string(),
            user_id,
            calendar_id,
            remote_id: None,
            subject: subject.into(),
            description: None,
            location: None,
            start,
            end,
            time_zone: "UTC".to_string(),
            is_all_day: false,
            recurrence: None,
            last_modified: Utc::now(),
            locally_modified: true,
            remote_version_tag: None,
        }
    }

    /// Whether the at-rest remote-identity invariant holds.
    pub fn has_remote_identity(&self) -> bool {
        self.remote_id.is_some() && self.remote_version_tag.is_some()
    }

    /// Record a local edit: bump the modification instant and flag for push.
    pub fn mark_locally_modified(&mut self) {
        self.last_modified = Utc::now();
        self.locally_modified = true;
    }

    /// Record a successful push: store the provider identity and clear the flag.
    pub fn mark_synced(&mut self, remote_id: impl Into<String>, version_tag: Option<String>) {
        self.remote_id = Some(remote_id.into());
        self.remote_version_tag = version_tag;
        self.locally_modified = false;
    }
}
