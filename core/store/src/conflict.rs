//! Durable conflict records and the conflict field taxonomy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use calsync_common::{Error, Result, UserId};

/// The fixed taxonomy of conflicting fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    Subject,
    Description,
    StartTime,
    EndTime,
    Location,
    AllDay,
    Recurrence,
}

/// One conflicting field with its typed local/remote value pair.
///
/// Recurrence conflicts compare presence only; the opaque rule payloads live
/// in the event snapshots on the parent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldConflict {
    Subject {
        local: String,
        remote: String,
    },
    Description {
        local: Option<String>,
        remote: Option<String>,
    },
    StartTime {
        local: DateTime<Utc>,
        remote: DateTime<Utc>,
    },
    EndTime {
        local: DateTime<Utc>,
        remote: DateTime<Utc>,
    },
    Location {
        local: Option<String>,
        remote: Option<String>,
    },
    AllDay {
        local: bool,
        remote: bool,
    },
    Recurrence {
        local: bool,
        remote: bool,
    },
}

impl FieldConflict {
    /// The taxonomy entry this field belongs to.
    pub fn conflict_type(&self) -> ConflictType {
        match self {
            FieldConflict::Subject { .. } => ConflictType::Subject,
            FieldConflict::Description { .. } => ConflictType::Description,
            FieldConflict::StartTime { .. } => ConflictType::StartTime,
            FieldConflict::EndTime { .. } => ConflictType::EndTime,
            FieldConflict::Location { .. } => ConflictType::Location,
            FieldConflict::AllDay { .. } => ConflictType::AllDay,
            FieldConflict::Recurrence { .. } => ConflictType::Recurrence,
        }
    }

    /// Whether this is a start/end time field.
    pub fn is_time_field(&self) -> bool {
        matches!(
            self,
            FieldConflict::StartTime { .. } | FieldConflict::EndTime { .. }
        )
    }

    /// Whether this is a content field (title or body text).
    pub fn is_content_field(&self) -> bool {
        matches!(
            self,
            FieldConflict::Subject { .. } | FieldConflict::Description { .. }
        )
    }
}

/// A conflicting field plus per-field modification attribution.
///
/// Detection populates both instants from the event-level timestamps; merge
/// resolution picks each field from the side with the later instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub field: FieldConflict,
    pub local_modified: DateTime<Utc>,
    pub remote_modified: DateTime<Utc>,
}

impl ConflictDetail {
    /// Whether the local side wins this field under merge resolution.
    pub fn local_wins(&self) -> bool {
        self.local_modified >= self.remote_modified
    }
}

/// How a conflict was (or is yet to be) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Pending,
    PreferLocal,
    PreferRemote,
    Merged,
}

/// Durable record of a detected conflict.
///
/// Created by the resolver, mutated only by resolution. Once `resolved_at`
/// is set the record is final; a fresh conflict on the same event spawns a
/// new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: String,
    pub user_id: UserId,
    /// Local event this conflict is about.
    pub event_id: String,
    /// Conflicting fields in detection order.
    pub details: Vec<ConflictDetail>,
    /// Serialized local event at detection time, for audit and manual review.
    pub local_version: serde_json::Value,
    /// Serialized remote event at detection time.
    pub remote_version: serde_json::Value,
    pub local_modified: DateTime<Utc>,
    pub remote_modified: DateTime<Utc>,
    pub resolution: Resolution,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_details: Option<String>,
    pub detected_at: DateTime<Utc>,
}

impl SyncConflict {
    /// Create a new pending conflict record.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        event_id: impl Into<String>,
        details: Vec<ConflictDetail>,
        local_version: serde_json::Value,
        remote_version: serde_json::Value,
        local_modified: DateTime<Utc>,
        remote_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            event_id: event_id.into(),
            details,
            local_version,
            remote_version,
            local_modified,
            remote_modified,
            resolution: Resolution::Pending,
            resolved_at: None,
            resolution_details: None,
            detected_at: Utc::now(),
        }
    }

    /// The ordered distinct conflict types on this record.
    pub fn conflict_types(&self) -> Vec<ConflictType> {
        let mut types = Vec::new();
        for detail in &self.details {
            let ty = detail.field.conflict_type();
            if !types.contains(&ty) {
                types.push(ty);
            }
        }
        types
    }

    /// Whether this conflict still awaits a decision.
    pub fn is_pending(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Finalize the record with a resolution.
    ///
    /// # Errors
    /// - `Validation` if `resolution` is `Pending`
    /// - `AlreadyExists` if the record was already resolved
    pub fn resolve(&mut self, resolution: Resolution, details: Option<String>) -> Result<()> {
        if resolution == Resolution::Pending {
            return Err(Error::Validation(
                "cannot resolve a conflict to pending".to_string(),
            ));
        }
        if !self.is_pending() {
            return Err(Error::AlreadyExists(format!(
                "conflict {} is already resolved",
                self.id
            )));
        }
        self.resolution = resolution;
        self.resolved_at = Some(Utc::now());
        self.resolution_details = details;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(details: Vec<ConflictDetail>) -> SyncConflict {
        let now = Utc::now();
        SyncConflict::new(
            UserId::new("u1").unwrap(),
            "event-1",
            details,
            serde_json::json!({}),
            serde_json::json!({}),
            now,
            now,
        )
    }

    fn subject_detail() -> ConflictDetail {
        let now = Utc::now();
        ConflictDetail {
            field: FieldConflict::Subject {
                local: "A".to_string(),
                remote: "B".to_string(),
            },
            local_modified: now,
            remote_modified: now,
        }
    }

    #[test]
    fn test_new_record_is_pending() {
        let conflict = record(vec![subject_detail()]);
        assert!(conflict.is_pending());
        assert_eq!(conflict.resolution, Resolution::Pending);
        assert!(conflict.resolved_at.is_none());
    }

    #[test]
    fn test_conflict_types_deduplicates_in_order() {
        let now = Utc::now();
        let conflict = record(vec![
            ConflictDetail {
                field: FieldConflict::StartTime {
                    local: now,
                    remote: now,
                },
                local_modified: now,
                remote_modified: now,
            },
            subject_detail(),
            ConflictDetail {
                field: FieldConflict::StartTime {
                    local: now,
                    remote: now,
                },
                local_modified: now,
                remote_modified: now,
            },
        ]);

        assert_eq!(
            conflict.conflict_types(),
            vec![ConflictType::StartTime, ConflictType::Subject]
        );
    }

    #[test]
    fn test_resolution_is_final() {
        let mut conflict = record(vec![subject_detail()]);
        conflict
            .resolve(Resolution::PreferLocal, Some("kept local".to_string()))
            .unwrap();

        assert!(!conflict.is_pending());
        let err = conflict.resolve(Resolution::PreferRemote, None).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        assert_eq!(conflict.resolution, Resolution::PreferLocal);
    }

    #[test]
    fn test_resolving_to_pending_is_rejected() {
        let mut conflict = record(vec![subject_detail()]);
        let err = conflict.resolve(Resolution::Pending, None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(conflict.is_pending());
    }

    #[test]
    fn test_detail_local_wins_tie_breaks_to_local() {
        let detail = subject_detail();
        assert!(detail.local_wins());
    }
}
