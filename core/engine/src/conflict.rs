//! Conflict detection and resolution.
//!
//! A conflict exists only when both sides changed after the last successful
//! sync and at least one compared field actually differs. A no-op edit on
//! both sides (re-save with identical content) is not a conflict.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use calsync_common::{Error, Result, UserId};
use calsync_gateway::RemoteEvent;
use calsync_store::{CalendarEvent, ConflictDetail, FieldConflict, Resolution, SyncConflict};

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Local version wins outright.
    PreferLocal,
    /// Remote version wins outright.
    PreferRemote,
    /// The side with the later modification instant wins in full.
    PreferLatest,
    /// Field-by-field: each conflicting field from its later side.
    Merge,
    /// Route to human review.
    Manual,
}

/// A detected conflict, before it becomes a durable record.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictInfo {
    /// Conflicting fields in comparison order.
    pub details: Vec<ConflictDetail>,
    pub local_modified: DateTime<Utc>,
    pub remote_modified: DateTime<Utc>,
}

/// Options for the deduplication equivalence check.
#[derive(Debug, Clone)]
pub struct EquivalenceOptions {
    /// Maximum start/end drift for two events to still count as the same.
    pub tolerance: Duration,
    /// Also require exact description and location matches.
    pub compare_content: bool,
}

impl Default for EquivalenceOptions {
    fn default() -> Self {
        Self {
            tolerance: Duration::seconds(60),
            compare_content: false,
        }
    }
}

/// Build an event carrying the remote side's content on the local identity.
///
/// The provider identity and version tag come along, so the result satisfies
/// the at-rest remote-identity invariant.
pub(crate) fn event_with_remote_content(
    local: &CalendarEvent,
    remote: &RemoteEvent,
) -> CalendarEvent {
    let mut event = local.clone();
    event.subject = remote.subject.clone();
    event.description = remote.description.clone();
    event.location = remote.location.clone();
    event.start = remote.start;
    event.end = remote.end;
    event.time_zone = remote.time_zone.clone();
    event.is_all_day = remote.is_all_day;
    event.recurrence = remote.recurrence.clone();
    event.last_modified = remote.last_modified;
    event.locally_modified = false;
    event.remote_id = Some(remote.id.clone());
    event.remote_version_tag = remote.version_tag.clone();
    event
}

fn apply_field_from_remote(event: &mut CalendarEvent, field: &FieldConflict, remote: &RemoteEvent) {
    match field {
        FieldConflict::Subject { .. } => event.subject = remote.subject.clone(),
        FieldConflict::Description { .. } => event.description = remote.description.clone(),
        FieldConflict::StartTime { .. } => event.start = remote.start,
        FieldConflict::EndTime { .. } => event.end = remote.end,
        FieldConflict::Location { .. } => event.location = remote.location.clone(),
        FieldConflict::AllDay { .. } => event.is_all_day = remote.is_all_day,
        FieldConflict::Recurrence { .. } => event.recurrence = remote.recurrence.clone(),
    }
}

/// Conflict detector and resolver. Pure decision logic, no I/O.
#[derive(Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    /// Create a new resolver.
    pub fn new() -> Self {
        Self
    }

    /// Detect a conflict between the local and remote version of an event.
    ///
    /// Returns `None` unless both sides were modified after `last_sync_time`
    /// and at least one compared field differs. An absent `last_sync_time`
    /// (first-ever sync) treats both sides as modified and compares the
    /// pair field by field.
    pub fn detect_conflict(
        &self,
        local: &CalendarEvent,
        remote: &RemoteEvent,
        last_sync_time: Option<DateTime<Utc>>,
    ) -> Option<ConflictInfo> {
        let local_changed = last_sync_time.is_none_or(|t| local.last_modified > t);
        let remote_changed = last_sync_time.is_none_or(|t| remote.last_modified > t);

        // If only one side changed, that side simply wins: no conflict.
        if !(local_changed && remote_changed) {
            return None;
        }

        let mut fields = Vec::new();

        if local.subject != remote.subject {
            fields.push(FieldConflict::Subject {
                local: local.subject.clone(),
                remote: remote.subject.clone(),
            });
        }
        if local.description != remote.description {
            fields.push(FieldConflict::Description {
                local: local.description.clone(),
                remote: remote.description.clone(),
            });
        }
        if local.start != remote.start {
            fields.push(FieldConflict::StartTime {
                local: local.start,
                remote: remote.start,
            });
        }
        if local.end != remote.end {
            fields.push(FieldConflict::EndTime {
                local: local.end,
                remote: remote.end,
            });
        }
        if local.location != remote.location {
            fields.push(FieldConflict::Location {
                local: local.location.clone(),
                remote: remote.location.clone(),
            });
        }
        if local.is_all_day != remote.is_all_day {
            fields.push(FieldConflict::AllDay {
                local: local.is_all_day,
                remote: remote.is_all_day,
            });
        }
        // Recurrence rules are opaque payloads; only presence is compared.
        if local.recurrence.is_some() != remote.recurrence.is_some() {
            fields.push(FieldConflict::Recurrence {
                local: local.recurrence.is_some(),
                remote: remote.recurrence.is_some(),
            });
        }

        if fields.is_empty() {
            return None;
        }

        Some(ConflictInfo {
            details: fields
                .into_iter()
                .map(|field| ConflictDetail {
                    field,
                    local_modified: local.last_modified,
                    remote_modified: remote.last_modified,
                })
                .collect(),
            local_modified: local.last_modified,
            remote_modified: remote.last_modified,
        })
    }

    /// Turn a detected conflict into a durable record with event snapshots.
    pub fn to_record(
        &self,
        user: &UserId,
        info: ConflictInfo,
        local: &CalendarEvent,
        remote: &RemoteEvent,
    ) -> Result<SyncConflict> {
        Ok(SyncConflict::new(
            user.clone(),
            local.local_id.clone(),
            info.details,
            serde_json::to_value(local)?,
            serde_json::to_value(remote)?,
            info.local_modified,
            info.remote_modified,
        ))
    }

    /// Suggest a resolution strategy for a set of conflicting fields.
    pub fn suggest_resolution(&self, details: &[ConflictDetail]) -> ResolutionStrategy {
        if !details.is_empty() && details.iter().all(|d| d.field.is_time_field()) {
            return ResolutionStrategy::Merge;
        }
        if details.iter().any(|d| d.field.is_content_field()) {
            return ResolutionStrategy::PreferLatest;
        }

        let mut types = Vec::new();
        for detail in details {
            let ty = detail.field.conflict_type();
            if !types.contains(&ty) {
                types.push(ty);
            }
        }
        if types.len() > 2 {
            return ResolutionStrategy::Manual;
        }

        ResolutionStrategy::PreferLatest
    }

    /// Resolve a conflict deterministically under the given strategy.
    ///
    /// Returns the resolved event content, the resolution kind to persist,
    /// and a human-readable summary.
    ///
    /// # Errors
    /// - `ManualResolutionRequired` for the `Manual` strategy; the caller
    ///   must route to human review instead
    pub fn auto_resolve(
        &self,
        conflict: &SyncConflict,
        strategy: ResolutionStrategy,
        local: &CalendarEvent,
        remote: &RemoteEvent,
    ) -> Result<(CalendarEvent, Resolution, String)> {
        match strategy {
            ResolutionStrategy::PreferLocal => Ok((
                local.clone(),
                Resolution::PreferLocal,
                "kept local version".to_string(),
            )),
            ResolutionStrategy::PreferRemote => Ok((
                event_with_remote_content(local, remote),
                Resolution::PreferRemote,
                "kept remote version".to_string(),
            )),
            ResolutionStrategy::PreferLatest => {
                if conflict.local_modified >= conflict.remote_modified {
                    Ok((
                        local.clone(),
                        Resolution::PreferLocal,
                        format!(
                            "latest wins: local ({} >= {})",
                            conflict.local_modified, conflict.remote_modified
                        ),
                    ))
                } else {
                    Ok((
                        event_with_remote_content(local, remote),
                        Resolution::PreferRemote,
                        format!(
                            "latest wins: remote ({} > {})",
                            conflict.remote_modified, conflict.local_modified
                        ),
                    ))
                }
            }
            ResolutionStrategy::Merge => {
                // Local is the base; each conflicting field comes from the
                // side with the later attribution instant.
                let mut resolved = local.clone();
                let mut taken = Vec::new();
                for detail in &conflict.details {
                    if detail.local_wins() {
                        taken.push(format!("{:?}: local", detail.field.conflict_type()));
                    } else {
                        apply_field_from_remote(&mut resolved, &detail.field, remote);
                        taken.push(format!("{:?}: remote", detail.field.conflict_type()));
                    }
                }
                resolved.last_modified = Utc::now();
                resolved.locally_modified = true;
                Ok((
                    resolved,
                    Resolution::Merged,
                    format!("merged fields ({})", taken.join(", ")),
                ))
            }
            ResolutionStrategy::Manual => Err(Error::ManualResolutionRequired(format!(
                "conflict {} needs human review",
                conflict.id
            ))),
        }
    }

    /// Whether two events are the same logical event for deduplication.
    pub fn are_equivalent(
        &self,
        local: &CalendarEvent,
        remote: &RemoteEvent,
        options: &EquivalenceOptions,
    ) -> bool {
        if local.subject != remote.subject {
            return false;
        }
        if local.is_all_day != remote.is_all_day {
            return false;
        }
        if (local.start - remote.start).abs() > options.tolerance {
            return false;
        }
        if (local.end - remote.end).abs() > options.tolerance {
            return false;
        }
        if options.compare_content
            && (local.description != remote.description || local.location != remote.location)
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calsync_common::CalendarId;
    use calsync_store::ConflictType;
    use proptest::prelude::*;

    fn base_times() -> (DateTime<Utc>, DateTime<Utc>, DateTime<Utc>) {
        let last_sync = Utc::now() - Duration::hours(1);
        let start = Utc::now() + Duration::hours(2);
        let end = start + Duration::hours(1);
        (last_sync, start, end)
    }

    fn local_event(
        subject: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> CalendarEvent {
        let mut event = CalendarEvent::new_local(
            UserId::new("u1").unwrap(),
            CalendarId::new("primary").unwrap(),
            subject,
            start,
            end,
        );
        event.mark_synced("remote-1", Some("tag-1".to_string()));
        event.last_modified = modified;
        event
    }

    fn remote_event(
        subject: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        modified: DateTime<Utc>,
    ) -> RemoteEvent {
        RemoteEvent {
            id: "remote-1".to_string(),
            subject: subject.to_string(),
            description: None,
            location: None,
            start,
            end,
            time_zone: "UTC".to_string(),
            is_all_day: false,
            recurrence: None,
            created: None,
            last_modified: modified,
            removed: false,
            version_tag: Some("tag-2".to_string()),
        }
    }

    #[test]
    fn test_single_side_change_is_not_a_conflict() {
        let resolver = ConflictResolver::new();
        let (last_sync, start, end) = base_times();

        // Only local changed after last_sync; fields differ wildly.
        let local = local_event("Local title", start, end, last_sync + Duration::minutes(10));
        let remote = remote_event(
            "Remote title",
            start + Duration::hours(3),
            end + Duration::hours(3),
            last_sync - Duration::minutes(10),
        );
        assert!(resolver
            .detect_conflict(&local, &remote, Some(last_sync))
            .is_none());

        // Only remote changed.
        let local = local_event("Local title", start, end, last_sync - Duration::minutes(10));
        let remote = remote_event(
            "Remote title",
            start,
            end,
            last_sync + Duration::minutes(10),
        );
        assert!(resolver
            .detect_conflict(&local, &remote, Some(last_sync))
            .is_none());
    }

    #[test]
    fn test_dual_modification_with_identical_content_is_not_a_conflict() {
        let resolver = ConflictResolver::new();
        let (last_sync, start, end) = base_times();

        let local = local_event("Same", start, end, last_sync + Duration::minutes(5));
        let remote = remote_event("Same", start, end, last_sync + Duration::minutes(7));

        assert!(resolver
            .detect_conflict(&local, &remote, Some(last_sync))
            .is_none());
    }

    #[test]
    fn test_dual_modification_title_conflict_suggests_prefer_latest() {
        let resolver = ConflictResolver::new();
        let (last_sync, start, end) = base_times();

        let local = local_event("A", start, end, last_sync + Duration::minutes(10));
        let remote = remote_event("B", start, end, last_sync + Duration::minutes(5));

        let info = resolver
            .detect_conflict(&local, &remote, Some(last_sync))
            .unwrap();
        assert_eq!(info.details.len(), 1);
        assert_eq!(
            info.details[0].field.conflict_type(),
            ConflictType::Subject
        );
        assert_eq!(
            resolver.suggest_resolution(&info.details),
            ResolutionStrategy::PreferLatest
        );
    }

    #[test]
    fn test_absent_last_sync_compares_every_pair() {
        let resolver = ConflictResolver::new();
        let (_, start, end) = base_times();

        let local = local_event("A", start, end, Utc::now() - Duration::days(30));
        let remote = remote_event("B", start, end, Utc::now() - Duration::days(40));

        let info = resolver.detect_conflict(&local, &remote, None).unwrap();
        assert_eq!(info.details.len(), 1);
    }

    #[test]
    fn test_time_only_conflict_suggests_merge() {
        let resolver = ConflictResolver::new();
        let (last_sync, start, end) = base_times();

        let local = local_event(
            "Same",
            start + Duration::minutes(30),
            end + Duration::minutes(30),
            last_sync + Duration::minutes(10),
        );
        let remote = remote_event("Same", start, end, last_sync + Duration::minutes(5));

        let info = resolver
            .detect_conflict(&local, &remote, Some(last_sync))
            .unwrap();
        assert_eq!(info.details.len(), 2);
        assert_eq!(
            resolver.suggest_resolution(&info.details),
            ResolutionStrategy::Merge
        );
    }

    #[test]
    fn test_three_non_content_types_suggest_manual() {
        let resolver = ConflictResolver::new();
        let (last_sync, start, end) = base_times();

        let mut local = local_event(
            "Same",
            start + Duration::minutes(30),
            end + Duration::minutes(30),
            last_sync + Duration::minutes(10),
        );
        local.location = Some("Room A".to_string());
        let mut remote = remote_event("Same", start, end, last_sync + Duration::minutes(5));
        remote.location = Some("Room B".to_string());

        let info = resolver
            .detect_conflict(&local, &remote, Some(last_sync))
            .unwrap();
        // Start, end and location conflict: three types, none content.
        assert_eq!(
            resolver.suggest_resolution(&info.details),
            ResolutionStrategy::Manual
        );
    }

    #[test]
    fn test_merge_takes_each_field_from_its_later_side() {
        let resolver = ConflictResolver::new();
        let (_, start, end) = base_times();
        let t0 = Utc::now() - Duration::minutes(30);

        let local = local_event("A", start + Duration::hours(1), end, t0 + Duration::minutes(10));
        let remote = remote_event("B", start, end, t0 + Duration::minutes(5));

        // Local changed start (attributed later), remote changed the title
        // (attributed later): merge keeps local's start and remote's title.
        let details = vec![
            ConflictDetail {
                field: FieldConflict::StartTime {
                    local: local.start,
                    remote: remote.start,
                },
                local_modified: t0 + Duration::minutes(10),
                remote_modified: t0 + Duration::minutes(5),
            },
            ConflictDetail {
                field: FieldConflict::Subject {
                    local: "A".to_string(),
                    remote: "B".to_string(),
                },
                local_modified: t0 + Duration::minutes(2),
                remote_modified: t0 + Duration::minutes(5),
            },
        ];
        let conflict = SyncConflict::new(
            UserId::new("u1").unwrap(),
            local.local_id.clone(),
            details,
            serde_json::to_value(&local).unwrap(),
            serde_json::to_value(&remote).unwrap(),
            t0 + Duration::minutes(10),
            t0 + Duration::minutes(5),
        );

        let before = Utc::now();
        let (resolved, resolution, details) = resolver
            .auto_resolve(&conflict, ResolutionStrategy::Merge, &local, &remote)
            .unwrap();

        assert_eq!(resolution, Resolution::Merged);
        assert_eq!(resolved.start, local.start);
        assert_eq!(resolved.subject, "B");
        assert_eq!(resolved.end, local.end);
        assert!(resolved.last_modified >= before);
        assert!(resolved.locally_modified);
        assert!(details.contains("StartTime: local"));
        assert!(details.contains("Subject: remote"));
    }

    #[test]
    fn test_prefer_latest_takes_whole_event() {
        let resolver = ConflictResolver::new();
        let (last_sync, start, end) = base_times();

        let local = local_event("A", start, end, last_sync + Duration::minutes(10));
        let mut remote = remote_event("B", start, end, last_sync + Duration::minutes(5));
        remote.location = Some("Room B".to_string());

        let info = resolver
            .detect_conflict(&local, &remote, Some(last_sync))
            .unwrap();
        let conflict = resolver
            .to_record(&local.user_id, info, &local, &remote)
            .unwrap();

        // Local is later: local wins in full, including the location field.
        let (resolved, resolution, _) = resolver
            .auto_resolve(&conflict, ResolutionStrategy::PreferLatest, &local, &remote)
            .unwrap();
        assert_eq!(resolution, Resolution::PreferLocal);
        assert_eq!(resolved.subject, "A");
        assert_eq!(resolved.location, None);
    }

    #[test]
    fn test_prefer_remote_carries_version_tag() {
        let resolver = ConflictResolver::new();
        let (last_sync, start, end) = base_times();

        let local = local_event("A", start, end, last_sync + Duration::minutes(10));
        let remote = remote_event("B", start, end, last_sync + Duration::minutes(5));

        let info = resolver
            .detect_conflict(&local, &remote, Some(last_sync))
            .unwrap();
        let conflict = resolver
            .to_record(&local.user_id, info, &local, &remote)
            .unwrap();

        let (resolved, resolution, _) = resolver
            .auto_resolve(&conflict, ResolutionStrategy::PreferRemote, &local, &remote)
            .unwrap();
        assert_eq!(resolution, Resolution::PreferRemote);
        assert_eq!(resolved.subject, "B");
        assert_eq!(resolved.remote_version_tag.as_deref(), Some("tag-2"));
        assert!(!resolved.locally_modified);
    }

    #[test]
    fn test_manual_strategy_raises() {
        let resolver = ConflictResolver::new();
        let (last_sync, start, end) = base_times();

        let local = local_event("A", start, end, last_sync + Duration::minutes(10));
        let remote = remote_event("B", start, end, last_sync + Duration::minutes(5));

        let info = resolver
            .detect_conflict(&local, &remote, Some(last_sync))
            .unwrap();
        let conflict = resolver
            .to_record(&local.user_id, info, &local, &remote)
            .unwrap();

        let err = resolver
            .auto_resolve(&conflict, ResolutionStrategy::Manual, &local, &remote)
            .unwrap_err();
        assert!(matches!(err, Error::ManualResolutionRequired(_)));
    }

    #[test]
    fn test_are_equivalent_respects_tolerance() {
        let resolver = ConflictResolver::new();
        let (_, start, end) = base_times();
        let now = Utc::now();

        let local = local_event("Standup", start, end, now);
        let close = remote_event(
            "Standup",
            start + Duration::seconds(30),
            end + Duration::seconds(30),
            now,
        );
        let far = remote_event(
            "Standup",
            start + Duration::seconds(90),
            end + Duration::seconds(90),
            now,
        );

        let options = EquivalenceOptions::default();
        assert!(resolver.are_equivalent(&local, &close, &options));
        assert!(!resolver.are_equivalent(&local, &far, &options));
    }

    #[test]
    fn test_are_equivalent_optionally_compares_content() {
        let resolver = ConflictResolver::new();
        let (_, start, end) = base_times();
        let now = Utc::now();

        let mut local = local_event("Standup", start, end, now);
        local.description = Some("notes".to_string());
        let mut remote = remote_event("Standup", start, end, now);
        remote.description = Some("different notes".to_string());

        assert!(resolver.are_equivalent(&local, &remote, &EquivalenceOptions::default()));
        assert!(!resolver.are_equivalent(
            &local,
            &remote,
            &EquivalenceOptions {
                compare_content: true,
                ..EquivalenceOptions::default()
            }
        ));
    }

    proptest! {
        /// Conflict symmetry: whenever only one side's timestamp is after
        /// last_sync, detection returns none no matter how the fields differ.
        #[test]
        fn prop_stale_side_never_conflicts(
            local_subject in "[a-z]{1,8}",
            remote_subject in "[a-z]{1,8}",
            start_skew_minutes in 0i64..600,
            local_is_fresh in proptest::bool::ANY,
        ) {
            let resolver = ConflictResolver::new();
            let last_sync = Utc::now() - Duration::hours(1);
            let start = Utc::now() + Duration::hours(2);
            let end = start + Duration::hours(1);

            let fresh = last_sync + Duration::minutes(10);
            let stale = last_sync - Duration::minutes(10);
            let (local_modified, remote_modified) = if local_is_fresh {
                (fresh, stale)
            } else {
                (stale, fresh)
            };

            let local = local_event(&local_subject, start, end, local_modified);
            let remote = remote_event(
                &remote_subject,
                start + Duration::minutes(start_skew_minutes),
                end + Duration::minutes(start_skew_minutes),
                remote_modified,
            );

            prop_assert!(resolver
                .detect_conflict(&local, &remote, Some(last_sync))
                .is_none());
        }
    }
}
