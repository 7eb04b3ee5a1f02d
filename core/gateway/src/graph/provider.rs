//! `CalendarGateway` implementation over the Graph wire client.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;

use calsync_common::{CalendarId, Result, UserId};

use crate::credentials::CredentialProvider;
use crate::gateway::{CalendarGateway, CalendarInfo, DeltaPage, EventDraft, RemoteEvent};
use crate::graph::client::{GraphClient, WireEvent};

/// Graph-backed calendar gateway.
pub struct GraphGateway {
    client: GraphClient,
}

impl GraphGateway {
    /// Create a gateway over the given credential source.
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        Self {
            client: GraphClient::new(credentials),
        }
    }

    /// Create a gateway over an existing client (for test servers).
    pub fn with_client(client: GraphClient) -> Self {
        Self { client }
    }

    fn to_remote_event(wire: WireEvent) -> Result<RemoteEvent> {
        let removed = wire.removed.is_some();
        let epoch = DateTime::<Utc>::MIN_UTC;

        let start = match &wire.start {
            Some(dt) => dt.to_utc()?,
            None => epoch,
        };
        let end = match &wire.end {
            Some(dt) => dt.to_utc()?,
            None => epoch,
        };
        let time_zone = wire
            .start
            .as_ref()
            .and_then(|dt| dt.time_zone.clone())
            .unwrap_or_else(|| "UTC".to_string());

        let last_modified = wire
            .last_modified_date_time
            .or(wire.created_date_time)
            .unwrap_or_else(Utc::now);

        Ok(RemoteEvent {
            id: wire.id,
            subject: wire.subject.unwrap_or_default(),
            description: wire.body.and_then(|b| b.content),
            location: wire.location.and_then(|l| l.display_name),
            start,
            end,
            time_zone,
            is_all_day: wire.is_all_day.unwrap_or(false),
            recurrence: wire.recurrence,
            created: wire.created_date_time,
            last_modified,
            removed,
            version_tag: wire.change_key,
        })
    }

    fn to_payload(draft: &EventDraft) -> serde_json::Value {
        let mut payload = json!({
            "subject": draft.subject,
            "start": {
                "dateTime": draft.start.naive_utc().format("%Y-%m-%dT%H:%M:%S%.7f").to_string(),
                "timeZone": draft.time_zone,
            },
            "end": {
                "dateTime": draft.end.naive_utc().format("%Y-%m-%dT%H:%M:%S%.7f").to_string(),
                "timeZone": draft.time_zone,
            },
            "isAllDay": draft.is_all_day,
        });

        if let Some(description) = &draft.description {
            payload["body"] = json!({"contentType": "text", "content": description});
        }
        if let Some(location) = &draft.location {
            payload["location"] = json!({"displayName": location});
        }
        if let Some(recurrence) = &draft.recurrence {
            payload["recurrence"] = recurrence.clone();
        }
        payload
    }
}

#[async_trait]
impl CalendarGateway for GraphGateway {
    fn name(&self) -> &str {
        "graph"
    }

    async fn fetch_delta_page(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<DeltaPage> {
        let wire = self
            .client
            .fetch_delta_page(user, calendar, token, page_size)
            .await?;

        let mut events = Vec::with_capacity(wire.value.len());
        for event in wire.value {
            events.push(Self::to_remote_event(event)?);
        }

        Ok(DeltaPage {
            events,
            next_page_token: wire.next_link,
            delta_token: wire.delta_link,
        })
    }

    async fn create_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        draft: &EventDraft,
    ) -> Result<RemoteEvent> {
        let payload = Self::to_payload(draft);
        let wire = self.client.create_event(user, calendar, &payload).await?;
        Self::to_remote_event(wire)
    }

    async fn update_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        remote_id: &str,
        draft: &EventDraft,
    ) -> Result<RemoteEvent> {
        let payload = Self::to_payload(draft);
        let wire = self
            .client
            .update_event(user, calendar, remote_id, &payload)
            .await?;
        Self::to_remote_event(wire)
    }

    async fn delete_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        remote_id: &str,
    ) -> Result<()> {
        self.client.delete_event(user, calendar, remote_id).await
    }

    async fn list_events(
        &self,
        user: &UserId,
        calendar: &CalendarId,
    ) -> Result<Vec<RemoteEvent>> {
        let wire = self.client.list_events(user, calendar).await?;
        let mut events = Vec::with_capacity(wire.len());
        for event in wire {
            events.push(Self::to_remote_event(event)?);
        }
        Ok(events)
    }

    async fn list_calendars(&self, user: &UserId) -> Result<Vec<CalendarInfo>> {
        let calendars = self.client.list_calendars(user).await?;
        Ok(calendars
            .into_iter()
            .map(|c| CalendarInfo {
                id: c.id,
                name: c.name,
                is_default: c.is_default_calendar.unwrap_or(false),
            })
            .collect())
    }
}
