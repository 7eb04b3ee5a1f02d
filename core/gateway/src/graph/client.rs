//! Graph API wire client.

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{header, Client, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use calsync_common::{CalendarId, Error, Result, UserId};

use crate::credentials::CredentialProvider;

/// Graph API base URL.
const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Default calendar-view window around "now" for the initial delta request,
/// in days. Incremental requests follow server-issued links and ignore it.
const DEFAULT_WINDOW_DAYS: i64 = 365;

/// A date-time as the wire protocol reports it: a naive stamp plus a
/// timezone name. Requests pin the response timezone to UTC.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDateTime {
    pub date_time: String,
    #[serde(default)]
    pub time_zone: Option<String>,
}

impl WireDateTime {
    /// Parse into a UTC instant.
    pub fn to_utc(&self) -> Result<DateTime<Utc>> {
        let naive = NaiveDateTime::parse_from_str(&self.date_time, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|e| {
                Error::Serialization(format!("bad date-time '{}': {}", self.date_time, e))
            })?;
        Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
    }
}

/// Event body as reported on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBody {
    #[serde(default)]
    pub content: Option<String>,
}

/// Event location as reported on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLocation {
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Calendar event as reported on the wire.
///
/// Deletion markers carry only `id` and the `@removed` annotation, so every
/// content field tolerates absence.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<WireBody>,
    #[serde(default)]
    pub location: Option<WireLocation>,
    #[serde(default)]
    pub start: Option<WireDateTime>,
    #[serde(default)]
    pub end: Option<WireDateTime>,
    #[serde(default)]
    pub is_all_day: Option<bool>,
    #[serde(default)]
    pub recurrence: Option<serde_json::Value>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub change_key: Option<String>,
    #[serde(rename = "@removed", default)]
    pub removed: Option<serde_json::Value>,
}

/// One page of a delta response.
#[derive(Debug, Deserialize)]
pub struct WireDeltaPage {
    #[serde(default)]
    pub value: Vec<WireEvent>,
    #[serde(rename = "@odata.nextLink", default)]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink", default)]
    pub delta_link: Option<String>,
}

/// One page of a plain event listing.
#[derive(Debug, Deserialize)]
struct WireEventList {
    #[serde(default)]
    value: Vec<WireEvent>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
}

/// Calendar as reported on the wire.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCalendar {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_default_calendar: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct WireCalendarList {
    #[serde(default)]
    value: Vec<WireCalendar>,
}

/// Graph API client.
pub struct GraphClient {
    http: Client,
    credentials: Arc<dyn CredentialProvider>,
    base_url: String,
}

impl GraphClient {
    /// Create a new client.
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Self {
        let http = Client::builder()
            .user_agent("calsync/0.1")
            .build()
            .expect("Failed to create HTTP client");

        Self {
            http,
            credentials,
            base_url: GRAPH_API_BASE.to_string(),
        }
    }

    /// Point the client at a different base URL (for test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Get authorization header value.
    async fn auth_header(&self, user: &UserId) -> Result<String> {
        let token = self.credentials.access_credential(user).await?;
        Ok(format!("Bearer {}", token))
    }

    /// Fetch one delta page.
    ///
    /// `token` is `None` for the initial request, or a previously returned
    /// next/delta link. Links are absolute URLs and are followed verbatim.
    pub async fn fetch_delta_page(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<WireDeltaPage> {
        let auth = self.auth_header(user).await?;

        let request = match token {
            Some(link) if link.starts_with("http") => {
                // Tokens are server-issued absolute URLs; anything else is
                // a stale or corrupted cursor.
                let parsed = url::Url::parse(link)
                    .map_err(|e| Error::TokenInvalid(format!("malformed token URL: {e}")))?;
                self.http.get(parsed)
            }
            Some(other) => {
                return Err(Error::TokenInvalid(format!(
                    "unrecognized continuation token '{other}'"
                )));
            }
            None => {
                let now = Utc::now();
                let url = format!(
                    "{}/me/calendars/{}/calendarView/delta",
                    self.base_url,
                    calendar.as_str()
                );
                self.http.get(&url).query(&[
                    (
                        "startDateTime",
                        (now - chrono::Duration::days(DEFAULT_WINDOW_DAYS)).to_rfc3339(),
                    ),
                    (
                        "endDateTime",
                        (now + chrono::Duration::days(DEFAULT_WINDOW_DAYS)).to_rfc3339(),
                    ),
                ])
            }
        };

        let response = request
            .header(header::AUTHORIZATION, auth)
            .header("Prefer", format!("odata.maxpagesize={page_size}"))
            .header("Prefer", "outlook.timezone=\"UTC\"")
            .send()
            .await
            .map_err(|e| Error::Transport(format!("delta request failed: {}", e)))?;

        Self::handle_response(response).await
    }

    /// Create an event.
    pub async fn create_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        payload: &serde_json::Value,
    ) -> Result<WireEvent> {
        let auth = self.auth_header(user).await?;
        let url = format!(
            "{}/me/calendars/{}/events",
            self.base_url,
            calendar.as_str()
        );

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("create event failed: {}", e)))?;

        Self::handle_response(response).await
    }

    /// Update an event.
    pub async fn update_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        event_id: &str,
        payload: &serde_json::Value,
    ) -> Result<WireEvent> {
        let auth = self.auth_header(user).await?;
        let url = format!(
            "{}/me/calendars/{}/events/{}",
            self.base_url,
            calendar.as_str(),
            event_id
        );

        let response = self
            .http
            .patch(&url)
            .header(header::AUTHORIZATION, auth)
            .json(payload)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("update event failed: {}", e)))?;

        Self::handle_response(response).await
    }

    /// Delete an event.
    pub async fn delete_event(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        event_id: &str,
    ) -> Result<()> {
        let auth = self.auth_header(user).await?;
        let url = format!(
            "{}/me/calendars/{}/events/{}",
            self.base_url,
            calendar.as_str(),
            event_id
        );

        let response = self
            .http
            .delete(&url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("delete event failed: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::status_error(response).await)
        }
    }

    /// List all events on a calendar, following pagination.
    pub async fn list_events(
        &self,
        user: &UserId,
        calendar: &CalendarId,
    ) -> Result<Vec<WireEvent>> {
        let mut all_events = Vec::new();
        let mut next_link: Option<String> = None;

        loop {
            let auth = self.auth_header(user).await?;
            let request = match &next_link {
                Some(link) => self.http.get(link),
                None => {
                    let url = format!(
                        "{}/me/calendars/{}/events",
                        self.base_url,
                        calendar.as_str()
                    );
                    self.http.get(&url)
                }
            };

            let response = request
                .header(header::AUTHORIZATION, auth)
                .header("Prefer", "outlook.timezone=\"UTC\"")
                .send()
                .await
                .map_err(|e| Error::Transport(format!("list events failed: {}", e)))?;

            let page: WireEventList = Self::handle_response(response).await?;
            all_events.extend(page.value);

            match page.next_link {
                Some(link) => next_link = Some(link),
                None => break,
            }
        }

        Ok(all_events)
    }

    /// List the user's calendars.
    pub async fn list_calendars(&self, user: &UserId) -> Result<Vec<WireCalendar>> {
        let auth = self.auth_header(user).await?;
        let url = format!("{}/me/calendars", self.base_url);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("list calendars failed: {}", e)))?;

        let list: WireCalendarList = Self::handle_response(response).await?;
        Ok(list.value)
    }

    /// Deserialize a successful response or map the status to an error kind.
    async fn handle_response<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Serialization(format!("bad response body: {}", e)))
        } else {
            Err(Self::status_error(response).await)
        }
    }

    async fn status_error(response: Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = if body.is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            format!("HTTP {}: {}", status.as_u16(), body)
        };

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::NotAuthenticated(detail),
            // The provider signals an expired delta token with 410 Gone.
            StatusCode::GONE => Error::TokenInvalid(detail),
            StatusCode::REQUEST_TIMEOUT => Error::Timeout(detail),
            StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(detail),
            StatusCode::NOT_FOUND => Error::NotFound(detail),
            StatusCode::BAD_REQUEST => Error::Validation(detail),
            _ => Error::Transport(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_date_time_parses_fractional_seconds() {
        let wire = WireDateTime {
            date_time: "2025-03-01T09:30:00.0000000".to_string(),
            time_zone: Some("UTC".to_string()),
        };
        let parsed = wire.to_utc().unwrap();
        assert_eq!(parsed.to_rfc3339(), "2025-03-01T09:30:00+00:00");
    }

    #[test]
    fn test_wire_date_time_rejects_garbage() {
        let wire = WireDateTime {
            date_time: "yesterday".to_string(),
            time_zone: None,
        };
        assert!(matches!(
            wire.to_utc().unwrap_err(),
            Error::Serialization(_)
        ));
    }

    #[test]
    fn test_delta_page_parses_events_and_links() {
        let json = serde_json::json!({
            "value": [{
                "id": "evt-1",
                "subject": "Design review",
                "body": {"contentType": "text", "content": "agenda"},
                "location": {"displayName": "Room 4"},
                "start": {"dateTime": "2025-03-01T09:00:00.0000000", "timeZone": "UTC"},
                "end": {"dateTime": "2025-03-01T10:00:00.0000000", "timeZone": "UTC"},
                "isAllDay": false,
                "createdDateTime": "2025-02-20T08:00:00Z",
                "lastModifiedDateTime": "2025-02-28T08:00:00Z",
                "changeKey": "ck-1"
            }],
            "@odata.nextLink": "https://example.test/delta?page=2"
        });

        let page: WireDeltaPage = serde_json::from_value(json).unwrap();
        assert_eq!(page.value.len(), 1);
        assert_eq!(page.value[0].subject.as_deref(), Some("Design review"));
        assert_eq!(page.value[0].change_key.as_deref(), Some("ck-1"));
        assert!(page.next_link.is_some());
        assert!(page.delta_link.is_none());
    }

    #[test]
    fn test_delta_page_parses_removed_marker() {
        let json = serde_json::json!({
            "value": [{
                "id": "evt-9",
                "@removed": {"reason": "deleted"}
            }],
            "@odata.deltaLink": "https://example.test/delta?token=abc"
        });

        let page: WireDeltaPage = serde_json::from_value(json).unwrap();
        assert_eq!(page.value.len(), 1);
        assert!(page.value[0].removed.is_some());
        assert!(page.value[0].start.is_none());
        assert!(page.delta_link.is_some());
    }

    #[test]
    fn test_final_page_has_delta_link_only() {
        let json = serde_json::json!({
            "value": [],
            "@odata.deltaLink": "https://example.test/delta?token=abc"
        });
        let page: WireDeltaPage = serde_json::from_value(json).unwrap();
        assert!(page.value.is_empty());
        assert!(page.next_link.is_none());
        assert_eq!(
            page.delta_link.as_deref(),
            Some("https://example.test/delta?token=abc")
        );
    }
}
