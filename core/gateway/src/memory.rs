//! In-memory calendar gateway for testing.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

use calsync_common::{CalendarId, Error, Result, UserId};

use crate::gateway::{CalendarGateway, CalendarInfo, DeltaPage, EventDraft, RemoteEvent};

/// In-memory remote calendar with a simulated delta protocol.
///
/// Every mutation appends a snapshot to an ordered change log. Continuation
/// tokens encode a position in that log; presenting a token replays the
/// changes recorded after it, in order, so re-presenting an old token
/// re-delivers its batch (at-least-once, like a real delta provider).
/// `invalidate_tokens` bumps a token epoch, making every previously issued
/// token fail with `TokenInvalid`.
pub struct MemoryGateway {
    inner: Arc<RwLock<Inner>>,
    /// One-shot failures consumed by the next matching call.
    fail_fetches: Mutex<Vec<Error>>,
    fail_writes: Mutex<Vec<Error>>,
    /// Token argument of every fetch, for assertions on fallback behavior.
    fetch_log: Mutex<Vec<Option<String>>>,
    latency: Mutex<Option<Duration>>,
}

struct Inner {
    /// Live events keyed by (calendar, id).
    events: HashMap<(String, String), RemoteEvent>,
    /// Ordered change log of (calendar, snapshot) entries.
    log: Vec<(String, RemoteEvent)>,
    /// Bumped to invalidate all outstanding tokens.
    epoch: u64,
}

impl MemoryGateway {
    /// Create an empty gateway.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                events: HashMap::new(),
                log: Vec::new(),
                epoch: 0,
            })),
            fail_fetches: Mutex::new(Vec::new()),
            fail_writes: Mutex::new(Vec::new()),
            fetch_log: Mutex::new(Vec::new()),
            latency: Mutex::new(None),
        }
    }

    /// Seed a remote event, recording it in the change log.
    pub fn seed_event(&self, calendar: &CalendarId, event: RemoteEvent) {
        let mut inner = self.inner.write().unwrap();
        let key = (calendar.as_str().to_string(), event.id.clone());
        inner.events.insert(key, event.clone());
        inner.log.push((calendar.as_str().to_string(), event));
    }

    /// Mutate a live event in place, bumping its modification stamp and
    /// version tag, and record the new snapshot in the change log.
    pub fn mutate_event(
        &self,
        calendar: &CalendarId,
        id: &str,
        mutate: impl FnOnce(&mut RemoteEvent),
    ) {
        let mut inner = self.inner.write().unwrap();
        let key = (calendar.as_str().to_string(), id.to_string());
        if let Some(event) = inner.events.get_mut(&key) {
            mutate(event);
            event.last_modified = Utc::now();
            event.version_tag = Some(Uuid::new_v4().to_string());
            let snapshot = event.clone();
            inner.log.push((calendar.as_str().to_string(), snapshot));
        }
    }

    /// Remove a live event, recording a tombstone in the change log.
    pub fn remove_event(&self, calendar: &CalendarId, id: &str) {
        let mut inner = self.inner.write().unwrap();
        let key = (calendar.as_str().to_string(), id.to_string());
        if inner.events.remove(&key).is_some() {
            inner
                .log
                .push((calendar.as_str().to_string(), RemoteEvent::tombstone(id)));
        }
    }

    /// Invalidate every token issued so far.
    pub fn invalidate_tokens(&self) {
        self.inner.write().unwrap().epoch += 1;
    }

    /// Queue a one-shot failure for the next delta fetch.
    pub fn fail_next_fetch(&self, error: Error) {
        self.fail_fetches.lock().unwrap().push(error);
    }

    /// Queue a one-shot failure for the next write call.
    pub fn fail_next_write(&self, error: Error) {
        self.fail_writes.lock().unwrap().push(error);
    }

    /// Add artificial latency to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Token arguments of every delta fetch so far.
    pub fn fetch_tokens(&self) -> Vec<Option<String>> {
        self.fetch_log.lock().unwrap().clone()
    }

    /// Number of live events on a calendar.
    pub fn live_events(&self, calendar: &CalendarId) -> usize {
        self.inner
            .read()
            .unwrap()
            .events
            .keys()
            .filter(|(cal, _)| cal == calendar.as_str())
            .count()
    }

    /// A live event by id, for test assertions.
    pub fn event(&self, calendar: &CalendarId, id: &str) -> Option<RemoteEvent> {
        self.inner
            .read()
            .unwrap()
            .events
            .get(&(calendar.as_str().to_string(), id.to_string()))
            .cloned()
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_failure(queue: &Mutex<Vec<Error>>) -> Option<Error> {
        let mut queue = queue.lock().unwrap();
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

impl Default for MemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Parsed continuation token.
enum Token {
    /// Mid-enumeration page cursor: offset into the initial snapshot plus
    /// the log position captured when the enumeration started.
    Fresh { epoch: u64, offset: usize, log_pos: usize },
    /// Incremental cursor: position in the change log.
    Delta { epoch: u64, log_pos: usize },
}

fn parse_token(raw: &str) -> Result<Token> {
    let parts: Vec<&str> = raw.split(':').collect();
    let invalid = || Error::TokenInvalid(format!("unrecognized token '{raw}'"));
    match parts.as_slice() {
        ["f", epoch, offset, log_pos] => Ok(Token::Fresh {
            epoch: epoch.parse().map_err(|_| invalid())?,
            offset: offset.parse().map_err(|_| invalid())?,
            log_pos: log_pos.parse().map_err(|_| invalid())?,
        }),
        ["d", epoch, log_pos] => Ok(Token::Delta {
            epoch: epoch.parse().map_err(|_| invalid())?,
            log_pos: log_pos.parse().map_err(|_| invalid())?,
        }),
        _ => Err(invalid()),
    }
}

#[async_trait]
impl CalendarGateway for MemoryGateway {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_delta_page(
        &self,
        _user: &UserId,
        calendar: &CalendarId,
        token: Option<&str>,
        page_size: usize,
    ) -> Result<DeltaPage> {
        self.fetch_log
            .lock()
            .unwrap()
            .push(token.map(|t| t.to_string()));
        self.simulate_latency().await;
        if let Some(error) = Self::take_failure(&self.fail_fetches) {
            return Err(error);
        }

        let inner = self.inner.read().unwrap();
        let page_size = page_size.max(1);

        let (offset, log_pos) = match token {
            None => (0, inner.log.len()),
            Some(raw) => match parse_token(raw)? {
                Token::Fresh { epoch, offset, log_pos } => {
                    if epoch != inner.epoch {
                        return Err(Error::TokenInvalid("token epoch expired".to_string()));
                    }
                    (offset, log_pos)
                }
                Token::Delta { epoch, log_pos } => {
                    if epoch != inner.epoch {
                        return Err(Error::TokenInvalid("token epoch expired".to_string()));
                    }
                    // Incremental: replay log entries after the cursor.
                    let mut events = Vec::new();
                    let mut pos = log_pos;
                    while pos < inner.log.len() && events.len() < page_size {
                        let (cal, event) = &inner.log[pos];
                        if cal == calendar.as_str() {
                            events.push(event.clone());
                        }
                        pos += 1;
                    }
                    let more = inner.log[pos..]
                        .iter()
                        .any(|(cal, _)| cal == calendar.as_str());
                    let token = format!("d:{}:{}", inner.epoch, pos);
                    return Ok(DeltaPage {
                        events,
                        next_page_token: more.then(|| token.clone()),
                        delta_token: (!more).then_some(token),
                    });
                }
            },
        };

        // Fresh enumeration: page through a stable ordering of live events,
        // then hand out a delta cursor at the log position captured up front.
        let mut snapshot: Vec<&RemoteEvent> = inner
            .events
            .iter()
            .filter(|((cal, _), _)| cal == calendar.as_str())
            .map(|(_, event)| event)
            .collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));

        let events: Vec<RemoteEvent> = snapshot
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|e| (*e).clone())
            .collect();
        let more = offset + events.len() < snapshot.len();

        Ok(DeltaPage {
            events,
            next_page_token: more
                .then(|| format!("f:{}:{}:{}", inner.epoch, offset + page_size, log_pos)),
            delta_token: (!more).then(|| format!("d:{}:{}", inner.epoch, log_pos)),
        })
    }

    async fn create_event(
        &self,
        _user: &UserId,
        calendar: &CalendarId,
        draft: &EventDraft,
    ) -> Result<RemoteEvent> {
        self.simulate_latency().await;
        if let Some(error) = Self::take_failure(&self.fail_writes) {
            return Err(error);
        }

        let now = Utc::now();
        let event = RemoteEvent {
            id: Uuid::new_v4().to_string(),
            subject: draft.subject.clone(),
            description: draft.description.clone(),
            location: draft.location.clone(),
            start: draft.start,
            end: draft.end,
            time_zone: draft.time_zone.clone(),
            is_all_day: draft.is_all_day,
            recurrence: draft.recurrence.clone(),
            created: Some(now),
            last_modified: now,
            removed: false,
            version_tag: Some(Uuid::new_v4().to_string()),
        };

        let mut inner = self.inner.write().unwrap();
        let key = (calendar.as_str().to_string(), event.id.clone());
        inner.events.insert(key, event.clone());
        inner
            .log
            .push((calendar.as_str().to_string(), event.clone()));
        Ok(event)
    }

    async fn update_event(
        &self,
        _user: &UserId,
        calendar: &CalendarId,
        remote_id: &str,
        draft: &EventDraft,
    ) -> Result<RemoteEvent> {
        self.simulate_latency().await;
        if let Some(error) = Self::take_failure(&self.fail_writes) {
            return Err(error);
        }

        let mut inner = self.inner.write().unwrap();
        let key = (calendar.as_str().to_string(), remote_id.to_string());
        let Some(event) = inner.events.get_mut(&key) else {
            return Err(Error::NotFound(format!("no remote event {remote_id}")));
        };

        event.subject = draft.subject.clone();
        event.description = draft.description.clone();
        event.location = draft.location.clone();
        event.start = draft.start;
        event.end = draft.end;
        event.time_zone = draft.time_zone.clone();
        event.is_all_day = draft.is_all_day;
        event.recurrence = draft.recurrence.clone();
        event.last_modified = Utc::now();
        event.version_tag = Some(Uuid::new_v4().to_string());

        let snapshot = event.clone();
        inner
            .log
            .push((calendar.as_str().to_string(), snapshot.clone()));
        Ok(snapshot)
    }

    async fn delete_event(
        &self,
        _user: &UserId,
        calendar: &CalendarId,
        remote_id: &str,
    ) -> Result<()> {
        self.simulate_latency().await;
        if let Some(error) = Self::take_failure(&self.fail_writes) {
            return Err(error);
        }

        let mut inner = self.inner.write().unwrap();
        let key = (calendar.as_str().to_string(), remote_id.to_string());
        if inner.events.remove(&key).is_none() {
            return Err(Error::NotFound(format!("no remote event {remote_id}")));
        }
        inner
            .log
            .push((calendar.as_str().to_string(), RemoteEvent::tombstone(remote_id)));
        Ok(())
    }

    async fn list_events(
        &self,
        _user: &UserId,
        calendar: &CalendarId,
    ) -> Result<Vec<RemoteEvent>> {
        self.simulate_latency().await;
        let inner = self.inner.read().unwrap();
        let mut events: Vec<RemoteEvent> = inner
            .events
            .iter()
            .filter(|((cal, _), _)| cal == calendar.as_str())
            .map(|(_, event)| event.clone())
            .collect();
        events.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(events)
    }

    async fn list_calendars(&self, _user: &UserId) -> Result<Vec<CalendarInfo>> {
        self.simulate_latency().await;
        let inner = self.inner.read().unwrap();
        let mut names: Vec<String> = inner
            .events
            .keys()
            .map(|(cal, _)| cal.clone())
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        Ok(names
            .into_iter()
            .enumerate()
            .map(|(i, id)| CalendarInfo {
                name: id.clone(),
                id,
                is_default: i == 0,
            })
            .collect())
    }
}
