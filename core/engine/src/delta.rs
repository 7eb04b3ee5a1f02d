//! Incremental ("delta") change fetching.
//!
//! Pagination is an explicit lazy sequence: `DeltaPages` produces pages on
//! demand, is finite, and is not restartable mid-stream, so memory use stays
//! bounded no matter how large the remote history is. Each page's token
//! depends on the prior page, so pages are always fetched sequentially.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use calsync_common::{CalendarId, Error, Result, UserId};
use calsync_gateway::{CalendarGateway, ChangeKind, DeltaPage, RemoteEvent};

use crate::retry::RetryExecutor;

/// Options for delta fetching.
#[derive(Debug, Clone)]
pub struct DeltaOptions {
    /// Preferred page size requested from the provider.
    pub page_size: usize,
    /// Upper bound on pages per enumeration, as a runaway guard.
    pub max_pages: usize,
    /// Deadline for a single page fetch.
    pub page_timeout: Duration,
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_pages: 500,
            page_timeout: Duration::from_secs(30),
        }
    }
}

/// A remote event tagged with its advisory change classification.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub event: RemoteEvent,
    pub kind: ChangeKind,
}

/// A fully fetched change set plus the cursor for the next run.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaBatch {
    /// Changed events in provider order across all pages.
    pub events: Vec<TaggedEvent>,
    /// The final page's delta token.
    pub continuation_token: String,
}

/// Lazy sequence of delta pages.
///
/// After an error or the final page the sequence is exhausted; `next`
/// returns `None` from then on.
pub struct DeltaPages<'a, G: CalendarGateway + ?Sized> {
    gateway: &'a G,
    retry: &'a RetryExecutor,
    user: UserId,
    calendar: CalendarId,
    cursor: Option<String>,
    options: DeltaOptions,
    pages_fetched: usize,
    delta_token: Option<String>,
    done: bool,
}

impl<'a, G: CalendarGateway + ?Sized> DeltaPages<'a, G> {
    fn new(
        gateway: &'a G,
        retry: &'a RetryExecutor,
        user: UserId,
        calendar: CalendarId,
        token: Option<String>,
        options: DeltaOptions,
    ) -> Self {
        Self {
            gateway,
            retry,
            user,
            calendar,
            cursor: token,
            options,
            pages_fetched: 0,
            delta_token: None,
            done: false,
        }
    }

    /// Produce the next page, or `None` once the sequence is exhausted.
    ///
    /// Transient failures are retried with backoff; a page fetch that still
    /// fails ends the sequence.
    pub async fn next(&mut self) -> Option<Result<DeltaPage>> {
        if self.done {
            return None;
        }

        if self.pages_fetched >= self.options.max_pages {
            self.done = true;
            return Some(Err(Error::Transport(format!(
                "delta enumeration exceeded {} pages",
                self.options.max_pages
            ))));
        }

        let gateway = self.gateway;
        let retry = self.retry;
        let user = self.user.clone();
        let calendar = self.calendar.clone();
        let cursor = self.cursor.clone();
        let page_timeout = self.options.page_timeout;
        let page_size = self.options.page_size;

        let result = retry
            .execute(|| {
                let user = user.clone();
                let calendar = calendar.clone();
                let cursor = cursor.clone();
                async move {
                    timeout(
                        page_timeout,
                        gateway.fetch_delta_page(&user, &calendar, cursor.as_deref(), page_size),
                    )
                    .await
                    .map_err(|_| Error::Timeout("delta page fetch".to_string()))?
                }
            })
            .await;

        let page = match result {
            Ok(page) => page,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        self.pages_fetched += 1;
        debug!(
            page = self.pages_fetched,
            events = page.events.len(),
            "fetched delta page"
        );

        if let Some(delta_token) = &page.delta_token {
            self.delta_token = Some(delta_token.clone());
            self.done = true;
        } else if let Some(next) = &page.next_page_token {
            self.cursor = Some(next.clone());
        } else {
            self.done = true;
            return Some(Err(Error::Transport(
                "delta page carried neither a next-page nor a delta token".to_string(),
            )));
        }

        Some(Ok(page))
    }

    /// The final delta token, available once the last page was produced.
    pub fn continuation_token(&self) -> Option<&str> {
        self.delta_token.as_deref()
    }

    /// Whether the sequence has ended.
    pub fn is_exhausted(&self) -> bool {
        self.done
    }
}

/// Fetches remote changes through the provider's delta protocol.
pub struct DeltaFetcher<G: CalendarGateway + ?Sized> {
    gateway: Arc<G>,
    retry: Arc<RetryExecutor>,
    options: DeltaOptions,
}

impl<G: CalendarGateway + ?Sized> DeltaFetcher<G> {
    /// Create a fetcher over a gateway.
    pub fn new(gateway: Arc<G>, retry: Arc<RetryExecutor>, options: DeltaOptions) -> Self {
        Self {
            gateway,
            retry,
            options,
        }
    }

    /// Start a lazy page sequence.
    ///
    /// `token` is `None` to start a fresh enumeration (which also
    /// establishes a token), or the delta token from a prior run.
    pub fn pages(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        token: Option<String>,
    ) -> DeltaPages<'_, G> {
        DeltaPages::new(
            self.gateway.as_ref(),
            self.retry.as_ref(),
            user.clone(),
            calendar.clone(),
            token,
            self.options.clone(),
        )
    }

    /// Fetch all pending changes, exhausting every page.
    ///
    /// # Postconditions
    /// - Events are concatenated in page order, each tagged with its
    ///   advisory classification
    /// - The returned token is the final page's delta token
    ///
    /// # Errors
    /// - `TokenInvalid` if the provider rejected the supplied token;
    ///   callers fall back to a full sync rather than retrying
    pub async fn fetch_changes(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        token: Option<&str>,
    ) -> Result<DeltaBatch> {
        let mut pages = self.pages(user, calendar, token.map(|t| t.to_string()));
        let mut events = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page?;
            events.extend(page.events.into_iter().map(|event| TaggedEvent {
                kind: event.change_kind(),
                event,
            }));
        }

        let continuation_token = pages
            .continuation_token()
            .ok_or_else(|| {
                Error::Transport("delta enumeration ended without a delta token".to_string())
            })?
            .to_string();

        Ok(DeltaBatch {
            events,
            continuation_token,
        })
    }

    /// Fetch changes, keeping only events overlapping `[start, end]`.
    ///
    /// Deletion markers always pass through regardless of the window: a
    /// deletion must be applied even if the window no longer contains the
    /// event.
    pub async fn fetch_changes_in_window(
        &self,
        user: &UserId,
        calendar: &CalendarId,
        token: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<DeltaBatch> {
        let mut batch = self.fetch_changes(user, calendar, token).await?;
        batch.events = Self::window_filter(batch.events, start, end);
        Ok(batch)
    }

    /// Keep deletions plus events overlapping `[start, end]`.
    pub fn window_filter(
        events: Vec<TaggedEvent>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Vec<TaggedEvent> {
        events
            .into_iter()
            .filter(|tagged| {
                tagged.kind == ChangeKind::Deleted
                    || (tagged.event.start < end && tagged.event.end > start)
            })
            .collect()
    }

    /// Probe whether the provider can produce a delta token for this
    /// calendar. Never raises; failures report `false`.
    pub async fn supports_incremental_sync(&self, user: &UserId, calendar: &CalendarId) -> bool {
        let mut pages = self.pages(user, calendar, None);
        match pages.next().await {
            Some(Ok(_)) => true,
            Some(Err(err)) => {
                warn!(user = %user, "incremental sync probe failed: {}", err);
                false
            }
            None => false,
        }
    }
}
