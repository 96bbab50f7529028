pub mod api;
pub mod parse;
pub mod retry;
pub mod scrape;

pub use api::ApiFetcher;
pub use retry::RetryPolicy;
pub use scrape::{BrowserSession, HttpSession, ScrapeFetcher};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::model::{Commit, EntityKind, PullRequest, RawRecord, RepoId, Source};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Rate limited (reset at {reset_at:?})")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("Transient network failure: {0}")]
    Transient(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("GitHub returned HTTP {status} for {url}")]
    Api { status: u16, url: String },

    #[error("Malformed response from {url}: {reason}")]
    Malformed { url: String, reason: String },

    #[error("Browser session expired (redirected to {0})")]
    SessionExpired(String),

    #[error("Could not parse page {url}: {reason}")]
    PageParse {
        url: String,
        reason: String,
        /// Where pagination can continue after skipping this page, if known.
        next: Option<Cursor>,
    },

    #[error("HTTP client setup failed: {0}")]
    Setup(String),

    #[error("Fetch cancelled")]
    Cancelled,
}

impl FetchError {
    /// Failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Timeout(_))
    }
}

/// Opaque pagination position understood by the fetcher that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cursor(pub String);

impl Cursor {
    pub fn page(number: u32) -> Self {
        Cursor(number.to_string())
    }

    /// The page number, for fetchers paginating by number.
    pub fn as_page(&self) -> Option<u32> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to fetch: one page of one entity kind for one repository.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub repo: RepoId,
    pub kind: EntityKind,
    /// Skip records last updated before this instant.
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// `None` requests the first page.
    pub cursor: Option<Cursor>,
    /// Validator from the previous pass's first page.
    pub etag: Option<String>,
}

impl PageRequest {
    pub fn first(repo: RepoId, kind: EntityKind) -> Self {
        Self {
            repo,
            kind,
            since: None,
            until: None,
            cursor: None,
            etag: None,
        }
    }
}

/// One page of raw records.
#[derive(Debug, Clone)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Position of this page.
    pub cursor: Cursor,
    /// Position of the following page; `None` ends the pass.
    pub next: Option<Cursor>,
    pub etag: Option<String>,
    /// The source confirmed nothing changed since the supplied etag.
    pub not_modified: bool,
    /// Rows dropped while reading the page.
    pub warnings: Vec<String>,
}

impl Page {
    /// A terminal page with no records.
    pub fn empty(cursor: Cursor) -> Self {
        Self {
            records: Vec::new(),
            cursor,
            next: None,
            etag: None,
            not_modified: false,
            warnings: Vec::new(),
        }
    }
}

/// The paginated-listing capability shared by every acquisition source.
#[async_trait]
pub trait FetchClient: Send + Sync {
    fn source(&self) -> Source;

    /// Whether this source can list the given entity kind at all.
    fn supports(&self, kind: EntityKind) -> bool {
        let _ = kind;
        true
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError>;

    /// Fields too expensive for list pages (full review list, size metrics, engagement).
    async fn pr_detail(&self, repo: &RepoId, number: u64) -> Result<RawRecord, FetchError>;

    /// Per-commit statistics, where the source offers them.
    async fn commit_detail(&self, repo: &RepoId, sha: &str) -> Result<Option<RawRecord>, FetchError> {
        let _ = (repo, sha);
        Ok(None)
    }
}

/// Lazily walk every page of `request`, starting at its cursor.
pub fn pages<'a>(
    client: &'a dyn FetchClient,
    request: PageRequest,
) -> impl Stream<Item = Result<Page, FetchError>> + Send + 'a {
    stream::try_unfold(Some(request), move |state| async move {
        let Some(request) = state else {
            return Ok(None);
        };
        let page = client.fetch_page(&request).await?;
        let following = page.next.clone().map(|next| PageRequest {
            cursor: Some(next),
            etag: None,
            ..request
        });
        Ok(Some((page, following)))
    })
}

/// Lazy sequence of pull requests updated at or after `since`.
pub fn list_pull_requests<'a>(
    client: &'a dyn FetchClient,
    repo: RepoId,
    since: Option<DateTime<Utc>>,
) -> impl Stream<Item = Result<PullRequest, FetchError>> + Send + 'a {
    let mut request = PageRequest::first(repo, EntityKind::PullRequests);
    request.since = since;
    pages(client, request)
        .map_ok(|page| stream::iter(page.records.into_iter().map(Ok)))
        .try_flatten()
        .try_filter_map(|record| async move {
            Ok(match record {
                RawRecord::PullRequest(pr) => Some(pr),
                RawRecord::Commit(_) => None,
            })
        })
}

/// Lazy sequence of commits made at or after `since`.
pub fn list_commits<'a>(
    client: &'a dyn FetchClient,
    repo: RepoId,
    since: Option<DateTime<Utc>>,
) -> impl Stream<Item = Result<Commit, FetchError>> + Send + 'a {
    let mut request = PageRequest::first(repo, EntityKind::Commits);
    request.since = since;
    pages(client, request)
        .map_ok(|page| stream::iter(page.records.into_iter().map(Ok)))
        .try_flatten()
        .try_filter_map(|record| async move {
            Ok(match record {
                RawRecord::Commit(commit) => Some(commit),
                RawRecord::PullRequest(_) => None,
            })
        })
}

/// Scripted fetcher shared by the unit tests of several modules.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub type Step = Result<Page, FetchError>;

    /// Serves pre-recorded pages keyed by page number and records every request.
    pub struct MockFetcher {
        pub source: Source,
        pub kinds: Vec<EntityKind>,
        pages: Mutex<Vec<(EntityKind, u32, VecDeque<Step>, Option<Step>)>>,
        details: Mutex<Vec<(u64, VecDeque<Result<RawRecord, FetchError>>)>>,
        pub requests: Mutex<Vec<(EntityKind, u32)>>,
        pub detail_requests: Mutex<Vec<u64>>,
    }

    impl MockFetcher {
        pub fn new(source: Source) -> Self {
            Self {
                source,
                kinds: EntityKind::ALL.to_vec(),
                pages: Mutex::new(Vec::new()),
                details: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                detail_requests: Mutex::new(Vec::new()),
            }
        }

        pub fn only(mut self, kind: EntityKind) -> Self {
            self.kinds = vec![kind];
            self
        }

        /// Serve `records` as page `number` of `total`, forever.
        pub fn page(self, kind: EntityKind, number: u32, total: u32, records: Vec<RawRecord>) -> Self {
            let page = Page {
                records,
                cursor: Cursor::page(number),
                next: (number < total).then(|| Cursor::page(number + 1)),
                etag: None,
                not_modified: false,
                warnings: Vec::new(),
            };
            self.pages.lock().unwrap().push((kind, number, VecDeque::new(), Some(Ok(page))));
            self
        }

        /// Serve `steps` once each, in order, before the page's steady answer.
        pub fn script(self, kind: EntityKind, number: u32, steps: Vec<Step>) -> Self {
            {
                let mut pages = self.pages.lock().unwrap();
                match pages.iter_mut().find(|(k, n, _, _)| *k == kind && *n == number) {
                    Some(entry) => entry.2.extend(steps),
                    None => pages.push((kind, number, steps.into(), None)),
                }
            }
            self
        }

        pub fn detail(self, number: u64, answers: Vec<Result<RawRecord, FetchError>>) -> Self {
            self.details.lock().unwrap().push((number, answers.into()));
            self
        }

        pub fn requested_pages(&self, kind: EntityKind) -> Vec<u32> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| *k == kind)
                .map(|(_, n)| *n)
                .collect()
        }
    }

    fn clone_step(step: &Step) -> Step {
        match step {
            Ok(page) => Ok(page.clone()),
            Err(e) => Err(FetchError::Transient(e.to_string())),
        }
    }

    #[async_trait]
    impl FetchClient for MockFetcher {
        fn source(&self) -> Source {
            self.source
        }

        fn supports(&self, kind: EntityKind) -> bool {
            self.kinds.contains(&kind)
        }

        async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
            let number = request.cursor.as_ref().and_then(Cursor::as_page).unwrap_or(1);
            self.requests.lock().unwrap().push((request.kind, number));
            let mut pages = self.pages.lock().unwrap();
            let Some(entry) = pages.iter_mut().find(|(k, n, _, _)| *k == request.kind && *n == number) else {
                return Ok(Page::empty(Cursor::page(number)));
            };
            if let Some(step) = entry.2.pop_front() {
                return step;
            }
            match &entry.3 {
                Some(step) => clone_step(step),
                None => Ok(Page::empty(Cursor::page(number))),
            }
        }

        async fn pr_detail(&self, repo: &RepoId, number: u64) -> Result<RawRecord, FetchError> {
            self.detail_requests.lock().unwrap().push(number);
            let mut details = self.details.lock().unwrap();
            match details.iter_mut().find(|(n, _)| *n == number) {
                Some((_, answers)) if answers.len() > 1 => answers.pop_front().unwrap(),
                Some((_, answers)) => match answers.front() {
                    Some(Ok(record)) => Ok(record.clone()),
                    Some(Err(e)) => Err(FetchError::SessionExpired(e.to_string())),
                    None => Ok(RawRecord::PullRequest(PullRequest::new(repo.clone(), number))),
                },
                None => Ok(RawRecord::PullRequest(PullRequest::new(repo.clone(), number))),
            }
        }
    }
}
