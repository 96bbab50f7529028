//! GitHub web UI source, driven through a signed-in browser session.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, COOKIE, RETRY_AFTER};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::parse;
use super::{Cursor, FetchClient, FetchError, Page, PageRequest};
use crate::credentials::SessionHandle;
use crate::model::{EntityKind, RawRecord, RepoId, Source};
use crate::ratelimit::{reset_after, RateLimiter};

pub const DEFAULT_BASE_URL: &str = "https://github.com";

/// A page as the browser ended up showing it.
#[derive(Debug, Clone)]
pub struct LoadedPage {
    /// URL after following redirects.
    pub final_url: String,
    pub status: u16,
    pub body: String,
}

/// Opaque page loader carrying the user's web session.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    async fn load(&self, url: &str) -> Result<LoadedPage, FetchError>;
}

/// Plain HTTP page loads with the `user_session` cookie attached.
pub struct HttpSession {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpSession {
    pub fn new(session: &SessionHandle, timeout: Duration) -> Result<Self, FetchError> {
        let value = session.cookie_value();
        let mut cookie = HeaderValue::from_str(&format!(
            "user_session={value}; __Host-user_session_same_site={value}"
        ))
        .map_err(|_| FetchError::Auth("session cookie contains characters not allowed in a header".to_string()))?;
        cookie.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, cookie);

        let client = reqwest::Client::builder()
            .user_agent("Mozilla/5.0 (compatible; pr-ledger)")
            .default_headers(headers)
            .build()
            .map_err(|e| FetchError::Setup(e.to_string()))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl BrowserSession for HttpSession {
    async fn load(&self, url: &str) -> Result<LoadedPage, FetchError> {
        let response = self.client.get(url).timeout(self.timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let reset_at = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .and_then(reset_after);
            return Err(FetchError::RateLimited { reset_at });
        }
        if status.is_server_error() {
            return Err(FetchError::Transient(format!("HTTP {} from {url}", status.as_u16())));
        }

        let final_url = response.url().to_string();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        Ok(LoadedPage {
            final_url,
            status: status.as_u16(),
            body,
        })
    }
}

/// Pull requests read from GitHub's search and conversation pages.
pub struct ScrapeFetcher {
    session: Arc<dyn BrowserSession>,
    base_url: String,
    user: String,
    limiter: Arc<RateLimiter>,
    pages_in_flight: Semaphore,
    /// Set once a page came back as the sign-in wall; no page is loaded after that.
    signed_out: AtomicBool,
}

impl ScrapeFetcher {
    pub fn new(
        session: Arc<dyn BrowserSession>,
        base_url: impl Into<String>,
        user: impl Into<String>,
        limiter: Arc<RateLimiter>,
        concurrency: usize,
    ) -> Self {
        Self {
            session,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            limiter,
            pages_in_flight: Semaphore::new(concurrency.max(1)),
            signed_out: AtomicBool::new(false),
        }
    }

    fn search_url(&self, request: &PageRequest, page: u32) -> Result<String, FetchError> {
        let mut query = format!("is:pr author:{} repo:{}", self.user, request.repo);
        if let Some(since) = request.since {
            query.push_str(&format!(" updated:>={}", since.date_naive()));
        }
        if let Some(until) = request.until {
            query.push_str(&format!(" created:<={}", until.date_naive()));
        }

        let page = page.to_string();
        let params = [
            ("q", query.as_str()),
            ("type", "pullrequests"),
            ("s", "updated"),
            ("o", "desc"),
            ("p", page.as_str()),
        ];
        reqwest::Url::parse_with_params(&format!("{}/search", self.base_url), &params)
            .map(String::from)
            .map_err(|e| FetchError::Setup(format!("invalid scrape base URL: {e}")))
    }

    /// Load a page and make sure it is the page asked for rather than a sign-in wall.
    ///
    /// A refused request puts the shared limiter into cooldown, so every worker of this
    /// source waits. A lost session fails every later load without touching GitHub.
    async fn load(&self, url: &str) -> Result<LoadedPage, FetchError> {
        let _permit = self.pages_in_flight.acquire().await.map_err(|_| FetchError::Cancelled)?;
        if self.signed_out.load(Ordering::Acquire) {
            return Err(FetchError::SessionExpired(format!("session already expired, not loading {url}")));
        }
        self.limiter.acquire(1).await;

        let page = match self.session.load(url).await {
            Ok(page) => page,
            Err(FetchError::RateLimited { reset_at }) => {
                let wait = self.limiter.cooldown(reset_at).await;
                warn!(url, wait_secs = wait.as_secs(), "rate limited by the web UI");
                return Err(FetchError::RateLimited { reset_at });
            }
            Err(e) => return Err(e),
        };
        let final_path = reqwest::Url::parse(&page.final_url)
            .map(|u| u.path().to_string())
            .unwrap_or_default();
        if parse::is_login_page(&final_path, &page.body) {
            warn!(url, final_url = %page.final_url, "browser session no longer signed in");
            self.signed_out.store(true, Ordering::Release);
            return Err(FetchError::SessionExpired(page.final_url));
        }
        if !(200..300).contains(&page.status) {
            return Err(FetchError::Api {
                status: page.status,
                url: url.to_string(),
            });
        }
        Ok(page)
    }

    #[instrument(skip(self, request), fields(repo = %request.repo, cursor = ?request.cursor))]
    async fn search_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let page_number = match &request.cursor {
            None => 1,
            Some(cursor) => cursor.as_page().ok_or_else(|| FetchError::Malformed {
                url: self.base_url.clone(),
                reason: format!("cursor {cursor} is not a page number"),
            })?,
        };
        let url = self.search_url(request, page_number)?;
        let loaded = self.load(&url).await?;

        let following = Cursor::page(page_number + 1);
        let parsed = parse::parse_search_page(&loaded.body).map_err(|e| FetchError::PageParse {
            url: url.clone(),
            reason: e.to_string(),
            next: parse::has_next_page(&loaded.body).then(|| following.clone()),
        })?;

        let mut records = Vec::with_capacity(parsed.rows.len());
        let mut warnings = Vec::new();
        for row in parsed.rows {
            if row.repo != request.repo {
                warnings.push(format!("search returned {}#{} outside {}", row.repo, row.number, request.repo));
                continue;
            }
            if let (Some(since), Some(updated)) = (request.since, row.updated_at) {
                if updated < since {
                    continue;
                }
            }
            records.push(RawRecord::PullRequest(row.into_pull_request()));
        }

        debug!(records = records.len(), has_next = parsed.has_next, "scraped search page");
        Ok(Page {
            records,
            cursor: Cursor::page(page_number),
            next: parsed.has_next.then_some(following),
            etag: None,
            not_modified: false,
            warnings,
        })
    }
}

#[async_trait]
impl FetchClient for ScrapeFetcher {
    fn source(&self) -> Source {
        Source::Scrape
    }

    fn supports(&self, kind: EntityKind) -> bool {
        kind == EntityKind::PullRequests
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        match request.kind {
            EntityKind::PullRequests => self.search_page(request).await,
            EntityKind::Commits => Ok(Page::empty(request.cursor.clone().unwrap_or_else(|| Cursor::page(1)))),
        }
    }

    #[instrument(skip(self, repo), fields(repo = %repo))]
    async fn pr_detail(&self, repo: &RepoId, number: u64) -> Result<RawRecord, FetchError> {
        let url = format!("{}/{}/{}/pull/{number}", self.base_url, repo.owner, repo.name);
        let loaded = self.load(&url).await?;
        let pr = parse::parse_pr_page(&loaded.body, repo, number).map_err(|e| FetchError::PageParse {
            url: url.clone(),
            reason: e.to_string(),
            next: None,
        })?;
        Ok(RawRecord::PullRequest(pr))
    }
}
