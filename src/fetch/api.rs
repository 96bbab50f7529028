//! GitHub REST API source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, ETAG, IF_NONE_MATCH, LINK, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use super::{Cursor, FetchClient, FetchError, Page, PageRequest};
use crate::model::{Commit, EntityKind, PrState, PullRequest, RawRecord, RepoId, Review, ReviewOutcome, Source};
use crate::ratelimit::{reset_after, RateLimiter};

pub const DEFAULT_BASE_URL: &str = "https://api.github.com";

/// Largest page the REST API serves.
const PAGE_SIZE: u32 = 100;

/// Squash-merge headlines end in `(#123)`; merge commits start with `Merge pull request #123`.
static PR_REF_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\(#(\d+)\)\s*$|^Merge pull request #(\d+))").expect("invalid regex"));

#[derive(Debug, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
}

#[derive(Debug, Deserialize)]
struct BranchRef {
    #[serde(rename = "ref")]
    name: String,
}

/// Pull request as returned by both the list and the detail endpoints. The size and
/// discussion counters are only present on the detail endpoint.
#[derive(Debug, Deserialize)]
struct PullResponse {
    number: u64,
    title: Option<String>,
    state: Option<String>,
    user: Option<User>,
    draft: Option<bool>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    merged_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    head: Option<BranchRef>,
    base: Option<BranchRef>,
    labels: Option<Vec<Label>>,
    merged: Option<bool>,
    additions: Option<u64>,
    deletions: Option<u64>,
    changed_files: Option<u64>,
    commits: Option<u64>,
    comments: Option<u64>,
    review_comments: Option<u64>,
}

impl PullResponse {
    fn is_by(&self, user: &str) -> bool {
        self.user.as_ref().is_some_and(|u| u.login.eq_ignore_ascii_case(user))
    }

    fn into_pull_request(self, repo: RepoId) -> PullRequest {
        let state = if self.merged_at.is_some() || self.merged == Some(true) {
            Some(PrState::Merged)
        } else {
            match self.state.as_deref() {
                Some("open") => Some(PrState::Open),
                Some("closed") => Some(PrState::Closed),
                _ => None,
            }
        };

        let mut pr = PullRequest::new(repo, self.number);
        pr.title = self.title;
        pr.state = state;
        pr.author = self.user.map(|u| u.login);
        pr.is_draft = self.draft;
        pr.created_at = self.created_at;
        pr.updated_at = self.updated_at;
        pr.merged_at = self.merged_at;
        pr.closed_at = self.closed_at;
        pr.head_branch = self.head.map(|h| h.name);
        pr.base_branch = self.base.map(|b| b.name);
        pr.labels = self.labels.map(|labels| labels.into_iter().map(|l| l.name).collect());
        pr.additions = self.additions;
        pr.deletions = self.deletions;
        pr.files_changed = self.changed_files;
        pr.commit_count = self.commits;
        pr.comment_count = self.comments.zip(self.review_comments).map(|(c, r)| c + r);
        pr
    }
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    user: Option<User>,
    state: String,
    submitted_at: Option<DateTime<Utc>>,
}

impl ReviewResponse {
    /// Pending reviews and reviews by deleted accounts are not contributions.
    fn into_review(self, pr_number: u64) -> Option<Review> {
        let outcome = match self.state.as_str() {
            "APPROVED" => ReviewOutcome::Approved,
            "CHANGES_REQUESTED" => ReviewOutcome::ChangesRequested,
            "COMMENTED" => ReviewOutcome::Commented,
            "DISMISSED" => ReviewOutcome::Dismissed,
            _ => return None,
        };
        Some(Review {
            pr_number,
            reviewer: self.user?.login,
            outcome,
            submitted_at: self.submitted_at?,
        })
    }
}

#[derive(Debug, Deserialize)]
struct Signature {
    name: Option<String>,
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    author: Option<Signature>,
    committer: Option<Signature>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Stats {
    additions: u64,
    deletions: u64,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
    commit: CommitInfo,
    author: Option<User>,
    stats: Option<Stats>,
}

impl CommitResponse {
    fn into_commit(self, repo: RepoId) -> Commit {
        let headline = self
            .commit
            .message
            .as_deref()
            .and_then(|m| m.lines().next())
            .map(str::to_string);

        let mut commit = Commit::new(repo, self.sha);
        commit.pr_number = headline.as_deref().and_then(pr_number_from_headline);
        commit.message = headline;
        commit.author = self
            .author
            .map(|u| u.login)
            .or_else(|| self.commit.author.as_ref().and_then(|a| a.name.clone()));
        commit.committed_at = self
            .commit
            .author
            .as_ref()
            .and_then(|a| a.date)
            .or_else(|| self.commit.committer.as_ref().and_then(|c| c.date));
        commit.additions = self.stats.as_ref().map(|s| s.additions);
        commit.deletions = self.stats.as_ref().map(|s| s.deletions);
        commit
    }
}

#[derive(Debug, Deserialize)]
struct RepoResponse {
    full_name: String,
}

/// Quota reported by the `x-ratelimit-*` response headers.
#[derive(Debug, Clone, Copy)]
struct RateLimitInfo {
    remaining: u64,
    reset_at: DateTime<Utc>,
}

fn rate_limit_from_headers(headers: &HeaderMap) -> Option<RateLimitInfo> {
    let remaining = headers.get("x-ratelimit-remaining")?.to_str().ok()?.parse::<u64>().ok()?;
    let reset = headers.get("x-ratelimit-reset")?.to_str().ok()?.parse::<i64>().ok()?;
    let reset_at = DateTime::from_timestamp(reset, 0)?;
    Some(RateLimitInfo { remaining, reset_at })
}

fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()
}

fn link_has_next(headers: &HeaderMap) -> bool {
    headers
        .get(LINK)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|link| link.split(',').any(|part| part.contains("rel=\"next\"")))
}

fn pr_number_from_headline(headline: &str) -> Option<u64> {
    let captures = PR_REF_REGEX.captures(headline)?;
    captures.get(1).or_else(|| captures.get(2))?.as_str().parse().ok()
}

fn page_number(request: &PageRequest, url: &str) -> Result<u32, FetchError> {
    match &request.cursor {
        None => Ok(1),
        Some(cursor) => cursor.as_page().ok_or_else(|| FetchError::Malformed {
            url: url.to_string(),
            reason: format!("cursor {cursor} is not a page number"),
        }),
    }
}

/// Authenticated, paginated calls against the GitHub REST API on behalf of one user.
pub struct ApiFetcher {
    client: reqwest::Client,
    base_url: String,
    user: String,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
    page_size: u32,
}

impl ApiFetcher {
    pub fn new(
        base_url: impl Into<String>,
        token: &str,
        user: impl Into<String>,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| FetchError::Auth("token contains characters not allowed in a header".to_string()))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));

        let client = reqwest::Client::builder()
            .user_agent("pr-ledger")
            .default_headers(headers)
            .build()
            .map_err(|e| FetchError::Setup(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            limiter,
            timeout,
            page_size: PAGE_SIZE,
        })
    }

    /// Override the page size; the REST API caps it at 100.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, PAGE_SIZE);
        self
    }

    /// Expand an organization into its repositories. Falls back to the user endpoint
    /// when the owner is a personal account.
    #[instrument(skip(self))]
    pub async fn list_org_repositories(&self, org: &str) -> Result<Vec<RepoId>, FetchError> {
        let repos: Vec<RepoResponse> = match self.get_all(&format!("{}/orgs/{org}/repos", self.base_url)).await {
            Err(FetchError::Api { status: 404, .. }) => {
                debug!("not an organization, listing user repositories");
                self.get_all(&format!("{}/users/{org}/repos", self.base_url)).await?
            }
            other => other?,
        };

        let mut ids = Vec::with_capacity(repos.len());
        for repo in repos {
            match RepoId::parse(&repo.full_name) {
                Ok(id) => ids.push(id),
                Err(e) => warn!(error = %e, "skipping repository with unexpected name"),
            }
        }
        ids.sort();
        debug!(count = ids.len(), "resolved repositories");
        Ok(ids)
    }

    /// Issue one GET, gated by the limiter, and classify the response status.
    async fn send(
        &self,
        url: &str,
        query: &[(&str, String)],
        etag: Option<&str>,
    ) -> Result<reqwest::Response, FetchError> {
        self.limiter.acquire(1).await;

        let mut request = self.client.get(url).query(query).timeout(self.timeout);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::Transient(e.to_string())
            }
        })?;

        let quota = rate_limit_from_headers(response.headers());
        if let Some(quota) = quota {
            self.limiter.observe(quota.remaining, quota.reset_at).await;
        }

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }

        let retry_after = retry_after(response.headers());
        let exhausted = quota.is_some_and(|q| q.remaining == 0);
        match status.as_u16() {
            401 => Err(FetchError::Auth(format!("HTTP 401 for {url}"))),
            429 | 403 if status.as_u16() == 429 || exhausted || retry_after.is_some() => {
                let reset_at = retry_after.and_then(reset_after).or(quota.map(|q| q.reset_at));
                let wait = self.limiter.cooldown(reset_at).await;
                warn!(url, status = status.as_u16(), wait_secs = wait.as_secs(), "rate limited by GitHub");
                Err(FetchError::RateLimited { reset_at })
            }
            code if status.is_server_error() => Err(FetchError::Transient(format!("HTTP {code} from {url}"))),
            code => Err(FetchError::Api {
                status: code,
                url: url.to_string(),
            }),
        }
    }

    async fn decode<T: DeserializeOwned>(url: &str, response: reqwest::Response) -> Result<T, FetchError> {
        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| FetchError::Malformed {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T, FetchError> {
        let response = self.send(url, query, None).await?;
        Self::decode(url, response).await
    }

    /// Every page of a list endpoint, until a short page.
    async fn get_all<T: DeserializeOwned>(&self, url: &str) -> Result<Vec<T>, FetchError> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let query = [("per_page", self.page_size.to_string()), ("page", page.to_string())];
            let items: Vec<T> = self.get_json(url, &query).await?;
            let short = (items.len() as u32) < self.page_size;
            all.extend(items);
            if short {
                return Ok(all);
            }
            page += 1;
        }
    }

    #[instrument(skip(self, request), fields(repo = %request.repo, cursor = ?request.cursor))]
    async fn pull_request_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let url = format!("{}/repos/{}/{}/pulls", self.base_url, request.repo.owner, request.repo.name);
        let page = page_number(request, &url)?;
        let query = [
            ("state", "all".to_string()),
            ("sort", "updated".to_string()),
            ("direction", "desc".to_string()),
            ("per_page", self.page_size.to_string()),
            ("page", page.to_string()),
        ];

        let response = self.send(&url, &query, request.etag.as_deref()).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("pull request listing not modified");
            return Ok(Page {
                etag: request.etag.clone(),
                not_modified: true,
                ..Page::empty(Cursor::page(page))
            });
        }
        let etag = header_string(response.headers(), ETAG);
        let has_next = link_has_next(response.headers());
        let items: Vec<PullResponse> = Self::decode(&url, response).await?;
        let full = items.len() as u32 >= self.page_size;

        let mut records = Vec::new();
        let mut reached_since = false;
        for item in items {
            // Sorted by most recently updated, so everything after this is older still.
            if let (Some(since), Some(updated)) = (request.since, item.updated_at) {
                if updated < since {
                    reached_since = true;
                    break;
                }
            }
            if !item.is_by(&self.user) {
                continue;
            }
            if let (Some(until), Some(created)) = (request.until, item.created_at) {
                if created > until {
                    continue;
                }
            }
            records.push(RawRecord::PullRequest(item.into_pull_request(request.repo.clone())));
        }

        let next = (has_next && full && !reached_since).then(|| Cursor::page(page + 1));
        debug!(records = records.len(), has_next = next.is_some(), "fetched pull request page");
        Ok(Page {
            records,
            cursor: Cursor::page(page),
            next,
            etag,
            not_modified: false,
            warnings: Vec::new(),
        })
    }

    #[instrument(skip(self, request), fields(repo = %request.repo, cursor = ?request.cursor))]
    async fn commit_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        let url = format!("{}/repos/{}/{}/commits", self.base_url, request.repo.owner, request.repo.name);
        let page = page_number(request, &url)?;
        let mut query = vec![
            ("author", self.user.clone()),
            ("per_page", self.page_size.to_string()),
            ("page", page.to_string()),
        ];
        if let Some(since) = request.since {
            query.push(("since", since.to_rfc3339()));
        }
        if let Some(until) = request.until {
            query.push(("until", until.to_rfc3339()));
        }

        let response = self.send(&url, &query, request.etag.as_deref()).await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("commit listing not modified");
            return Ok(Page {
                etag: request.etag.clone(),
                not_modified: true,
                ..Page::empty(Cursor::page(page))
            });
        }
        let etag = header_string(response.headers(), ETAG);
        let has_next = link_has_next(response.headers());
        let items: Vec<CommitResponse> = Self::decode(&url, response).await?;
        let full = items.len() as u32 >= self.page_size;

        let records: Vec<RawRecord> = items
            .into_iter()
            .map(|item| RawRecord::Commit(item.into_commit(request.repo.clone())))
            .collect();

        let next = (has_next && full).then(|| Cursor::page(page + 1));
        debug!(records = records.len(), has_next = next.is_some(), "fetched commit page");
        Ok(Page {
            records,
            cursor: Cursor::page(page),
            next,
            etag,
            not_modified: false,
            warnings: Vec::new(),
        })
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

#[async_trait]
impl FetchClient for ApiFetcher {
    fn source(&self) -> Source {
        Source::Api
    }

    async fn fetch_page(&self, request: &PageRequest) -> Result<Page, FetchError> {
        match request.kind {
            EntityKind::PullRequests => self.pull_request_page(request).await,
            EntityKind::Commits => self.commit_page(request).await,
        }
    }

    #[instrument(skip(self, repo), fields(repo = %repo))]
    async fn pr_detail(&self, repo: &RepoId, number: u64) -> Result<RawRecord, FetchError> {
        let pull_url = format!("{}/repos/{}/{}/pulls/{number}", self.base_url, repo.owner, repo.name);
        let detail: PullResponse = self.get_json(&pull_url, &[]).await?;
        let reviews: Vec<ReviewResponse> = self.get_all(&format!("{pull_url}/reviews")).await?;
        let commits: Vec<CommitResponse> = self.get_all(&format!("{pull_url}/commits")).await?;

        let mut pr = detail.into_pull_request(repo.clone());

        let reviews: Vec<Review> = reviews.into_iter().filter_map(|r| r.into_review(number)).collect();
        let reviewers: BTreeSet<String> = reviews.iter().map(|r| r.reviewer.clone()).collect();
        pr.reviewers = Some(reviewers.into_iter().collect());
        pr.reviews = Some(reviews);

        let mut commit_times: Vec<DateTime<Utc>> = commits
            .iter()
            .filter_map(|c| c.commit.committer.as_ref().and_then(|s| s.date))
            .collect();
        commit_times.sort();
        pr.commit_times = Some(commit_times);

        debug!(
            reviews = pr.reviews.as_ref().map_or(0, Vec::len),
            commits = pr.commit_times.as_ref().map_or(0, Vec::len),
            "fetched pull request detail"
        );
        Ok(RawRecord::PullRequest(pr))
    }

    async fn commit_detail(&self, repo: &RepoId, sha: &str) -> Result<Option<RawRecord>, FetchError> {
        let url = format!("{}/repos/{}/{}/commits/{sha}", self.base_url, repo.owner, repo.name);
        let detail: CommitResponse = self.get_json(&url, &[]).await?;
        Ok(Some(RawRecord::Commit(detail.into_commit(repo.clone()))))
    }
}
