//! Extraction of pull request data from GitHub web UI pages.
//!
//! Everything here is a pure function over HTML text so it can be tested against
//! captured pages without a browser.

use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use thiserror::Error;

use crate::model::{PrState, PullRequest, RepoId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("page has no search results container")]
    MissingResults,

    #[error("search row {index}: {reason}")]
    Row { index: usize, reason: String },

    #[error("pull request page has no title")]
    MissingTitle,
}

static ROW_PULL_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"href="/([\w.-]+)/([\w.-]+)/pull/(\d+)""#).expect("invalid regex"));
static SEARCH_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="search-title"[^>]*>([^<]+)<"#).expect("invalid regex"));
static ISSUE_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="js-issue-title[^"]*"[^>]*>([^<]+)<"#).expect("invalid regex"));
static STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"State--(merged|closed|open|draft)\b").expect("invalid regex"));
static AUTHOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="author"[^>]*>([^<]+)<"#).expect("invalid regex"));
static TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<relative-time data-kind="(created|updated)" datetime="([^"]+)""#).expect("invalid regex")
});
static LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="IssueLabel"[^>]*>([^<]+)<"#).expect("invalid regex"));
static COMMENT_COUNT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="comment-count"[^>]*>\s*([\d,]+)"#).expect("invalid regex"));
static HEAD_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="commit-ref head-ref"[^>]*>([^<]+)<"#).expect("invalid regex"));
static BASE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"class="commit-ref base-ref"[^>]*>([^<]+)<"#).expect("invalid regex"));
static DIFFSTAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)class="diffstat".*?\+([\d,]+).*?[−-]([\d,]+)"#).expect("invalid regex"));
static REACTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)data-reaction="([A-Z_]+)".*?js-discussion-reaction-group-count">\s*([\d,]+)"#)
        .expect("invalid regex")
});
static LOGIN_FORM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<form[^>]*action="/(?:session|login)""#).expect("invalid regex"));

const RESULTS_MARKER: &str = r#"data-testid="results-list""#;
const EMPTY_MARKER: &str = r#"data-testid="blankslate""#;
const ROW_MARKER: &str = r#"data-testid="issue-row""#;
const THREAD_MARKER: &str = "js-resolvable-timeline-thread-container";

/// One pull request row of a search results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRow {
    pub repo: RepoId,
    pub number: u64,
    pub title: Option<String>,
    pub state: Option<PrState>,
    pub is_draft: Option<bool>,
    pub author: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub labels: BTreeSet<String>,
    pub comment_count: Option<u64>,
}

impl SearchRow {
    pub fn into_pull_request(self) -> PullRequest {
        let mut pr = PullRequest::new(self.repo, self.number);
        pr.title = self.title;
        pr.state = self.state;
        pr.is_draft = self.is_draft;
        pr.author = self.author;
        pr.created_at = self.created_at;
        pr.updated_at = self.updated_at;
        pr.labels = Some(self.labels);
        pr.comment_count = self.comment_count;
        pr
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPage {
    pub rows: Vec<SearchRow>,
    pub has_next: bool,
}

/// Whether the page offers a `rel="next"` pagination link.
pub fn has_next_page(html: &str) -> bool {
    html.contains(r#"rel="next""#)
}

/// Whether a loaded page is GitHub's sign-in page rather than the requested one.
pub fn is_login_page(final_path: &str, html: &str) -> bool {
    final_path.starts_with("/login") || final_path.starts_with("/session") || LOGIN_FORM.is_match(html)
}

pub fn parse_search_page(html: &str) -> Result<SearchPage, ParseError> {
    if !html.contains(RESULTS_MARKER) {
        if html.contains(EMPTY_MARKER) {
            return Ok(SearchPage {
                rows: Vec::new(),
                has_next: false,
            });
        }
        return Err(ParseError::MissingResults);
    }

    let rows = html
        .split(ROW_MARKER)
        .skip(1)
        .enumerate()
        .map(|(index, fragment)| parse_search_row(index, fragment))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(SearchPage {
        rows,
        has_next: has_next_page(html),
    })
}

fn parse_search_row(index: usize, fragment: &str) -> Result<SearchRow, ParseError> {
    let link = ROW_PULL_LINK.captures(fragment).ok_or_else(|| ParseError::Row {
        index,
        reason: "no pull request link".to_string(),
    })?;
    let number = link[3].parse().map_err(|_| ParseError::Row {
        index,
        reason: format!("invalid pull request number {}", &link[3]),
    })?;
    let (state, is_draft) = state_of(fragment);
    let (created_at, updated_at) = timestamps(fragment);

    Ok(SearchRow {
        repo: RepoId::new(&link[1], &link[2]),
        number,
        title: first_text(&SEARCH_TITLE, fragment),
        state,
        is_draft,
        author: first_text(&AUTHOR, fragment),
        created_at,
        updated_at,
        labels: LABEL.captures_iter(fragment).map(|c| decode_entities(c[1].trim())).collect(),
        comment_count: COMMENT_COUNT.captures(fragment).and_then(|c| parse_count(&c[1])),
    })
}

/// Fields of a pull request conversation page, including engagement the API does not
/// report in a single call.
pub fn parse_pr_page(html: &str, repo: &RepoId, number: u64) -> Result<PullRequest, ParseError> {
    let title = first_text(&ISSUE_TITLE, html).ok_or(ParseError::MissingTitle)?;
    let (state, is_draft) = state_of(html);
    let (created_at, updated_at) = timestamps(html);

    let mut reactions: BTreeMap<String, u64> = BTreeMap::new();
    for captures in REACTION.captures_iter(html) {
        if let Some(count) = parse_count(&captures[2]) {
            *reactions.entry(captures[1].to_string()).or_default() += count;
        }
    }

    let mut pr = PullRequest::new(repo.clone(), number);
    pr.title = Some(title);
    pr.state = state;
    pr.is_draft = is_draft;
    pr.author = first_text(&AUTHOR, html);
    pr.created_at = created_at;
    pr.updated_at = updated_at;
    pr.head_branch = first_text(&HEAD_REF, html).map(|r| match r.split_once(':') {
        Some((_, branch)) => branch.to_string(),
        None => r,
    });
    pr.base_branch = first_text(&BASE_REF, html);
    if let Some(stat) = DIFFSTAT.captures(html) {
        pr.additions = parse_count(&stat[1]);
        pr.deletions = parse_count(&stat[2]);
    }
    pr.labels = Some(LABEL.captures_iter(html).map(|c| decode_entities(c[1].trim())).collect());
    pr.review_thread_count = Some(html.matches(THREAD_MARKER).count() as u64);
    pr.reaction_count = Some(reactions.values().sum());
    pr.reactions = Some(reactions);
    Ok(pr)
}

/// State badge of a row or page. Drafts are open pull requests.
fn state_of(html: &str) -> (Option<PrState>, Option<bool>) {
    match STATE.captures(html).and_then(|c| c.get(1)).map(|m| m.as_str()) {
        Some("merged") => (Some(PrState::Merged), Some(false)),
        Some("closed") => (Some(PrState::Closed), None),
        Some("open") => (Some(PrState::Open), Some(false)),
        Some("draft") => (Some(PrState::Open), Some(true)),
        _ => (None, None),
    }
}

fn timestamps(html: &str) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    let mut created = None;
    let mut updated = None;
    for captures in TIMESTAMP.captures_iter(html) {
        let Ok(at) = DateTime::parse_from_rfc3339(&captures[2]) else {
            continue;
        };
        let slot = if &captures[1] == "created" { &mut created } else { &mut updated };
        slot.get_or_insert(at.with_timezone(&Utc));
    }
    (created, updated)
}

fn first_text(pattern: &Regex, html: &str) -> Option<String> {
    pattern
        .captures(html)
        .map(|c| decode_entities(c[1].trim()))
        .filter(|s| !s.is_empty())
}

/// Counts are rendered with thousands separators.
fn parse_count(text: &str) -> Option<u64> {
    text.replace(',', "").parse().ok()
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}
