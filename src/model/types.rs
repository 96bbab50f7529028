use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::ModelError;

/// A repository identified by its owner (organization or user) and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoId {
    pub owner: String,
    pub name: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Parse `owner/name`.
    pub fn parse(full_name: &str) -> Result<Self, ModelError> {
        let (owner, name) = full_name
            .trim()
            .split_once('/')
            .ok_or_else(|| ModelError::InvalidRepo(full_name.to_string()))?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(ModelError::InvalidRepo(full_name.to_string()));
        }
        Ok(Self::new(owner, name))
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// Where a raw record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Api,
    Scrape,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Api => write!(f, "api"),
            Source::Scrape => write!(f, "scrape"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    PullRequests,
    Commits,
}

impl EntityKind {
    pub const ALL: [EntityKind; 2] = [EntityKind::PullRequests, EntityKind::Commits];
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::PullRequests => write!(f, "pull_requests"),
            EntityKind::Commits => write!(f, "commits"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl fmt::Display for PrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrState::Open => write!(f, "open"),
            PrState::Closed => write!(f, "closed"),
            PrState::Merged => write!(f, "merged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewOutcome {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
}

/// A single submitted review on a pull request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub pr_number: u64,
    pub reviewer: String,
    pub outcome: ReviewOutcome,
    pub submitted_at: DateTime<Utc>,
}

/// Review outcome tallies for one pull request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReviewCounts {
    pub approved: u64,
    pub changes_requested: u64,
    pub commented: u64,
    pub dismissed: u64,
}

impl ReviewCounts {
    pub fn tally<'a>(reviews: impl IntoIterator<Item = &'a Review>) -> Self {
        let mut counts = ReviewCounts::default();
        for review in reviews {
            match review.outcome {
                ReviewOutcome::Approved => counts.approved += 1,
                ReviewOutcome::ChangesRequested => counts.changes_requested += 1,
                ReviewOutcome::Commented => counts.commented += 1,
                ReviewOutcome::Dismissed => counts.dismissed += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> u64 {
        self.approved + self.changes_requested + self.commented + self.dismissed
    }
}

/// A pull request as seen by one source, or as reconciled across sources.
///
/// Only `repo` and `number` are guaranteed. Every other field is `None` until some
/// source has actually reported it; a missing count is never treated as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub repo: RepoId,
    pub number: u64,
    pub title: Option<String>,
    pub state: Option<PrState>,
    pub author: Option<String>,
    pub is_draft: Option<bool>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub head_branch: Option<String>,
    pub base_branch: Option<String>,
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
    pub files_changed: Option<u64>,
    pub commit_count: Option<u64>,
    /// Timestamps of the commits pushed to this pull request, when known.
    pub commit_times: Option<Vec<DateTime<Utc>>>,
    pub labels: Option<BTreeSet<String>>,
    pub reviewers: Option<Vec<String>>,
    pub reviews: Option<Vec<Review>>,
    pub comment_count: Option<u64>,
    pub review_thread_count: Option<u64>,
    pub reaction_count: Option<u64>,
    /// Reaction name (e.g. `THUMBS_UP`) to count.
    pub reactions: Option<BTreeMap<String, u64>>,
}

impl PullRequest {
    pub fn new(repo: RepoId, number: u64) -> Self {
        Self {
            repo,
            number,
            title: None,
            state: None,
            author: None,
            is_draft: None,
            created_at: None,
            updated_at: None,
            merged_at: None,
            closed_at: None,
            head_branch: None,
            base_branch: None,
            additions: None,
            deletions: None,
            files_changed: None,
            commit_count: None,
            commit_times: None,
            labels: None,
            reviewers: None,
            reviews: None,
            comment_count: None,
            review_thread_count: None,
            reaction_count: None,
            reactions: None,
        }
    }

    /// Layer `newer` on top of `self`: fields present in `newer` win, absent ones keep
    /// the value already held. A newer `Open` state also drops close and merge times
    /// the newer observation does not report, since the pull request was reopened.
    pub fn overlay(self, newer: PullRequest) -> PullRequest {
        let reopened = newer.state == Some(PrState::Open);
        let (merged_at, closed_at) = if reopened {
            (newer.merged_at, newer.closed_at)
        } else {
            (newer.merged_at.or(self.merged_at), newer.closed_at.or(self.closed_at))
        };
        PullRequest {
            repo: self.repo,
            number: self.number,
            title: newer.title.or(self.title),
            state: newer.state.or(self.state),
            author: newer.author.or(self.author),
            is_draft: newer.is_draft.or(self.is_draft),
            created_at: newer.created_at.or(self.created_at),
            updated_at: newer.updated_at.or(self.updated_at),
            merged_at,
            closed_at,
            head_branch: newer.head_branch.or(self.head_branch),
            base_branch: newer.base_branch.or(self.base_branch),
            additions: newer.additions.or(self.additions),
            deletions: newer.deletions.or(self.deletions),
            files_changed: newer.files_changed.or(self.files_changed),
            commit_count: newer.commit_count.or(self.commit_count),
            commit_times: newer.commit_times.or(self.commit_times),
            labels: newer.labels.or(self.labels),
            reviewers: newer.reviewers.or(self.reviewers),
            reviews: newer.reviews.or(self.reviews),
            comment_count: newer.comment_count.or(self.comment_count),
            review_thread_count: newer.review_thread_count.or(self.review_thread_count),
            reaction_count: newer.reaction_count.or(self.reaction_count),
            reactions: newer.reactions.or(self.reactions),
        }
    }

    pub fn review_counts(&self) -> ReviewCounts {
        ReviewCounts::tally(self.reviews.iter().flatten())
    }

    /// Reviews left by someone other than the author. Replies by the author on their
    /// own pull request are recorded as reviews but are not review.
    pub fn peer_reviews(&self) -> impl Iterator<Item = &Review> {
        let author = self.author.as_deref();
        self.reviews
            .iter()
            .flatten()
            .filter(move |review| !author.is_some_and(|a| review.reviewer.eq_ignore_ascii_case(a)))
    }
}

/// A commit as seen by one source, or as reconciled across sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub repo: RepoId,
    pub sha: String,
    pub author: Option<String>,
    pub committed_at: Option<DateTime<Utc>>,
    pub pr_number: Option<u64>,
    pub additions: Option<u64>,
    pub deletions: Option<u64>,
    pub branch: Option<String>,
    pub message: Option<String>,
}

impl Commit {
    pub fn new(repo: RepoId, sha: impl Into<String>) -> Self {
        Self {
            repo,
            sha: sha.into(),
            author: None,
            committed_at: None,
            pr_number: None,
            additions: None,
            deletions: None,
            branch: None,
            message: None,
        }
    }

    pub fn overlay(self, newer: Commit) -> Commit {
        Commit {
            repo: self.repo,
            sha: self.sha,
            author: newer.author.or(self.author),
            committed_at: newer.committed_at.or(self.committed_at),
            pr_number: newer.pr_number.or(self.pr_number),
            additions: newer.additions.or(self.additions),
            deletions: newer.deletions.or(self.deletions),
            branch: newer.branch.or(self.branch),
            message: newer.message.or(self.message),
        }
    }
}

/// Canonical identity of a contribution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordKey {
    PullRequest { repo: RepoId, number: u64 },
    Commit { repo: RepoId, sha: String },
}

impl RecordKey {
    pub fn repo(&self) -> &RepoId {
        match self {
            RecordKey::PullRequest { repo, .. } | RecordKey::Commit { repo, .. } => repo,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            RecordKey::PullRequest { .. } => EntityKind::PullRequests,
            RecordKey::Commit { .. } => EntityKind::Commits,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::PullRequest { repo, number } => write!(f, "{repo}#{number}"),
            RecordKey::Commit { repo, sha } => {
                write!(f, "{repo}@{}", sha.get(..7).unwrap_or(sha))
            }
        }
    }
}

/// A partial record as delivered by a fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RawRecord {
    PullRequest(PullRequest),
    Commit(Commit),
}

impl RawRecord {
    pub fn key(&self) -> RecordKey {
        match self {
            RawRecord::PullRequest(pr) => RecordKey::PullRequest {
                repo: pr.repo.clone(),
                number: pr.number,
            },
            RawRecord::Commit(commit) => RecordKey::Commit {
                repo: commit.repo.clone(),
                sha: commit.sha.clone(),
            },
        }
    }

    /// The timestamp incremental fetches are keyed on.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        match self {
            RawRecord::PullRequest(pr) => pr.updated_at.or(pr.created_at),
            RawRecord::Commit(commit) => commit.committed_at,
        }
    }

    /// Layer a same-identity record on top of this one. Mismatched kinds keep `self`.
    pub fn overlay(self, newer: RawRecord) -> RawRecord {
        match (self, newer) {
            (RawRecord::PullRequest(old), RawRecord::PullRequest(new)) => {
                RawRecord::PullRequest(old.overlay(new))
            }
            (RawRecord::Commit(old), RawRecord::Commit(new)) => RawRecord::Commit(old.overlay(new)),
            (old, _) => old,
        }
    }

    pub fn as_pull_request(&self) -> Option<&PullRequest> {
        match self {
            RawRecord::PullRequest(pr) => Some(pr),
            RawRecord::Commit(_) => None,
        }
    }

    pub fn as_commit(&self) -> Option<&Commit> {
        match self {
            RawRecord::Commit(commit) => Some(commit),
            RawRecord::PullRequest(_) => None,
        }
    }
}
