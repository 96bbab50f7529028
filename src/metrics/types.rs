use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{PrState, RepoId};

/// Width of the time-series buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucketing {
    Day,
    /// Weeks start on Monday.
    #[default]
    Week,
    Month,
    Quarter,
}

impl fmt::Display for Bucketing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bucketing::Day => write!(f, "day"),
            Bucketing::Week => write!(f, "week"),
            Bucketing::Month => write!(f, "month"),
            Bucketing::Quarter => write!(f, "quarter"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MetricsOptions {
    pub bucketing: Bucketing,
    /// Reporting timezone; calendar boundaries are drawn here.
    pub utc_offset: FixedOffset,
}

impl Default for MetricsOptions {
    fn default() -> Self {
        Self {
            bucketing: Bucketing::Week,
            utc_offset: Utc.fix(),
        }
    }
}

/// Derived figures for one pull request. Durations are whole seconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PrMetrics {
    pub repo: RepoId,
    pub number: u64,
    pub title: Option<String>,
    pub state: Option<PrState>,
    pub time_to_merge_secs: Option<i64>,
    pub time_to_first_review_secs: Option<i64>,
    pub review_cycles: u32,
    pub changes_requested: u64,
    /// Additions plus deletions, when both are known.
    pub size: Option<u64>,
}

/// Approved reviews over all reviews.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ApprovalRate {
    pub approved: u64,
    pub total: u64,
    pub rate: f64,
}

impl ApprovalRate {
    pub fn from_counts(approved: u64, total: u64) -> Option<Self> {
        (total > 0).then(|| Self {
            approved,
            total,
            rate: approved as f64 / total as f64,
        })
    }
}

/// Directed edge from a pull request author to someone who reviewed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollaborationEdge {
    pub author: String,
    pub reviewer: String,
    pub weight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewerRank {
    pub reviewer: String,
    pub reviews: u64,
    pub first_review_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeBucket {
    /// First calendar day of the bucket in the reporting timezone.
    pub start: NaiveDate,
    pub label: String,
    pub pull_requests: u64,
    pub commits: u64,
    pub pr_net_lines: i64,
    pub commit_net_lines: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryBreakdown {
    pub repo: RepoId,
    pub pull_requests: u64,
    pub merged: u64,
    pub commits: u64,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub approval_rate: Option<ApprovalRate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub pull_requests: u64,
    pub merged: u64,
    pub closed: u64,
    pub open: u64,
    /// Merged over all pull requests.
    pub merge_rate: Option<f64>,
    pub commits: u64,
    pub lines_added: u64,
    pub lines_deleted: u64,
    pub repositories_touched: u64,
    pub most_active_repository: Option<RepoId>,
    pub average_pr_size: Option<f64>,
    pub median_time_to_merge_secs: Option<i64>,
    /// Most consecutive calendar days with a pull request or commit.
    pub longest_streak_days: u32,
    pub prs_with_reviews: u64,
    /// Pull requests with at least one review over all pull requests.
    pub review_rate: Option<f64>,
    /// Distinct reviewers per pull request, averaged over all pull requests.
    pub average_reviewers_per_pr: Option<f64>,
    /// Over pull requests whose comment count is known.
    pub average_comments_per_pr: Option<f64>,
    pub unique_reviewers: u64,
}

/// Everything derived from one ledger. Every section is present even when empty.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub bucketing: Bucketing,
    pub utc_offset_minutes: i32,
    pub summary: Summary,
    pub pull_requests: Vec<PrMetrics>,
    pub approval_rate: Option<ApprovalRate>,
    pub repositories: Vec<RepositoryBreakdown>,
    pub collaboration: Vec<CollaborationEdge>,
    pub top_reviewers: Vec<ReviewerRank>,
    pub time_series: Vec<TimeBucket>,
}
