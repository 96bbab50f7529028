pub mod buckets;
pub mod types;

pub use types::{
    ApprovalRate, Bucketing, CollaborationEdge, MetricsOptions, MetricsReport, PrMetrics, RepositoryBreakdown,
    ReviewerRank, Summary, TimeBucket,
};

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, instrument};

use crate::model::{Commit, PrState, PullRequest, RepoId, ReviewCounts, ReviewOutcome};
use crate::store::ContributionLedger;

/// Derive the full metrics report from a ledger. Pure; recomputed from scratch each time.
#[instrument(skip_all, fields(records = ledger.len(), bucketing = %options.bucketing))]
pub fn compute_metrics(ledger: &ContributionLedger, options: &MetricsOptions) -> MetricsReport {
    let prs: Vec<&PullRequest> = ledger.pull_requests().collect();
    let commits: Vec<&Commit> = ledger.commits().collect();

    let pull_requests: Vec<PrMetrics> = prs.iter().map(|pr| pr_metrics(pr)).collect();

    let overall_counts = ReviewCounts::tally(prs.iter().flat_map(|pr| pr.peer_reviews()));
    let (collaboration, top_reviewers) = collaboration(&prs);

    let report = MetricsReport {
        bucketing: options.bucketing,
        utc_offset_minutes: options.utc_offset.local_minus_utc() / 60,
        summary: summary(&prs, &commits, &pull_requests, options),
        approval_rate: ApprovalRate::from_counts(overall_counts.approved, overall_counts.total()),
        repositories: repository_breakdown(&prs, &commits),
        collaboration,
        top_reviewers,
        time_series: time_series(&prs, &commits, options),
        pull_requests,
    };
    debug!(
        pull_requests = report.pull_requests.len(),
        buckets = report.time_series.len(),
        "computed metrics"
    );
    report
}

fn add_counts(a: ReviewCounts, b: ReviewCounts) -> ReviewCounts {
    ReviewCounts {
        approved: a.approved + b.approved,
        changes_requested: a.changes_requested + b.changes_requested,
        commented: a.commented + b.commented,
        dismissed: a.dismissed + b.dismissed,
    }
}

fn pr_metrics(pr: &PullRequest) -> PrMetrics {
    let first_review = pr.peer_reviews().map(|r| r.submitted_at).min();
    PrMetrics {
        repo: pr.repo.clone(),
        number: pr.number,
        title: pr.title.clone(),
        state: pr.state,
        time_to_merge_secs: time_to_merge(pr),
        time_to_first_review_secs: first_review.zip(pr.created_at).map(|(r, c)| (r - c).num_seconds()),
        review_cycles: review_cycles(pr),
        changes_requested: ReviewCounts::tally(pr.peer_reviews()).changes_requested,
        size: pr.additions.zip(pr.deletions).map(|(a, d)| a + d),
    }
}

/// `merged_at - created_at`; absent for pull requests that were never merged.
pub fn time_to_merge(pr: &PullRequest) -> Option<i64> {
    pr.merged_at.zip(pr.created_at).map(|(m, c)| (m - c).num_seconds())
}

/// Number of review rounds: zero without reviews, otherwise one plus a round for every
/// commit that answers outstanding change requests. Several requests made before the
/// same commit open a single round.
pub fn review_cycles(pr: &PullRequest) -> u32 {
    let mut requests: Vec<DateTime<Utc>> = Vec::new();
    let mut reviewed = false;
    for review in pr.peer_reviews() {
        reviewed = true;
        if review.outcome == ReviewOutcome::ChangesRequested {
            requests.push(review.submitted_at);
        }
    }
    if !reviewed {
        return 0;
    }
    requests.sort_unstable();
    let mut commit_times = pr.commit_times.clone().unwrap_or_default();
    commit_times.sort_unstable();

    let mut cycles = 1;
    let mut pending = requests.into_iter().peekable();
    for commit in commit_times {
        let mut answered = false;
        while pending.next_if(|&request| request < commit).is_some() {
            answered = true;
        }
        if answered {
            cycles += 1;
        }
    }
    cycles
}

/// Author to reviewer edges, and reviewers ranked by how often they reviewed.
fn collaboration(prs: &[&PullRequest]) -> (Vec<CollaborationEdge>, Vec<ReviewerRank>) {
    let mut edges: BTreeMap<(String, String), u64> = BTreeMap::new();
    let mut reviewers: BTreeMap<String, (u64, DateTime<Utc>)> = BTreeMap::new();

    for pr in prs {
        let Some(author) = pr.author.as_deref() else {
            continue;
        };
        for review in pr.peer_reviews() {
            *edges.entry((author.to_string(), review.reviewer.clone())).or_default() += 1;
            let entry = reviewers
                .entry(review.reviewer.clone())
                .or_insert((0, review.submitted_at));
            entry.0 += 1;
            entry.1 = entry.1.min(review.submitted_at);
        }
    }

    let mut edges: Vec<CollaborationEdge> = edges
        .into_iter()
        .map(|((author, reviewer), weight)| CollaborationEdge {
            author,
            reviewer,
            weight,
        })
        .collect();
    edges.sort_by(|a, b| {
        b.weight
            .cmp(&a.weight)
            .then_with(|| a.author.cmp(&b.author))
            .then_with(|| a.reviewer.cmp(&b.reviewer))
    });

    let mut ranking: Vec<ReviewerRank> = reviewers
        .into_iter()
        .map(|(reviewer, (reviews, first_review_at))| ReviewerRank {
            reviewer,
            reviews,
            first_review_at,
        })
        .collect();
    ranking.sort_by(|a, b| {
        b.reviews
            .cmp(&a.reviews)
            .then_with(|| a.first_review_at.cmp(&b.first_review_at))
            .then_with(|| a.reviewer.cmp(&b.reviewer))
    });

    (edges, ranking)
}

fn repository_breakdown(prs: &[&PullRequest], commits: &[&Commit]) -> Vec<RepositoryBreakdown> {
    let mut repos: BTreeMap<RepoId, (RepositoryBreakdown, ReviewCounts)> = BTreeMap::new();
    fn slot<'a>(
        repos: &'a mut BTreeMap<RepoId, (RepositoryBreakdown, ReviewCounts)>,
        repo: &RepoId,
    ) -> &'a mut (RepositoryBreakdown, ReviewCounts) {
        repos.entry(repo.clone()).or_insert_with(|| {
            (
                RepositoryBreakdown {
                    repo: repo.clone(),
                    pull_requests: 0,
                    merged: 0,
                    commits: 0,
                    lines_added: 0,
                    lines_deleted: 0,
                    approval_rate: None,
                },
                ReviewCounts::default(),
            )
        })
    }

    for pr in prs {
        let (breakdown, counts) = slot(&mut repos, &pr.repo);
        breakdown.pull_requests += 1;
        if pr.state == Some(PrState::Merged) {
            breakdown.merged += 1;
        }
        breakdown.lines_added += pr.additions.unwrap_or(0);
        breakdown.lines_deleted += pr.deletions.unwrap_or(0);
        *counts = add_counts(*counts, ReviewCounts::tally(pr.peer_reviews()));
    }
    for commit in commits {
        slot(&mut repos, &commit.repo).0.commits += 1;
    }

    repos
        .into_values()
        .map(|(mut breakdown, counts)| {
            breakdown.approval_rate = ApprovalRate::from_counts(counts.approved, counts.total());
            breakdown
        })
        .collect()
}

fn summary(prs: &[&PullRequest], commits: &[&Commit], metrics: &[PrMetrics], options: &MetricsOptions) -> Summary {
    let count_state = |state: PrState| prs.iter().filter(|pr| pr.state == Some(state)).count() as u64;
    let merged = count_state(PrState::Merged);
    let total = prs.len() as u64;

    let mut activity: BTreeMap<&RepoId, u64> = BTreeMap::new();
    for repo in prs.iter().map(|pr| &pr.repo).chain(commits.iter().map(|c| &c.repo)) {
        *activity.entry(repo).or_default() += 1;
    }
    // Ties go to the repository that sorts first.
    let most_active_repository = activity
        .iter()
        .fold(None::<(&RepoId, u64)>, |best, (repo, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((*repo, count)),
        })
        .map(|(repo, _)| repo.clone());

    let sizes: Vec<u64> = metrics.iter().filter_map(|m| m.size).collect();
    let average_pr_size = (!sizes.is_empty()).then(|| sizes.iter().sum::<u64>() as f64 / sizes.len() as f64);

    let mut merge_times: Vec<i64> = metrics.iter().filter_map(|m| m.time_to_merge_secs).collect();
    merge_times.sort_unstable();

    let reviewers_per_pr: Vec<BTreeSet<String>> = prs
        .iter()
        .map(|pr| pr.peer_reviews().map(|r| r.reviewer.to_ascii_lowercase()).collect())
        .collect();
    let prs_with_reviews = reviewers_per_pr.iter().filter(|r| !r.is_empty()).count() as u64;
    let unique_reviewers = reviewers_per_pr.iter().flatten().collect::<BTreeSet<_>>().len() as u64;
    let comment_counts: Vec<u64> = prs.iter().filter_map(|pr| pr.comment_count).collect();

    let active_days: BTreeSet<NaiveDate> = prs
        .iter()
        .filter_map(|pr| pr.created_at)
        .chain(commits.iter().filter_map(|c| c.committed_at))
        .map(|at| buckets::local_date(at, options.utc_offset))
        .collect();

    Summary {
        pull_requests: total,
        merged,
        closed: count_state(PrState::Closed),
        open: count_state(PrState::Open),
        merge_rate: (total > 0).then(|| merged as f64 / total as f64),
        commits: commits.len() as u64,
        lines_added: prs.iter().filter_map(|pr| pr.additions).sum(),
        lines_deleted: prs.iter().filter_map(|pr| pr.deletions).sum(),
        repositories_touched: activity.len() as u64,
        most_active_repository,
        average_pr_size,
        median_time_to_merge_secs: median(&merge_times),
        longest_streak_days: longest_streak(&active_days),
        prs_with_reviews,
        review_rate: (total > 0).then(|| prs_with_reviews as f64 / total as f64),
        average_reviewers_per_pr: (total > 0)
            .then(|| reviewers_per_pr.iter().map(BTreeSet::len).sum::<usize>() as f64 / total as f64),
        average_comments_per_pr: (!comment_counts.is_empty())
            .then(|| comment_counts.iter().sum::<u64>() as f64 / comment_counts.len() as f64),
        unique_reviewers,
    }
}

fn median(sorted: &[i64]) -> Option<i64> {
    match sorted.len() {
        0 => None,
        n if n % 2 == 1 => Some(sorted[n / 2]),
        n => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2),
    }
}

fn longest_streak(days: &BTreeSet<NaiveDate>) -> u32 {
    let mut longest = 0;
    let mut current = 0;
    let mut previous: Option<NaiveDate> = None;
    for &day in days {
        current = match previous.and_then(|p| p.succ_opt()) {
            Some(expected) if expected == day => current + 1,
            _ => 1,
        };
        longest = longest.max(current);
        previous = Some(day);
    }
    longest
}

/// Contiguous buckets from the earliest to the latest activity, empty ones included.
fn time_series(prs: &[&PullRequest], commits: &[&Commit], options: &MetricsOptions) -> Vec<TimeBucket> {
    let bucketing = options.bucketing;
    let start_of = |at: DateTime<Utc>| buckets::bucket_start(buckets::local_date(at, options.utc_offset), bucketing);
    let net = |additions: Option<u64>, deletions: Option<u64>| {
        additions.unwrap_or(0) as i64 - deletions.unwrap_or(0) as i64
    };

    let mut filled: BTreeMap<NaiveDate, TimeBucket> = BTreeMap::new();
    fn bucket(filled: &mut BTreeMap<NaiveDate, TimeBucket>, start: NaiveDate, bucketing: Bucketing) -> &mut TimeBucket {
        filled.entry(start).or_insert_with(|| TimeBucket {
            start,
            label: buckets::label(start, bucketing),
            pull_requests: 0,
            commits: 0,
            pr_net_lines: 0,
            commit_net_lines: 0,
        })
    }

    for pr in prs {
        if let Some(created) = pr.created_at {
            let b = bucket(&mut filled, start_of(created), bucketing);
            b.pull_requests += 1;
            b.pr_net_lines += net(pr.additions, pr.deletions);
        }
    }
    for commit in commits {
        if let Some(at) = commit.committed_at {
            let b = bucket(&mut filled, start_of(at), bucketing);
            b.commits += 1;
            b.commit_net_lines += net(commit.additions, commit.deletions);
        }
    }

    let (Some(&first), Some(&last)) = (filled.keys().next(), filled.keys().next_back()) else {
        return Vec::new();
    };
    let mut cursor = Some(first);
    while let Some(start) = cursor.filter(|s| *s <= last) {
        bucket(&mut filled, start, bucketing);
        cursor = buckets::next_bucket(start, bucketing);
    }

    filled.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge;
    use crate::model::{RawRecord, Review, Source};
    use chrono::{FixedOffset, TimeZone};

    fn repo(name: &str) -> RepoId {
        RepoId::new("acme", name)
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn review(number: u64, reviewer: &str, outcome: ReviewOutcome, submitted_at: DateTime<Utc>) -> Review {
        Review {
            pr_number: number,
            reviewer: reviewer.to_string(),
            outcome,
            submitted_at,
        }
    }

    fn pr(name: &str, number: u64, created_day: u32) -> PullRequest {
        let mut pr = PullRequest::new(repo(name), number);
        pr.author = Some("octocat".to_string());
        pr.state = Some(PrState::Open);
        pr.created_at = Some(at(created_day, 10));
        pr
    }

    fn commit(name: &str, sha: &str, day: u32, additions: u64, deletions: u64) -> Commit {
        let mut commit = Commit::new(repo(name), sha);
        commit.committed_at = Some(at(day, 9));
        commit.additions = Some(additions);
        commit.deletions = Some(deletions);
        commit
    }

    fn ledger(prs: Vec<PullRequest>, commits: Vec<Commit>) -> ContributionLedger {
        let records = prs
            .into_iter()
            .map(RawRecord::PullRequest)
            .chain(commits.into_iter().map(RawRecord::Commit))
            .map(|raw| merge(None, raw, Source::Api).unwrap())
            .collect();
        ContributionLedger::new(records)
    }

    fn options(bucketing: Bucketing) -> MetricsOptions {
        MetricsOptions {
            bucketing,
            ..MetricsOptions::default()
        }
    }

    #[test]
    fn test_time_to_merge() {
        let mut merged = pr("widgets", 1, 1);
        merged.state = Some(PrState::Merged);
        merged.merged_at = Some(Utc.with_ymd_and_hms(2024, 3, 2, 12, 30, 0).unwrap());
        let open = pr("widgets", 2, 1);

        let report = compute_metrics(&ledger(vec![merged, open], vec![]), &options(Bucketing::Week));
        assert_eq!(report.pull_requests[0].time_to_merge_secs, Some(26 * 3600 + 30 * 60));
        assert_eq!(report.pull_requests[1].time_to_merge_secs, None);
        assert_eq!(report.summary.median_time_to_merge_secs, Some(95_400));
    }

    #[test]
    fn test_review_cycles() {
        let mut none = pr("widgets", 1, 1);
        none.reviews = Some(vec![]);
        assert_eq!(review_cycles(&none), 0);
        assert_eq!(review_cycles(&pr("widgets", 1, 1)), 0);

        let mut answered = pr("widgets", 2, 1);
        answered.reviews = Some(vec![
            review(2, "bob", ReviewOutcome::ChangesRequested, at(2, 9)),
            review(2, "bob", ReviewOutcome::Approved, at(3, 9)),
        ]);
        answered.commit_times = Some(vec![at(1, 10), at(2, 15)]);
        assert_eq!(review_cycles(&answered), 2);

        let mut unanswered = answered.clone();
        unanswered.commit_times = Some(vec![at(1, 10)]);
        assert_eq!(review_cycles(&unanswered), 1);
    }

    #[test]
    fn test_requests_before_one_commit_are_one_round() {
        let mut reworked = pr("widgets", 3, 1);
        reworked.reviews = Some(vec![
            review(3, "bob", ReviewOutcome::ChangesRequested, at(2, 9)),
            review(3, "carol", ReviewOutcome::ChangesRequested, at(3, 9)),
            review(3, "bob", ReviewOutcome::Approved, at(5, 9)),
        ]);
        reworked.commit_times = Some(vec![at(1, 9), at(4, 9)]);
        assert_eq!(review_cycles(&reworked), 2);

        // A second request answered by a later push opens another round.
        reworked
            .reviews
            .as_mut()
            .unwrap()
            .push(review(3, "carol", ReviewOutcome::ChangesRequested, at(6, 9)));
        reworked.commit_times.as_mut().unwrap().push(at(7, 9));
        assert_eq!(review_cycles(&reworked), 3);
        assert_eq!(pr_metrics(&reworked).changes_requested, 3);
    }

    #[test]
    fn test_author_replies_are_not_reviews() {
        let mut replied = pr("widgets", 4, 1);
        replied.reviews = Some(vec![
            review(4, "octocat", ReviewOutcome::Commented, at(1, 11)),
            review(4, "bob", ReviewOutcome::Approved, at(1, 13)),
        ]);
        let report = compute_metrics(&ledger(vec![replied], vec![]), &options(Bucketing::Day));

        assert_eq!(report.pull_requests[0].time_to_first_review_secs, Some(3 * 3600));
        assert_eq!(report.approval_rate.unwrap().rate, 1.0);
        assert_eq!(report.summary.unique_reviewers, 1);

        let mut only_author = pr("widgets", 5, 1);
        only_author.reviews = Some(vec![review(5, "octocat", ReviewOutcome::Commented, at(1, 11))]);
        assert_eq!(review_cycles(&only_author), 0);
    }

    #[test]
    fn test_review_insights() {
        let mut reviewed = pr("widgets", 1, 1);
        reviewed.comment_count = Some(4);
        reviewed.reviews = Some(vec![
            review(1, "bob", ReviewOutcome::Commented, at(1, 12)),
            review(1, "Bob", ReviewOutcome::Approved, at(1, 14)),
            review(1, "carol", ReviewOutcome::Approved, at(1, 15)),
        ]);
        let mut second = pr("widgets", 2, 2);
        second.comment_count = Some(0);
        second.reviews = Some(vec![review(2, "bob", ReviewOutcome::Approved, at(2, 12))]);
        let unreviewed = pr("gadgets", 3, 3);

        let summary =
            compute_metrics(&ledger(vec![reviewed, second, unreviewed], vec![]), &options(Bucketing::Week)).summary;
        assert_eq!(summary.prs_with_reviews, 2);
        assert_eq!(summary.review_rate, Some(2.0 / 3.0));
        // Distinct reviewers: 2 + 1 + 0 over three pull requests.
        assert_eq!(summary.average_reviewers_per_pr, Some(1.0));
        // Only pull requests with a known comment count are averaged.
        assert_eq!(summary.average_comments_per_pr, Some(2.0));
        assert_eq!(summary.unique_reviewers, 2);
    }

    #[test]
    fn test_first_review_and_approval_rate() {
        let mut reviewed = pr("widgets", 1, 1);
        reviewed.reviews = Some(vec![
            review(1, "bob", ReviewOutcome::Approved, at(1, 14)),
            review(1, "carol", ReviewOutcome::Commented, at(1, 12)),
        ]);
        let report = compute_metrics(&ledger(vec![reviewed, pr("gadgets", 2, 1)], vec![]), &options(Bucketing::Day));

        let widgets = report.pull_requests.iter().find(|m| m.number == 1).unwrap();
        assert_eq!(widgets.time_to_first_review_secs, Some(2 * 3600));
        assert_eq!(report.approval_rate.unwrap().rate, 0.5);

        let gadgets = report.repositories.iter().find(|r| r.repo == repo("gadgets")).unwrap();
        assert_eq!(gadgets.approval_rate, None);
    }

    #[test]
    fn test_reviewer_ranking_ties() {
        let mut first = pr("widgets", 1, 1);
        first.reviews = Some(vec![
            review(1, "zed", ReviewOutcome::Approved, at(2, 9)),
            review(1, "amy", ReviewOutcome::Approved, at(3, 9)),
            review(1, "octocat", ReviewOutcome::Commented, at(2, 8)),
        ]);
        let mut second = pr("widgets", 2, 4);
        second.reviews = Some(vec![
            review(2, "bob", ReviewOutcome::Approved, at(3, 9)),
            review(2, "bob", ReviewOutcome::Commented, at(5, 9)),
        ]);
        let report = compute_metrics(&ledger(vec![first, second], vec![]), &options(Bucketing::Week));

        let order: Vec<&str> = report.top_reviewers.iter().map(|r| r.reviewer.as_str()).collect();
        // bob has the most reviews; zed and amy tie on one and zed reviewed first.
        assert_eq!(order, vec!["bob", "zed", "amy"]);
        assert_eq!(report.collaboration[0].reviewer, "bob");
        assert_eq!(report.collaboration[0].weight, 2);
        assert!(report.collaboration.iter().all(|e| e.reviewer != "octocat"));
    }

    #[test]
    fn test_weekly_series_is_contiguous() {
        let mut early = pr("widgets", 1, 4);
        early.additions = Some(50);
        early.deletions = Some(10);
        let commits = vec![commit("widgets", "a", 20, 5, 1), commit("widgets", "b", 21, 1, 3)];
        let report = compute_metrics(&ledger(vec![early], commits), &options(Bucketing::Week));

        let labels: Vec<&str> = report.time_series.iter().map(|b| b.label.as_str()).collect();
        assert_eq!(labels, vec!["2024-03-04", "2024-03-11", "2024-03-18"]);
        assert_eq!(report.time_series[0].pull_requests, 1);
        assert_eq!(report.time_series[0].pr_net_lines, 40);
        assert_eq!(report.time_series[1].pull_requests, 0);
        assert_eq!(report.time_series[1].commits, 0);
        assert_eq!(report.time_series[2].commits, 2);
        assert_eq!(report.time_series[2].commit_net_lines, 2);
    }

    #[test]
    fn test_reporting_offset_moves_bucket() {
        let mut late = pr("widgets", 1, 10);
        late.created_at = Some(Utc.with_ymd_and_hms(2024, 3, 10, 23, 30, 0).unwrap());
        let options = MetricsOptions {
            bucketing: Bucketing::Week,
            utc_offset: FixedOffset::east_opt(3600).unwrap(),
        };
        let report = compute_metrics(&ledger(vec![late], vec![]), &options);
        assert_eq!(report.time_series[0].label, "2024-03-11");
        assert_eq!(report.utc_offset_minutes, 60);
    }

    #[test]
    fn test_summary() {
        let mut merged = pr("widgets", 1, 1);
        merged.state = Some(PrState::Merged);
        merged.additions = Some(100);
        merged.deletions = Some(20);
        let mut closed = pr("widgets", 2, 2);
        closed.state = Some(PrState::Closed);
        closed.additions = Some(10);
        closed.deletions = Some(10);
        let open = pr("gadgets", 3, 5);
        let commits = vec![commit("gadgets", "c", 3, 1, 1)];

        let summary = compute_metrics(&ledger(vec![merged, closed, open], commits), &options(Bucketing::Month)).summary;
        assert_eq!(summary.pull_requests, 3);
        assert_eq!((summary.merged, summary.closed, summary.open), (1, 1, 1));
        assert_eq!(summary.merge_rate, Some(1.0 / 3.0));
        assert_eq!(summary.lines_added, 110);
        assert_eq!(summary.repositories_touched, 2);
        // Two items each; the tie goes to the name that sorts first.
        assert_eq!(summary.most_active_repository, Some(repo("gadgets")));
        assert_eq!(summary.average_pr_size, Some(70.0));
        assert_eq!(summary.median_time_to_merge_secs, None);
        // Days 1, 2, 3 in a row, then 5.
        assert_eq!(summary.longest_streak_days, 3);
    }

    #[test]
    fn test_empty_ledger() {
        let report = compute_metrics(&ContributionLedger::default(), &MetricsOptions::default());
        assert!(report.pull_requests.is_empty());
        assert!(report.time_series.is_empty());
        assert!(report.repositories.is_empty());
        assert_eq!(report.approval_rate, None);
        assert_eq!(report.summary, Summary::default());
    }
}
