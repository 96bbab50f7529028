pub mod types;

pub use types::{Health, Report};

use chrono::Utc;
use colored::Colorize;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::metrics::MetricsReport;
use crate::orchestrator::{JobStatus, RunReport};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write report file: {0}")]
    FileWrite(#[from] std::io::Error),

    #[error("Failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Rows shown per ranked section in the terminal.
const TOP_N: usize = 10;

pub fn build(user: &str, acquisition: RunReport, metrics: MetricsReport) -> Report {
    Report {
        user: user.to_string(),
        generated_at: Utc::now(),
        health: Health::of(&acquisition),
        acquisition,
        metrics,
    }
}

/// Output the report to the terminal (default) or as JSON to a file.
#[instrument(skip(report), fields(user = %report.user, health = %report.health))]
pub fn output(report: &Report, json_path: Option<&Path>) -> Result<(), ReportError> {
    match json_path {
        None => {
            debug!("writing report to terminal");
            print_terminal_report(report);
            Ok(())
        }
        Some(path) => {
            debug!(path = %path.display(), "writing report to file");
            write_json_report(report, path)
        }
    }
}

fn print_terminal_report(report: &Report) {
    let metrics = &report.metrics;
    let summary = &metrics.summary;
    let run = &report.acquisition;

    println!();
    println!("Contributions by {}", report.user.bold());
    println!(
        "Jobs: {} | failed: {} | records merged: {}",
        run.jobs.len(),
        run.failed().count(),
        run.records_merged()
    );
    println!();

    println!("═══ Summary ═══");
    println!(
        "Pull requests: {} (merged {}, closed {}, open {}) | merge rate {}",
        summary.pull_requests,
        summary.merged,
        summary.closed,
        summary.open,
        percent(summary.merge_rate)
    );
    println!(
        "Commits: {} | {} {} | repositories: {}{}",
        summary.commits,
        format!("+{}", summary.lines_added).green(),
        format!("-{}", summary.lines_deleted).red(),
        summary.repositories_touched,
        summary
            .most_active_repository
            .as_ref()
            .map(|repo| format!(" (most active {repo})"))
            .unwrap_or_default()
    );
    println!(
        "Average PR size: {} | median time to merge: {} | longest streak: {} days",
        summary
            .average_pr_size
            .map(|size| format!("{size:.1} lines"))
            .unwrap_or_else(|| "n/a".to_string()),
        summary
            .median_time_to_merge_secs
            .map(format_duration)
            .unwrap_or_else(|| "n/a".to_string()),
        summary.longest_streak_days
    );
    println!("Approval rate: {}", percent(metrics.approval_rate.map(|a| a.rate)));
    println!(
        "Reviewed: {} PRs ({}) | reviewers per PR: {} | comments per PR: {} | unique reviewers: {}",
        summary.prs_with_reviews,
        percent(summary.review_rate),
        average(summary.average_reviewers_per_pr),
        average(summary.average_comments_per_pr),
        summary.unique_reviewers
    );
    println!();

    println!("═══ Repositories ═══");
    if metrics.repositories.is_empty() {
        println!("  No activity.");
    }
    for repo in &metrics.repositories {
        println!(
            "  • {}: {} PRs ({} merged), {} commits, +{} -{}, approval {}",
            repo.repo,
            repo.pull_requests,
            repo.merged,
            repo.commits,
            repo.lines_added,
            repo.lines_deleted,
            percent(repo.approval_rate.map(|a| a.rate))
        );
    }
    println!();

    if !metrics.top_reviewers.is_empty() {
        println!("═══ Top Reviewers ═══");
        for reviewer in metrics.top_reviewers.iter().take(TOP_N) {
            println!("  • {}: {} reviews", reviewer.reviewer, reviewer.reviews);
        }
        println!();
    }

    if !metrics.time_series.is_empty() {
        println!("═══ Activity by {} ═══", metrics.bucketing);
        for bucket in &metrics.time_series {
            println!(
                "  {:<10}  PRs {:>3}  commits {:>4}  net {:>+7}",
                bucket.label,
                bucket.pull_requests,
                bucket.commits,
                bucket.pr_net_lines + bucket.commit_net_lines
            );
        }
        println!();
    }

    let diagnostics: Vec<String> = run.diagnostics().map(ToString::to_string).collect();
    let failures: Vec<String> = run
        .jobs
        .iter()
        .filter_map(|job| match &job.status {
            JobStatus::Failed { reason, .. } => Some(format!("{}: {reason}", job.key)),
            _ => None,
        })
        .collect();
    if !diagnostics.is_empty() || !failures.is_empty() {
        println!("═══ Diagnostics ═══");
        for failure in &failures {
            println!("  • {} {}", "failed".red(), failure);
        }
        for diagnostic in &diagnostics {
            println!("  • {diagnostic}");
        }
        println!();
    }

    println!("═══ Acquisition: {} ═══", colorize_health(report.health));
    println!();
}

fn write_json_report(report: &Report, path: &Path) -> Result<(), ReportError> {
    let json = serde_json::to_string_pretty(report)?;
    std::fs::write(path, json)?;
    Ok(())
}

fn colorize_health(health: Health) -> colored::ColoredString {
    match health {
        Health::Complete => "COMPLETE".green().bold(),
        Health::Partial => "PARTIAL".yellow().bold(),
        Health::Failed => "FAILED".red().bold(),
    }
}

fn percent(rate: Option<f64>) -> String {
    rate.map(|r| format!("{:.1}%", r * 100.0))
        .unwrap_or_else(|| "n/a".to_string())
}

fn average(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.2}")).unwrap_or_else(|| "n/a".to_string())
}

/// Compact human duration, two most significant units.
pub fn format_duration(secs: i64) -> String {
    let sign = if secs < 0 { "-" } else { "" };
    let secs = secs.unsigned_abs();
    let (days, hours, minutes) = (secs / 86_400, secs % 86_400 / 3600, secs % 3600 / 60);
    let body = match (days, hours, minutes) {
        (0, 0, 0) => format!("{secs}s"),
        (0, 0, m) => format!("{m}m"),
        (0, h, m) => format!("{h}h {m}m"),
        (d, h, _) => format!("{d}d {h}h"),
    };
    format!("{sign}{body}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge;
    use crate::metrics::{compute_metrics, MetricsOptions};
    use crate::model::{EntityKind, PrState, PullRequest, RawRecord, RepoId, Source};
    use crate::orchestrator::{Diagnostic, JobOutcome, JobState};
    use crate::store::{CheckpointKey, ContributionLedger};
    use chrono::TimeZone;

    fn sample_run() -> RunReport {
        let key = CheckpointKey::new(RepoId::new("acme", "widgets"), EntityKind::PullRequests);
        RunReport {
            jobs: vec![JobOutcome {
                key,
                status: JobStatus::Done,
                history: vec![JobState::Idle, JobState::Fetching, JobState::Done],
                pages: 1,
                records_merged: 1,
                diagnostics: vec![Diagnostic::Throttled {
                    source: Source::Api,
                    wait_secs: 60,
                }],
            }],
        }
    }

    fn sample_metrics() -> MetricsReport {
        let mut pr = PullRequest::new(RepoId::new("acme", "widgets"), 42);
        pr.title = Some("Add widget cache".to_string());
        pr.state = Some(PrState::Merged);
        pr.created_at = Some(Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap());
        pr.merged_at = Some(Utc.with_ymd_and_hms(2024, 3, 5, 12, 0, 0).unwrap());
        pr.additions = Some(120);
        pr.deletions = Some(30);
        let record = merge(None, RawRecord::PullRequest(pr), Source::Api).unwrap();
        compute_metrics(&ContributionLedger::new(vec![record]), &MetricsOptions::default())
    }

    #[test]
    fn test_build_report_health() {
        let report = build("octocat", sample_run(), sample_metrics());
        assert_eq!(report.health, Health::Complete);
        assert_eq!(report.user, "octocat");
        assert_eq!(report.metrics.summary.merged, 1);
    }

    #[test]
    fn test_write_json_report() {
        let report = build("octocat", sample_run(), sample_metrics());
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        output(&report, Some(&path)).unwrap();

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["user"], "octocat");
        assert_eq!(value["health"], "complete");
        assert_eq!(value["metrics"]["summary"]["lines_added"], 120);
        assert_eq!(value["metrics"]["pull_requests"][0]["time_to_merge_secs"], 97_200);
        assert_eq!(value["acquisition"]["jobs"][0]["diagnostics"][0]["type"], "throttled");
        assert!(value["metrics"]["collaboration"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_output_to_terminal() {
        let report = build("octocat", sample_run(), sample_metrics());
        // Should not panic
        output(&report, None).unwrap();
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(20 * 60), "20m");
        assert_eq!(format_duration(3 * 3600 + 20 * 60), "3h 20m");
        assert_eq!(format_duration(27 * 3600), "1d 3h");
        assert_eq!(format_duration(-90), "-1m");
    }
}
