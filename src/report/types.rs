use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::metrics::MetricsReport;
use crate::orchestrator::{JobStatus, RunReport};

/// How much of the requested acquisition succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Complete,
    Partial,
    Failed,
}

impl Health {
    /// Failed when no job finished, partial when some did not.
    pub fn of(run: &RunReport) -> Self {
        let done = run.jobs.iter().filter(|job| job.status == JobStatus::Done).count();
        match done {
            n if n == run.jobs.len() => Health::Complete,
            0 => Health::Failed,
            _ => Health::Partial,
        }
    }
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::Complete => write!(f, "COMPLETE"),
            Health::Partial => write!(f, "PARTIAL"),
            Health::Failed => write!(f, "FAILED"),
        }
    }
}

/// Everything one invocation produced, as printed or written out.
#[derive(Debug, Serialize)]
pub struct Report {
    pub user: String,
    pub generated_at: DateTime<Utc>,
    pub health: Health,
    pub acquisition: RunReport,
    pub metrics: MetricsReport,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, RepoId, Source};
    use crate::orchestrator::JobOutcome;
    use crate::store::CheckpointKey;

    fn outcome(status: JobStatus) -> JobOutcome {
        JobOutcome {
            key: CheckpointKey::new(RepoId::new("acme", "widgets"), EntityKind::PullRequests),
            status,
            history: vec![],
            pages: 0,
            records_merged: 0,
            diagnostics: vec![],
        }
    }

    #[test]
    fn test_health_of_run() {
        let failed = || {
            outcome(JobStatus::Failed {
                source: Some(Source::Api),
                reason: "HTTP 404".to_string(),
            })
        };
        assert_eq!(Health::of(&RunReport::default()), Health::Complete);
        assert_eq!(
            Health::of(&RunReport { jobs: vec![outcome(JobStatus::Done), failed()] }),
            Health::Partial
        );
        assert_eq!(
            Health::of(&RunReport { jobs: vec![failed(), outcome(JobStatus::Cancelled)] }),
            Health::Failed
        );
    }

    #[test]
    fn test_health_display() {
        assert_eq!(Health::Complete.to_string(), "COMPLETE");
        assert_eq!(Health::Partial.to_string(), "PARTIAL");
        assert_eq!(Health::Failed.to_string(), "FAILED");
    }
}
