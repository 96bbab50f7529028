use serde::Serialize;
use std::fmt;
use tracing::{debug, warn};

use crate::model::{RecordKey, Source};
use crate::store::CheckpointKey;

/// Where one repository × entity-kind job stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Fetching,
    /// Waiting out a rate limit.
    Throttled,
    Merging,
    CheckpointAdvanced,
    Done,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Cancelled)
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Idle, Fetching | Done | Failed | Cancelled) => true,
            // Skipped pages go straight to the next fetch.
            (Fetching, Fetching | Throttled | Merging | CheckpointAdvanced | Failed | Cancelled) => true,
            (Throttled, Fetching | Merging | Cancelled) => true,
            (Merging, Throttled | CheckpointAdvanced | Failed | Cancelled) => true,
            (CheckpointAdvanced, Fetching | Done | Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Idle => "idle",
            JobState::Fetching => "fetching",
            JobState::Throttled => "throttled",
            JobState::Merging => "merging",
            JobState::CheckpointAdvanced => "checkpoint advanced",
            JobState::Done => "done",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Done,
    Failed { source: Option<Source>, reason: String },
    Cancelled,
}

/// Something skipped or degraded during a run that did not stop it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Diagnostic {
    PageSkipped { source: Source, url: String, reason: String },
    RowDropped { source: Source, reason: String },
    RecordRejected { source: Source, key: RecordKey, reason: String },
    DetailUnavailable { source: Source, key: RecordKey, reason: String },
    Throttled { source: Source, wait_secs: u64 },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::PageSkipped { source, url, reason } => {
                write!(f, "[{source}] skipped page {url}: {reason}")
            }
            Diagnostic::RowDropped { source, reason } => write!(f, "[{source}] dropped row: {reason}"),
            Diagnostic::RecordRejected { source, key, reason } => {
                write!(f, "[{source}] rejected {key}: {reason}")
            }
            Diagnostic::DetailUnavailable { source, key, reason } => {
                write!(f, "[{source}] no detail for {key}: {reason}")
            }
            Diagnostic::Throttled { source, wait_secs } => {
                write!(f, "[{source}] rate limited, waited {wait_secs}s")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub key: CheckpointKey,
    pub status: JobStatus,
    /// Every state the job passed through, starting at `Idle`.
    pub history: Vec<JobState>,
    pub pages: u32,
    pub records_merged: u64,
    pub diagnostics: Vec<Diagnostic>,
}

/// Result of one acquisition run: a partial success is still a report.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub jobs: Vec<JobOutcome>,
}

impl RunReport {
    pub fn diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.jobs.iter().flat_map(|job| job.diagnostics.iter())
    }

    pub fn failed(&self) -> impl Iterator<Item = &JobOutcome> {
        self.jobs
            .iter()
            .filter(|job| matches!(job.status, JobStatus::Failed { .. }))
    }

    pub fn records_merged(&self) -> u64 {
        self.jobs.iter().map(|job| job.records_merged).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.jobs.iter().all(|job| job.status == JobStatus::Done)
    }
}

/// Mutable bookkeeping for a job while it runs.
#[derive(Debug)]
pub(crate) struct JobRun {
    pub key: CheckpointKey,
    pub history: Vec<JobState>,
    pub pages: u32,
    pub records_merged: u64,
    pub diagnostics: Vec<Diagnostic>,
}

impl JobRun {
    pub fn new(key: CheckpointKey) -> Self {
        Self {
            key,
            history: vec![JobState::Idle],
            pages: 0,
            records_merged: 0,
            diagnostics: Vec::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.history.last().copied().unwrap_or(JobState::Idle)
    }

    pub fn transition(&mut self, next: JobState) {
        let current = self.state();
        if !current.can_transition_to(next) {
            warn!(job = %self.key, from = %current, to = %next, "unexpected job transition");
        }
        debug!(job = %self.key, from = %current, to = %next, "job transition");
        self.history.push(next);
    }

    pub fn diagnose(&mut self, diagnostic: Diagnostic) {
        warn!(job = %self.key, "{diagnostic}");
        self.diagnostics.push(diagnostic);
    }

    pub fn finish(mut self, status: JobStatus) -> JobOutcome {
        let terminal = match &status {
            JobStatus::Done => JobState::Done,
            JobStatus::Failed { .. } => JobState::Failed,
            JobStatus::Cancelled => JobState::Cancelled,
        };
        self.transition(terminal);
        JobOutcome {
            key: self.key,
            status,
            history: self.history,
            pages: self.pages,
            records_merged: self.records_merged,
            diagnostics: self.diagnostics,
        }
    }
}
