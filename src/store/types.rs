use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::fetch::Cursor;
use crate::merge::ContributionRecord;
use crate::model::{Commit, EntityKind, PullRequest, RecordKey, RepoId, Source};

/// One unit of resumable work: an entity kind of a repository within an organization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub org: String,
    pub repo: RepoId,
    pub kind: EntityKind,
}

impl CheckpointKey {
    pub fn new(repo: RepoId, kind: EntityKind) -> Self {
        Self {
            org: repo.owner.clone(),
            repo,
            kind,
        }
    }

    /// Whether a canonical record belongs to this unit of work.
    pub fn covers(&self, key: &RecordKey) -> bool {
        key.repo() == &self.repo && key.kind() == self.kind
    }
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo, self.kind)
    }
}

/// How far one source has got through one [`CheckpointKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceProgress {
    /// Page to fetch next. Set while a pass is underway, cleared when it ends.
    pub next: Option<Cursor>,
    /// Cursor of the last page whose records were committed.
    pub last_cursor: Option<Cursor>,
    /// Validator of the first page of the last pass.
    pub etag: Option<String>,
    /// Lower bound used by the pass in progress.
    pub pass_since: Option<DateTime<Utc>>,
    /// Highest `updated_at` merged so far. Never moves backwards.
    pub watermark: Option<DateTime<Utc>>,
    pub completed_passes: u32,
}

impl SourceProgress {
    pub fn in_pass(&self) -> bool {
        self.next.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCheckpoint {
    pub key: CheckpointKey,
    pub sources: BTreeMap<Source, SourceProgress>,
}

impl FetchCheckpoint {
    pub fn new(key: CheckpointKey) -> Self {
        Self {
            key,
            sources: BTreeMap::new(),
        }
    }

    pub fn progress(&self, source: Source) -> SourceProgress {
        self.sources.get(&source).cloned().unwrap_or_default()
    }
}

/// Everything one fetched page changes, applied to the store as a single unit.
#[derive(Debug, Clone, Default)]
pub struct PageCommit {
    pub records: Vec<ContributionRecord>,
    pub checkpoint: Option<(CheckpointKey, Source, SourceProgress)>,
}

/// The canonical records, ordered by identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContributionLedger {
    records: Vec<ContributionRecord>,
}

impl ContributionLedger {
    /// Build from records already keyed uniquely; order is normalised here.
    pub fn new(mut records: Vec<ContributionRecord>) -> Self {
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records.dedup_by(|a, b| a.key == b.key);
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ContributionRecord> {
        self.records.iter()
    }

    pub fn get(&self, key: &RecordKey) -> Option<&ContributionRecord> {
        self.records
            .binary_search_by(|r| r.key.cmp(key))
            .ok()
            .map(|i| &self.records[i])
    }

    pub fn pull_requests(&self) -> impl Iterator<Item = &PullRequest> {
        self.records.iter().filter_map(ContributionRecord::pull_request)
    }

    pub fn commits(&self) -> impl Iterator<Item = &Commit> {
        self.records.iter().filter_map(ContributionRecord::commit)
    }
}

impl<'a> IntoIterator for &'a ContributionLedger {
    type Item = &'a ContributionRecord;
    type IntoIter = std::slice::Iter<'a, ContributionRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge;
    use crate::model::RawRecord;

    fn record(number: u64) -> ContributionRecord {
        let pr = PullRequest::new(RepoId::new("acme", "widgets"), number);
        merge(None, RawRecord::PullRequest(pr), Source::Api).unwrap()
    }

    #[test]
    fn test_ledger_is_ordered_and_unique() {
        let ledger = ContributionLedger::new(vec![record(3), record(1), record(3), record(2)]);
        let numbers: Vec<u64> = ledger.pull_requests().map(|pr| pr.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert!(ledger.get(&record(2).key).is_some());
        assert!(ledger.get(&record(9).key).is_none());
    }

    #[test]
    fn test_ledger_iterates_repeatedly() {
        let ledger = ContributionLedger::new(vec![record(1), record(2)]);
        assert_eq!(ledger.iter().count(), 2);
        assert_eq!((&ledger).into_iter().count(), 2);
    }

    #[test]
    fn test_checkpoint_key_covers_matching_records() {
        let key = CheckpointKey::new(RepoId::new("acme", "widgets"), EntityKind::PullRequests);
        assert_eq!(key.org, "acme");
        assert!(key.covers(&record(1).key));
        let other = CheckpointKey::new(RepoId::new("acme", "widgets"), EntityKind::Commits);
        assert!(!other.covers(&record(1).key));
    }
}
