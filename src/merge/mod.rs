//! Reconciliation of API and scrape observations into canonical records.
//!
//! Each [`ContributionRecord`] keeps the latest observation from every source and
//! derives its canonical view from them, so the result depends only on what each source
//! reported and never on arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::model::{Commit, PullRequest, RawRecord, RecordKey, Source};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("{key}: {field} differs between sources (have {existing}, got {incoming})")]
    DataIntegrity {
        key: RecordKey,
        field: &'static str,
        existing: String,
        incoming: String,
    },

    #[error("cannot merge {incoming} into {existing}")]
    IdentityMismatch { existing: RecordKey, incoming: RecordKey },
}

/// Canonical form of one pull request or commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContributionRecord {
    pub key: RecordKey,
    pub canonical: RawRecord,
    /// Latest accumulated observation per source.
    pub observations: BTreeMap<Source, RawRecord>,
    /// Which source supplied each populated canonical field.
    pub provenance: BTreeMap<String, Source>,
}

impl ContributionRecord {
    pub fn pull_request(&self) -> Option<&PullRequest> {
        self.canonical.as_pull_request()
    }

    pub fn commit(&self) -> Option<&Commit> {
        self.canonical.as_commit()
    }

    /// `updated_at` as last reported by one source.
    pub fn observed_updated_at(&self, source: Source) -> Option<DateTime<Utc>> {
        self.observations.get(&source).and_then(RawRecord::updated_at)
    }

    pub fn observation(&self, source: Source) -> Option<&RawRecord> {
        self.observations.get(&source)
    }
}

/// Fold `incoming` from `source` into the existing canonical record, if any.
///
/// Fails with [`MergeError::DataIntegrity`] when `incoming` contradicts a field that
/// never changes once set (authorship, creation time); the existing record stays valid.
pub fn merge(
    existing: Option<&ContributionRecord>,
    incoming: RawRecord,
    source: Source,
) -> Result<ContributionRecord, MergeError> {
    let key = incoming.key();
    let mut observations = match existing {
        Some(record) if record.key != key => {
            return Err(MergeError::IdentityMismatch {
                existing: record.key.clone(),
                incoming: key,
            })
        }
        Some(record) => {
            check_integrity(&record.canonical, &incoming, &key)?;
            record.observations.clone()
        }
        None => BTreeMap::new(),
    };

    let observation = match observations.remove(&source) {
        Some(previous) => previous.overlay(incoming),
        None => incoming,
    };
    observations.insert(source, observation);

    let mut provenance = BTreeMap::new();
    let canonical = match &key {
        RecordKey::PullRequest { repo, number } => {
            let api = observations.get(&Source::Api).and_then(RawRecord::as_pull_request);
            let scrape = observations.get(&Source::Scrape).and_then(RawRecord::as_pull_request);
            let mut pr = PullRequest::new(repo.clone(), *number);
            resolve_pull_request(&mut pr, api, scrape, &mut provenance);
            RawRecord::PullRequest(pr)
        }
        RecordKey::Commit { repo, sha } => {
            let api = observations.get(&Source::Api).and_then(RawRecord::as_commit);
            let scrape = observations.get(&Source::Scrape).and_then(RawRecord::as_commit);
            let mut commit = Commit::new(repo.clone(), sha.clone());
            resolve_commit(&mut commit, api, scrape, &mut provenance);
            RawRecord::Commit(commit)
        }
    };

    Ok(ContributionRecord {
        key,
        canonical,
        observations,
        provenance,
    })
}

fn check_integrity(existing: &RawRecord, incoming: &RawRecord, key: &RecordKey) -> Result<(), MergeError> {
    fn same<T: PartialEq + ToString>(
        key: &RecordKey,
        field: &'static str,
        existing: &Option<T>,
        incoming: &Option<T>,
    ) -> Result<(), MergeError> {
        match (existing, incoming) {
            (Some(a), Some(b)) if a != b => Err(MergeError::DataIntegrity {
                key: key.clone(),
                field,
                existing: a.to_string(),
                incoming: b.to_string(),
            }),
            _ => Ok(()),
        }
    }

    match (existing, incoming) {
        (RawRecord::PullRequest(old), RawRecord::PullRequest(new)) => {
            same(key, "author", &old.author, &new.author)?;
            same(key, "created_at", &old.created_at, &new.created_at)
        }
        (RawRecord::Commit(old), RawRecord::Commit(new)) => same(key, "author", &old.author, &new.author),
        _ => Ok(()),
    }
}

/// First populated value in preference order, recording which source supplied it.
fn pick<R, T>(
    field: &str,
    order: &[(Source, Option<&R>)],
    get: impl Fn(&R) -> Option<T>,
    provenance: &mut BTreeMap<String, Source>,
) -> Option<T> {
    for (source, observation) in order {
        if let Some(value) = observation.and_then(&get) {
            provenance.insert(field.to_string(), *source);
            return Some(value);
        }
    }
    None
}

fn resolve_pull_request(
    pr: &mut PullRequest,
    api: Option<&PullRequest>,
    scrape: Option<&PullRequest>,
    provenance: &mut BTreeMap<String, Source>,
) {
    let api_first = [(Source::Api, api), (Source::Scrape, scrape)];
    let scrape_first = [(Source::Scrape, scrape), (Source::Api, api)];

    macro_rules! resolve {
        ($order:expr, $($field:ident),+ $(,)?) => {
            $(pr.$field = pick(stringify!($field), &$order, |p: &PullRequest| p.$field.clone(), provenance);)+
        };
    }

    resolve!(
        api_first,
        title,
        state,
        author,
        is_draft,
        created_at,
        updated_at,
        merged_at,
        closed_at,
        head_branch,
        base_branch,
        additions,
        deletions,
        files_changed,
        commit_count,
        commit_times,
        labels,
        reviewers,
        reviews,
        comment_count,
    );
    // Engagement is what the web UI shows best.
    resolve!(scrape_first, review_thread_count, reaction_count, reactions);
}

fn resolve_commit(
    commit: &mut Commit,
    api: Option<&Commit>,
    scrape: Option<&Commit>,
    provenance: &mut BTreeMap<String, Source>,
) {
    let order = [(Source::Api, api), (Source::Scrape, scrape)];

    macro_rules! resolve {
        ($($field:ident),+) => {
            $(commit.$field = pick(stringify!($field), &order, |c: &Commit| c.$field.clone(), provenance);)+
        };
    }

    resolve!(author, committed_at, pr_number, additions, deletions, branch, message);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PrState, RepoId};
    use chrono::TimeZone;

    fn repo() -> RepoId {
        RepoId::new("acme", "widgets")
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).unwrap()
    }

    fn api_pr() -> RawRecord {
        let mut pr = PullRequest::new(repo(), 41);
        pr.title = Some("Cache widget lookups".to_string());
        pr.state = Some(PrState::Merged);
        pr.author = Some("octocat".to_string());
        pr.created_at = Some(at(1));
        pr.updated_at = Some(at(4));
        pr.merged_at = Some(at(4));
        pr.additions = Some(120);
        pr.reaction_count = Some(1);
        RawRecord::PullRequest(pr)
    }

    fn scrape_pr() -> RawRecord {
        let mut pr = PullRequest::new(repo(), 41);
        pr.title = Some("Cache widget lookups (stale)".to_string());
        pr.state = Some(PrState::Open);
        pr.author = Some("octocat".to_string());
        pr.updated_at = Some(at(2));
        pr.reaction_count = Some(7);
        pr.review_thread_count = Some(2);
        RawRecord::PullRequest(pr)
    }

    fn merge_all(steps: &[(RawRecord, Source)]) -> ContributionRecord {
        let mut record: Option<ContributionRecord> = None;
        for (incoming, source) in steps {
            record = Some(merge(record.as_ref(), incoming.clone(), *source).unwrap());
        }
        record.unwrap()
    }

    #[test]
    fn test_first_observation_becomes_canonical() {
        let record = merge(None, api_pr(), Source::Api).unwrap();
        assert_eq!(record.canonical, api_pr());
        assert_eq!(record.provenance.get("title"), Some(&Source::Api));
        assert_eq!(record.provenance.get("deletions"), None);
        assert!(record.pull_request().unwrap().deletions.is_none());
    }

    #[test]
    fn test_api_state_beats_stale_scrape() {
        for steps in [
            vec![(api_pr(), Source::Api), (scrape_pr(), Source::Scrape)],
            vec![(scrape_pr(), Source::Scrape), (api_pr(), Source::Api)],
        ] {
            let record = merge_all(&steps);
            let pr = record.pull_request().unwrap();
            assert_eq!(pr.state, Some(PrState::Merged));
            assert_eq!(pr.title.as_deref(), Some("Cache widget lookups"));
            assert_eq!(record.provenance.get("state"), Some(&Source::Api));
        }
    }

    #[test]
    fn test_engagement_prefers_scrape() {
        let record = merge_all(&[(api_pr(), Source::Api), (scrape_pr(), Source::Scrape)]);
        let pr = record.pull_request().unwrap();
        assert_eq!(pr.reaction_count, Some(7));
        assert_eq!(pr.review_thread_count, Some(2));
        assert_eq!(record.provenance.get("reaction_count"), Some(&Source::Scrape));
        // Only the API reported creation time.
        assert_eq!(pr.created_at, Some(at(1)));
        assert_eq!(record.provenance.get("created_at"), Some(&Source::Api));
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = merge_all(&[(api_pr(), Source::Api), (scrape_pr(), Source::Scrape)]);
        let b = merge_all(&[(scrape_pr(), Source::Scrape), (api_pr(), Source::Api)]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let once = merge_all(&[(api_pr(), Source::Api), (scrape_pr(), Source::Scrape)]);
        let twice = merge_all(&[
            (api_pr(), Source::Api),
            (scrape_pr(), Source::Scrape),
            (api_pr(), Source::Api),
            (scrape_pr(), Source::Scrape),
        ]);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_partial_observation_keeps_earlier_fields() {
        let mut detail = PullRequest::new(repo(), 41);
        detail.deletions = Some(30);
        let record = merge_all(&[
            (api_pr(), Source::Api),
            (RawRecord::PullRequest(detail), Source::Api),
        ]);
        let pr = record.pull_request().unwrap();
        assert_eq!(pr.additions, Some(120));
        assert_eq!(pr.deletions, Some(30));
        assert_eq!(record.observations.len(), 1);
    }

    #[test]
    fn test_author_conflict_is_rejected() {
        let existing = merge(None, api_pr(), Source::Api).unwrap();
        let mut impostor = PullRequest::new(repo(), 41);
        impostor.author = Some("mallory".to_string());

        let err = merge(Some(&existing), RawRecord::PullRequest(impostor), Source::Scrape).unwrap_err();
        assert!(matches!(err, MergeError::DataIntegrity { field: "author", .. }));
    }

    #[test]
    fn test_created_at_conflict_is_rejected() {
        let existing = merge(None, api_pr(), Source::Api).unwrap();
        let mut moved = PullRequest::new(repo(), 41);
        moved.created_at = Some(at(9));

        let err = merge(Some(&existing), RawRecord::PullRequest(moved), Source::Scrape).unwrap_err();
        assert!(matches!(err, MergeError::DataIntegrity { field: "created_at", .. }));
    }

    #[test]
    fn test_identity_mismatch() {
        let existing = merge(None, api_pr(), Source::Api).unwrap();
        let other = RawRecord::PullRequest(PullRequest::new(repo(), 99));
        assert!(matches!(
            merge(Some(&existing), other, Source::Api),
            Err(MergeError::IdentityMismatch { .. })
        ));
    }

    #[test]
    fn test_commit_merge() {
        let mut listed = Commit::new(repo(), "abc123");
        listed.author = Some("octocat".to_string());
        listed.committed_at = Some(at(3));
        let mut stats = Commit::new(repo(), "abc123");
        stats.additions = Some(10);
        stats.deletions = Some(2);

        let record = merge_all(&[
            (RawRecord::Commit(listed), Source::Api),
            (RawRecord::Commit(stats), Source::Api),
        ]);
        let commit = record.commit().unwrap();
        assert_eq!(commit.author.as_deref(), Some("octocat"));
        assert_eq!(commit.additions, Some(10));
        assert_eq!(record.provenance.get("additions"), Some(&Source::Api));
        assert_eq!(record.observed_updated_at(Source::Api), Some(at(3)));
    }
}
