//! Drives acquisition across repositories: one job per repository and entity kind,
//! each walking every source's pages from its checkpoint, merging each page into the
//! store together with the checkpoint advance.

pub mod job;

pub use job::{Diagnostic, JobOutcome, JobState, JobStatus, RunReport};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::config::Config;
use crate::credentials::{AuthError, CredentialProvider};
use crate::fetch::retry::with_retry;
use crate::fetch::{ApiFetcher, FetchClient, FetchError, HttpSession, PageRequest, RetryPolicy, ScrapeFetcher};
use crate::merge::{merge, ContributionRecord};
use crate::model::{EntityKind, ModelError, RawRecord, RecordKey, RepoId, Source};
use crate::ratelimit::{cooldown_wait, RateLimiter};
use crate::store::{CheckpointKey, PageCommit, SourceProgress, Store, StoreError};
use job::JobRun;

/// A source failing to parse this many pages in a row is treated as broken.
const MAX_CONSECUTIVE_PAGE_FAILURES: u32 = 3;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("No repositories left to acquire after exclusions")]
    NoTargets,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Jobs running at once.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Drop stored records and checkpoints of the targeted jobs before fetching.
    pub full_refresh: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            concurrency: 4,
            retry: RetryPolicy::default(),
            full_refresh: false,
        }
    }
}

/// Command-line switches layered over the configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub full_refresh: bool,
    pub skip_scrape: bool,
}

/// Why a job stopped before finishing every source.
#[derive(Debug)]
enum Stop {
    Cancelled,
    Failed { source: Source, reason: String },
}

/// Records merged from one page, and what stopped the merge early, if anything.
struct MergedPage {
    records: Vec<ContributionRecord>,
    watermark: Option<DateTime<Utc>>,
    stop: Option<Stop>,
}

pub struct Orchestrator {
    /// Tried in order for every job; API first so scrape pages merge onto API data.
    sources: Vec<Arc<dyn FetchClient>>,
    store: Arc<Store>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(sources: Vec<Arc<dyn FetchClient>>, store: Arc<Store>, settings: RunSettings) -> Self {
        Self {
            sources,
            store,
            settings,
        }
    }

    /// Wire up the fetchers the configuration asks for and resolve the repositories to
    /// acquire. Missing credentials fail here, before any request goes out.
    pub async fn from_config(
        config: &Config,
        credentials: &dyn CredentialProvider,
        store: Arc<Store>,
        options: RunOptions,
    ) -> Result<(Self, Vec<RepoId>), OrchestratorError> {
        let token = credentials.token(&config.user)?;
        let scrape_enabled = config.scrape.enabled && !options.skip_scrape;
        let session = if scrape_enabled {
            Some(credentials.session(&config.user)?)
        } else {
            None
        };

        let api_limiter = Arc::new(RateLimiter::windowed(
            "api",
            config.rate_limit_ceiling,
            config.rate_limit_window(),
        ));
        let api = Arc::new(ApiFetcher::new(
            config.api.base_url.as_str(),
            &token,
            config.user.as_str(),
            api_limiter,
            config.request_timeout(),
        )?);

        let mut sources: Vec<Arc<dyn FetchClient>> = vec![api.clone()];
        if let Some(session) = session {
            let limiter = Arc::new(RateLimiter::token_bucket(
                "scrape",
                config.scrape.requests_per_minute,
                config.scrape.burst,
            ));
            let browser = Arc::new(HttpSession::new(&session, config.request_timeout())?);
            sources.push(Arc::new(ScrapeFetcher::new(
                browser,
                config.scrape.base_url.as_str(),
                config.user.as_str(),
                limiter,
                config.scrape.concurrency,
            )));
        }
        info!(sources = sources.len(), scrape = scrape_enabled, "fetch sources ready");

        let targets = resolve_targets(config, &api).await?;
        let settings = RunSettings {
            since: config.since,
            until: config.until,
            concurrency: config.concurrency,
            retry: config.retry_policy(),
            full_refresh: options.full_refresh,
        };
        Ok((Self::new(sources, store, settings), targets))
    }

    /// Acquire every entity kind of every repository. Individual job failures are
    /// reported in the [`RunReport`]; only a failed full-refresh clear aborts the run.
    #[instrument(skip(self, repos, cancel), fields(repos = repos.len()))]
    pub async fn run(&self, repos: &[RepoId], cancel: watch::Receiver<bool>) -> Result<RunReport, OrchestratorError> {
        let keys: Vec<CheckpointKey> = repos
            .iter()
            .flat_map(|repo| EntityKind::ALL.into_iter().map(move |kind| CheckpointKey::new(repo.clone(), kind)))
            .filter(|key| self.sources.iter().any(|s| s.supports(key.kind)))
            .collect();

        if self.settings.full_refresh {
            let removed = self.store.clear(&keys)?;
            info!(removed, "full refresh requested");
        }

        let mut jobs: Vec<JobOutcome> = stream::iter(keys)
            .map(|key| self.run_job(key, cancel.clone()))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;
        jobs.sort_by(|a, b| a.key.cmp(&b.key));

        let report = RunReport { jobs };
        info!(
            jobs = report.jobs.len(),
            failed = report.failed().count(),
            records = report.records_merged(),
            diagnostics = report.diagnostics().count(),
            "acquisition finished"
        );
        Ok(report)
    }

    async fn run_job(&self, key: CheckpointKey, mut cancel: watch::Receiver<bool>) -> JobOutcome {
        let span = info_span!("job", repo = %key.repo, kind = %key.kind);
        async move {
            let kind = key.kind;
            let mut job = JobRun::new(key);
            for client in self.sources.iter().filter(|c| c.supports(kind)) {
                match self.run_source(&mut job, client.as_ref(), &mut cancel).await {
                    Ok(()) => {}
                    Err(Stop::Cancelled) => {
                        info!("job cancelled");
                        return job.finish(JobStatus::Cancelled);
                    }
                    Err(Stop::Failed { source, reason }) => {
                        warn!(source = %source, reason = %reason, "job failed");
                        return job.finish(JobStatus::Failed {
                            source: Some(source),
                            reason,
                        });
                    }
                }
            }
            info!(pages = job.pages, records = job.records_merged, "job done");
            job.finish(JobStatus::Done)
        }
        .instrument(span)
        .await
    }

    /// Walk one source's pages for a job, from its checkpoint to the end of the pass.
    async fn run_source(
        &self,
        job: &mut JobRun,
        client: &dyn FetchClient,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), Stop> {
        let source = client.source();
        let fail = |reason: String| Stop::Failed { source, reason };

        let mut progress = self
            .store
            .checkpoint(&job.key)
            .map_err(|e| fail(e.to_string()))?
            .progress(source);

        let mut request = PageRequest::first(job.key.repo.clone(), job.key.kind);
        request.until = self.settings.until;
        match progress.next.clone() {
            Some(next) => {
                info!(source = %source, cursor = %next, "resuming interrupted pass");
                request.cursor = Some(next);
                request.since = progress.pass_since;
            }
            None => {
                let since = self.settings.since.max(progress.watermark);
                debug!(source = %source, since = ?since, "starting pass");
                progress.pass_since = since;
                request.since = since;
                request.etag = progress.etag.clone();
            }
        }

        let mut parse_failures = 0;
        loop {
            job.transition(JobState::Fetching);
            let fetched = {
                let request = &request;
                self.call(job, source, cancel, "fetch_page", move || client.fetch_page(request))
                    .await
            };

            let mut page = match fetched {
                Ok(page) => {
                    parse_failures = 0;
                    page
                }
                Err(FetchError::PageParse { url, reason, next }) => {
                    parse_failures += 1;
                    job.diagnose(Diagnostic::PageSkipped { source, url, reason });
                    if parse_failures >= MAX_CONSECUTIVE_PAGE_FAILURES {
                        return Err(fail(format!("{parse_failures} consecutive pages could not be parsed")));
                    }
                    match next {
                        Some(next) => {
                            request.cursor = Some(next);
                            request.etag = None;
                            continue;
                        }
                        None => {
                            progress.next = None;
                            progress.completed_passes += 1;
                            return self
                                .commit(job, source, Vec::new(), progress)
                                .await
                                .map_err(|e| fail(e.to_string()));
                        }
                    }
                }
                Err(FetchError::Cancelled) => return Err(Stop::Cancelled),
                Err(e) => return Err(fail(e.to_string())),
            };

            job.pages += 1;
            for reason in page.warnings.drain(..) {
                job.diagnose(Diagnostic::RowDropped { source, reason });
            }

            if page.not_modified {
                debug!(source = %source, "nothing changed since the last pass");
                progress.next = None;
                progress.last_cursor = Some(page.cursor);
                progress.completed_passes += 1;
                return self
                    .commit(job, source, Vec::new(), progress)
                    .await
                    .map_err(|e| fail(e.to_string()));
            }

            job.transition(JobState::Merging);
            let merged = self.merge_page(job, client, page.records, cancel).await;
            if let Some(stop) = merged.stop {
                // A cancelled page is dropped whole. When the job fails instead (lost
                // session or credentials) the records merged so far are still valid and
                // kept; either way the checkpoint stays put so the page is fetched again.
                let count = merged.records.len() as u64;
                if count > 0 && matches!(stop, Stop::Failed { .. }) {
                    self.store
                        .commit_page_in_background(PageCommit {
                            records: merged.records,
                            checkpoint: None,
                        })
                        .await
                        .map_err(|e| fail(e.to_string()))?;
                    job.records_merged += count;
                }
                return Err(stop);
            }

            if request.cursor.is_none() && page.etag.is_some() {
                progress.etag = page.etag.clone();
            }
            progress.last_cursor = Some(page.cursor.clone());
            progress.next = page.next.clone();
            progress.watermark = progress.watermark.max(merged.watermark);
            if page.next.is_none() {
                progress.completed_passes += 1;
            }
            self.commit(job, source, merged.records, progress.clone())
                .await
                .map_err(|e| fail(e.to_string()))?;

            match page.next {
                Some(next) => {
                    request.cursor = Some(next);
                    request.etag = None;
                }
                None => return Ok(()),
            }
        }
    }

    async fn commit(
        &self,
        job: &mut JobRun,
        source: Source,
        records: Vec<ContributionRecord>,
        progress: SourceProgress,
    ) -> Result<(), StoreError> {
        let count = records.len() as u64;
        self.store
            .commit_page_in_background(PageCommit {
                records,
                checkpoint: Some((job.key.clone(), source, progress)),
            })
            .await?;
        job.records_merged += count;
        job.transition(JobState::CheckpointAdvanced);
        Ok(())
    }

    /// Merge a page's records against the stored canonical records. Duplicates within
    /// the page fold into each other.
    async fn merge_page(
        &self,
        job: &mut JobRun,
        client: &dyn FetchClient,
        records: Vec<RawRecord>,
        cancel: &mut watch::Receiver<bool>,
    ) -> MergedPage {
        let source = client.source();
        let mut pending: BTreeMap<RecordKey, ContributionRecord> = BTreeMap::new();
        let mut watermark = None;
        let mut stop = None;

        for raw in records {
            let key = raw.key();
            if !job.key.covers(&key) {
                job.diagnose(Diagnostic::RowDropped {
                    source,
                    reason: format!("{key} does not belong to {}", job.key),
                });
                continue;
            }

            let existing = match pending.get(&key) {
                Some(record) => Some(record.clone()),
                None => match self.store.record(&key) {
                    Ok(record) => record,
                    Err(e) => {
                        stop = Some(Stop::Failed {
                            source,
                            reason: e.to_string(),
                        });
                        break;
                    }
                },
            };

            let raw = match self.enrich(job, client, raw, existing.as_ref(), cancel).await {
                Ok(raw) => raw,
                Err(reason) => {
                    stop = Some(reason);
                    break;
                }
            };

            let updated_at = raw.updated_at();
            match merge(existing.as_ref(), raw, source) {
                Ok(record) => {
                    watermark = watermark.max(updated_at);
                    pending.insert(key, record);
                }
                Err(e) => job.diagnose(Diagnostic::RecordRejected {
                    source,
                    key,
                    reason: e.to_string(),
                }),
            }
        }

        MergedPage {
            records: pending.into_values().collect(),
            watermark,
            stop,
        }
    }

    /// Fetch detail for new or changed pull requests and for commits still missing
    /// their line counts. Only a lost session or auth failure stops the job; any other
    /// detail failure keeps the listed record as is.
    async fn enrich(
        &self,
        job: &mut JobRun,
        client: &dyn FetchClient,
        raw: RawRecord,
        existing: Option<&ContributionRecord>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<RawRecord, Stop> {
        let source = client.source();
        let changed = existing.map_or(true, |record| record.observed_updated_at(source) != raw.updated_at());

        let detail = match &raw {
            RawRecord::PullRequest(pr) if changed => {
                let (repo, number) = (&pr.repo, pr.number);
                self.call(job, source, cancel, "pr_detail", move || client.pr_detail(repo, number))
                    .await
                    .map(Some)
            }
            RawRecord::Commit(commit)
                if commit.additions.is_none()
                    && existing.and_then(ContributionRecord::commit).and_then(|c| c.additions).is_none() =>
            {
                let (repo, sha) = (&commit.repo, commit.sha.as_str());
                self.call(job, source, cancel, "commit_detail", move || client.commit_detail(repo, sha))
                    .await
            }
            _ => Ok(None),
        };

        match detail {
            Ok(Some(detail)) => Ok(raw.overlay(detail)),
            Ok(None) => Ok(raw),
            Err(FetchError::Cancelled) => Err(Stop::Cancelled),
            Err(e @ (FetchError::SessionExpired(_) | FetchError::Auth(_))) => Err(Stop::Failed {
                source,
                reason: e.to_string(),
            }),
            Err(e) => {
                job.diagnose(Diagnostic::DetailUnavailable {
                    source,
                    key: raw.key(),
                    reason: e.to_string(),
                });
                Ok(raw)
            }
        }
    }

    /// Run one fetch operation with retries, waiting out rate limits without spending
    /// attempts, and giving up as soon as cancellation is signalled.
    async fn call<T, F, Fut>(
        &self,
        job: &mut JobRun,
        source: Source,
        cancel: &mut watch::Receiver<bool>,
        label: &str,
        mut operation: F,
    ) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        loop {
            let result = tokio::select! {
                biased;
                _ = cancelled(cancel) => return Err(FetchError::Cancelled),
                result = with_retry(&self.settings.retry, label, &mut operation) => result,
            };

            match result {
                Err(FetchError::RateLimited { reset_at }) => {
                    let wait = cooldown_wait(reset_at);
                    let resume = job.state();
                    job.transition(JobState::Throttled);
                    job.diagnose(Diagnostic::Throttled {
                        source,
                        wait_secs: wait.as_secs(),
                    });
                    tokio::select! {
                        biased;
                        _ = cancelled(cancel) => return Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                    job.transition(resume);
                }
                other => return other,
            }
        }
    }
}

/// Resolves once shutdown has been signalled. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Organization repositories plus explicitly listed ones, minus exclusions, sorted.
#[instrument(skip_all)]
pub async fn resolve_targets(config: &Config, api: &ApiFetcher) -> Result<Vec<RepoId>, OrchestratorError> {
    let excluded = config
        .exclude_repositories
        .iter()
        .map(|name| RepoId::parse(name))
        .collect::<Result<BTreeSet<_>, _>>()?;

    let policy = config.retry_policy();
    let mut targets = BTreeSet::new();
    for org in &config.organizations {
        let org = org.as_str();
        let repos = with_retry(&policy, "list_org_repositories", move || api.list_org_repositories(org)).await?;
        debug!(org, count = repos.len(), "expanded organization");
        targets.extend(repos);
    }
    for name in &config.repositories {
        targets.insert(RepoId::parse(name)?);
    }
    targets.retain(|repo| !excluded.contains(repo));

    if targets.is_empty() {
        return Err(OrchestratorError::NoTargets);
    }
    info!(repositories = targets.len(), "resolved acquisition targets");
    Ok(targets.into_iter().collect())
}
