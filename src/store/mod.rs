pub mod types;

pub use types::{CheckpointKey, ContributionLedger, FetchCheckpoint, PageCommit, SourceProgress};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::merge::ContributionRecord;
use crate::model::RecordKey;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to access store file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode store snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Store file {path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Store state poisoned by a panicked writer")]
    Poisoned,

    #[error("Store write task did not complete: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// On-disk form: maps with structured keys are flattened to lists.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    records: Vec<ContributionRecord>,
    checkpoints: Vec<FetchCheckpoint>,
}

#[derive(Debug, Clone, Default)]
struct StoreState {
    records: BTreeMap<RecordKey, ContributionRecord>,
    checkpoints: BTreeMap<CheckpointKey, FetchCheckpoint>,
}

impl StoreState {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            records: self.records.values().cloned().collect(),
            checkpoints: self.checkpoints.values().cloned().collect(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            records: snapshot.records.into_iter().map(|r| (r.key.clone(), r)).collect(),
            checkpoints: snapshot.checkpoints.into_iter().map(|c| (c.key.clone(), c)).collect(),
        }
    }
}

/// Canonical records and fetch checkpoints, persisted together as one JSON snapshot.
///
/// Every change goes through [`Store::commit_page`] or [`Store::clear`]: the change is
/// applied to a copy, the copy is written to a temporary file and renamed over the
/// snapshot, and only then does it replace the in-memory state. A failed write leaves
/// both the file and the in-memory state as they were.
#[derive(Debug)]
pub struct Store {
    path: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl Store {
    /// Open the snapshot at `path`, starting empty if it does not exist yet.
    #[instrument]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let state = match fs::read_to_string(path) {
            Ok(contents) => {
                let snapshot: Snapshot = serde_json::from_str(&contents).map_err(|e| StoreError::Corrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                if snapshot.version != SNAPSHOT_VERSION {
                    return Err(StoreError::Corrupt {
                        path: path.to_path_buf(),
                        reason: format!("unsupported snapshot version {}", snapshot.version),
                    });
                }
                StoreState::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState::default(),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        info!(
            records = state.records.len(),
            checkpoints = state.checkpoints.len(),
            "opened store"
        );
        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(state),
        })
    }

    /// A store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::Poisoned)
    }

    pub fn checkpoint(&self, key: &CheckpointKey) -> Result<FetchCheckpoint, StoreError> {
        let state = self.lock()?;
        Ok(state
            .checkpoints
            .get(key)
            .cloned()
            .unwrap_or_else(|| FetchCheckpoint::new(key.clone())))
    }

    pub fn record(&self, key: &RecordKey) -> Result<Option<ContributionRecord>, StoreError> {
        Ok(self.lock()?.records.get(key).cloned())
    }

    /// Apply a page's merged records and checkpoint advance atomically.
    pub fn commit_page(&self, commit: PageCommit) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let mut next = state.clone();

        let record_count = commit.records.len();
        for record in commit.records {
            next.records.insert(record.key.clone(), record);
        }

        if let Some((key, source, progress)) = commit.checkpoint {
            let checkpoint = next
                .checkpoints
                .entry(key.clone())
                .or_insert_with(|| FetchCheckpoint::new(key));
            let previous = checkpoint.sources.get(&source).and_then(|p| p.watermark);
            let mut progress = progress;
            progress.watermark = progress.watermark.max(previous);
            checkpoint.sources.insert(source, progress);
        }

        self.persist(&next)?;
        *state = next;
        debug!(records = record_count, "committed page");
        Ok(())
    }

    /// [`Store::commit_page`] on the blocking thread pool. Snapshot writes end in an
    /// fsync and must not stall the async workers.
    pub async fn commit_page_in_background(self: &Arc<Self>, commit: PageCommit) -> Result<(), StoreError> {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || store.commit_page(commit)).await?
    }

    /// Forget checkpoints and records for the given units of work.
    #[instrument(skip(self, keys), fields(keys = keys.len()))]
    pub fn clear(&self, keys: &[CheckpointKey]) -> Result<usize, StoreError> {
        let mut state = self.lock()?;
        let mut next = state.clone();

        for key in keys {
            next.checkpoints.remove(key);
        }
        let before = next.records.len();
        next.records
            .retain(|record_key, _| !keys.iter().any(|key| key.covers(record_key)));
        let removed = before - next.records.len();

        self.persist(&next)?;
        *state = next;
        info!(removed, "cleared store for full refresh");
        Ok(removed)
    }

    /// Snapshot of the canonical records, ordered by identity.
    pub fn ledger(&self) -> Result<ContributionLedger, StoreError> {
        let state = self.lock()?;
        Ok(ContributionLedger::new(state.records.values().cloned().collect()))
    }

    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_error = |source: std::io::Error| StoreError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let contents = serde_json::to_vec(&state.snapshot())?;
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = fs::File::create(&tmp).map_err(io_error)?;
        file.write_all(&contents).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        fs::rename(&tmp, path).map_err(io_error)?;
        Ok(())
    }
}
