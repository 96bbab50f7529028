pub mod types;

pub use types::{
    Commit, EntityKind, PrState, PullRequest, RawRecord, RecordKey, RepoId, Review, ReviewCounts,
    ReviewOutcome, Source,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid repository name (expected owner/name): {0}")]
    InvalidRepo(String),
}
