use thiserror::Error;

use crate::model::CollectionKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    PartialDeletion(#[from] PartialDeletionError),
}

impl Error {
    /// Stable label for the error family, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Embedding(_) => "embedding",
            Error::Storage(StorageError::NotFound { .. }) => "not_found",
            Error::Storage(_) => "storage",
            Error::Validation(_) => "validation",
            Error::PartialDeletion(_) => "partial_deletion",
        }
    }
}

/// Failures raised by an embedding provider.
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("malformed input: {0}")]
    InvalidInput(String),

    #[error("provider timed out")]
    Timeout,

    #[error("provider returned an unexpected response: {0}")]
    BadResponse(String),
}

impl From<reqwest::Error> for EmbeddingError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EmbeddingError::Timeout
        } else {
            EmbeddingError::Unavailable(e.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("corrupt segment {segment} at offset {offset}: {reason}")]
    Corrupt {
        segment: String,
        offset: u64,
        reason: String,
    },

    #[error("invalid vector dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("metric mismatch: deployment uses {persisted}, configured {configured}")]
    MetricMismatch {
        persisted: String,
        configured: String,
    },

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("segment {0} is unusable after a failed rollback; reopen the database")]
    SegmentFailed(String),

    #[error("poisoned lock on {0}")]
    Poisoned(&'static str),
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("n_results must be between 1 and {max}, got {actual}")]
    ResultsOutOfRange { actual: usize, max: usize },

    #[error("cannot filter on unknown metadata key: {0}")]
    UnknownFilterKey(String),

    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    #[error("unknown review type: {0}")]
    UnknownReviewType(String),

    #[error("malformed review report: {0}")]
    MalformedReport(String),

    #[error("record {id} belongs to another user")]
    OwnerMismatch { id: String },

    #[error("project context id {id} must equal its project_id {project_id}")]
    ProjectIdMismatch { id: String, project_id: String },
}

/// Raised by a purge that stopped part-way through the collections.
///
/// `cleared` lists, in purge order, every collection that finished along with
/// the number of records it dropped. `failed` is the collection that errored;
/// the collections after it were not attempted.
#[derive(Error, Debug)]
#[error(
    "partial deletion for user {user_id}: {} of {} collections cleared, {failed} failed: {reason}",
    cleared.len(),
    CollectionKind::ALL.len()
)]
pub struct PartialDeletionError {
    pub user_id: String,
    pub cleared: Vec<(CollectionKind, usize)>,
    pub failed: CollectionKind,
    pub reason: String,
}

impl PartialDeletionError {
    pub fn deleted(&self) -> usize {
        self.cleared.iter().map(|(_, n)| n).sum()
    }

    /// Collections the caller still has to purge, in purge order.
    pub fn remaining(&self) -> Vec<CollectionKind> {
        CollectionKind::ALL
            .iter()
            .copied()
            .filter(|kind| !self.cleared.iter().any(|(done, _)| done == kind))
            .collect()
    }
}

impl<T> From<std::sync::PoisonError<T>> for StorageError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        StorageError::Poisoned("collection")
    }
}
