use crate::images::DecodeError;
use crate::search::embeddings::EmbeddingError;
use crate::search::extractor::ExtractError;
use crate::search::ranker::RankError;
use crate::search::snapshot::SnapshotError;
use crate::search::store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Decode(#[from] DecodeError),

    #[error("{0}")]
    Extraction(String),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("{0} not found")]
    NotFound(String),

    #[error("embedding for image {0} is not ready yet")]
    NotReady(String),

    #[error("{0}")]
    Validation(String),

    #[error("image exceeds the {limit} byte upload limit")]
    PayloadTooLarge { limit: usize },

    #[error("failed to fetch image: {0}")]
    Fetch(String),

    #[error("storage error: {0}")]
    StorageIo(#[from] std::io::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

pub const MODEL_UNAVAILABLE: &str = "image model unavailable";
pub const EXTRACTION_FAILED: &str = "embedding extraction failed";

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }
}

impl From<ExtractError> for AppError {
    fn from(err: ExtractError) -> Self {
        match err {
            ExtractError::Decode(e) => AppError::Decode(e),
            ExtractError::Fetch(msg) => AppError::Fetch(msg),
            ExtractError::Timeout("image fetch", secs) => {
                AppError::Fetch(format!("timed out after {secs}s"))
            }
            other @ ExtractError::Timeout(..) => {
                AppError::Extraction(format!("{EXTRACTION_FAILED}: {other}"))
            }
            ExtractError::Model(e) => e.into(),
        }
    }
}

// Model errors carry backend internals; clients only get a fixed message.
impl From<EmbeddingError> for AppError {
    fn from(err: EmbeddingError) -> Self {
        log::warn!("{err}");
        match err {
            EmbeddingError::InitFailed(_) | EmbeddingError::InvalidModel(_) => {
                AppError::Extraction(MODEL_UNAVAILABLE.to_string())
            }
            EmbeddingError::EmbeddingFailed(_) => {
                AppError::Extraction(EXTRACTION_FAILED.to_string())
            }
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DimensionMismatch { expected, got } => {
                AppError::DimensionMismatch { expected, got }
            }
            StoreError::NonFinite => {
                log::warn!("{err}");
                AppError::Extraction(EXTRACTION_FAILED.to_string())
            }
        }
    }
}

impl From<RankError> for AppError {
    fn from(err: RankError) -> Self {
        match err {
            RankError::DimensionMismatch { query, candidate } => AppError::DimensionMismatch {
                expected: candidate,
                got: query,
            },
        }
    }
}

impl From<SnapshotError> for AppError {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::Io(e) => AppError::StorageIo(e),
            other => AppError::Other(other.into()),
        }
    }
}
