use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by the glitch engine.
///
/// Only `InputTooSmall`, `UnsupportedContainer`, `InvalidRequest` and `Store`
/// ever abort a batch. `DecodeFailed` is absorbed by the recovery pipeline and
/// `CancellationRequested` marks a variant that was skipped.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The input has no room for a pixel-data window after its header.
    #[error("Input too small: {len} bytes, need more than {min}")]
    InputTooSmall { len: usize, min: usize },

    /// The bytes are not a container this engine understands.
    #[error("Unsupported container: {0}")]
    UnsupportedContainer(String),

    /// A candidate could not be decoded or re-encoded.
    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    /// The batch was cancelled before this unit of work finished.
    #[error("Cancellation requested")]
    CancellationRequested,

    /// Arguments or settings that cannot produce a valid batch.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Persisting a batch to the output store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedContainer(msg.into())
    }

    pub fn decode_failed(msg: impl Into<String>) -> Self {
        Self::DecodeFailed(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Errors after which no variant of the batch can be produced.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::DecodeFailed(_) | EngineError::CancellationRequested
        )
    }
}
