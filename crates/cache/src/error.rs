//! Error type shared by the storage tiers and the configuration layer

use crate::frame::FrameId;

/// Result alias used throughout the cache crate
pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame {frame_id} is corrupted: {reason}")]
    Corrupted { frame_id: FrameId, reason: String },
    #[error("frame {0} is not stored")]
    MissingFrame(FrameId),
    #[error("decompression error: {0}")]
    Decompress(#[from] lz4_flex::block::DecompressError),
    #[error("invalid value for configuration key: {0}")]
    InvalidConfig(String),
    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn corrupted(frame_id: FrameId, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            frame_id,
            reason: reason.into(),
        }
    }
}
