use thiserror::Error;

#[derive(Error, Debug)]
pub enum WireError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(
        "maximum segment size ({max_segment_size}) must be greater than metadata overhead ({metadata_overhead})"
    )]
    SegmentTooSmall {
        max_segment_size: usize,
        metadata_overhead: usize,
    },
    #[error("message cannot be empty")]
    EmptyMessage,
    #[error("message too large to segment ({0} bytes)")]
    MessageTooLarge(usize),
    #[error("serialized segment size ({size}) exceeds maximum ({max})")]
    SegmentOverflow { size: usize, max: usize },
    #[error("segment data is not valid UTF-8")]
    InvalidUtf8,
    #[error("no UTF-8 split boundary within {0} bytes")]
    NoSplitBoundary(usize),
}

pub type Result<T> = std::result::Result<T, WireError>;
