/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The metadata block is empty (a frame needs at least `{}`).
    #[error("frame has no metadata")]
    EmptyMetadata,

    /// The metadata block itself contains the separator byte.
    #[error("metadata contains the 0x00 separator at offset {offset}")]
    SeparatorInMetadata { offset: usize },

    /// The frame exceeds the configured maximum size.
    #[error("frame too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// The metadata block is not the JSON the reader expected.
    #[error("invalid frame metadata: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FrameError>;
