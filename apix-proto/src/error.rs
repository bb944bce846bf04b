//! Errors raised while building frames.

/// Alias for `Result<T, apix_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Reasons a packet cannot be encoded.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Header is empty, does not start with `/`, or contains `{` / NUL.
    #[error("invalid header {0:?}")]
    InvalidHeader(String),

    /// Payload does not start with `{` or contains a NUL byte.
    #[error("invalid payload: {0}")]
    InvalidData(&'static str),

    /// The serialized frame would exceed [`MAX_FRAME_LEN`](crate::MAX_FRAME_LEN).
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong {
        /// Length the frame would have had.
        len: usize,
        /// Maximum permitted length.
        max: usize,
    },
}
