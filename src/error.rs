use thiserror::Error;

/// Failure classes surfaced across the crate boundary.
///
/// Success is `Ok(())`; rate-mode termination inside the coders uses a
/// private sentinel and never reaches callers.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("buffer length does not match the expected size")]
    WrongSize,
    #[error("bitstream written by an incompatible codec version ({0})")]
    VersionMismatch(u8),
    #[error("bitstream dimensionality does not match its header")]
    DimMismatch,
    #[error("bitstream requires a generic compression pass that is not available")]
    CompressionError,
    #[error("codec failure: {0}")]
    Other(&'static str),
}

// Header parsing reads through `Cursor`; running off the end of a
// truncated stream is a size mismatch.
impl From<std::io::Error> for CodecError {
    fn from(_: std::io::Error) -> Self {
        CodecError::WrongSize
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
