use thiserror::Error;

/// Errors raised by registry, matcher and session operations.
///
/// Every variant fails only the offending call; the state it was called on
/// is left exactly as it was.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FaceError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("face index {index} out of range for {len} detected faces")]
    IndexOutOfRange { index: usize, len: usize },
}
