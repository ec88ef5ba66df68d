//! Error taxonomy for the runtime: `Aborted` (bad external input, recoverable
//! by the caller), `OutOfRange` (normal stream-termination signal), and the
//! fatal programmer-error path, which does not produce an `RtError` at all —
//! it asserts/panics per the propagation policy.

use thiserror::Error;

/// Errors surfaced across file parsing and loading APIs.
///
/// `Fatal` programmer errors (shape/dtype mismatches inside operators,
/// out-of-bounds indices, use of an uninitialized PMPack backend) are not
/// represented here: they `panic!`/`assert!` per the spec's propagation
/// policy rather than returning a value the caller could plausibly recover
/// from.
#[derive(Debug, Error)]
pub enum RtError {
    /// Invariant violation or malformed external input (bad magic, bad
    /// shape, malformed model file). Callers may retry with corrected
    /// inputs.
    #[error("aborted: {0}")]
    Aborted(String),

    /// End of stream reached while reading a tensor/TensorMap stream. Used
    /// by streaming readers as the canonical, non-error termination signal.
    #[error("out of range")]
    OutOfRange,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type RtResult<T> = Result<T, RtError>;

impl RtError {
    pub fn aborted(msg: impl Into<String>) -> Self {
        RtError::Aborted(msg.into())
    }
}
