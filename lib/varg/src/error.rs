use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds surfaced by the codec, the KV file layer and the job
/// drivers.
///
/// `Eof` is only ever returned at a clean record boundary; inside a
/// record every end-of-stream becomes `UnexpectedEof`.
#[derive(Debug, Error)]
pub enum Error {
    /// Clean end of stream at a record boundary.
    #[error("end of stream")]
    Eof,

    /// The stream ended in the middle of a record or field.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// A decoded length disagrees with the framing, or a declared-length
    /// contract was violated.
    #[error("bad record format")]
    BadFormat,

    /// A caller handed the bulk writer mismatched offset slices.
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// A job is missing a required factory or source list.
    #[error("job configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the clean end-of-stream marker.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }
}
