use std::fmt;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the sorter and its collaborators.
///
/// `Io` and `WorkerFailed` carry a rendered message rather than the
/// original `std::io::Error` / boxed cause so that `Error` stays
/// `Clone` - required for the sticky per-subtask `first_error` field
/// (7) to be read and re-raised from multiple call sites without
/// moving the original value out.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An allocation failed while growing a run, a bulk buffer, or a
    /// scratch region.
    #[error("allocation failed")]
    OutOfMemory,
    /// A temp-file read, write, truncate, or mmap failed.
    #[error("temp file i/o failed: {0}")]
    Io(String),
    /// A method was called out of phase, e.g. `write()` after `rewind()`.
    #[error("invalid usage: {0}")]
    InvalidUsage(String),
    /// A background worker observed one of the other kinds; the
    /// original kind is preserved inside.
    #[error("worker failed: {0}")]
    WorkerFailed(Box<Error>),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl Error {
    pub(crate) fn invalid_usage(msg: impl fmt::Display) -> Error {
        Error::InvalidUsage(msg.to_string())
    }

    pub(crate) fn worker_failed(e: Error) -> Error {
        Error::WorkerFailed(Box::new(e))
    }
}
