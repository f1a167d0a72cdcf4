use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    ReadError(&'static str, io::Error),
    WriteError(&'static str, io::Error),
    Decode(&'static str, String),
    ChecksumMismatch,
    /// Segment ID would exceed the configured hard cap. Signals a
    /// misconfigured deployment, not a recoverable condition.
    SegmentLimit(u16),
    /// All reader sessions are in use; the caller must close one first.
    SessionLimit(usize),
    InvalidSession(usize),
    InvalidState(String),
    InvalidOperation(String),
    /// Operation not implemented by the active layout (e.g. column
    /// difference on anything but the indexed-column layout).
    Unsupported(&'static str),
    IndexCorruption(String),
    /// A thread panicked while holding one of the store's locks.
    MutexPoisoned,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::ReadError(context, err) => write!(f, "Failed to read {}: {}", context, err),
            Error::WriteError(context, err) => write!(f, "Failed to write {}: {}", context, err),
            Error::Decode(what, msg) => write!(f, "Failed to decode {}: {}", what, msg),
            Error::ChecksumMismatch => write!(f, "Checksum mismatch"),
            Error::SegmentLimit(max) => {
                write!(f, "Segment limit reached: at most {} segments", max)
            }
            Error::SessionLimit(max) => {
                write!(
                    f,
                    "Session limit reached: at most {} concurrent sessions",
                    max
                )
            }
            Error::InvalidSession(id) => write!(f, "Invalid session id: {}", id),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
            Error::Unsupported(what) => write!(f, "Unsupported operation: {}", what),
            Error::IndexCorruption(msg) => write!(f, "Index corruption: {}", msg),
            Error::MutexPoisoned => write!(f, "Lock poisoned by a panicked thread"),
        }
    }
}

impl std::error::Error for Error {}
