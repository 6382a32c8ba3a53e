use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the cache.
///
/// Index-internal corruption is recovered by rebuilding from the cache
/// directory and never reaches callers; version mismatches refuse to open so
/// the owning application can wipe the directory and retry.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache path {path:?} unusable: {message}")]
    Path { path: PathBuf, message: String },

    #[error("cache index is corrupt")]
    IndexCorrupt,

    #[error("file is not a recognized cache")]
    BadMagic,

    #[error("cache version is too old to upgrade")]
    VersionTooOld,

    #[error("cache version is from the future")]
    VersionFromTheFuture,

    #[error("cache must be rebuilt after an experiment change")]
    ExperimentChange,

    #[error("entry I/O failed: {message}")]
    EntryIo { kind: io::ErrorKind, message: String },

    #[error("entry not found")]
    NotFound,

    #[error("entry already exists")]
    AlreadyExists,

    #[error("operation cancelled")]
    Cancelled,
}

impl CacheError {
    pub(crate) fn path(path: &std::path::Path, err: &io::Error) -> Self {
        CacheError::Path {
            path: path.to_owned(),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => CacheError::NotFound,
            io::ErrorKind::AlreadyExists => CacheError::AlreadyExists,
            kind => CacheError::EntryIo {
                kind,
                message: err.to_string(),
            },
        }
    }
}

pub type CacheResult<T> = Result<T, CacheError>;
