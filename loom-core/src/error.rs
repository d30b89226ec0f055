//! Error types for Loom

use std::path::PathBuf;

use thiserror::Error;

use crate::exec::ExecError;

/// Result type alias for Loom operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for Loom operations
///
/// Per-repository failures inside a fan-out never surface as an `Error` to the
/// caller; they are folded into the report of that repository. The variants
/// below reach the caller only for whole-operation usage errors (unknown
/// freeze id, duplicate tag, invalid repository at freeze time).
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// libgit2 error
    #[error("Git error: {0}")]
    Git(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The path is not a usable git repository
    #[error("'{}' is not a valid git repository ({name}): {reason}", path.display())]
    InvalidRepository {
        name: String,
        path: PathBuf,
        reason: String,
    },

    /// A repository with this name is already part of the fleet
    #[error("Repository '{0}' is already registered")]
    DuplicateRepository(String),

    /// Freeze tag cannot be used as part of a file name
    #[error("Invalid freeze tag '{0}'")]
    InvalidTag(String),

    /// A freeze record with this id already exists on disk
    #[error("Freeze snapshot '{0}' already exists")]
    DuplicateFreezeId(String),

    /// No freeze record with this id
    #[error("Freeze snapshot '{0}' not found")]
    FreezeNotFound(String),

    /// Applying a stash produced merge conflicts; the stash was left in place
    #[error("Stash {stash_ref} in '{repo}' conflicts with the working tree")]
    StashConflict { repo: String, stash_ref: String },

    /// Subprocess execution error
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// Catch-all that keeps the type of the underlying failure
    #[error("Unexpected {kind}: {message}")]
    Unexpected { kind: String, message: String },
}

impl From<git2::Error> for Error {
    fn from(err: git2::Error) -> Self {
        Error::Git(err.message().to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        let kind = if err.is_panic() { "panic" } else { "cancellation" };
        Error::Unexpected {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }
}
