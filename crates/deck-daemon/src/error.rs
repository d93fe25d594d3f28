//! Failure taxonomy for engine operations.
//!
//! Transient control-socket failures never show up here: they are resolved
//! to typed defaults inside `mpv`.  Only mutating operations return these.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Catalog empty both remotely and in the local cache.
    #[error("no files available")]
    NoFilesAvailable,

    /// Remote file service could not deliver the file.
    #[error("remote fetch failed: {0}")]
    FetchFailed(String),

    /// mpv rejected or never answered a command we depend on.
    #[error("player error: {0}")]
    Player(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Engine event loop has shut down.
    #[error("engine is not accepting requests")]
    Busy,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
