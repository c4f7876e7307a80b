use thiserror::Error;

/// All errors that Burrow can produce.
///
/// Variants map roughly onto the CouchDB status codes a caller would expect
/// (`Conflict` -> 409, `Forbidden` -> 403, ...) but the mapping to an actual
/// wire status is left to whatever layer speaks HTTP.
#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("deleted: {0}")]
    Deleted(String),

    #[error("conflict: document update conflict")]
    Conflict,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid revision format: {0}")]
    InvalidRev(String),

    #[error("missing document id")]
    MissingId,

    #[error("database already exists: {0}")]
    DatabaseExists(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("insufficient storage: {0}")]
    InsufficientStorage(String),

    #[error("database is closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BurrowError {
    /// Whether this error is a transient network/server hiccup worth a
    /// backoff-and-retry, as opposed to a terminal failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, BurrowError::TransientNetwork(_))
    }
}

pub type Result<T> = std::result::Result<T, BurrowError>;
