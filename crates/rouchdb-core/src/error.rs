use thiserror::Error;

/// All errors that RouchDB can produce.
#[derive(Debug, Error)]
pub enum RouchError {
    #[error("not found: {0}")]
    NotFound(String),

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

    #[error("database error: {0}")]
    DatabaseError(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The remote peer could not be reached, or the connection dropped
    /// mid-stream. Replication retries on this; plain reads/writes don't.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Neither `db.id()` of the source nor the target answered during
    /// replication peer verification.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// Replication gave up after its retry budget was exhausted.
    #[error("replication failed: {0}")]
    ReplicationFailed(String),
}

impl RouchError {
    /// A stable, lowercase, wire-style name for this error kind, used in
    /// bulk-write result entries (`{"error": "conflict", "reason": "..."}`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            RouchError::NotFound(_) => "not_found",
            RouchError::Conflict => "conflict",
            RouchError::BadRequest(_) => "bad_request",
            RouchError::Unauthorized => "unauthorized",
            RouchError::Forbidden(_) => "forbidden",
            RouchError::InvalidRev(_) => "invalid_rev",
            RouchError::MissingId => "missing_id",
            RouchError::DatabaseExists(_) => "database_exists",
            RouchError::DatabaseError(_) => "database_error",
            RouchError::Io(_) => "io_error",
            RouchError::Json(_) => "json_error",
            RouchError::TransportError(_) => "transport_error",
            RouchError::PeerNotFound(_) => "peer_not_found",
            RouchError::ReplicationFailed(_) => "replication_failed",
        }
    }
}

pub type Result<T> = std::result::Result<T, RouchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(RouchError::Conflict.kind_name(), "conflict");
        assert_eq!(RouchError::NotFound("x".into()).kind_name(), "not_found");
        assert_eq!(
            RouchError::ReplicationFailed("x".into()).kind_name(),
            "replication_failed"
        );
    }
}
