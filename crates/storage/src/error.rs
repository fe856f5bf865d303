/// All errors that can be returned by a `Repository` implementation.
///
/// Business-rule failures (missing checkpoint, illegal transition, ...) are
/// never expressed here. A `StorageError` always means the backend itself
/// could not do what it was asked.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The snapshot (transaction) could not be committed and was rolled back.
    #[error("snapshot commit failed: {0}")]
    CommitFailed(String),

    /// A persisted value could not be encoded or decoded by the backend.
    #[error("serialization error for {entity_type}/{entity_id}: {message}")]
    Serialization {
        entity_type: String,
        entity_id: String,
        message: String,
    },

    /// A timestamp string was not valid ISO-8601 / RFC 3339.
    #[error("invalid timestamp '{value}': {message}")]
    InvalidTimestamp { value: String, message: String },

    /// A backend-specific storage error (I/O, lock poisoning, connection, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}
