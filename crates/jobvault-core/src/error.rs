//! Error handling for the job store.

use thiserror::Error;

/// Result type for job store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during job store operations.
///
/// Every kind is a distinct, matchable condition. Read paths never turn one
/// of these into a successful-but-wrong result.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Job not found in the store.
    #[error("No such job: {0}")]
    NoSuchJob(String),

    /// File (job-scoped or shared) not found in the store.
    #[error("No such file: {0}")]
    NoSuchFile(String),

    /// The physical backing of the store does not exist.
    #[error("No job store found at {0}")]
    NoSuchJobStore(String),

    /// `initialize` was called on a locator whose backing already exists.
    #[error("Job store already exists at {0}")]
    JobStoreExists(String),

    /// Content is encrypted but the key needed to read it is not configured.
    #[error("Content is encrypted but no key was provided.")]
    EncryptionKeyMissing,

    /// Backing resources exist in an incompatible location.
    #[error("Location conflict: {resource} exists in {existing}, requested {requested}")]
    LocationConflict {
        resource: String,
        existing: String,
        requested: String,
    },

    /// Locator string could not be parsed.
    #[error("Invalid job store locator: {0}")]
    InvalidLocator(String),

    /// Store or shared file name violates the backend's naming rules.
    #[error("Invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    /// No handler is registered for the URL scheme, or the handler cannot
    /// perform the requested direction.
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    /// Backend failure that is safe to retry (throttling, timeouts).
    #[error("Transient backend error: {0}")]
    Transient(String),

    /// Non-retryable backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A conditional write lost against a concurrent writer.
    #[error("Precondition failed for {0}")]
    PreconditionFailed(String),

    /// Envelope encryption or decryption failed (wrong key, corrupt frame).
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// A stream handle was abandoned before its content was committed.
    #[error("Stream aborted: {0}")]
    StreamAborted(String),

    /// The store handle has neither been initialized nor resumed.
    #[error("Job store {0} is not initialized or resumed")]
    NotAttached(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal store error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether a retry of the failed call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    /// Whether this error reports a missing job or file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NoSuchJob(_) | StoreError::NoSuchFile(_))
    }

    /// Wrap this error for transport through `std::io` interfaces.
    ///
    /// The original kind is recovered by `StoreError::from(io::Error)`.
    pub fn into_io(self) -> std::io::Error {
        let kind = match &self {
            StoreError::NoSuchFile(_) | StoreError::NoSuchJob(_) => std::io::ErrorKind::NotFound,
            StoreError::StreamAborted(_) => std::io::ErrorKind::BrokenPipe,
            StoreError::Io(e) => e.kind(),
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, self)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        // Stream handles carry StoreError inside io::Error; unwrap it again.
        if e.get_ref().is_some_and(|inner| inner.is::<StoreError>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(store_err) = inner.downcast::<StoreError>() {
                    return *store_err;
                }
            }
            return StoreError::Internal("lost wrapped store error".to_string());
        }
        StoreError::Io(e)
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            StoreError::Transient(e.to_string())
        } else if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            StoreError::NoSuchFile(e.url().map(|u| u.to_string()).unwrap_or_default())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Internal(format!("background task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::NoSuchJob("job-123".to_string());
        assert_eq!(err.to_string(), "No such job: job-123");

        let err = StoreError::EncryptionKeyMissing;
        assert_eq!(
            err.to_string(),
            "Content is encrypted but no key was provided."
        );

        let err = StoreError::LocationConflict {
            resource: "demo--files".to_string(),
            existing: "us-west-1".to_string(),
            requested: "us-east-1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Location conflict: demo--files exists in us-west-1, requested us-east-1"
        );
    }

    #[test]
    fn test_io_roundtrip_preserves_kind() {
        let io = StoreError::NoSuchFile("f-1".to_string()).into_io();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
        let back = StoreError::from(io);
        assert!(matches!(back, StoreError::NoSuchFile(id) if id == "f-1"));

        let io = StoreError::EncryptionKeyMissing.into_io();
        assert!(matches!(
            StoreError::from(io),
            StoreError::EncryptionKeyMissing
        ));
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(StoreError::from(io), StoreError::Io(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Transient("slow down".into()).is_transient());
        assert!(!StoreError::Backend("denied".into()).is_transient());
        assert!(StoreError::NoSuchFile("x".into()).is_not_found());
    }
}
