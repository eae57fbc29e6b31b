//! Error types for the S3 adapter.

use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use jobvault_core::StoreError;
use thiserror::Error;

/// Result type for S3 operations.
pub type S3Result<T> = Result<T, S3Error>;

/// Errors that can occur when talking to S3.
#[derive(Debug, Error)]
pub enum S3Error {
    /// Bucket exists, but in another region.
    #[error("Bucket {bucket} exists in {existing}, not {requested}")]
    BucketElsewhere {
        /// Bucket name.
        bucket: String,
        /// Region the bucket lives in.
        existing: String,
        /// Region the caller asked for.
        requested: String,
    },

    /// Bucket name is taken by another account.
    #[error("Bucket name {0} is owned by another account")]
    BucketTaken(String),

    /// Bucket does not exist.
    #[error("No such bucket: {0}")]
    NoSuchBucket(String),

    /// Key does not exist.
    #[error("No such key: {0}")]
    NoSuchKey(String),

    /// Conditional write lost against another writer.
    #[error("Precondition failed for {0}")]
    PreconditionFailed(String),

    /// Object is SSE-C encrypted and no key was sent.
    #[error("Customer key required for {0}")]
    CustomerKeyRequired(String),

    /// Object is SSE-C encrypted under a different key.
    #[error("Customer key rejected for {0}")]
    CustomerKeyRejected(String),

    /// Throttling, timeouts and 5xx responses.
    #[error("S3 temporarily unavailable: {0}")]
    Unavailable(String),

    /// Response body could not be read.
    #[error("Failed to read response body: {0}")]
    Body(String),

    /// Presigned URL could not be built.
    #[error("Presigning failed: {0}")]
    Presign(String),

    /// Any other S3 API error.
    #[error("S3 API error: {0}")]
    Api(String),
}

impl S3Error {
    /// Classify an SDK error for the object at `target`. `with_key` says
    /// whether the request carried a customer key.
    pub(crate) fn classify<E>(err: SdkError<E, HttpResponse>, target: &str, with_key: bool) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        if matches!(
            err,
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_)
        ) {
            return S3Error::Unavailable(format!("{target}: {}", DisplayErrorContext(&err)));
        }
        let status = err.raw_response().map(|r| r.status().as_u16());
        let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
        match (status, code.as_deref()) {
            (_, Some("NoSuchBucket")) => S3Error::NoSuchBucket(target.to_string()),
            (_, Some("NoSuchKey")) | (Some(404), _) => S3Error::NoSuchKey(target.to_string()),
            (_, Some("PreconditionFailed" | "ConditionalRequestConflict")) | (Some(412), _) => {
                S3Error::PreconditionFailed(target.to_string())
            }
            (_, Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable"))
            | (Some(500 | 502 | 503 | 504), _) => {
                S3Error::Unavailable(format!("{target}: {}", DisplayErrorContext(&err)))
            }
            (Some(400), _) if !with_key => S3Error::CustomerKeyRequired(target.to_string()),
            (Some(400 | 403), _) if with_key => S3Error::CustomerKeyRejected(target.to_string()),
            _ => S3Error::Api(format!("{target}: {}", DisplayErrorContext(&err))),
        }
    }

    pub(crate) fn is_missing(&self) -> bool {
        matches!(self, S3Error::NoSuchBucket(_) | S3Error::NoSuchKey(_))
    }
}

impl From<S3Error> for StoreError {
    fn from(e: S3Error) -> Self {
        match e {
            S3Error::BucketElsewhere {
                bucket,
                existing,
                requested,
            } => StoreError::LocationConflict {
                resource: bucket,
                existing,
                requested,
            },
            S3Error::NoSuchBucket(bucket) => StoreError::NoSuchJobStore(format!("s3://{bucket}")),
            S3Error::NoSuchKey(key) => StoreError::NoSuchFile(key),
            S3Error::PreconditionFailed(key) => StoreError::PreconditionFailed(key),
            S3Error::CustomerKeyRequired(_) => StoreError::EncryptionKeyMissing,
            S3Error::CustomerKeyRejected(key) => {
                StoreError::Encryption(format!("{key} was written with a different customer key"))
            }
            S3Error::Unavailable(msg) => StoreError::Transient(msg),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_elsewhere_display() {
        let err = S3Error::BucketElsewhere {
            bucket: "run--files".into(),
            existing: "us-east-1".into(),
            requested: "eu-west-1".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("us-east-1"));
        assert!(msg.contains("eu-west-1"));
    }

    #[test]
    fn test_bucket_elsewhere_to_location_conflict() {
        let store: StoreError = S3Error::BucketElsewhere {
            bucket: "run--files".into(),
            existing: "us-east-1".into(),
            requested: "eu-west-1".into(),
        }
        .into();
        assert!(matches!(
            store,
            StoreError::LocationConflict { resource, .. } if resource == "run--files"
        ));
    }

    #[test]
    fn test_missing_key_to_no_such_file() {
        let store: StoreError = S3Error::NoSuchKey("jobs/abc".into()).into();
        assert!(matches!(store, StoreError::NoSuchFile(k) if k == "jobs/abc"));
    }

    #[test]
    fn test_missing_bucket_to_no_such_job_store() {
        let store: StoreError = S3Error::NoSuchBucket("run--jobs".into()).into();
        assert!(matches!(store, StoreError::NoSuchJobStore(_)));
    }

    #[test]
    fn test_unavailable_is_transient() {
        let store: StoreError = S3Error::Unavailable("SlowDown".into()).into();
        assert!(store.is_transient());
    }

    #[test]
    fn test_customer_key_errors() {
        let missing: StoreError = S3Error::CustomerKeyRequired("blob/x".into()).into();
        assert!(matches!(missing, StoreError::EncryptionKeyMissing));
        let wrong: StoreError = S3Error::CustomerKeyRejected("blob/x".into()).into();
        assert!(matches!(wrong, StoreError::Encryption(_)));
    }

    #[test]
    fn test_other_errors_are_backend_errors() {
        let store: StoreError = S3Error::BucketTaken("run--jobs".into()).into();
        assert!(matches!(store, StoreError::Backend(_)));
        let store: StoreError = S3Error::Api("AccessDenied".into()).into();
        assert!(matches!(store, StoreError::Backend(_)));
    }
}
