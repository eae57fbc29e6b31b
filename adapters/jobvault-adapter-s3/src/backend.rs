//! S3 realization of the object backend.

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
    Delete, ObjectIdentifier,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use jobvault_core::{EncryptionKey, StoreResult};
use jobvault_object::{ListPage, ObjectBackend, ObjectMeta, Precondition, PutOptions};
use md5::{Digest, Md5};

use crate::error::{S3Error, S3Result};

/// Locator prefix of S3-backed stores.
pub const S3_PREFIX: &str = "aws";

/// Region S3 treats as the default location.
const DEFAULT_REGION: &str = "us-east-1";

/// User metadata entry carrying the fingerprint of the customer key.
const SSE_METADATA: &str = "jobvault-sse";

/// Longest validity S3 accepts for presigned URLs.
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 3600);

/// S3 rejects smaller non-final multipart parts with `EntityTooSmall`.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Keys removed per `DeleteObjects` request.
const DELETE_BATCH: usize = 1000;

/// SSE-C request headers for one key.
struct CustomerKey {
    key: String,
    md5: String,
    fingerprint: String,
}

impl CustomerKey {
    fn new(key: &EncryptionKey) -> Self {
        Self {
            key: STANDARD.encode(key.as_bytes()),
            md5: STANDARD.encode(Md5::digest(key.as_bytes())),
            fingerprint: key.fingerprint(),
        }
    }
}

/// Apply SSE-C headers to any request builder that takes them.
macro_rules! with_customer_key {
    ($request:expr, $key:expr) => {
        match $key {
            Some(k) => $request
                .sse_customer_algorithm("AES256")
                .sse_customer_key(k.key.as_str())
                .sse_customer_key_md5(k.md5.as_str()),
            None => $request,
        }
    };
}

/// An S3 account seen from one region.
#[derive(Clone)]
pub struct S3Backend {
    client: aws_sdk_s3::Client,
    region: String,
    presign_expiry: Duration,
}

impl fmt::Debug for S3Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Backend")
            .field("region", &self.region)
            .field("presign_expiry", &self.presign_expiry)
            .field("credentials", &"[REDACTED]")
            .finish()
    }
}

impl S3Backend {
    /// Connect to S3 in `region`.
    ///
    /// Loads AWS credentials from the default chain (environment, SSO, config files, IAM role).
    pub async fn connect(region: impl Into<String>) -> Self {
        let region = region.into();
        let config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()))
            .timeout_config(
                aws_config::timeout::TimeoutConfig::builder()
                    .operation_timeout(Duration::from_secs(60))
                    .connect_timeout(Duration::from_secs(10))
                    .build(),
            )
            .load()
            .await;
        Self::from_client(aws_sdk_s3::Client::new(&config), region)
    }

    /// Wrap an existing client, for example one pointed at an S3-compatible
    /// endpoint.
    pub fn from_client(client: aws_sdk_s3::Client, region: impl Into<String>) -> Self {
        Self {
            client,
            region: region.into(),
            presign_expiry: MAX_PRESIGN_EXPIRY,
        }
    }

    /// Validity of URLs handed out by `public_url`, capped at seven days.
    pub fn with_presign_expiry(mut self, expiry: Duration) -> Self {
        self.presign_expiry = expiry.min(MAX_PRESIGN_EXPIRY);
        self
    }

    /// Region a bucket lives in, or `None` if it does not exist.
    pub async fn bucket_region(&self, bucket: &str) -> S3Result<Option<String>> {
        match self.client.get_bucket_location().bucket(bucket).send().await {
            Ok(out) => Ok(Some(
                match out.location_constraint().map(|c| c.as_str()) {
                    None | Some("") => DEFAULT_REGION.to_string(),
                    Some("EU") => "eu-west-1".to_string(),
                    Some(region) => region.to_string(),
                },
            )),
            Err(e) => match S3Error::classify(e, bucket, false) {
                S3Error::NoSuchBucket(_) | S3Error::NoSuchKey(_) => Ok(None),
                e => Err(e),
            },
        }
    }

    async fn ensure_region(&self, bucket: &str) -> S3Result<()> {
        match self.bucket_region(bucket).await? {
            Some(existing) if existing == self.region => Ok(()),
            Some(existing) => Err(S3Error::BucketElsewhere {
                bucket: bucket.to_string(),
                existing,
                requested: self.region.clone(),
            }),
            None => Err(S3Error::NoSuchBucket(bucket.to_string())),
        }
    }

    async fn empty_bucket(&self, bucket: &str) -> S3Result<()> {
        let mut token = None;
        loop {
            let out = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| S3Error::classify(e, bucket, false))?;
            let ids: Vec<ObjectIdentifier> = out
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .filter_map(|k| ObjectIdentifier::builder().key(k).build().ok())
                .collect();
            for batch in ids.chunks(DELETE_BATCH) {
                let delete = Delete::builder()
                    .set_objects(Some(batch.to_vec()))
                    .quiet(true)
                    .build()
                    .map_err(|e| S3Error::Api(e.to_string()))?;
                self.client
                    .delete_objects()
                    .bucket(bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| S3Error::classify(e, bucket, false))?;
            }
            match out.next_continuation_token() {
                Some(next) if out.is_truncated() == Some(true) => token = Some(next.to_string()),
                _ => break,
            }
        }

        let uploads = self
            .client
            .list_multipart_uploads()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| S3Error::classify(e, bucket, false))?;
        for upload in uploads.uploads() {
            if let (Some(key), Some(id)) = (upload.key(), upload.upload_id()) {
                self.client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(id)
                    .send()
                    .await
                    .map_err(|e| S3Error::classify(e, key, false))?;
            }
        }
        Ok(())
    }
}

fn object_meta(
    key: &str,
    size: Option<i64>,
    e_tag: Option<&str>,
    metadata: Option<&std::collections::HashMap<String, String>>,
) -> ObjectMeta {
    ObjectMeta {
        key: key.to_string(),
        size: size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
        version: e_tag.unwrap_or_default().to_string(),
        sse_fingerprint: metadata.and_then(|m| m.get(SSE_METADATA)).cloned(),
    }
}

fn range_header(range: &Range<u64>) -> String {
    format!("bytes={}-{}", range.start, range.end - 1)
}

#[async_trait]
impl ObjectBackend for S3Backend {
    fn prefix(&self) -> &'static str {
        S3_PREFIX
    }

    fn url_schemes(&self) -> &'static [&'static str] {
        &["s3"]
    }

    fn region(&self) -> &str {
        &self.region
    }

    fn min_part_size(&self) -> u64 {
        MIN_PART_SIZE
    }

    async fn create_container(&self, container: &str) -> StoreResult<()> {
        let mut request = self.client.create_bucket().bucket(container);
        if self.region != DEFAULT_REGION {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        match request.send().await {
            Ok(_) => {
                tracing::debug!(bucket = container, region = %self.region, "Created bucket");
                Ok(())
            }
            Err(e) => {
                let code = e
                    .as_service_error()
                    .and_then(|s| aws_sdk_s3::error::ProvideErrorMetadata::code(s))
                    .map(str::to_string);
                match code.as_deref() {
                    Some("BucketAlreadyOwnedByYou" | "IllegalLocationConstraintException") => {
                        Ok(self.ensure_region(container).await?)
                    }
                    Some("BucketAlreadyExists") => {
                        Err(S3Error::BucketTaken(container.to_string()).into())
                    }
                    _ => Err(S3Error::classify(e, container, false).into()),
                }
            }
        }
    }

    async fn container_exists(&self, container: &str) -> StoreResult<bool> {
        match self.client.head_bucket().bucket(container).send().await {
            Ok(_) => Ok(true),
            Err(e) => match S3Error::classify(e, container, false) {
                e if e.is_missing() => Ok(false),
                // 301 and 403 both mean the bucket exists somewhere.
                S3Error::Api(_) | S3Error::CustomerKeyRequired(_) => Ok(true),
                e => Err(e.into()),
            },
        }
    }

    async fn delete_container(&self, container: &str) -> StoreResult<()> {
        match self.empty_bucket(container).await {
            Ok(()) => {}
            Err(e) if e.is_missing() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        match self.client.delete_bucket().bucket(container).send().await {
            Ok(_) => {
                tracing::debug!(bucket = container, "Deleted bucket");
                Ok(())
            }
            Err(e) => match S3Error::classify(e, container, false) {
                e if e.is_missing() => Ok(()),
                e => Err(e.into()),
            },
        }
    }

    async fn put(
        &self,
        container: &str,
        key: &str,
        data: Bytes,
        options: &PutOptions,
    ) -> StoreResult<ObjectMeta> {
        let customer = options.sse.as_ref().map(CustomerKey::new);
        let size = data.len() as i64;
        let mut request = self
            .client
            .put_object()
            .bucket(container)
            .key(key)
            .body(ByteStream::from(data));
        request = match &options.precondition {
            Precondition::None => request,
            Precondition::IfAbsent => request.if_none_match("*"),
            Precondition::IfVersion(tag) => request.if_match(tag),
        };
        if let Some(k) = &customer {
            request = request.metadata(SSE_METADATA, k.fingerprint.as_str());
        }
        let request = with_customer_key!(request, customer.as_ref());
        let out = request
            .send()
            .await
            .map_err(|e| S3Error::classify(e, key, customer.is_some()))?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: size as u64,
            version: out.e_tag().unwrap_or_default().to_string(),
            sse_fingerprint: customer.map(|k| k.fingerprint),
        })
    }

    async fn get(
        &self,
        container: &str,
        key: &str,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<(Bytes, ObjectMeta)> {
        let customer = sse.map(CustomerKey::new);
        let request = self.client.get_object().bucket(container).key(key);
        let out = with_customer_key!(request, customer.as_ref())
            .send()
            .await
            .map_err(|e| S3Error::classify(e, key, customer.is_some()))?;
        let meta = object_meta(key, out.content_length(), out.e_tag(), out.metadata());
        let body = out
            .body
            .collect()
            .await
            .map_err(|e| S3Error::Body(e.to_string()))?;
        Ok((body.into_bytes(), meta))
    }

    async fn get_range(
        &self,
        container: &str,
        key: &str,
        range: Range<u64>,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<Bytes> {
        if range.start >= range.end {
            return Ok(Bytes::new());
        }
        let customer = sse.map(CustomerKey::new);
        let request = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .range(range_header(&range));
        let out = match with_customer_key!(request, customer.as_ref()).send().await {
            Ok(out) => out,
            Err(e) => {
                if e.raw_response().is_some_and(|r| r.status().as_u16() == 416) {
                    return Ok(Bytes::new());
                }
                return Err(S3Error::classify(e, key, customer.is_some()).into());
            }
        };
        let body = out
            .body
            .collect()
            .await
            .map_err(|e| S3Error::Body(e.to_string()))?;
        Ok(body.into_bytes())
    }

    async fn head(&self, container: &str, key: &str) -> StoreResult<Option<ObjectMeta>> {
        match self.client.head_object().bucket(container).key(key).send().await {
            Ok(out) => Ok(Some(object_meta(
                key,
                out.content_length(),
                out.e_tag(),
                out.metadata(),
            ))),
            Err(e) => match S3Error::classify(e, key, false) {
                S3Error::NoSuchKey(_) => Ok(None),
                e => Err(e.into()),
            },
        }
    }

    async fn delete(&self, container: &str, key: &str) -> StoreResult<()> {
        match self.client.delete_object().bucket(container).key(key).send().await {
            Ok(_) => Ok(()),
            Err(e) => match S3Error::classify(e, key, false) {
                e if e.is_missing() => Ok(()),
                e => Err(e.into()),
            },
        }
    }

    async fn list(&self, container: &str, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
        let mut listed = Vec::new();
        let mut token = None;
        loop {
            let out = match self
                .client
                .list_objects_v2()
                .bucket(container)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
            {
                Ok(out) => out,
                Err(e) => match S3Error::classify(e, container, false) {
                    S3Error::NoSuchBucket(_) => return Ok(Vec::new()),
                    e => return Err(e.into()),
                },
            };
            for object in out.contents() {
                if let Some(key) = object.key() {
                    listed.push(object_meta(key, object.size(), object.e_tag(), None));
                }
            }
            match out.next_continuation_token() {
                Some(next) if out.is_truncated() == Some(true) => token = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(listed)
    }

    async fn list_page(
        &self,
        container: &str,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StoreResult<ListPage> {
        let out = match self
            .client
            .list_objects_v2()
            .bucket(container)
            .prefix(prefix)
            .set_start_after(start_after.map(str::to_string))
            .max_keys(i32::try_from(limit).unwrap_or(i32::MAX))
            .send()
            .await
        {
            Ok(out) => out,
            Err(e) => match S3Error::classify(e, container, false) {
                S3Error::NoSuchBucket(_) => return Ok(ListPage::default()),
                e => return Err(e.into()),
            },
        };
        let objects = out
            .contents()
            .iter()
            .filter_map(|object| {
                object
                    .key()
                    .map(|key| object_meta(key, object.size(), object.e_tag(), None))
            })
            .collect();
        Ok(ListPage {
            objects,
            truncated: out.is_truncated() == Some(true),
        })
    }

    async fn create_multipart(
        &self,
        container: &str,
        key: &str,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<String> {
        let customer = sse.map(CustomerKey::new);
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(container)
            .key(key);
        if let Some(k) = &customer {
            request = request.metadata(SSE_METADATA, k.fingerprint.as_str());
        }
        let out = with_customer_key!(request, customer.as_ref())
            .send()
            .await
            .map_err(|e| S3Error::classify(e, key, customer.is_some()))?;
        out.upload_id()
            .map(str::to_string)
            .ok_or_else(|| S3Error::Api(format!("{key}: no upload ID returned")).into())
    }

    async fn upload_part(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        number: u32,
        data: Bytes,
        sse: Option<&EncryptionKey>,
    ) -> StoreResult<String> {
        let customer = sse.map(CustomerKey::new);
        let request = self
            .client
            .upload_part()
            .bucket(container)
            .key(key)
            .upload_id(upload_id)
            .part_number(number as i32)
            .body(ByteStream::from(data));
        let out = with_customer_key!(request, customer.as_ref())
            .send()
            .await
            .map_err(|e| S3Error::classify(e, key, customer.is_some()))?;
        out.e_tag()
            .map(str::to_string)
            .ok_or_else(|| S3Error::Api(format!("{key}: no ETag for part {number}")).into())
    }

    async fn complete_multipart(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<(u32, String)>,
    ) -> StoreResult<ObjectMeta> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .into_iter()
                    .map(|(number, tag)| {
                        CompletedPart::builder()
                            .part_number(number as i32)
                            .e_tag(tag)
                            .build()
                    })
                    .collect(),
            ))
            .build();
        let out = self
            .client
            .complete_multipart_upload()
            .bucket(container)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| S3Error::classify(e, key, false))?;
        Ok(object_meta(key, None, out.e_tag(), None))
    }

    async fn abort_multipart(
        &self,
        container: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(container)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => match S3Error::classify(e, key, false) {
                e if e.is_missing() => Ok(()),
                e => Err(e.into()),
            },
        }
    }

    async fn public_url(&self, container: &str, key: &str) -> StoreResult<String> {
        if self.head(container, key).await?.is_none() {
            return Err(S3Error::NoSuchKey(key.to_string()).into());
        }
        let presigning = PresigningConfig::expires_in(self.presign_expiry)
            .map_err(|e| S3Error::Presign(e.to_string()))?;
        let request = self
            .client
            .get_object()
            .bucket(container)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| S3Error::Presign(e.to_string()))?;
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_customer_key_headers() {
        let key = EncryptionKey::from_bytes([7u8; 32]);
        let headers = CustomerKey::new(&key);
        assert_eq!(STANDARD.decode(&headers.key).unwrap(), vec![7u8; 32]);
        assert_eq!(STANDARD.decode(&headers.md5).unwrap().len(), 16);
        assert_eq!(headers.fingerprint, key.fingerprint());
    }

    #[test]
    fn test_range_header_is_inclusive() {
        assert_eq!(range_header(&(0..10)), "bytes=0-9");
        assert_eq!(range_header(&(65536..131072)), "bytes=65536-131071");
    }

    #[test]
    fn test_object_meta_reads_fingerprint() {
        let mut metadata = std::collections::HashMap::new();
        metadata.insert(SSE_METADATA.to_string(), "abc".to_string());
        let meta = object_meta("k", Some(12), Some("\"etag\""), Some(&metadata));
        assert_eq!(meta.size, 12);
        assert_eq!(meta.version, "\"etag\"");
        assert_eq!(meta.sse_fingerprint.as_deref(), Some("abc"));

        let listed = object_meta("k", None, None, None);
        assert_eq!(listed.size, 0);
        assert_eq!(listed.sse_fingerprint, None);
    }

    #[test]
    fn test_presign_expiry_is_capped() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new("eu-west-1"))
            .build();
        let backend = S3Backend::from_client(aws_sdk_s3::Client::from_conf(config), "eu-west-1")
            .with_presign_expiry(Duration::from_secs(30 * 24 * 3600));
        assert_eq!(backend.presign_expiry, MAX_PRESIGN_EXPIRY);
        assert_eq!(backend.prefix(), "aws");
        assert_eq!(backend.url_schemes(), &["s3"]);
    }
}
