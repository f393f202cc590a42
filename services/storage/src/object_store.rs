//! Object store seam: uploads, deletes and presigned URLs.
//!
//! The survey core only manages locators and the upload/delete lifecycle;
//! reading object contents is limited to ingestion inputs (archives and
//! position logs).

use crate::config::S3Config;
use crate::error::{Result, StorageError};
use crate::reading::ObjectLocator;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// What to upload
#[derive(Debug, Clone)]
pub enum UploadSource {
    Bytes(Bytes),
    File(PathBuf),
}

impl UploadSource {
    async fn into_bytes(self) -> Result<Bytes> {
        match self {
            UploadSource::Bytes(bytes) => Ok(bytes),
            UploadSource::File(path) => tokio::fs::read(&path)
                .await
                .map(Bytes::from)
                .map_err(|e| {
                    StorageError::backend(format!("failed to read {}: {e}", path.display()))
                }),
        }
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket that uploads land in
    fn bucket(&self) -> &str;

    async fn upload(&self, source: UploadSource, key: &str) -> Result<ObjectLocator>;

    async fn get_bytes(&self, locator: &ObjectLocator) -> Result<Bytes>;

    /// Keys directly under `prefix`, all pages
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>>;

    /// Server-side copy into the upload bucket
    async fn copy(&self, from: &ObjectLocator, key: &str) -> Result<ObjectLocator>;

    async fn delete(&self, locator: &ObjectLocator) -> Result<()>;

    async fn presign(&self, locator: &ObjectLocator, ttl: Duration) -> Result<String>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    config: S3Config,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            config: config.clone(),
        })
    }

    /// Simple single-part upload for small files
    async fn simple_upload(&self, data: Bytes, key: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("S3 PutObject failed: {e}")))?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(&self, data: Bytes, key: &str) -> Result<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type_for(key))
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("S3 CreateMultipartUpload failed: {e}")))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::malformed("no upload id in CreateMultipartUpload response"))?;

        abort_on_failure(
            self.upload_parts(&data, key, upload_id),
            self.abort_multipart_upload(key, upload_id),
        )
        .await
    }

    /// Upload every part and complete the upload
    async fn upload_parts(&self, data: &Bytes, key: &str, upload_id: &str) -> Result<()> {
        let mut completed_parts = Vec::new();

        for (index, chunk) in data.chunks(self.config.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;
            let response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| StorageError::backend(format!("S3 UploadPart failed: {e}")))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("S3 CompleteMultipartUpload failed: {e}")))?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("S3 AbortMultipartUpload failed: {e}")))?;

        Ok(())
    }
}

/// Run `upload`; if it fails, run `abort` and return the upload's error.
/// A failed abort is only logged.
async fn abort_on_failure<U, A>(upload: U, abort: A) -> Result<()>
where
    U: Future<Output = Result<()>>,
    A: Future<Output = Result<()>>,
{
    let err = match upload.await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    if let Err(abort_err) = abort.await {
        warn!(error = %abort_err, "Failed to abort multipart upload");
    }
    Err(err)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self, source), fields(bucket = %self.bucket))]
    async fn upload(&self, source: UploadSource, key: &str) -> Result<ObjectLocator> {
        let data = source.into_bytes().await?;
        let size_bytes = data.len();

        if size_bytes > self.config.multipart_threshold_bytes {
            self.multipart_upload(data, key).await?;
        } else {
            self.simple_upload(data, key).await?;
        }

        debug!(key = %key, size_bytes, "Object uploaded");
        Ok(ObjectLocator::new(&self.bucket, key))
    }

    async fn get_bytes(&self, locator: &ObjectLocator) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("S3 GetObject {locator} failed: {e}")))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::backend(format!("S3 body read {locator} failed: {e}")))?;

        Ok(body.into_bytes())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| StorageError::backend(format!("S3 ListObjectsV2 failed: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(String::from)),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation_token = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    #[instrument(skip(self), fields(from = %from))]
    async fn copy(&self, from: &ObjectLocator, key: &str) -> Result<ObjectLocator> {
        self.client
            .copy_object()
            .copy_source(format!("{}/{}", from.bucket, from.key))
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("S3 CopyObject failed: {e}")))?;

        Ok(ObjectLocator::new(&self.bucket, key))
    }

    #[instrument(skip(self), fields(locator = %locator))]
    async fn delete(&self, locator: &ObjectLocator) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .send()
            .await
            .map_err(|e| StorageError::backend(format!("S3 DeleteObject failed: {e}")))?;

        debug!("Object deleted");
        Ok(())
    }

    async fn presign(&self, locator: &ObjectLocator, ttl: Duration) -> Result<String> {
        let presigning_config = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::precondition(format!("invalid presign ttl: {e}")))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&locator.bucket)
            .key(&locator.key)
            .presigned(presigning_config)
            .await
            .map_err(|e| StorageError::backend(format!("S3 presign failed: {e}")))?;

        Ok(presigned.uri().to_string())
    }
}

/// In-memory object store keyed by `(bucket, key)`
pub struct MemoryObjectStore {
    bucket: String,
    objects: RwLock<BTreeMap<(String, String), Bytes>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    /// Seed an object directly, e.g. an uploaded archive
    pub fn insert(&self, locator: &ObjectLocator, data: impl Into<Bytes>) {
        self.objects
            .write()
            .insert((locator.bucket.clone(), locator.key.clone()), data.into());
    }

    pub fn contains(&self, locator: &ObjectLocator) -> bool {
        self.objects
            .read()
            .contains_key(&(locator.bucket.clone(), locator.key.clone()))
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(&self, source: UploadSource, key: &str) -> Result<ObjectLocator> {
        let locator = ObjectLocator::new(&self.bucket, key);
        let data = source.into_bytes().await?;
        self.insert(&locator, data);
        Ok(locator)
    }

    async fn get_bytes(&self, locator: &ObjectLocator) -> Result<Bytes> {
        self.objects
            .read()
            .get(&(locator.bucket.clone(), locator.key.clone()))
            .cloned()
            .ok_or_else(|| StorageError::not_found(locator.to_string()))
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn copy(&self, from: &ObjectLocator, key: &str) -> Result<ObjectLocator> {
        let data = self.get_bytes(from).await?;
        self.upload(UploadSource::Bytes(data), key).await
    }

    async fn delete(&self, locator: &ObjectLocator) -> Result<()> {
        self.objects
            .write()
            .remove(&(locator.bucket.clone(), locator.key.clone()));
        Ok(())
    }

    async fn presign(&self, locator: &ObjectLocator, ttl: Duration) -> Result<String> {
        if !self.contains(locator) {
            return Err(StorageError::not_found(locator.to_string()));
        }
        Ok(format!(
            "memory://{}/{}?expires_in={}",
            locator.bucket,
            locator.key,
            ttl.as_secs()
        ))
    }
}

/// Sanitize a path component to prevent path traversal
pub fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect::<String>()
        .replace("..", "__")
}

/// Content type from the key's extension
fn content_type_for(key: &str) -> &'static str {
    let extension = key.rsplit_once('.').map(|(_, ext)| ext.to_lowercase());
    match extension.as_deref() {
        Some("jpeg") | Some("jpg") => "image/jpeg",
        Some("png") => "image/png",
        Some("json") => "application/json",
        Some("txt") => "text/plain",
        Some("zip") => "application/zip",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("img-001.jpg"), "img-001.jpg");
        assert_eq!(sanitize_path_component("device/path"), "device_path");
        assert_eq!(sanitize_path_component("../etc"), "___etc");
        assert_eq!(sanitize_path_component("hello world"), "hello_world");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a/b/c.JPG"), "image/jpeg");
        assert_eq!(content_type_for("x.png"), "image/png");
        assert_eq!(content_type_for("out.json"), "application/json");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[tokio::test]
    async fn test_memory_store_lifecycle() {
        let store = MemoryObjectStore::new("images");
        let locator = store
            .upload(UploadSource::Bytes(Bytes::from_static(b"jpeg")), "r/1.jpg")
            .await
            .unwrap();
        assert_eq!(locator, ObjectLocator::new("images", "r/1.jpg"));

        let copy = store.copy(&locator, "r/2.jpg").await.unwrap();
        assert_eq!(store.get_bytes(&copy).await.unwrap(), Bytes::from_static(b"jpeg"));
        assert_eq!(store.list_keys("images", "r/").await.unwrap().len(), 2);

        let url = store.presign(&locator, Duration::from_secs(60)).await.unwrap();
        assert!(url.contains("r/1.jpg"));

        store.delete(&locator).await.unwrap();
        assert!(!store.contains(&locator));
        assert!(store.presign(&locator, Duration::from_secs(60)).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_multipart_upload_is_aborted() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let aborts = AtomicUsize::new(0);
        let counter = &aborts;
        let abort = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), StorageError>(())
        };

        abort_on_failure(async { Ok(()) }, abort()).await.unwrap();
        assert_eq!(aborts.load(Ordering::SeqCst), 0);

        let result = abort_on_failure(
            async { Err(StorageError::backend("S3 UploadPart failed: timeout")) },
            abort(),
        )
        .await;
        assert!(matches!(result, Err(StorageError::Backend(m)) if m.contains("UploadPart")));
        assert_eq!(aborts.load(Ordering::SeqCst), 1);

        // the upload error wins over a failed abort
        let result = abort_on_failure(
            async { Err(StorageError::backend("S3 CompleteMultipartUpload failed")) },
            async { Err(StorageError::backend("S3 AbortMultipartUpload failed")) },
        )
        .await;
        assert!(matches!(result, Err(StorageError::Backend(m)) if m.contains("Complete")));
    }
}
