//! Input sources: a zip archive in the object store, a flat object-store
//! prefix, or files on local disk.

use crate::digester::{DigestError, InputSource, LogReader, Result, Uploader};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use roadsurvey_storage::{ObjectLocator, ObjectStore, UploadSource};
use std::io::{Cursor, Read};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use zip::ZipArchive;

fn utf8(data: Vec<u8>, file: &str) -> Result<String> {
    String::from_utf8(data).map_err(|e| DigestError::Source(format!("{file} is not UTF-8: {e}")))
}

/// Zip archive held in memory; entries are uploaded from their decompressed
/// bytes
pub struct ArchiveSource {
    archive: Mutex<ZipArchive<Cursor<Bytes>>>,
    objects: Arc<dyn ObjectStore>,
}

impl ArchiveSource {
    pub fn new(data: Bytes, objects: Arc<dyn ObjectStore>) -> Result<Self> {
        let archive = ZipArchive::new(Cursor::new(data))
            .map_err(|e| DigestError::Source(format!("invalid zip archive: {e}")))?;
        debug!(entries = archive.len(), "Archive opened");

        Ok(Self {
            archive: Mutex::new(archive),
            objects,
        })
    }

    fn read_entry(&self, name: &str) -> Result<Vec<u8>> {
        let mut archive = self.archive.lock();
        let mut entry = archive
            .by_name(name)
            .map_err(|e| DigestError::Source(format!("{name}: {e}")))?;

        let mut data = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut data)
            .map_err(|e| DigestError::Source(format!("{name}: {e}")))?;
        Ok(data)
    }
}

#[async_trait]
impl Uploader for ArchiveSource {
    async fn upload(&self, file: &str, key: &str) -> Result<ObjectLocator> {
        let data = self.read_entry(file)?;
        Ok(self
            .objects
            .upload(UploadSource::Bytes(Bytes::from(data)), key)
            .await?)
    }
}

#[async_trait]
impl LogReader for ArchiveSource {
    async fn read_log(&self, file: &str) -> Result<String> {
        utf8(self.read_entry(file)?, file)
    }
}

#[async_trait]
impl InputSource for ArchiveSource {
    async fn file_names(&self) -> Result<Vec<String>> {
        let archive = self.archive.lock();
        let mut names: Vec<String> = archive
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }
}

/// Files already uploaded under one flat prefix; images are copied
/// server-side
pub struct PrefixSource {
    bucket: String,
    prefix: String,
    objects: Arc<dyn ObjectStore>,
}

impl PrefixSource {
    pub fn new(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: prefix.into(),
            objects,
        }
    }

    fn locator(&self, key: &str) -> ObjectLocator {
        ObjectLocator::new(&self.bucket, key)
    }
}

#[async_trait]
impl Uploader for PrefixSource {
    async fn upload(&self, file: &str, key: &str) -> Result<ObjectLocator> {
        Ok(self.objects.copy(&self.locator(file), key).await?)
    }
}

#[async_trait]
impl LogReader for PrefixSource {
    async fn read_log(&self, file: &str) -> Result<String> {
        let data = self.objects.get_bytes(&self.locator(file)).await?;
        utf8(data.to_vec(), file)
    }
}

#[async_trait]
impl InputSource for PrefixSource {
    /// Keys directly under the prefix; nested keys are skipped
    async fn file_names(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects
            .list_keys(&self.bucket, &self.prefix)
            .await?
            .into_iter()
            .filter(|key| {
                let rest = key[self.prefix.len()..].trim_start_matches('/');
                !rest.is_empty() && !rest.contains('/')
            })
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Explicit list of local files
pub struct LocalSource {
    files: Vec<PathBuf>,
    objects: Arc<dyn ObjectStore>,
}

impl LocalSource {
    pub fn new(files: Vec<PathBuf>, objects: Arc<dyn ObjectStore>) -> Self {
        Self { files, objects }
    }
}

#[async_trait]
impl Uploader for LocalSource {
    async fn upload(&self, file: &str, key: &str) -> Result<ObjectLocator> {
        Ok(self
            .objects
            .upload(UploadSource::File(PathBuf::from(file)), key)
            .await?)
    }
}

#[async_trait]
impl LogReader for LocalSource {
    async fn read_log(&self, file: &str) -> Result<String> {
        tokio::fs::read_to_string(file)
            .await
            .map_err(|e| DigestError::Source(format!("{file}: {e}")))
    }
}

#[async_trait]
impl InputSource for LocalSource {
    async fn file_names(&self) -> Result<Vec<String>> {
        self.files
            .iter()
            .map(|path| {
                path.to_str().map(str::to_string).ok_or_else(|| {
                    DigestError::Source(format!("non UTF-8 path: {}", path.display()))
                })
            })
            .collect()
    }
}
