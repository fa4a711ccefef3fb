//! # Remote storage
//!
//! Daily archives are shipped to an object store under
//! `<prefix>/<account>/<YYYY>/<YYYY-MM-DD>/<file name>`. Existing stores
//! are read by other tools, so the key layout must not change.

mod dir;
#[cfg(feature = "s3")]
mod s3;

pub use self::dir::DirObjectStore;
#[cfg(feature = "s3")]
pub use self::s3::S3ObjectStore;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{error, info};

use crate::config::{local_part, RemoteSettings};
use crate::error::{Error, Result};

/// Storage class requested for archives, which are rarely read back.
pub const ARCHIVE_STORAGE_CLASS: &str = "STANDARD_IA";

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("bucket or object not found")]
    NotFound,
    #[error("access denied")]
    Forbidden,
    #[error("{0}")]
    Other(String),
}

/// Minimal object storage capability.
pub trait ObjectStore: Send + Sync {
    fn head_bucket(&self, bucket: &str) -> std::result::Result<(), RemoteError>;

    /// Stores the file at `path` under `key`, replacing any existing object.
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        storage_class: Option<&str>,
    ) -> std::result::Result<(), RemoteError>;
}

pub fn remote_key(prefix: &str, username: &str, date: NaiveDate, file_name: &str) -> String {
    format!(
        "{}/{}/{}/{}/{}",
        prefix,
        local_part(username),
        date.format("%Y"),
        date.format("%Y-%m-%d"),
        file_name
    )
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub bucket: String,
    pub remote_key: String,
    pub size_bytes: u64,
    pub digest_remote_key: Option<String>,
}

pub struct RemoteUploader {
    store: Box<dyn ObjectStore>,
    bucket: String,
    prefix: String,
}

impl RemoteUploader {
    pub fn new(store: Box<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        RemoteUploader {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
        }
    }

    /// Builds the uploader described by the settings: a directory mirror
    /// when `local_root` is set, S3 otherwise.
    pub fn from_settings(settings: &RemoteSettings) -> Result<Self> {
        let store: Box<dyn ObjectStore> = match &settings.local_root {
            Some(root) => Box::new(DirObjectStore::new(root)),
            None => s3_store(settings)?,
        };
        Ok(RemoteUploader::new(store, &settings.bucket, &settings.prefix))
    }

    /// Checks that the bucket is reachable. A failure is only reported, it does not stop a run.
    pub fn verify_reachable(&self) -> bool {
        match self.store.head_bucket(&self.bucket) {
            Ok(()) => {
                info!(bucket = %self.bucket, "remote bucket is reachable");
                true
            }
            Err(RemoteError::NotFound) => {
                error!(bucket = %self.bucket, "remote bucket not found");
                false
            }
            Err(RemoteError::Forbidden) => {
                error!(bucket = %self.bucket, "access denied to remote bucket");
                false
            }
            Err(RemoteError::Other(e)) => {
                error!(bucket = %self.bucket, "cannot reach remote bucket: {}", e);
                false
            }
        }
    }

    pub fn upload_archive(
        &self,
        archive: &Path,
        username: &str,
        date: NaiveDate,
        digest: Option<&Path>,
    ) -> Result<UploadReceipt> {
        let size_bytes = fs::metadata(archive)
            .map_err(|e| Error::Upload(format!("archive {} not found: {}", archive.display(), e)))?
            .len();
        let remote_key = self.key_for(archive, username, date)?;
        info!(bucket = %self.bucket, key = %remote_key, "uploading archive");
        self.store
            .put_object(&self.bucket, &remote_key, archive, Some(ARCHIVE_STORAGE_CLASS))
            .map_err(|e| Error::Upload(format!("{}: {}", remote_key, e)))?;
        info!(
            "uploaded {}/{} ({:.2} MB)",
            self.bucket,
            remote_key,
            size_bytes as f64 / (1024.0 * 1024.0)
        );

        let digest_remote_key = match digest.filter(|digest| digest.exists()) {
            Some(digest) => {
                let key = self.key_for(digest, username, date)?;
                self.store
                    .put_object(&self.bucket, &key, digest, None)
                    .map_err(|e| Error::Upload(format!("{}: {}", key, e)))?;
                info!(bucket = %self.bucket, key = %key, "uploaded digest");
                Some(key)
            }
            None => None,
        };

        Ok(UploadReceipt {
            bucket: self.bucket.clone(),
            remote_key,
            size_bytes,
            digest_remote_key,
        })
    }

    fn key_for(&self, path: &Path, username: &str, date: NaiveDate) -> Result<String> {
        let file_name = path
            .file_name()
            .ok_or_else(|| Error::Upload(format!("{} has no file name", path.display())))?;
        Ok(remote_key(
            &self.prefix,
            username,
            date,
            &file_name.to_string_lossy(),
        ))
    }
}

#[cfg(feature = "s3")]
fn s3_store(settings: &RemoteSettings) -> Result<Box<dyn ObjectStore>> {
    Ok(Box::new(S3ObjectStore::new(settings)?))
}

#[cfg(not(feature = "s3"))]
fn s3_store(_settings: &RemoteSettings) -> Result<Box<dyn ObjectStore>> {
    Err(Error::Config(
        "S3 support is not compiled in, set remote.local_root or enable the `s3` feature"
            .to_string(),
    ))
}
