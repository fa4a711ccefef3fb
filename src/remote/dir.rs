use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use super::{ObjectStore, RemoteError};

/// Object store mirroring buckets as directories: the object `key` of
/// `bucket` lives at `<root>/<bucket>/<key>`. Handy for NAS mounts and
/// for tests.
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirObjectStore { root: root.into() }
    }

    fn bucket_dir(&self, bucket: &str) -> PathBuf {
        self.root.join(bucket)
    }
}

fn to_remote_error(err: io::Error) -> RemoteError {
    match err.kind() {
        io::ErrorKind::NotFound => RemoteError::NotFound,
        io::ErrorKind::PermissionDenied => RemoteError::Forbidden,
        _ => RemoteError::Other(err.to_string()),
    }
}

/// Keys are relative, `/`-separated and may not climb out of the bucket.
fn key_path(key: &str) -> Result<PathBuf, RemoteError> {
    let path = Path::new(key);
    let valid = !key.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if valid {
        Ok(path.to_path_buf())
    } else {
        Err(RemoteError::Other(format!("invalid object key {:?}", key)))
    }
}

impl ObjectStore for DirObjectStore {
    fn head_bucket(&self, bucket: &str) -> Result<(), RemoteError> {
        let dir = self.bucket_dir(bucket);
        let metadata = fs::metadata(&dir).map_err(to_remote_error)?;
        if !metadata.is_dir() {
            return Err(RemoteError::NotFound);
        }
        fs::read_dir(&dir).map_err(to_remote_error)?;
        Ok(())
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        _storage_class: Option<&str>,
    ) -> Result<(), RemoteError> {
        let bucket_dir = self.bucket_dir(bucket);
        if !bucket_dir.is_dir() {
            return Err(RemoteError::NotFound);
        }
        let target = bucket_dir.join(key_path(key)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(to_remote_error)?;
        }
        let mut tmp_name = target.as_os_str().to_os_string();
        tmp_name.push(".partial");
        let tmp = PathBuf::from(tmp_name);
        fs::copy(path, &tmp).map_err(to_remote_error)?;
        fs::rename(&tmp, &target).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            to_remote_error(e)
        })
    }
}
