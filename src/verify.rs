use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::store::write_atomically;

pub const DIGEST_EXTENSION: &str = "sha256";
pub const HASH_LEN: usize = 32;
pub type HashResult = [u8; HASH_LEN];

pub struct StreamHasher<R: Read> {
    hasher: Sha256,
    input: R,
}

impl<R: Read> StreamHasher<R> {
    pub fn new(input: R) -> Self {
        StreamHasher {
            hasher: Sha256::default(),
            input,
        }
    }

    pub fn get_result(self) -> HashResult {
        let mut result = [0; HASH_LEN];
        result.copy_from_slice(self.hasher.finalize().as_slice());
        result
    }
}

impl<R: Read> Read for StreamHasher<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.input.read(buf)?;
        self.hasher.update(&buf[..size]);
        Ok(size)
    }
}

pub fn hash_file(path: &Path) -> io::Result<HashResult> {
    let mut hasher = StreamHasher::new(File::open(path)?);
    io::copy(&mut hasher, &mut io::sink())?;
    Ok(hasher.get_result())
}

/// Path of the digest file accompanying `archive`.
pub fn digest_path_for(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(".");
    name.push(DIGEST_EXTENSION);
    PathBuf::from(name)
}

/// Hashes `archive` and writes `<archive>.sha256` next to it, in the format
/// understood by `sha256sum -c`.
pub fn build_digest(archive: &Path) -> Result<PathBuf> {
    let file_name = archive
        .file_name()
        .ok_or_else(|| Error::compression(archive, "archive path has no file name"))?
        .to_string_lossy()
        .into_owned();
    let hash = hash_file(archive).map_err(|e| Error::compression(archive, e))?;
    let digest = digest_path_for(archive);
    let line = format!("{}  {}\n", hex::encode(hash), file_name);
    write_atomically(&digest, line.as_bytes()).map_err(|e| Error::compression(&digest, e))?;
    Ok(digest)
}

/// Checks the archive named in a digest file against the recorded hash.
pub fn verify_digest(digest: &Path) -> Result<bool> {
    let content = fs::read_to_string(digest).map_err(|e| Error::compression(digest, e))?;
    let (expected, file_name) = content
        .trim_end()
        .split_once("  ")
        .ok_or_else(|| Error::compression(digest, "malformed digest line"))?;
    let archive = digest.with_file_name(file_name);
    let hash = hash_file(&archive).map_err(|e| Error::compression(&archive, e))?;
    Ok(hex::encode(hash).eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_stream_hasher_passes_data_through() {
        let mut hasher = StreamHasher::new(&b"hello"[..]);
        let mut out = vec![];
        hasher.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(
            hex::encode(hasher.get_result()),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_digest_round() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("archive-test-2024-01-15.tar.gz");
        fs::write(&archive, b"test archive content").unwrap();
        let digest = build_digest(&archive).unwrap();
        assert_eq!(
            digest.file_name().unwrap(),
            "archive-test-2024-01-15.tar.gz.sha256"
        );
        let line = fs::read_to_string(&digest).unwrap();
        assert!(line.ends_with("  archive-test-2024-01-15.tar.gz\n"));
        assert_eq!(line.split_whitespace().next().unwrap().len(), HASH_LEN * 2);
        assert!(verify_digest(&digest).unwrap());

        fs::write(&archive, b"tampered").unwrap();
        assert!(!verify_digest(&digest).unwrap());
    }

    #[test]
    fn test_digest_of_missing_archive() {
        let tmp = TempDir::new().unwrap();
        let err = build_digest(&tmp.path().join("missing.tar.gz")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Compression);
    }
}
