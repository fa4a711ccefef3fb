//! On-disk layout of archived mailboxes.
//!
//! ```text
//! base/<account>[/<YYYY>/<YYYY-MM-DD>]/<folder>/<uid>.eml
//! ```
//!
//! The year and date segments exist only in the dated layout. Every segment
//! derived from untrusted input goes through [`sanitize_filename`].

use chrono::NaiveDate;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::config::local_part;
use crate::error::{Error, Result};

pub const MESSAGE_EXTENSION: &str = "eml";
pub const MAX_NAME_LEN: usize = 200;

/// Longest trailing extension kept intact when a name is truncated.
const MAX_EXTENSION_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayoutMode {
    /// One tree per day, under year and ISO date segments.
    Dated,
    /// A single tree per account where every day accumulates.
    Flat,
}

fn is_reserved(c: char) -> bool {
    matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control()
}

fn sanitize_with(name: &str, replace: impl Fn(char) -> bool) -> String {
    let mut result = String::with_capacity(name.len());
    let mut replacing = false;
    for c in name.chars() {
        if replace(c) {
            if !replacing {
                result.push('_');
            }
            replacing = true;
        } else {
            result.push(c);
            replacing = false;
        }
    }
    // Neither empty names nor `.`/`..` may reach the filesystem.
    if result.chars().all(|c| c == '.') {
        result = "_".repeat(result.len().max(1));
    }
    truncate_name(result)
}

fn truncate_name(name: String) -> String {
    if name.chars().count() <= MAX_NAME_LEN {
        return name;
    }
    let ext = match name.rfind('.') {
        Some(pos) if pos > 0 && name.len() - pos <= MAX_EXTENSION_LEN => &name[pos..],
        _ => "",
    };
    let keep = MAX_NAME_LEN - ext.chars().count();
    let mut result: String = name.chars().take(keep).collect();
    result.push_str(ext);
    result
}

/// Makes an untrusted string safe to use as a single path component.
///
/// Separators, quotes, wildcards and control characters become `_`, with
/// runs of them collapsed into one, and the result is at most
/// [`MAX_NAME_LEN`] characters long, keeping a trailing extension.
pub fn sanitize_filename(name: &str) -> String {
    sanitize_with(name, is_reserved)
}

/// Like [`sanitize_filename`], but spaces are replaced as well.
pub fn sanitize_folder_name(name: &str) -> String {
    sanitize_with(name, |c| c == ' ' || is_reserved(c))
}

pub struct ArchiveStore {
    base: PathBuf,
    mode: LayoutMode,
}

impl ArchiveStore {
    pub fn new(base: impl Into<PathBuf>, mode: LayoutMode) -> Self {
        ArchiveStore {
            base: base.into(),
            mode,
        }
    }

    fn dated_root(&self, username: &str, date: NaiveDate) -> PathBuf {
        let mut path = self.base.join(sanitize_filename(local_part(username)));
        path.push(date.format("%Y").to_string());
        path.push(date.format("%Y-%m-%d").to_string());
        path
    }

    /// Canonical directory of `folder` (or of the account root when `None`)
    /// for the messages of `date`.
    pub fn resolve_path(&self, username: &str, date: NaiveDate, folder: Option<&str>) -> PathBuf {
        let mut path = match self.mode {
            LayoutMode::Dated => self.dated_root(username, date),
            LayoutMode::Flat => self.base.join(sanitize_filename(local_part(username))),
        };
        if let Some(folder) = folder {
            path.push(sanitize_folder_name(folder));
        }
        path
    }

    /// The dated directory used to stage a day's archive, whatever the
    /// layout mode.
    pub fn transient_dir(&self, username: &str, date: NaiveDate) -> PathBuf {
        self.dated_root(username, date)
    }

    /// Creates the account root and one directory per folder. Existing
    /// directories are left alone.
    pub fn ensure_layout(
        &self,
        username: &str,
        date: NaiveDate,
        folders: &[String],
    ) -> Result<PathBuf> {
        let root = self.resolve_path(username, date, None);
        fs::create_dir_all(&root)
            .map_err(|e| Error::storage("cannot create account directory", &root, e))?;
        for folder in folders {
            let dir = self.resolve_path(username, date, Some(folder));
            fs::create_dir_all(&dir)
                .map_err(|e| Error::storage("cannot create folder directory", &dir, e))?;
        }
        Ok(root)
    }

    /// Where the message `uid` of `folder` is stored. Distinct uids may
    /// share a path once sanitized.
    pub fn message_path(&self, username: &str, date: NaiveDate, folder: &str, uid: &str) -> PathBuf {
        self.resolve_path(username, date, Some(folder))
            .join(sanitize_filename(&format!("{}.{}", uid, MESSAGE_EXTENSION)))
    }

    pub fn persist_message(
        &self,
        username: &str,
        date: NaiveDate,
        folder: &str,
        uid: &str,
        raw: &[u8],
    ) -> Result<PathBuf> {
        let dir = self.resolve_path(username, date, Some(folder));
        if !dir.is_dir() {
            return Err(Error::storage(
                "folder directory is missing",
                &dir,
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        let path = self.message_path(username, date, folder, uid);
        write_atomically(&path, raw).map_err(|e| Error::storage("cannot write message", &path, e))?;
        Ok(path)
    }

    /// Persisted messages of a folder, sorted by file name.
    pub fn list_messages(
        &self,
        username: &str,
        date: NaiveDate,
        folder: &str,
    ) -> Result<Vec<PathBuf>> {
        let dir = self.resolve_path(username, date, Some(folder));
        let entries =
            fs::read_dir(&dir).map_err(|e| Error::storage("cannot list folder", &dir, e))?;
        let mut messages = vec![];
        for entry in entries {
            let path = entry
                .map_err(|e| Error::storage("cannot list folder", &dir, e))?
                .path();
            let is_message = path
                .extension()
                .map_or(false, |ext| ext == MESSAGE_EXTENSION);
            if is_message && path.is_file() {
                messages.push(path);
            }
        }
        messages.sort();
        Ok(messages)
    }
}

/// Writes `content` next to `path` first and renames it into place, so a
/// reader never sees a partially written file.
pub(crate) fn write_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.as_os_str().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);
    let result = fs::File::create(&tmp_path).and_then(|mut file| {
        file.write_all(content)?;
        file.sync_all()
    });
    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn test_sanitize_passthrough() {
        assert_eq!(sanitize_filename("hello.txt"), "hello.txt");
        assert_eq!(sanitize_folder_name("INBOX"), "INBOX");
        assert_eq!(sanitize_folder_name("Already_Safe-1"), "Already_Safe-1");
    }

    #[test]
    fn test_sanitize_reserved_characters() {
        let result = sanitize_filename("file<>:\"/\\|?*name.txt");
        assert_eq!(result, "file_name.txt");
        let result = sanitize_filename("a\u{0}b\tc\r\nd");
        assert_eq!(result, "a_b_c_d");
        assert_eq!(sanitize_filename("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_filename(".."), "__");
        assert_eq!(sanitize_filename(""), "_");
    }

    #[test]
    fn test_sanitize_folder_spaces() {
        assert_eq!(sanitize_folder_name("Posta inviata"), "Posta_inviata");
        assert_eq!(sanitize_folder_name("INBOX/Archivio  2023"), "INBOX_Archivio_2023");
    }

    #[test]
    fn test_sanitize_length() {
        let result = sanitize_filename(&"a".repeat(300));
        assert_eq!(result.chars().count(), MAX_NAME_LEN);

        let result = sanitize_filename(&format!("{}.eml", "b".repeat(300)));
        assert_eq!(result.chars().count(), MAX_NAME_LEN);
        assert!(result.ends_with(".eml"));

        let result = sanitize_folder_name(&"è ".repeat(300));
        assert!(result.chars().count() <= MAX_NAME_LEN);
    }

    #[test]
    fn test_sanitize_never_leaks_reserved() {
        let inputs = [
            "plain",
            "with space",
            "tab\there",
            "<<<>>>",
            "C:\\Windows\\system32",
            "\"quoted\"|piped?*",
            "ünïcödé/name",
        ];
        for input in inputs.iter() {
            for result in [sanitize_filename(input), sanitize_folder_name(input)].iter() {
                assert!(!result.chars().any(is_reserved), "{:?} -> {:?}", input, result);
                assert!(result.chars().count() <= MAX_NAME_LEN);
                assert!(!result.is_empty());
            }
        }
    }

    #[test]
    fn test_dated_paths() {
        let store = ArchiveStore::new("/base", LayoutMode::Dated);
        let path = store.resolve_path("test@example.com", date(15), Some("Posta inviata"));
        assert_eq!(
            path,
            Path::new("/base/test/2024/2024-01-15/Posta_inviata")
        );
        let root = store.resolve_path("test@example.com", date(15), None);
        assert_eq!(root, Path::new("/base/test/2024/2024-01-15"));
    }

    #[test]
    fn test_flat_paths() {
        let store = ArchiveStore::new("/base", LayoutMode::Flat);
        let first = store.resolve_path("test@example.com", date(15), Some("INBOX"));
        let second = store.resolve_path("test@example.com", date(16), Some("INBOX"));
        assert_eq!(first, second);
        let text = first.to_string_lossy();
        assert!(!text.contains("2024"));
        assert_eq!(first, Path::new("/base/test/INBOX"));
        assert_eq!(
            store.transient_dir("test@example.com", date(15)),
            Path::new("/base/test/2024/2024-01-15")
        );
    }

    #[test]
    fn test_ensure_layout_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = ArchiveStore::new(tmp.path(), LayoutMode::Dated);
        let folders = vec!["INBOX".to_string(), "Posta inviata".to_string()];
        let root = store.ensure_layout("test@example.com", date(15), &folders).unwrap();
        assert!(root.join("INBOX").is_dir());
        assert!(root.join("Posta_inviata").is_dir());

        let mut before: Vec<_> = fs::read_dir(&root).unwrap().map(|e| e.unwrap().path()).collect();
        before.sort();
        let again = store.ensure_layout("test@example.com", date(15), &folders).unwrap();
        let mut after: Vec<_> = fs::read_dir(&root).unwrap().map(|e| e.unwrap().path()).collect();
        after.sort();
        assert_eq!(root, again);
        assert_eq!(before, after);
    }

    #[test]
    fn test_persist_and_list() {
        let tmp = TempDir::new().unwrap();
        let store = ArchiveStore::new(tmp.path(), LayoutMode::Dated);
        store
            .ensure_layout("test@example.com", date(15), &["INBOX".to_string()])
            .unwrap();
        let raw = b"Subject: Test Subject\r\n\r\nbody";
        let path = store
            .persist_message("test@example.com", date(15), "INBOX", "123", raw)
            .unwrap();
        assert!(path.ends_with("INBOX/123.eml"));
        assert_eq!(fs::read(&path).unwrap(), raw.to_vec());
        store
            .persist_message("test@example.com", date(15), "INBOX", "../7", raw)
            .unwrap();
        let listed = store.list_messages("test@example.com", date(15), "INBOX").unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|p| p.extension().unwrap() == "eml"));
        assert!(listed.iter().all(|p| p.parent().unwrap().ends_with("INBOX")));
    }

    #[test]
    fn test_persist_into_missing_folder() {
        let tmp = TempDir::new().unwrap();
        let store = ArchiveStore::new(tmp.path(), LayoutMode::Dated);
        let err = store
            .persist_message("test@example.com", date(15), "INBOX", "1", b"x")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Storage);
    }

    #[test]
    fn test_flat_layout_accumulates() {
        let tmp = TempDir::new().unwrap();
        let store = ArchiveStore::new(tmp.path(), LayoutMode::Flat);
        let folders = ["INBOX".to_string()];
        store.ensure_layout("test@example.com", date(15), &folders).unwrap();
        store.persist_message("test@example.com", date(15), "INBOX", "1", b"a").unwrap();
        store.ensure_layout("test@example.com", date(16), &folders).unwrap();
        store.persist_message("test@example.com", date(16), "INBOX", "2", b"b").unwrap();
        let day1 = store.list_messages("test@example.com", date(15), "INBOX").unwrap();
        let day2 = store.list_messages("test@example.com", date(16), "INBOX").unwrap();
        assert_eq!(day1.len(), 2);
        assert_eq!(day1, day2);
    }
}
