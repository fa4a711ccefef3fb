use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

pub type Result<T> = std::result::Result<T, Error>;

/// The category a fault belongs to.
///
/// Serialized in lowercase into every `summary.json`, so the names are
/// part of the on-disk format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Storage,
    Protocol,
    Indexing,
    Compression,
    Upload,
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{context} ({}): {source}", path.display())]
    Storage {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("mail source error: {0}")]
    Protocol(String),
    #[error("indexing error: {0}")]
    Indexing(String),
    #[error("cannot build archive {}: {message}", path.display())]
    Compression { path: PathBuf, message: String },
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn storage(context: &'static str, path: &Path, source: io::Error) -> Self {
        Error::Storage {
            context,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn compression(path: &Path, message: impl ToString) -> Self {
        Error::Compression {
            path: path.to_path_buf(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Storage { .. } => ErrorKind::Storage,
            Error::Protocol(_) => ErrorKind::Protocol,
            Error::Indexing(_) => ErrorKind::Indexing,
            Error::Compression { .. } => ErrorKind::Compression,
            Error::Upload(_) => ErrorKind::Upload,
            Error::Config(_) => ErrorKind::Config,
        }
    }
}

/// A failure recorded while processing an account.
///
/// Records are plain data: they are accumulated by the worker and end up
/// in the account summary instead of unwinding the stack.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Local>,
}

impl ErrorRecord {
    pub fn new(err: &Error) -> Self {
        ErrorRecord {
            kind: err.kind(),
            folder: None,
            uid: None,
            message: err.to_string(),
            timestamp: Local::now(),
        }
    }

    pub fn in_folder(mut self, folder: &str) -> Self {
        self.folder = Some(folder.to_string());
        self
    }

    pub fn for_uid(mut self, uid: &str) -> Self {
        self.uid = Some(uid.to_string());
        self
    }
}

/// Faults that abort the processing of one account.
///
/// Everything else a worker runs into becomes an [`ErrorRecord`].
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("cannot create directory structure: {0}")]
    Structure(#[source] Error),
    #[error("cannot write account summary: {0}")]
    Summary(#[source] Error),
    #[error("worker panicked: {0}")]
    Panicked(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_carries_kind_and_context() {
        let err = Error::Protocol("connection reset".to_string());
        let record = ErrorRecord::new(&err).in_folder("INBOX").for_uid("42");
        assert_eq!(record.kind, ErrorKind::Protocol);
        assert_eq!(record.folder.as_deref(), Some("INBOX"));
        assert_eq!(record.uid.as_deref(), Some("42"));
        assert!(record.message.contains("connection reset"));
    }

    #[test]
    fn test_kind_serializes_lowercase() {
        let json = serde_json::to_string(&ErrorKind::Compression).unwrap();
        assert_eq!(json, "\"compression\"");
        let err = Error::storage(
            "cannot write message",
            Path::new("/nowhere"),
            io::Error::from(io::ErrorKind::PermissionDenied),
        );
        assert_eq!(err.kind(), ErrorKind::Storage);
    }
}
