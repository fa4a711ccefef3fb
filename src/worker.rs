//! Processing of a single account.
//!
//! A worker walks one account through a fixed sequence of stages:
//!
//! ```text
//! Init -> StructureReady -> Fetched -> Indexed -> Archived -> Summarized -> Done
//! ```
//!
//! A failing stage leaves an [`ErrorRecord`] behind and the worker moves on
//! with whatever it has. Only two failures stop an account: the directory
//! structure cannot be created, or the summary cannot be written. In both
//! cases no summary exists afterwards.

use chrono::{Local, NaiveDate};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::archive::build_archive;
use crate::config::{Account, BackupMode, Config};
use crate::error::{Error, ErrorRecord, Result, WorkerError};
use crate::index::{Indexer, CSV_INDEX, JSON_INDEX};
use crate::report::{write_summary, AccountSummary};
use crate::retry::with_retry;
use crate::source::{MailSession, MailSource};
use crate::store::{sanitize_folder_name, ArchiveStore, LayoutMode};
use crate::verify::build_digest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Init,
    StructureReady,
    Fetched,
    Indexed,
    Archived,
    Summarized,
    Done,
}

pub struct AccountWorker<'a> {
    account: &'a Account,
    config: &'a Config,
    source: &'a dyn MailSource,
    store: ArchiveStore,
    errors: Vec<ErrorRecord>,
    /// Message files written during this run, with the uid they hold.
    written: HashMap<PathBuf, String>,
    stage: Stage,
}

impl<'a> AccountWorker<'a> {
    pub fn new(account: &'a Account, config: &'a Config, source: &'a dyn MailSource) -> Self {
        let mode = match config.backup_mode {
            BackupMode::Standard => LayoutMode::Dated,
            BackupMode::RemoteSync => LayoutMode::Flat,
        };
        AccountWorker {
            account,
            config,
            source,
            store: ArchiveStore::new(&config.base_path, mode),
            errors: vec![],
            written: HashMap::new(),
            stage: Stage::Init,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.stage, "{:?} cannot follow {:?}", next, self.stage);
        debug!(account = %self.account.username, stage = ?next, "stage reached");
        self.stage = next;
    }

    fn record(&mut self, record: ErrorRecord) {
        error!(
            account = %self.account.username,
            folder = record.folder.as_deref().unwrap_or("-"),
            uid = record.uid.as_deref().unwrap_or("-"),
            "{}",
            record.message
        );
        self.errors.push(record);
    }

    /// Archives the messages of `date` and returns the path of the
    /// account summary.
    pub fn process(&mut self, date: NaiveDate) -> std::result::Result<PathBuf, WorkerError> {
        let start_time = Local::now();
        let account = self.account;
        self.errors.clear();
        self.written.clear();
        self.stage = Stage::Init;
        info!(account = %account.username, %date, "processing account");

        let root = self
            .store
            .ensure_layout(&account.username, date, &account.folders)
            .map_err(|e| {
                error!(account = %account.username, "{}", e);
                WorkerError::Structure(e)
            })?;
        self.advance(Stage::StructureReady);

        let mut indexer = Indexer::new(&root);
        self.fetch(date, &mut indexer);
        self.advance(Stage::Fetched);

        if let Err(e) = indexer.finalize() {
            self.record(ErrorRecord::new(&e));
        }
        self.advance(Stage::Indexed);

        let (archive_path, digest_path) = self.archive(date, &root);
        self.advance(Stage::Archived);

        let end_time = Local::now();
        let stats = indexer.stats();
        let summary = AccountSummary {
            account: account.username.clone(),
            date,
            stats,
            archive_path,
            digest_path,
            errors: self.errors.clone(),
            start_time,
            end_time,
            duration_seconds: (end_time - start_time).num_milliseconds() as f64 / 1000.0,
        };
        let summary_path = write_summary(&root, &summary).map_err(|e| {
            error!(account = %account.username, "{}", e);
            WorkerError::Summary(e)
        })?;
        self.advance(Stage::Summarized);

        info!(
            account = %account.username,
            messages = summary.stats.total_messages,
            errors = summary.errors.len(),
            "completed in {:.2}s",
            summary.duration_seconds
        );
        self.advance(Stage::Done);
        Ok(summary_path)
    }

    fn fetch(&mut self, date: NaiveDate, indexer: &mut Indexer) {
        let config = self.config;
        let result = with_retry(&config.retry_policy, || self.fetch_all_folders(date, indexer));
        if let Err(e) = result {
            self.record(ErrorRecord::new(&e));
        }
    }

    /// One attempt: open a session and go through every folder. Folder
    /// failures are recorded here and do not fail the attempt.
    fn fetch_all_folders(&mut self, date: NaiveDate, indexer: &mut Indexer) -> Result<()> {
        let account = self.account;
        let source = self.source;
        let mut session = source.connect(account, &self.config.protocol)?;
        for folder in &account.folders {
            if let Err(e) = self.fetch_folder(&mut *session, folder, date, indexer) {
                self.record(ErrorRecord::new(&e).in_folder(folder));
            }
        }
        Ok(())
    }

    fn fetch_folder(
        &mut self,
        session: &mut dyn MailSession,
        folder: &str,
        date: NaiveDate,
        indexer: &mut Indexer,
    ) -> Result<()> {
        let account = self.account;
        let username = &account.username;
        let stream = session.fetch_by_date(folder, date, self.config.protocol.batch_size)?;
        let mut saved = 0;
        for message in stream {
            let message = message?;
            let target = self.store.message_path(username, date, folder, &message.uid);
            if let Some(owner) = self.written.get(&target).filter(|uid| **uid != message.uid) {
                let e = Error::storage(
                    "stored name already used by another message",
                    &target,
                    io::Error::new(io::ErrorKind::AlreadyExists, format!("uid {}", owner)),
                );
                self.record(ErrorRecord::new(&e).in_folder(folder).for_uid(&message.uid));
                continue;
            }
            match self
                .store
                .persist_message(username, date, folder, &message.uid, &message.raw)
            {
                Ok(path) => {
                    self.written.insert(path.clone(), message.uid.clone());
                    indexer.add_message(
                        &message.raw,
                        &message.uid,
                        folder,
                        &path,
                        message.is_unread(),
                    );
                    saved += 1;
                }
                Err(e) => {
                    let record = ErrorRecord::new(&e).in_folder(folder).for_uid(&message.uid);
                    self.record(record);
                }
            }
        }
        info!(account = %username, folder, saved, "folder fetched");
        Ok(())
    }

    /// Builds the archive and its digest. Failures are recorded and leave
    /// the corresponding path empty.
    fn archive(&mut self, date: NaiveDate, root: &Path) -> (Option<PathBuf>, Option<PathBuf>) {
        let account = self.account;
        let source_dir = match self.config.backup_mode {
            BackupMode::Standard => root.to_path_buf(),
            BackupMode::RemoteSync => match self.project(date, root) {
                Ok(dir) => dir,
                Err(e) => {
                    self.record(ErrorRecord::new(&e));
                    return (None, None);
                }
            },
        };

        let archive = match build_archive(
            &source_dir,
            account.local_part(),
            date,
            self.config.compression,
        ) {
            Ok(archive) => archive,
            Err(e) => {
                self.record(ErrorRecord::new(&e));
                return (None, None);
            }
        };
        let digest = match build_digest(&archive) {
            Ok(digest) => Some(digest),
            Err(e) => {
                self.record(ErrorRecord::new(&e));
                None
            }
        };

        match self.config.backup_mode {
            BackupMode::Standard => {
                info!(archive = %archive.display(), "archive kept locally");
            }
            BackupMode::RemoteSync => {
                let mut keep = vec![archive.clone()];
                keep.extend(digest.clone());
                if let Err(e) = prune_except(&source_dir, &keep) {
                    self.record(ErrorRecord::new(&e));
                }
                info!(archive = %archive.display(), "archive staged for upload");
            }
        }
        (Some(archive), digest)
    }

    /// Rebuilds the dated projection of the flat tree that the remote
    /// archive is made from: the index files plus every folder.
    fn project(&self, date: NaiveDate, root: &Path) -> Result<PathBuf> {
        let account = self.account;
        let dir = self.store.transient_dir(&account.username, date);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .map_err(|e| Error::storage("cannot clear staging directory", &dir, e))?;
        }
        fs::create_dir_all(&dir)
            .map_err(|e| Error::storage("cannot create staging directory", &dir, e))?;

        for name in [CSV_INDEX, JSON_INDEX] {
            let src = root.join(name);
            if src.is_file() {
                let dst = dir.join(name);
                fs::copy(&src, &dst).map_err(|e| Error::storage("cannot stage index", &dst, e))?;
            }
        }
        for folder in &account.folders {
            let src = self.store.resolve_path(&account.username, date, Some(folder));
            if src.is_dir() {
                let dst = dir.join(sanitize_folder_name(folder));
                copy_tree(&src, &dst)
                    .map_err(|e| Error::storage("cannot stage folder", &dst, e))?;
            } else {
                warn!(account = %account.username, folder = %folder, "nothing to stage");
            }
        }
        Ok(dir)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Empties `dir` of everything but `keep`.
fn prune_except(dir: &Path, keep: &[PathBuf]) -> Result<()> {
    let entries = fs::read_dir(dir).map_err(|e| Error::storage("cannot list", dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::storage("cannot list", dir, e))?;
        let path = entry.path();
        if keep.contains(&path) {
            continue;
        }
        let is_dir = entry
            .file_type()
            .map_err(|e| Error::storage("cannot inspect staged copy", &path, e))?
            .is_dir();
        let removed = if is_dir {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| Error::storage("cannot remove staged copy", &path, e))?;
    }
    Ok(())
}
