use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, NaiveTime};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::any::Any;
use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::{Account, BackupMode, Config};
use crate::error::WorkerError;
use crate::notify::Notifier;
use crate::remote::RemoteUploader;
use crate::report::{read_summary, AccountSummary, RunReport};
use crate::source::MailSource;
use crate::utils;
use crate::worker::AccountWorker;

/// Longest single sleep of the daily loop, so that clock changes are
/// noticed reasonably fast.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Runs are for the previous day unless a date is given.
pub fn default_target_date(today: NaiveDate) -> NaiveDate {
    today.pred_opt().unwrap_or(today)
}

/// The first `run_time` strictly after `now`.
pub fn next_trigger(now: NaiveDateTime, run_time: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(run_time);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

fn remove_if_empty(dir: &Path) -> io::Result<bool> {
    if fs::read_dir(dir)?.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(dir)?;
    Ok(true)
}

pub struct Scheduler {
    config: Config,
    source: Arc<dyn MailSource>,
    uploader: Option<RemoteUploader>,
    notifier: Box<dyn Notifier>,
    quiet: bool,
}

impl Scheduler {
    pub fn new(
        config: Config,
        source: Arc<dyn MailSource>,
        uploader: Option<RemoteUploader>,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        if config.backup_mode == BackupMode::RemoteSync {
            match &uploader {
                Some(uploader) => {
                    uploader.verify_reachable();
                }
                None => warn!("remote_sync mode without an uploader, archives stay local"),
            }
        }
        Scheduler {
            config,
            source,
            uploader,
            notifier,
            quiet: false,
        }
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Processes every account for `date` (yesterday by default) and
    /// returns the aggregated report. A run always produces a report,
    /// whatever happens to individual accounts.
    pub fn run_archive_job(&self, date: Option<NaiveDate>) -> RunReport {
        let date = date.unwrap_or_else(|| default_target_date(Local::now().date_naive()));
        info!(%date, accounts = self.config.accounts.len(), "archive run started");

        let mut summaries = vec![];
        for (username, outcome) in self.process_accounts(date) {
            match outcome.map_err(|e| e.to_string()).and_then(|path| {
                read_summary(&path).map_err(|e| e.to_string())
            }) {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!(account = %username, "account produced no summary: {}", e),
            }
        }

        if self.config.backup_mode == BackupMode::RemoteSync {
            self.handle_uploads(&summaries, date);
        }

        let report = RunReport::aggregate(date, self.config.accounts.len(), summaries);
        info!(
            %date,
            processed = report.accounts_processed,
            successful = report.accounts_successful,
            messages = report.total_messages,
            unread = report.unread_messages,
            errors = report.errors.len(),
            "archive run finished"
        );
        match self.notifier.send(&report, date) {
            Ok(true) => debug!("notification sent"),
            Ok(false) => debug!("notification skipped"),
            Err(e) => error!("cannot send notification: {}", e),
        }
        report
    }

    fn process_accounts(&self, date: NaiveDate) -> Vec<(String, Result<PathBuf, WorkerError>)> {
        let accounts = &self.config.accounts;
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency)
            .thread_name(|i| format!("pec-worker-{}", i))
            .build();
        let progress = utils::create_progress_bar(self.quiet, accounts.len());
        progress.tick();
        let run = || {
            accounts
                .par_iter()
                .map(|account| {
                    let outcome = self.process_account(account, date);
                    progress.inc(1);
                    (account.username.clone(), outcome)
                })
                .collect::<Vec<_>>()
        };
        let outcomes = match pool {
            Ok(pool) => pool.install(run),
            Err(e) => {
                warn!("cannot build worker pool, using the global one: {}", e);
                run()
            }
        };
        progress.finish_and_clear();
        outcomes
    }

    fn process_account(&self, account: &Account, date: NaiveDate) -> Result<PathBuf, WorkerError> {
        let source = &*self.source;
        panic::catch_unwind(AssertUnwindSafe(|| {
            AccountWorker::new(account, &self.config, source).process(date)
        }))
        .unwrap_or_else(|payload| Err(WorkerError::Panicked(panic_message(&*payload))))
    }

    /// Ships the archives one account at a time. Local files are only
    /// removed once the upload went through.
    fn handle_uploads(&self, summaries: &[AccountSummary], date: NaiveDate) {
        let uploader = match &self.uploader {
            Some(uploader) => uploader,
            None => return,
        };
        for summary in summaries {
            let archive = match &summary.archive_path {
                Some(archive) => archive,
                None => {
                    warn!(account = %summary.account, "no archive to upload");
                    continue;
                }
            };
            let digest = summary.digest_path.as_deref();
            match uploader.upload_archive(archive, &summary.account, date, digest) {
                Ok(receipt) => {
                    info!(
                        account = %summary.account,
                        key = %receipt.remote_key,
                        bytes = receipt.size_bytes,
                        "archive uploaded"
                    );
                    clean_local_copy(archive, digest);
                }
                Err(e) => error!(
                    account = %summary.account,
                    "upload failed, local archive kept: {}", e
                ),
            }
        }
    }

    /// Runs the archive job every day at the configured time. Never returns.
    pub fn run_forever(&self) {
        let run_time = self.config.scheduler.run_time().unwrap_or_default();
        loop {
            let next = next_trigger(Local::now().naive_local(), run_time);
            info!(next = %next, "next archive run scheduled");
            loop {
                let now = Local::now().naive_local();
                if now >= next {
                    break;
                }
                let wait = (next - now).to_std().unwrap_or(MAX_SLEEP);
                thread::sleep(wait.min(MAX_SLEEP));
            }
            self.run_archive_job(None);
        }
    }
}

/// Removes the uploaded archive and digest, then the dated directory and
/// its year directory when they are left empty.
fn clean_local_copy(archive: &Path, digest: Option<&Path>) {
    for file in std::iter::once(archive).chain(digest) {
        match fs::remove_file(file) {
            Ok(()) => debug!(path = %file.display(), "removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %file.display(), "cannot remove: {}", e),
        }
    }
    let dated = archive.parent();
    let year = dated.and_then(Path::parent);
    for dir in dated.into_iter().chain(year) {
        match remove_if_empty(dir) {
            Ok(true) => debug!(path = %dir.display(), "removed empty directory"),
            Ok(false) => break,
            Err(e) => {
                warn!(path = %dir.display(), "cannot remove directory: {}", e);
                break;
            }
        }
    }
}
