use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, ErrorRecord, Result};
use crate::index::IndexStats;
use crate::store::write_atomically;

pub const SUMMARY_FILE: &str = "summary.json";

/// The terminal record of one account's processing for one date.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account: String,
    pub date: NaiveDate,
    pub stats: IndexStats,
    pub archive_path: Option<PathBuf>,
    pub digest_path: Option<PathBuf>,
    pub errors: Vec<ErrorRecord>,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub duration_seconds: f64,
}

impl AccountSummary {
    pub fn is_successful(&self) -> bool {
        self.errors.is_empty()
    }
}

pub fn write_summary(dir: &Path, summary: &AccountSummary) -> Result<PathBuf> {
    let path = dir.join(SUMMARY_FILE);
    let json = serde_json::to_vec_pretty(summary).map_err(|e| {
        Error::storage(
            "cannot serialize summary",
            &path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    write_atomically(&path, &json).map_err(|e| Error::storage("cannot write summary", &path, e))?;
    Ok(path)
}

pub fn read_summary(path: &Path) -> Result<AccountSummary> {
    let text =
        fs::read_to_string(path).map_err(|e| Error::storage("cannot read summary", path, e))?;
    serde_json::from_str(&text).map_err(|e| {
        Error::storage(
            "cannot parse summary",
            path,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountError {
    pub account: String,
    #[serde(flatten)]
    pub record: ErrorRecord,
}

/// Run-level aggregation of the account summaries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub date: NaiveDate,
    pub accounts_processed: usize,
    pub accounts_successful: usize,
    pub total_messages: usize,
    pub unread_messages: usize,
    pub errors: Vec<AccountError>,
    pub accounts: Vec<AccountSummary>,
}

impl RunReport {
    /// Aggregates the summaries of a run over `total_accounts` configured
    /// accounts. Accounts without a summary count as processed but not
    /// successful. The result does not depend on the order of `summaries`.
    pub fn aggregate(date: NaiveDate, total_accounts: usize, mut summaries: Vec<AccountSummary>) -> Self {
        summaries.sort_by(|a, b| a.account.cmp(&b.account));
        let mut report = RunReport {
            date,
            accounts_processed: total_accounts.max(summaries.len()),
            accounts_successful: 0,
            total_messages: 0,
            unread_messages: 0,
            errors: vec![],
            accounts: vec![],
        };
        for summary in &summaries {
            if summary.is_successful() {
                report.accounts_successful += 1;
            }
            report.total_messages += summary.stats.total_messages;
            report.unread_messages += summary.stats.unread_messages;
            report
                .errors
                .extend(summary.errors.iter().map(|record| AccountError {
                    account: summary.account.clone(),
                    record: record.clone(),
                }));
        }
        report.accounts = summaries;
        report
    }

    pub fn has_errors(&self) -> bool {
        self.accounts_successful < self.accounts_processed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use tempfile::TempDir;

    pub fn summary(account: &str, messages: usize, errors: usize) -> AccountSummary {
        let now = Local::now();
        let mut stats = IndexStats::default();
        stats.total_messages = messages;
        stats.folders.insert("INBOX".to_string(), messages);
        AccountSummary {
            account: account.to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            stats,
            archive_path: None,
            digest_path: None,
            errors: (0..errors)
                .map(|i| ErrorRecord::new(&Error::Protocol(format!("failure {}", i))))
                .collect(),
            start_time: now,
            end_time: now,
            duration_seconds: 0.0,
        }
    }

    #[test]
    fn test_summary_file() {
        let tmp = TempDir::new().unwrap();
        let original = summary("a@pec.it", 3, 1);
        let path = write_summary(tmp.path(), &original).unwrap();
        assert_eq!(path, tmp.path().join(SUMMARY_FILE));
        let read = read_summary(&path).unwrap();
        assert_eq!(read.account, original.account);
        assert_eq!(read.errors.len(), 1);
        assert_eq!(read.stats, original.stats);
    }

    #[test]
    fn test_aggregate() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let report = RunReport::aggregate(
            date,
            4,
            vec![summary("b@pec.it", 2, 0), summary("a@pec.it", 5, 2), summary("c@pec.it", 1, 0)],
        );
        assert_eq!(report.accounts_processed, 4);
        assert_eq!(report.accounts_successful, 2);
        assert_eq!(report.total_messages, 8);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|e| e.account == "a@pec.it"));
        assert!(report.has_errors());
    }

    #[test]
    fn test_aggregate_ignores_order() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let a = summary("a@pec.it", 5, 1);
        let b = summary("b@pec.it", 2, 0);
        let first = RunReport::aggregate(date, 2, vec![a.clone(), b.clone()]);
        let second = RunReport::aggregate(date, 2, vec![b, a]);
        assert_eq!(first, second);
    }
}
