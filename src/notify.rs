use chrono::NaiveDate;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use crate::config::NotificationSettings;
use crate::error::{Error, Result};
use crate::report::RunReport;
use crate::store::write_atomically;

/// Delivers the report of a run. `Ok(false)` means nothing was sent.
pub trait Notifier: Send + Sync {
    fn send(&self, report: &RunReport, date: NaiveDate) -> Result<bool>;
}

/// Drops `report-<YYYY-MM-DD>.json` into a directory watched by whatever
/// forwards reports to people (mail relay, chat bridge, monitoring).
pub struct ReportNotifier {
    enabled: bool,
    only_on_error: bool,
    report_dir: Option<PathBuf>,
}

impl ReportNotifier {
    pub fn new(settings: &NotificationSettings) -> Self {
        ReportNotifier {
            enabled: settings.enabled,
            only_on_error: settings.only_on_error,
            report_dir: settings.report_dir.clone(),
        }
    }
}

impl Notifier for ReportNotifier {
    fn send(&self, report: &RunReport, date: NaiveDate) -> Result<bool> {
        if !self.enabled || (self.only_on_error && !report.has_errors()) {
            return Ok(false);
        }
        let dir = self
            .report_dir
            .as_ref()
            .ok_or_else(|| Error::Config("notifications: report_dir is not set".to_string()))?;
        fs::create_dir_all(dir).map_err(|e| Error::storage("cannot create report directory", dir, e))?;
        let path = dir.join(format!("report-{}.json", date.format("%Y-%m-%d")));
        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| Error::Config(format!("cannot serialize report: {}", e)))?;
        write_atomically(&path, &json).map_err(|e| Error::storage("cannot write report", &path, e))?;
        info!(report = %path.display(), "run report delivered");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::summary;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn settings(dir: &TempDir, enabled: bool, only_on_error: bool) -> NotificationSettings {
        NotificationSettings {
            enabled,
            report_dir: Some(dir.path().join("reports")),
            only_on_error,
        }
    }

    #[test]
    fn test_disabled() {
        let tmp = TempDir::new().unwrap();
        let notifier = ReportNotifier::new(&settings(&tmp, false, false));
        let report = RunReport::aggregate(date(), 1, vec![summary("a@pec.it", 1, 0)]);
        assert!(!notifier.send(&report, date()).unwrap());
        assert!(!tmp.path().join("reports").exists());
    }

    #[test]
    fn test_writes_report() {
        let tmp = TempDir::new().unwrap();
        let notifier = ReportNotifier::new(&settings(&tmp, true, false));
        let report = RunReport::aggregate(date(), 1, vec![summary("a@pec.it", 1, 0)]);
        assert!(notifier.send(&report, date()).unwrap());
        let written = fs::read_to_string(tmp.path().join("reports/report-2024-01-15.json")).unwrap();
        let parsed: RunReport = serde_json::from_str(&written).unwrap();
        assert_eq!(parsed.accounts_successful, 1);
    }

    #[test]
    fn test_only_on_error() {
        let tmp = TempDir::new().unwrap();
        let notifier = ReportNotifier::new(&settings(&tmp, true, true));
        let clean = RunReport::aggregate(date(), 1, vec![summary("a@pec.it", 1, 0)]);
        assert!(!notifier.send(&clean, date()).unwrap());
        let failed = RunReport::aggregate(date(), 2, vec![summary("a@pec.it", 1, 0)]);
        assert!(notifier.send(&failed, date()).unwrap());
    }
}
