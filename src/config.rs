//! Typed configuration, read from a TOML file.
//!
//! Every section has defaults except the account list and the base path.
//! [`Config::validate`] collects all problems at once so that a broken
//! file is reported in a single pass before any run starts.

use anyhow::{bail, Context};
use chrono::NaiveTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::ArchiveFormat;
use crate::retry::RetryPolicy;
use crate::store::{sanitize_filename, sanitize_folder_name};

pub const RUN_TIME_FORMAT: &str = "%H:%M";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// Dated local trees, archives are kept next to the messages.
    #[default]
    Standard,
    /// Flat local trees, daily archives are shipped to object storage and
    /// then removed locally.
    #[serde(alias = "s3_sync")]
    RemoteSync,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub base_path: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub backup_mode: BackupMode,
    #[serde(default)]
    pub compression: ArchiveFormat,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub protocol: ProtocolSettings,
    #[serde(default)]
    pub source: SourceSettings,
    #[serde(default, alias = "s3")]
    pub remote: Option<RemoteSettings>,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

fn default_concurrency() -> usize {
    4
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub folders: Vec<String>,
}

fn default_port() -> u16 {
    993
}

impl Account {
    /// The part of the username before `@`, used to name directories,
    /// archives and remote keys.
    pub fn local_part(&self) -> &str {
        local_part(&self.username)
    }
}

pub fn local_part(username: &str) -> &str {
    username.split('@').next().unwrap_or(username)
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Account")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("folders", &self.folders)
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolSettings {
    /// Connection timeout, in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_timeout() -> u64 {
    30
}

fn default_batch_size() -> usize {
    100
}

impl Default for ProtocolSettings {
    fn default() -> Self {
        ProtocolSettings {
            timeout: default_timeout(),
            batch_size: default_batch_size(),
        }
    }
}

/// Settings of the bundled maildir mail source.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceSettings {
    /// Root holding one synchronised maildir tree per account username.
    pub maildir_root: Option<PathBuf>,
}

#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteSettings {
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    /// Custom endpoint for S3-compatible services.
    pub endpoint_url: Option<String>,
    /// Mirror objects into this directory instead of talking to S3.
    pub local_root: Option<PathBuf>,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "pec-backups".to_string()
}

impl fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("prefix", &self.prefix)
            .field("aws_access_key_id", &self.aws_access_key_id)
            .field(
                "aws_secret_access_key",
                &self.aws_secret_access_key.as_ref().map(|_| "<redacted>"),
            )
            .field("endpoint_url", &self.endpoint_url)
            .field("local_root", &self.local_root)
            .finish()
    }
}

impl RemoteSettings {
    fn validate(&self, problems: &mut Vec<String>) {
        if self.bucket.trim().is_empty() {
            problems.push("remote: bucket name is required".to_string());
        }
        match (&self.aws_access_key_id, &self.aws_secret_access_key) {
            (Some(_), None) => problems.push(
                "remote: aws_secret_access_key is required when aws_access_key_id is provided"
                    .to_string(),
            ),
            (None, Some(_)) => problems.push(
                "remote: aws_access_key_id is required when aws_secret_access_key is provided"
                    .to_string(),
            ),
            _ => {}
        }
        if self.local_root.is_none() && !cfg!(feature = "s3") {
            problems.push(
                "remote: local_root is required unless built with the `s3` feature".to_string(),
            );
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerSettings {
    /// Time of day of the daily run, `HH:MM` in local time.
    #[serde(default = "default_run_time")]
    pub run_time: String,
}

fn default_run_time() -> String {
    "01:00".to_string()
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        SchedulerSettings {
            run_time: default_run_time(),
        }
    }
}

impl SchedulerSettings {
    pub fn run_time(&self) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(&self.run_time, RUN_TIME_FORMAT).ok()
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationSettings {
    #[serde(default)]
    pub enabled: bool,
    pub report_dir: Option<PathBuf>,
    /// Only notify when at least one account reported an error.
    #[serde(default)]
    pub only_on_error: bool,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        let config = Config::parse(&text)
            .with_context(|| format!("cannot parse config file {}", path.display()))?;
        let problems = config.validate();
        if !problems.is_empty() {
            bail!("invalid configuration:\n  {}", problems.join("\n  "));
        }
        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Config> {
        Ok(toml::from_str(text)?)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = vec![];
        if self.base_path.as_os_str().is_empty() {
            problems.push("base_path must not be empty".to_string());
        }
        if self.concurrency == 0 {
            problems.push("concurrency must be at least 1".to_string());
        }
        if self.accounts.is_empty() {
            problems.push("at least one account is required".to_string());
        }
        for (i, account) in self.accounts.iter().enumerate() {
            if account.username.trim().is_empty() {
                problems.push(format!("accounts[{}]: username is required", i));
            }
            if account.host.trim().is_empty() {
                problems.push(format!("accounts[{}]: host is required", i));
            }
            if account.folders.is_empty() {
                problems.push(format!("accounts[{}]: at least one folder is required", i));
            }
            let mut folders = HashMap::new();
            for folder in &account.folders {
                if let Some(other) = folders.insert(sanitize_folder_name(folder), folder) {
                    problems.push(format!(
                        "accounts[{}]: folders {:?} and {:?} would be stored in the same directory",
                        i, other, folder
                    ));
                }
            }
        }
        // Every account needs a subtree of its own under base_path.
        let mut owners: HashMap<String, &str> = HashMap::new();
        for account in &self.accounts {
            let dir = sanitize_filename(account.local_part());
            match owners.insert(dir.clone(), &account.username) {
                Some(other) if other == account.username => {
                    problems.push(format!("account {} is configured twice", other))
                }
                Some(other) => problems.push(format!(
                    "accounts {} and {} would share the directory {:?}",
                    other, account.username, dir
                )),
                None => {}
            }
        }
        problems.extend(self.retry_policy.problems());
        if self.protocol.batch_size == 0 {
            problems.push("protocol: batch_size must be at least 1".to_string());
        }
        if self.scheduler.run_time().is_none() {
            problems.push(format!(
                "scheduler: run_time {:?} is not a valid HH:MM time",
                self.scheduler.run_time
            ));
        }
        if self.notifications.enabled && self.notifications.report_dir.is_none() {
            problems.push("notifications: report_dir is required when enabled".to_string());
        }
        match (&self.remote, self.backup_mode) {
            (Some(remote), _) => remote.validate(&mut problems),
            (None, BackupMode::RemoteSync) => {
                problems.push("remote_sync mode requires a [remote] section".to_string())
            }
            (None, BackupMode::Standard) => {}
        }
        problems
    }
}
