use chrono::{DateTime, FixedOffset, NaiveDate};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{FetchedMessage, MailSession, MailSource, MessageStream};
use crate::config::{Account, ProtocolSettings};
use crate::error::{Error, Result};

/// Mail source reading maildir trees kept in sync by an external agent
/// (mbsync, offlineimap, ...).
///
/// The mailbox of an account lives at `<root>/<username>/` and every
/// archived folder is a maildir below it, with the usual `cur` and `new`
/// subdirectories.
pub struct MaildirSource {
    root: PathBuf,
}

impl MaildirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        MaildirSource { root: root.into() }
    }
}

impl MailSource for MaildirSource {
    fn connect(
        &self,
        account: &Account,
        _settings: &ProtocolSettings,
    ) -> Result<Box<dyn MailSession + '_>> {
        let mailbox = self.root.join(&account.username);
        if !mailbox.is_dir() {
            return Err(Error::Protocol(format!(
                "no mailbox for {} under {}",
                account.username,
                self.root.display()
            )));
        }
        debug!(account = %account.username, "opened maildir session");
        Ok(Box::new(MaildirSession {
            username: account.username.clone(),
            mailbox,
        }))
    }
}

struct MaildirSession {
    username: String,
    mailbox: PathBuf,
}

impl MailSession for MaildirSession {
    fn fetch_by_date(
        &mut self,
        folder: &str,
        date: NaiveDate,
        batch_size: usize,
    ) -> Result<MessageStream<'_>> {
        let dir = self.mailbox.join(folder);
        if !dir.is_dir() {
            return Err(Error::Protocol(format!("folder {:?} does not exist", folder)));
        }
        let mut files = vec![];
        for sub in &["cur", "new"] {
            let sub = dir.join(sub);
            if !sub.is_dir() {
                continue;
            }
            let entries = fs::read_dir(&sub).map_err(|e| {
                Error::Protocol(format!("cannot list {}: {}", sub.display(), e))
            })?;
            for entry in entries {
                let entry = entry.map_err(|e| Error::Protocol(e.to_string()))?;
                let path = entry.path();
                if !is_hidden(&path) && path.is_file() {
                    files.push(path);
                }
            }
        }
        files.sort();
        debug!(folder, candidates = files.len(), "listed maildir folder");
        Ok(Box::new(DatedMessages {
            pending: files.into_iter(),
            ready: VecDeque::new(),
            batch_size: batch_size.max(1),
            date,
        }))
    }
}

impl Drop for MaildirSession {
    fn drop(&mut self) {
        debug!(account = %self.username, "closed maildir session");
    }
}

/// Reads candidate files one batch at a time and keeps those dated on the
/// target day.
///
/// Batches load on the calling thread, which is already a scheduler pool
/// thread; nested parallel work there may steal another account's job.
struct DatedMessages {
    pending: std::vec::IntoIter<PathBuf>,
    ready: VecDeque<Result<FetchedMessage>>,
    batch_size: usize,
    date: NaiveDate,
}

impl Iterator for DatedMessages {
    type Item = Result<FetchedMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(item);
            }
            let batch: Vec<PathBuf> = self.pending.by_ref().take(self.batch_size).collect();
            if batch.is_empty() {
                return None;
            }
            let date = self.date;
            self.ready
                .extend(batch.iter().filter_map(|path| load_if_dated(path, date)));
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(true, |name| name.starts_with('.'))
}

fn load_if_dated(path: &Path, date: NaiveDate) -> Option<Result<FetchedMessage>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) => {
            return Some(Err(Error::Protocol(format!(
                "cannot read {}: {}",
                path.display(),
                e
            ))))
        }
    };
    match get_datetime_from_email(&raw) {
        Some(dt) if dt.date_naive() == date => {}
        Some(_) => return None,
        None => {
            warn!("no usable Date header in {}, skipping it", path.display());
            return None;
        }
    }
    let file_name = path.file_name()?.to_string_lossy();
    let (uid, flags) = split_maildir_name(&file_name);
    Some(Ok(FetchedMessage {
        uid: uid.to_string(),
        raw,
        flags,
    }))
}

/// Splits a maildir file name into its unique part and the IMAP flags
/// encoded in the `:2,` info suffix.
fn split_maildir_name(name: &str) -> (&str, Vec<String>) {
    match name.split_once(":2,") {
        Some((uid, info)) => {
            let flags = info
                .chars()
                .filter_map(|c| match c {
                    'S' => Some("\\Seen"),
                    'R' => Some("\\Answered"),
                    'F' => Some("\\Flagged"),
                    'T' => Some("\\Deleted"),
                    'D' => Some("\\Draft"),
                    _ => None,
                })
                .map(str::to_string)
                .collect();
            (uid, flags)
        }
        None => (name, vec![]),
    }
}

fn normalize_datetime(mut dt: &str) -> Cow<str> {
    // Trailing commentary timezone info is not recognized.
    if dt.ends_with(')') {
        if let Some(pos) = dt.rfind('(') {
            dt = &dt[..pos];
        }
    }
    dt = dt.trim();
    // -0000 timezone cannot be parsed. Let's just treat it as +0000.
    if let Some(stripped) = dt.strip_suffix("-0000") {
        Cow::Owned(format!("{}+0000", stripped))
    } else {
        Cow::Borrowed(dt)
    }
}

fn get_datetime_from_email(raw: &[u8]) -> Option<DateTime<FixedOffset>> {
    const DATE_HEADER: &[u8] = b"date:";
    for line in raw.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        // End of the header section.
        if line.is_empty() {
            break;
        }
        if line.len() < DATE_HEADER.len() || !line[..DATE_HEADER.len()].eq_ignore_ascii_case(DATE_HEADER)
        {
            continue;
        }
        let value = String::from_utf8_lossy(&line[DATE_HEADER.len()..]);
        if let Ok(dt) = DateTime::parse_from_rfc2822(&normalize_datetime(&value)) {
            return Some(dt);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_datetime() {
        assert_eq!(
            normalize_datetime("Thu, 29 Sep 2016 23:18:26 +0000"),
            "Thu, 29 Sep 2016 23:18:26 +0000"
        );
        assert_eq!(
            normalize_datetime("Tue, 11 Jul 2017 18:30:33 +0000 (UTC)"),
            "Tue, 11 Jul 2017 18:30:33 +0000"
        );
        assert_eq!(
            normalize_datetime(" Sat, 01 Oct 2016 14:47:20 -0000"),
            "Sat, 01 Oct 2016 14:47:20 +0000"
        );
    }

    #[test]
    fn test_date_header_stops_at_body() {
        let raw = b"Subject: hi\r\nDATE: Mon, 15 Jan 2024 23:30:00 -0500\r\n\r\nDate: nope\r\n";
        let dt = get_datetime_from_email(raw).unwrap();
        assert_eq!(dt.date_naive(), NaiveDate::from_ymd_opt(2024, 1, 15).unwrap());
        assert_eq!(get_datetime_from_email(b"Subject: x\r\n\r\nDate: Mon, 15 Jan 2024 10:00:00 +0000\r\n"), None);
    }

    #[test]
    fn test_split_maildir_name() {
        assert_eq!(split_maildir_name("1705312800.M1P2.host"), ("1705312800.M1P2.host", vec![]));
        let (uid, flags) = split_maildir_name("1705312800.M1P2.host:2,RS");
        assert_eq!(uid, "1705312800.M1P2.host");
        assert_eq!(flags, vec!["\\Answered".to_string(), "\\Seen".to_string()]);
    }

    fn write_mail(dir: &Path, name: &str, date: &str) {
        let content = format!("From: a@pec.it\r\nDate: {}\r\nSubject: s\r\n\r\nbody\r\n", date);
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_fetch_by_date() {
        let root = TempDir::new().unwrap();
        let inbox = root.path().join("user@pec.it").join("INBOX");
        for sub in &["cur", "new", "tmp"] {
            fs::create_dir_all(inbox.join(sub)).unwrap();
        }
        write_mail(&inbox.join("cur"), "1.host:2,S", "Mon, 15 Jan 2024 08:00:00 +0100");
        write_mail(&inbox.join("new"), "2.host", "Mon, 15 Jan 2024 21:00:00 +0100");
        write_mail(&inbox.join("new"), "3.host", "Tue, 16 Jan 2024 09:00:00 +0100");
        fs::write(inbox.join("new").join(".hidden"), b"x").unwrap();

        let source = MaildirSource::new(root.path());
        let account: Account = toml::from_str(
            "username = \"user@pec.it\"\npassword = \"p\"\nhost = \"h\"\nfolders = [\"INBOX\"]",
        )
        .unwrap();
        let mut session = source.connect(&account, &ProtocolSettings::default()).unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let messages: Vec<_> = session
            .fetch_by_date("INBOX", date, 1)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].uid, "1.host");
        assert!(!messages[0].is_unread());
        assert_eq!(messages[1].uid, "2.host");
        assert!(messages[1].is_unread());

        assert!(session.fetch_by_date("Missing", date, 10).is_err());
    }

    #[test]
    fn test_batches_keep_file_order_inside_a_pool() {
        let root = TempDir::new().unwrap();
        let inbox = root.path().join("user@pec.it").join("INBOX");
        for sub in &["cur", "new"] {
            fs::create_dir_all(inbox.join(sub)).unwrap();
        }
        for i in 1..=7 {
            let date = if i == 4 {
                "Tue, 16 Jan 2024 09:00:00 +0100"
            } else {
                "Mon, 15 Jan 2024 09:00:00 +0100"
            };
            write_mail(&inbox.join("cur"), &format!("{}.host:2,S", i), date);
        }

        let source = MaildirSource::new(root.path());
        let account: Account = toml::from_str(
            "username = \"user@pec.it\"\npassword = \"p\"\nhost = \"h\"\nfolders = [\"INBOX\"]",
        )
        .unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let uids: Vec<String> = pool.install(|| {
            let mut session = source.connect(&account, &ProtocolSettings::default()).unwrap();
            session
                .fetch_by_date("INBOX", date, 2)
                .unwrap()
                .map(|message| message.unwrap().uid)
                .collect()
        });
        assert_eq!(uids, ["1.host", "2.host", "3.host", "5.host", "6.host", "7.host"]);
    }

    #[test]
    fn test_connect_without_mailbox() {
        let root = TempDir::new().unwrap();
        let source = MaildirSource::new(root.path());
        let account: Account = toml::from_str(
            "username = \"ghost@pec.it\"\npassword = \"p\"\nhost = \"h\"\nfolders = [\"INBOX\"]",
        )
        .unwrap();
        assert!(source.connect(&account, &ProtocolSettings::default()).is_err());
    }
}
