use chrono::{DateTime, Local};
use mail_parser::{Addr, Address, MessageParser};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::write_atomically;

pub const CSV_INDEX: &str = "index.csv";
pub const JSON_INDEX: &str = "index.json";

const CSV_COLUMNS: &[&str] = &[
    "uid", "folder", "subject", "from", "to", "date", "size", "unread", "path",
];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub uid: String,
    pub folder: String,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub date: Option<String>,
    pub size: usize,
    pub unread: bool,
    /// Location of the `.eml` file, relative to the index when possible.
    pub path: PathBuf,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_messages: usize,
    pub unread_messages: usize,
    pub folders: BTreeMap<String, usize>,
}

#[derive(Serialize)]
struct IndexDocument<'a> {
    generated_at: DateTime<Local>,
    #[serde(flatten)]
    stats: IndexStats,
    messages: &'a [IndexEntry],
}

/// Collects per-message metadata while messages are persisted, and writes
/// `index.csv` and `index.json` into its root on [`Indexer::finalize`].
///
/// Entries are keyed by folder and uid, so adding a message twice (after a
/// retried fetch, for example) replaces the first entry.
pub struct Indexer {
    root: PathBuf,
    entries: Vec<IndexEntry>,
    positions: HashMap<(String, String), usize>,
}

impl Indexer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Indexer {
            root: root.into(),
            entries: vec![],
            positions: HashMap::new(),
        }
    }

    pub fn add_message(&mut self, raw: &[u8], uid: &str, folder: &str, path: &Path, unread: bool) {
        let mut entry = IndexEntry {
            uid: uid.to_string(),
            folder: folder.to_string(),
            subject: String::new(),
            from: String::new(),
            to: vec![],
            date: None,
            size: raw.len(),
            unread,
            path: path.strip_prefix(&self.root).unwrap_or(path).to_path_buf(),
        };
        match MessageParser::default().parse(raw) {
            Some(message) => {
                entry.subject = message.subject().unwrap_or_default().to_string();
                entry.from = message
                    .from()
                    .and_then(|from| addresses(from).into_iter().next())
                    .unwrap_or_default();
                entry.to = message.to().map(addresses).unwrap_or_default();
                entry.date = message.date().map(|date| date.to_rfc3339());
                if entry.date.is_none() {
                    debug!(folder, uid, "message has no usable Date header");
                }
            }
            None => warn!(folder, uid, "cannot parse message headers, indexing it bare"),
        }

        let key = (entry.folder.clone(), entry.uid.clone());
        match self.positions.get(&key) {
            Some(&pos) => self.entries[pos] = entry,
            None => {
                self.positions.insert(key, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn stats(&self) -> IndexStats {
        let mut stats = IndexStats::default();
        for entry in &self.entries {
            stats.total_messages += 1;
            if entry.unread {
                stats.unread_messages += 1;
            }
            *stats.folders.entry(entry.folder.clone()).or_default() += 1;
        }
        stats
    }

    /// Writes both index files. Calling it again overwrites them.
    pub fn finalize(&self) -> Result<(PathBuf, PathBuf)> {
        let csv_path = self.root.join(CSV_INDEX);
        write_atomically(&csv_path, self.to_csv().as_bytes())
            .map_err(|e| Error::Indexing(format!("cannot write {}: {}", csv_path.display(), e)))?;

        let json_path = self.root.join(JSON_INDEX);
        let document = IndexDocument {
            generated_at: Local::now(),
            stats: self.stats(),
            messages: &self.entries,
        };
        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| Error::Indexing(format!("cannot serialize index: {}", e)))?;
        write_atomically(&json_path, &json)
            .map_err(|e| Error::Indexing(format!("cannot write {}: {}", json_path.display(), e)))?;

        debug!(
            root = %self.root.display(),
            messages = self.entries.len(),
            "index written"
        );
        Ok((csv_path, json_path))
    }

    fn to_csv(&self) -> String {
        let mut out = CSV_COLUMNS.join(",");
        out.push_str("\r\n");
        for entry in &self.entries {
            let fields = [
                entry.uid.clone(),
                entry.folder.clone(),
                entry.subject.clone(),
                entry.from.clone(),
                entry.to.join("; "),
                entry.date.clone().unwrap_or_default(),
                entry.size.to_string(),
                entry.unread.to_string(),
                entry.path.to_string_lossy().into_owned(),
            ];
            let row: Vec<_> = fields.iter().map(|field| csv_field(field)).collect();
            out.push_str(&row.join(","));
            out.push_str("\r\n");
        }
        out
    }
}

fn csv_field(value: &str) -> String {
    if value.contains(|c: char| matches!(c, ',' | '"' | '\r' | '\n')) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn format_addr(addr: &Addr) -> Option<String> {
    match (addr.name.as_deref(), addr.address.as_deref()) {
        (Some(name), Some(address)) => Some(format!("{} <{}>", name, address)),
        (None, Some(address)) => Some(address.to_string()),
        (Some(name), None) => Some(name.to_string()),
        (None, None) => None,
    }
}

fn addresses(address: &Address) -> Vec<String> {
    match address {
        Address::List(addrs) => addrs.iter().filter_map(format_addr).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|group| group.addresses.iter())
            .filter_map(format_addr)
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const RAW: &[u8] = b"From: Mario Rossi <mario@pec.it>\r\n\
        To: a@pec.it, b@pec.it\r\n\
        Subject: Fattura, gennaio\r\n\
        Date: Mon, 15 Jan 2024 10:00:00 +0100\r\n\
        \r\n\
        body\r\n";

    #[test]
    fn test_entry_fields() {
        let mut indexer = Indexer::new("/root/acct");
        indexer.add_message(RAW, "7", "INBOX", Path::new("/root/acct/INBOX/7.eml"), true);
        let entry = &indexer.entries()[0];
        assert_eq!(entry.subject, "Fattura, gennaio");
        assert_eq!(entry.from, "Mario Rossi <mario@pec.it>");
        assert_eq!(entry.to, vec!["a@pec.it".to_string(), "b@pec.it".to_string()]);
        assert!(entry.date.as_deref().unwrap().starts_with("2024-01-15T10:00:00"));
        assert_eq!(entry.size, RAW.len());
        assert_eq!(entry.path, Path::new("INBOX/7.eml"));
    }

    #[test]
    fn test_malformed_message_still_indexed() {
        let mut indexer = Indexer::new("/root/acct");
        indexer.add_message(b"", "1", "INBOX", Path::new("/elsewhere/1.eml"), false);
        assert_eq!(indexer.entries().len(), 1);
        assert_eq!(indexer.entries()[0].path, Path::new("/elsewhere/1.eml"));
        assert_eq!(indexer.stats().total_messages, 1);
    }

    #[test]
    fn test_stats_and_dedup() {
        let mut indexer = Indexer::new("/root/acct");
        let path = Path::new("/root/acct/x.eml");
        indexer.add_message(RAW, "1", "INBOX", path, true);
        indexer.add_message(RAW, "2", "INBOX", path, false);
        indexer.add_message(RAW, "1", "Posta inviata", path, false);
        indexer.add_message(RAW, "1", "INBOX", path, true);
        let stats = indexer.stats();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.unread_messages, 1);
        assert_eq!(stats.folders["INBOX"], 2);
        assert_eq!(stats.folders["Posta inviata"], 1);
    }

    #[test]
    fn test_finalize_writes_both_indexes() {
        let tmp = TempDir::new().unwrap();
        let mut indexer = Indexer::new(tmp.path());
        indexer.add_message(RAW, "1", "INBOX", &tmp.path().join("INBOX/1.eml"), true);
        indexer.add_message(RAW, "2", "INBOX", &tmp.path().join("INBOX/2.eml"), false);
        let (csv_path, json_path) = indexer.finalize().unwrap();
        // A second call simply overwrites.
        indexer.finalize().unwrap();

        let csv = fs::read_to_string(csv_path).unwrap();
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("uid,folder,subject"));
        assert!(lines[1].contains("\"Fattura, gennaio\""));

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(json_path).unwrap()).unwrap();
        assert_eq!(json["total_messages"], 2);
        assert_eq!(json["unread_messages"], 1);
        assert_eq!(json["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_csv_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }
}
