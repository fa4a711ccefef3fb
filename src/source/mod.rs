//! # Mail source
//!
//! A [`MailSource`] opens one [`MailSession`] per account. The session is
//! exclusively owned by the worker processing that account and is closed
//! when dropped, whatever path the worker leaves by.

mod maildir;

pub use self::maildir::MaildirSource;

use chrono::NaiveDate;

use crate::config::{Account, ProtocolSettings};
use crate::error::Result;

/// The flag marking a message as read.
pub const SEEN_FLAG: &str = "\\Seen";

/// One message as delivered by the mail source.
#[derive(Clone, Debug, PartialEq)]
pub struct FetchedMessage {
    /// Identifier assigned by the source, stable for the message.
    pub uid: String,
    pub raw: Vec<u8>,
    pub flags: Vec<String>,
}

impl FetchedMessage {
    /// A message is unread iff none of its flags is the seen marker,
    /// compared case-insensitively.
    pub fn is_unread(&self) -> bool {
        !self
            .flags
            .iter()
            .any(|flag| flag.eq_ignore_ascii_case(SEEN_FLAG))
    }
}

/// Messages of one folder, in delivery order. The stream cannot be resumed
/// once it yielded an error; a new session is needed to start over.
pub type MessageStream<'a> = Box<dyn Iterator<Item = Result<FetchedMessage>> + 'a>;

pub trait MailSource: Send + Sync {
    /// Open a session for `account`. Transport and authentication failures
    /// are reported as protocol errors.
    fn connect(
        &self,
        account: &Account,
        settings: &ProtocolSettings,
    ) -> Result<Box<dyn MailSession + '_>>;
}

pub trait MailSession {
    /// Lazily fetch the messages of `folder` dated `date`, `batch_size`
    /// messages at a time.
    fn fetch_by_date(
        &mut self,
        folder: &str,
        date: NaiveDate,
        batch_size: usize,
    ) -> Result<MessageStream<'_>>;
}


#[cfg(test)]
mod tests {
    use super::*;

    fn message(flags: &[&str]) -> FetchedMessage {
        FetchedMessage {
            uid: "1".to_string(),
            raw: vec![],
            flags: flags.iter().map(|f| f.to_string()).collect(),
        }
    }

    #[test]
    fn test_unread_derivation() {
        assert!(message(&[]).is_unread());
        assert!(message(&["\\Answered"]).is_unread());
        assert!(!message(&["\\Seen"]).is_unread());
        assert!(!message(&["\\Answered", "\\SEEN"]).is_unread());
        assert!(!message(&["\\seen"]).is_unread());
    }
}
