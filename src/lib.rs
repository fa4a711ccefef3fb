//! Daily archiving of certified-email (PEC) mailboxes.
//!
//! For every configured account a worker fetches the messages of a day,
//! stores them under a per-account tree, indexes them and bundles the
//! result into a compressed archive with a SHA-256 digest. In remote-sync
//! mode the archives are then shipped to object storage and removed
//! locally. The [`scheduler::Scheduler`] drives the workers and aggregates
//! their summaries into a [`report::RunReport`].

pub mod archive;
pub mod config;
pub mod error;
pub mod index;
pub mod notify;
pub mod remote;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod source;
pub mod store;
pub mod verify;
pub mod worker;

mod utils;
