//! # mailmirror-core
//!
//! Mirrors IMAP mailboxes into a content-addressed archive and keeps
//! remote flags and local tags in step.
//!
//! This crate provides:
//! - A header digest over `From`, `Date` and `Message-ID`, and the archive
//!   entry format
//! - Fixed-width binary mailbox indexes, one file per mailbox
//! - A deduplicating archive writer with a bounded pool of write slots
//! - The per-mailbox reconciliation pass
//! - Flag/tag translation and the tag store's revision checkpoint
//! - Exclusive connection ownership with an interruptible IDLE listener
//! - Batch and live drivers

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod account;
pub mod archive;
pub mod codec;
pub mod config;
pub mod conn;
mod error;
mod file_ops;
pub mod flags;
pub mod index;
pub mod reconcile;
pub mod remote;
pub mod revision;
pub mod sync;
pub mod tags;
pub mod tagstore;

pub use account::{
    AccountConfig, Auth, MailboxConfig, ValidationError, ValidationResult, mailbox_id,
    validate_account,
};
pub use archive::{Archive, ArchiveWriter, WorkItem, WriteReport};
pub use codec::{Digest, Headers, ParseError};
pub use config::{EngineConfig, Settings};
pub use conn::{Connection, ConnectionGuard};
pub use error::{Error, Result};
pub use flags::{FlagEntry, FlagTable, FlagTicket, TagOp};
pub use index::{Field, IndexError, IndexRecord, MailboxIndex};
pub use reconcile::{MailboxReport, MailboxSpec, Reconciled, Reconciler};
pub use remote::{Connector, ImapConnector, RemoteError, RemoteSession};
pub use revision::{DeltaScope, RevisionCheckpoint, StorePlan, TagDeltas};
pub use sync::{BatchReport, run_batch, run_live};
pub use tags::{PendingDeletes, TagBatch};
pub use tagstore::{Notmuch, TagStore, TagStoreError};
