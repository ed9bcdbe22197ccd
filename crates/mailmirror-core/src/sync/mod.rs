//! Batch and live drivers.
//!
//! Both drive the same per-mailbox step: reconcile, push local tag
//! changes as remote flags while the mailbox is still selected, save the
//! index. Tag updates and deletions are collected per cycle and applied
//! to the tag store in one batch.

mod batch;
mod live;

use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

pub use batch::{BatchReport, run_batch};
pub use live::run_live;

use crate::account::AccountConfig;
use crate::archive::Archive;
use crate::config::EngineConfig;
use crate::index::{IndexError, MailboxIndex};
use crate::reconcile::{MailboxSpec, Reconciler};
use crate::remote::RemoteSession;
use crate::revision::TagDeltas;
use crate::tags::{PendingDeletes, TagBatch};
use crate::tagstore::TagStore;
use crate::{Error, Result};

/// One configured mailbox and its index.
#[derive(Debug, Clone)]
pub struct MailboxState {
    /// Name on the server.
    pub name: String,
    /// Mailbox identifier.
    pub id: String,
    /// Extra tags for newly seen messages.
    pub tags: Vec<String>,
    /// Index file.
    pub path: PathBuf,
    /// Current index.
    pub index: MailboxIndex,
}

impl MailboxState {
    fn spec(&self) -> MailboxSpec<'_> {
        MailboxSpec {
            name: &self.name,
            id: &self.id,
            tags: &self.tags,
        }
    }
}

fn index_error(path: &Path, e: IndexError) -> Error {
    match e {
        IndexError::Io(e) => Error::storage(path, e),
        other => Error::storage(path, std::io::Error::other(other)),
    }
}

async fn create_dirs(config: &EngineConfig) -> Result<()> {
    for dir in [&config.index_dir, &config.archive_dir] {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| Error::storage(dir, e))?;
    }
    if let Some(parent) = config.checkpoint_file.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::storage(parent, e))?;
    }
    Ok(())
}

/// Loads the index of every mailbox of an account.
///
/// # Errors
///
/// Fails if an existing index file cannot be read.
pub async fn load_mailboxes(
    config: &EngineConfig,
    account: &AccountConfig,
) -> Result<Vec<MailboxState>> {
    let mut mailboxes = Vec::with_capacity(account.mailboxes.len());
    for mailbox in &account.mailboxes {
        let id = account.mailbox_id(mailbox.name());
        let path = config.index_path(&id);
        let index = MailboxIndex::load_or_empty(&path)
            .await
            .map_err(|e| index_error(&path, e))?;
        mailboxes.push(MailboxState {
            name: mailbox.name().to_string(),
            id,
            tags: mailbox.tags(),
            path,
            index,
        });
    }
    Ok(mailboxes)
}

/// Writes every index back to disk.
///
/// # Errors
///
/// Fails on the first index that cannot be written.
pub async fn save_mailboxes(mailboxes: &mut [MailboxState]) -> Result<()> {
    for mailbox in mailboxes {
        mailbox
            .index
            .save(&mailbox.path)
            .await
            .map_err(|e| index_error(&mailbox.path, e))?;
    }
    Ok(())
}

/// What one cycle over an account's mailboxes produced.
#[derive(Debug, Default)]
pub struct CycleOutcome {
    /// Tag updates for the tag store.
    pub batch: TagBatch,
    /// Digests pruned from some index.
    pub removed: PendingDeletes,
    /// Mailboxes reconciled.
    pub mailboxes: usize,
    /// Mailboxes whose pass failed.
    pub failed_mailboxes: usize,
    /// Remote flags added from local tags.
    pub pushed: usize,
    /// The connection died; later cycles cannot use it.
    pub connection_lost: bool,
}

impl CycleOutcome {
    /// True if there is nothing for the tag store.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty() && self.removed.is_empty()
    }
}

/// Reconciles every mailbox of one account in order.
///
/// A failing mailbox is logged and skipped. A lost connection skips the
/// remaining mailboxes.
///
/// # Errors
///
/// Only storage failures are returned.
pub async fn sync_mailboxes<R: RemoteSession>(
    session: &mut R,
    account: &str,
    reconciler: &Reconciler,
    mailboxes: &mut [MailboxState],
    deltas: &TagDeltas,
) -> Result<CycleOutcome> {
    let mut outcome = CycleOutcome::default();
    let total = mailboxes.len();

    for (n, mailbox) in mailboxes.iter_mut().enumerate() {
        match sync_mailbox(session, reconciler, mailbox, deltas, &mut outcome).await {
            Ok(()) => outcome.mailboxes += 1,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                error!(account, mailbox = %mailbox.name, error = %e, "mailbox pass failed");
                outcome.failed_mailboxes += 1;
                if e.is_connection_lost() {
                    warn!(account, skipped = total - n - 1, "connection lost, skipping remaining mailboxes");
                    outcome.failed_mailboxes += total - n - 1;
                    outcome.connection_lost = true;
                    break;
                }
            }
        }
    }
    Ok(outcome)
}

/// One mailbox step. The index in `mailbox` only changes if every part
/// succeeded.
async fn sync_mailbox<R: RemoteSession>(
    session: &mut R,
    reconciler: &Reconciler,
    mailbox: &mut MailboxState,
    deltas: &TagDeltas,
    outcome: &mut CycleOutcome,
) -> Result<()> {
    let mut work = mailbox.index.clone();
    let reconciled = reconciler.run(session, mailbox.spec(), &mut work).await?;

    let mut pushed = 0;
    for plan in deltas.plan(&mut work) {
        session
            .store_add(&plan.uids, &plan.flag)
            .await
            .map_err(|source| Error::Protocol {
                mailbox: mailbox.name.clone(),
                source,
            })?;
        plan.apply(&mut work);
        pushed += plan.uids.len();
        info!(mailbox = %mailbox.id, flag = %plan.flag, count = plan.uids.len(), "pushed local tags");
    }

    work.save(&mailbox.path)
        .await
        .map_err(|e| index_error(&mailbox.path, e))?;
    mailbox.index = work;

    for ticket in &reconciled.tickets {
        outcome
            .batch
            .record(reconciler.archive(), reconciler.table(), ticket);
    }
    outcome.removed.extend(reconciled.removed);
    outcome.pushed += pushed;
    Ok(())
}

/// What one tag store update did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreApplied {
    /// Batch lines sent.
    pub lines: usize,
    /// Messages tagged offline.
    pub deleted: usize,
}

/// Applies one cycle's results to the tag store: confirms deletions
/// against every saved index, lets the store index new files, then sends
/// the tag batch.
///
/// # Errors
///
/// Fails if the index directory cannot be read or the store rejects a
/// command.
pub async fn apply_to_store<T: TagStore>(
    store: &T,
    archive: &Archive,
    index_dir: &Path,
    mut batch: TagBatch,
    removed: PendingDeletes,
) -> Result<StoreApplied> {
    let confirmed = removed.confirm(index_dir).await?;
    for digest in &confirmed {
        batch.record_offline(archive, digest);
    }
    if !confirmed.is_empty() {
        info!(count = confirmed.len(), "messages gone from every mailbox");
    }

    store.refresh().await?;
    let lines = batch.resolve().await;
    store.apply_batch(&lines).await?;
    Ok(StoreApplied {
        lines: lines.len(),
        deleted: confirmed.len(),
    })
}
