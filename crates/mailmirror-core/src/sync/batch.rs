//! One full pass over every account.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::{CycleOutcome, apply_to_store, create_dirs, load_mailboxes, sync_mailboxes};
use crate::account::AccountConfig;
use crate::archive::Archive;
use crate::config::EngineConfig;
use crate::reconcile::Reconciler;
use crate::remote::{Connector, RemoteSession};
use crate::revision::{DeltaScope, RevisionCheckpoint, TagDeltas};
use crate::tags::{PendingDeletes, TagBatch};
use crate::tagstore::TagStore;
use crate::{Error, Result};

/// Totals of one batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Accounts processed.
    pub accounts: usize,
    /// Accounts that could not connect.
    pub failed_accounts: usize,
    /// Mailboxes reconciled.
    pub mailboxes: usize,
    /// Mailboxes whose pass failed.
    pub failed_mailboxes: usize,
    /// Tag batch lines sent to the store.
    pub tag_lines: usize,
    /// Messages tagged offline.
    pub confirmed_deletions: usize,
    /// Remote flags added from local tags.
    pub pushed: usize,
    /// Whether a new checkpoint was written.
    pub checkpoint_saved: bool,
}

async fn sync_account<C: Connector>(
    config: Arc<EngineConfig>,
    reconciler: Arc<Reconciler>,
    connector: Arc<C>,
    account: AccountConfig,
    deltas: Arc<TagDeltas>,
) -> Result<CycleOutcome> {
    let mut session = connector
        .connect(&account)
        .await
        .map_err(|source| Error::Session {
            account: account.user.clone(),
            source,
        })?;

    let mut mailboxes = load_mailboxes(&config, &account).await?;
    let outcome =
        sync_mailboxes(&mut session, &account.user, &reconciler, &mut mailboxes, &deltas).await?;

    if !outcome.connection_lost
        && let Err(e) = session.logout().await
    {
        warn!(account = %account.user, error = %e, "logout failed");
    }
    Ok(outcome)
}

/// Mirrors every account once, then updates the tag store.
///
/// Accounts run concurrently; the mailboxes of one account run in order
/// on its single connection. Local tag changes since the stored checkpoint
/// are pushed to each mailbox right after it was reconciled. The
/// checkpoint only advances when every account and mailbox succeeded.
///
/// # Errors
///
/// Returns storage failures and tag store failures. Connection and
/// protocol failures are logged and counted in the report.
pub async fn run_batch<T, C>(
    config: Arc<EngineConfig>,
    store: &T,
    connector: Arc<C>,
    accounts: Vec<AccountConfig>,
) -> Result<BatchReport>
where
    T: TagStore,
    C: Connector,
{
    create_dirs(&config).await?;

    let previous = RevisionCheckpoint::load(&config.checkpoint_file).await;
    let snapshot = store.status().await?;
    let scope = DeltaScope::new(previous.as_ref(), &snapshot);
    let deltas = Arc::new(TagDeltas::collect(store, &config.flag_table, &scope).await?);
    info!(
        full = matches!(scope, DeltaScope::Full),
        flags = deltas.entries().len(),
        "collected local tag changes"
    );

    let archive = Arc::new(Archive::new(&config.archive_dir));
    let reconciler = Arc::new(Reconciler::new(
        archive,
        config.flag_table.clone(),
        config.write_slots,
    ));

    let mut report = BatchReport {
        accounts: accounts.len(),
        ..BatchReport::default()
    };
    let mut tasks = JoinSet::new();
    for account in accounts {
        tasks.spawn(sync_account(
            Arc::clone(&config),
            Arc::clone(&reconciler),
            Arc::clone(&connector),
            account,
            Arc::clone(&deltas),
        ));
    }

    let mut batch = TagBatch::new();
    let mut removed = PendingDeletes::default();
    let mut fatal = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(outcome)) => {
                report.mailboxes += outcome.mailboxes;
                report.failed_mailboxes += outcome.failed_mailboxes;
                report.pushed += outcome.pushed;
                batch.merge(outcome.batch);
                removed.merge(outcome.removed);
            }
            Ok(Err(e)) if e.is_fatal() => {
                error!(error = %e, "storage failure");
                fatal.get_or_insert(e);
            }
            Ok(Err(e)) => {
                error!(error = %e, "account failed");
                report.failed_accounts += 1;
            }
            Err(e) => {
                error!(error = %e, "account task failed");
                report.failed_accounts += 1;
            }
        }
    }
    if let Some(e) = fatal {
        return Err(e);
    }

    let applied =
        apply_to_store(store, reconciler.archive(), &config.index_dir, batch, removed).await?;
    report.tag_lines = applied.lines;
    report.confirmed_deletions = applied.deleted;

    if report.failed_accounts == 0 && report.failed_mailboxes == 0 {
        snapshot
            .save(&config.checkpoint_file)
            .await
            .map_err(|e| Error::storage(&config.checkpoint_file, e))?;
        report.checkpoint_saved = true;
    } else {
        warn!(
            failed_accounts = report.failed_accounts,
            failed_mailboxes = report.failed_mailboxes,
            "keeping previous checkpoint"
        );
    }

    info!(
        mailboxes = report.mailboxes,
        tag_lines = report.tag_lines,
        pushed = report.pushed,
        "batch complete"
    );
    Ok(report)
}
