//! Long-running mode.
//!
//! Per account there is a reconcile task and an idle task sharing one
//! [`Connection`]. The idle task parks the account's first mailbox in IDLE
//! and turns push events into triggers; the reconcile task runs a full
//! cycle over the account's mailboxes per trigger. A single store task
//! owns the tag store: it applies the tag updates every cycle produces and
//! polls the store for local changes, which it hands back to the reconcile
//! tasks as triggers carrying deltas.

use std::sync::Arc;
use std::time::Duration;

use mailmirror_imap::IdleEvent;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{MailboxState, apply_to_store, create_dirs, load_mailboxes, save_mailboxes, sync_mailboxes};
use crate::account::AccountConfig;
use crate::archive::Archive;
use crate::config::EngineConfig;
use crate::conn::Connection;
use crate::reconcile::Reconciler;
use crate::remote::{Connector, RemoteSession};
use crate::revision::{DeltaScope, RevisionCheckpoint, TagDeltas};
use crate::tags::{PendingDeletes, TagBatch};
use crate::tagstore::TagStore;
use crate::{Error, Result};

/// Cycle results buffered on their way to the store task.
const UPDATE_DEPTH: usize = 16;

/// Why a reconcile cycle should run.
#[derive(Debug)]
enum Trigger {
    /// The server reported a change.
    Remote,
    /// Local tags changed.
    Deltas(Arc<TagDeltas>),
}

#[derive(Debug)]
struct StoreUpdate {
    batch: TagBatch,
    removed: PendingDeletes,
}

struct Worker<S> {
    user: String,
    conn: Connection<S>,
    mailboxes: Arc<Mutex<Vec<MailboxState>>>,
    reconcile: JoinHandle<Result<bool>>,
    idle: JoinHandle<()>,
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    // A dropped sender counts as a stop request.
    let _ = stop.wait_for(|requested| *requested).await;
}

fn absorb(deltas: &mut TagDeltas, trigger: Trigger) {
    if let Trigger::Deltas(more) = trigger {
        deltas.merge(&more);
    }
}

/// Runs cycles until stopped. Returns `true` if no local change is left
/// unpushed.
async fn reconcile_loop<S: RemoteSession>(
    user: String,
    conn: Connection<S>,
    reconciler: Arc<Reconciler>,
    mailboxes: Arc<Mutex<Vec<MailboxState>>>,
    mut triggers: mpsc::UnboundedReceiver<Trigger>,
    updates: mpsc::Sender<StoreUpdate>,
    mut stop: watch::Receiver<bool>,
) -> Result<bool> {
    let mut carried = TagDeltas::default();
    loop {
        let first = tokio::select! {
            biased;
            () = stopped(&mut stop) => break,
            trigger = triggers.recv() => match trigger {
                Some(trigger) => trigger,
                None => break,
            },
        };

        let mut deltas = std::mem::take(&mut carried);
        absorb(&mut deltas, first);
        while let Ok(trigger) = triggers.try_recv() {
            absorb(&mut deltas, trigger);
        }

        let outcome = {
            let mut mailboxes = mailboxes.lock().await;
            let mut session = conn.acquire().await;
            sync_mailboxes(&mut *session, &user, &reconciler, &mut mailboxes, &deltas).await?
        };
        debug!(account = %user, mailboxes = outcome.mailboxes, pushed = outcome.pushed, "cycle done");
        if outcome.failed_mailboxes > 0 {
            carried = deltas;
        }

        let lost = outcome.connection_lost;
        if !outcome.is_empty() {
            let update = StoreUpdate {
                batch: outcome.batch,
                removed: outcome.removed,
            };
            if updates.send(update).await.is_err() {
                warn!(account = %user, "tag store task is gone");
                break;
            }
        }
        if lost {
            error!(account = %user, "connection lost, live sync stopped for this account");
            conn.close_idle();
            break;
        }
    }
    // Deltas still queued were never pushed. Closing first makes later
    // broadcasts fail instead of landing unseen.
    triggers.close();
    while let Ok(trigger) = triggers.try_recv() {
        absorb(&mut carried, trigger);
    }
    Ok(carried.is_empty())
}

/// Turns IDLE push events on `mailbox` into triggers until closed.
async fn idle_loop<S: RemoteSession>(
    user: String,
    mailbox: String,
    conn: Connection<S>,
    keepalive: Duration,
    triggers: mpsc::UnboundedSender<Trigger>,
) {
    let mut known = None;
    while !conn.is_idle_closed() {
        match conn.idle_once(&mailbox, keepalive, &mut known).await {
            Ok(Some(IdleEvent::Exists(_) | IdleEvent::Expunge(_) | IdleEvent::Fetch(_))) => {
                debug!(account = %user, mailbox, "push event");
                if triggers.send(Trigger::Remote).is_err() {
                    break;
                }
            }
            Ok(Some(IdleEvent::Timeout | IdleEvent::Stopped)) => {}
            Ok(None) => tokio::task::yield_now().await,
            Err(e) => {
                error!(account = %user, mailbox, error = %e, "idle failed");
                break;
            }
        }
    }
    debug!(account = %user, "idle listener stopped");
}

/// Hands `deltas` to every account. Returns `false` if some account had
/// already stopped taking triggers.
fn broadcast(triggers: &[mpsc::UnboundedSender<Trigger>], deltas: &Arc<TagDeltas>) -> bool {
    triggers
        .iter()
        .fold(true, |delivered, trigger| {
            trigger.send(Trigger::Deltas(Arc::clone(deltas))).is_ok() && delivered
        })
}

/// Queries local changes since `last` if the store moved.
async fn poll_deltas<T: TagStore>(
    store: &T,
    config: &EngineConfig,
    last: &mut RevisionCheckpoint,
) -> Result<Option<TagDeltas>> {
    let status = store.status().await?;
    if status == *last {
        return Ok(None);
    }
    let scope = DeltaScope::new(Some(&*last), &status);
    let deltas = TagDeltas::collect(store, &config.flag_table, &scope).await?;
    *last = status;
    Ok((!deltas.is_empty()).then_some(deltas))
}

/// Owns the tag store. Returns the checkpoint to persist once every
/// update sender is gone, or `None` if some local changes never reached
/// an account.
async fn store_loop<T: TagStore>(
    store: T,
    config: Arc<EngineConfig>,
    archive: Arc<Archive>,
    triggers: Vec<mpsc::UnboundedSender<Trigger>>,
    mut updates: mpsc::Receiver<StoreUpdate>,
) -> Result<Option<RevisionCheckpoint>> {
    let previous = RevisionCheckpoint::load(&config.checkpoint_file).await;
    let mut last = store.status().await?;
    let scope = DeltaScope::new(previous.as_ref(), &last);
    let deltas = TagDeltas::collect(&store, &config.flag_table, &scope).await?;
    info!(
        full = matches!(scope, DeltaScope::Full),
        flags = deltas.entries().len(),
        "collected local tag changes"
    );
    // Always sent: it doubles as the start signal.
    let pending = !deltas.is_empty();
    let mut undelivered = !broadcast(&triggers, &Arc::new(deltas)) && pending;

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            update = updates.recv() => {
                let Some(update) = update else { break };
                match apply_to_store(&store, &archive, &config.index_dir, update.batch, update.removed).await {
                    Ok(applied) => debug!(lines = applied.lines, deleted = applied.deleted, "tag store updated"),
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(e) => error!(error = %e, "tag store update failed"),
                }
            }
            _ = ticker.tick() => {
                match poll_deltas(&store, &config, &mut last).await {
                    Ok(Some(deltas)) => {
                        info!(flags = deltas.entries().len(), "local tags changed");
                        if !broadcast(&triggers, &Arc::new(deltas)) {
                            warn!("local tag changes not delivered to every account");
                            undelivered = true;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "tag store poll failed"),
                }
            }
        }
    }
    Ok((!undelivered).then_some(last))
}

/// Mirrors accounts continuously until `shutdown` turns true.
///
/// Accounts that cannot connect are logged and skipped. On shutdown the
/// running cycles complete, every index is saved, the checkpoint is
/// written if no local change was left unpushed, the idle listeners are
/// stopped and the sessions logged out.
///
/// # Errors
///
/// Returns storage failures. A tag store failure at startup is returned
/// after the shutdown sequence.
pub async fn run_live<T, C>(
    config: Arc<EngineConfig>,
    store: T,
    connector: Arc<C>,
    accounts: Vec<AccountConfig>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()>
where
    T: TagStore + 'static,
    C: Connector,
{
    create_dirs(&config).await?;

    let archive = Arc::new(Archive::new(&config.archive_dir));
    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&archive),
        config.flag_table.clone(),
        config.write_slots,
    ));
    let (stop_tx, stop_rx) = watch::channel(false);
    let (update_tx, update_rx) = mpsc::channel(UPDATE_DEPTH);

    let mut workers = Vec::new();
    let mut triggers = Vec::new();
    for account in accounts {
        let session = match connector.connect(&account).await {
            Ok(session) => session,
            Err(e) => {
                error!(account = %account.user, error = %e, "cannot connect, account skipped");
                continue;
            }
        };
        let mailboxes = load_mailboxes(&config, &account).await?;
        let Some(watched) = mailboxes.first().map(|m| m.name.clone()) else {
            continue;
        };
        info!(account = %account.user, mailbox = %watched, "watching");

        let conn = Connection::new(session);
        let mailboxes = Arc::new(Mutex::new(mailboxes));
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let reconcile = tokio::spawn(reconcile_loop(
            account.user.clone(),
            conn.clone(),
            Arc::clone(&reconciler),
            Arc::clone(&mailboxes),
            trigger_rx,
            update_tx.clone(),
            stop_rx.clone(),
        ));
        let idle = tokio::spawn(idle_loop(
            account.user.clone(),
            watched,
            conn.clone(),
            config.idle_keepalive,
            trigger_tx.clone(),
        ));
        triggers.push(trigger_tx);
        workers.push(Worker {
            user: account.user,
            conn,
            mailboxes,
            reconcile,
            idle,
        });
    }
    drop(update_tx);

    if workers.is_empty() {
        warn!("no account connected");
        return Ok(());
    }

    let mut store_task = tokio::spawn(store_loop(
        store,
        Arc::clone(&config),
        archive,
        triggers,
        update_rx,
    ));
    let finished_early = tokio::select! {
        () = stopped(&mut shutdown) => None,
        joined = &mut store_task => Some(joined),
    };
    info!("shutting down");
    let _ = stop_tx.send(true);

    let mut failure = None;
    let mut clean = true;
    for worker in &mut workers {
        match (&mut worker.reconcile).await {
            Ok(Ok(done)) => clean &= done,
            Ok(Err(e)) => {
                error!(account = %worker.user, error = %e, "reconcile task failed");
                clean = false;
                if e.is_fatal() {
                    failure.get_or_insert(e);
                }
            }
            Err(e) => {
                error!(account = %worker.user, error = %e, "reconcile task failed");
                clean = false;
            }
        }
    }

    for worker in &workers {
        let mut mailboxes = worker.mailboxes.lock().await;
        if let Err(e) = save_mailboxes(&mut mailboxes).await {
            error!(account = %worker.user, error = %e, "cannot save indexes");
            failure.get_or_insert(e);
        }
    }

    let joined = match finished_early {
        Some(joined) => joined,
        None => store_task.await,
    };
    match joined {
        Ok(Ok(Some(checkpoint))) if clean && failure.is_none() => {
            if let Err(e) = checkpoint.save(&config.checkpoint_file).await {
                failure.get_or_insert(Error::storage(&config.checkpoint_file, e));
            }
        }
        Ok(Ok(_)) => warn!("keeping previous checkpoint"),
        Ok(Err(e)) => {
            error!(error = %e, "tag store task failed");
            failure.get_or_insert(e);
        }
        Err(e) => error!(error = %e, "tag store task failed"),
    }

    for worker in workers {
        worker.conn.close_idle();
        if let Err(e) = worker.idle.await {
            warn!(account = %worker.user, error = %e, "idle task failed");
        }
        let mut session = worker.conn.acquire().await;
        if let Err(e) = session.logout().await {
            warn!(account = %worker.user, error = %e, "logout failed");
        }
    }

    failure.map_or(Ok(()), Err)
}
