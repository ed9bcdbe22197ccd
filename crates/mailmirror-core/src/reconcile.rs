//! One reconciliation pass over one mailbox.
//!
//! 1. Select. An empty mailbox empties the index and ends the pass.
//! 2. UID stage: fetch UID and flags for every message. Known UIDs get
//!    their flag bits refreshed, unknown ones are collected.
//! 3. Records whose UID the server no longer lists are pruned.
//! 4. Header stage: fetch the canonical headers of unknown UIDs, digest
//!    them and add index records. Digests missing from the archive are
//!    collected.
//! 5. Body stage: fetch those messages in full and stream them into the
//!    archive writer.
//!
//! The pass works on a copy of the index and only replaces the caller's
//! index when every stage succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use mailmirror_imap::FetchedMessage;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::archive::{Archive, ArchiveWriter, WorkItem, WriteReport};
use crate::codec::{self, Digest, Headers};
use crate::flags::{FlagTable, FlagTicket};
use crate::index::{Field, IndexRecord, MailboxIndex};
use crate::remote::{RemoteError, RemoteSession};
use crate::{Error, Result};

/// Messages buffered between a fetch and its consumer.
const CHANNEL_DEPTH: usize = 64;

/// The mailbox being reconciled.
#[derive(Debug, Clone, Copy)]
pub struct MailboxSpec<'a> {
    /// Name on the server.
    pub name: &'a str,
    /// Identifier used in logs and as the index file name.
    pub id: &'a str,
    /// Tags added to messages first seen in this mailbox.
    pub tags: &'a [String],
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxReport {
    /// Messages on the server.
    pub exists: u32,
    /// Known messages whose flags changed.
    pub flag_changes: usize,
    /// UIDs not in the index before this pass.
    pub new_messages: usize,
    /// Header blocks received.
    pub headers_fetched: usize,
    /// Bytes of header blocks hashed.
    pub header_bytes: usize,
    /// New UIDs whose digest was already indexed under another UID.
    pub reused: usize,
    /// Full messages received.
    pub bodies_fetched: usize,
    /// Archive writer totals.
    pub archive: WriteReport,
    /// Records pruned because the server no longer lists them.
    pub removed: usize,
    /// Messages skipped because their data was unusable.
    pub skipped: usize,
}

/// Output of one pass.
#[derive(Debug, Default)]
pub struct Reconciled {
    /// Tag updates to apply locally.
    pub tickets: Vec<FlagTicket>,
    /// Digests of pruned records, pending deletion confirmation.
    pub removed: Vec<Digest>,
    /// Counters.
    pub report: MailboxReport,
}

/// Reconciles mailboxes against their indexes.
#[derive(Debug, Clone)]
pub struct Reconciler {
    archive: Arc<Archive>,
    table: FlagTable,
    write_slots: usize,
}

fn protocol(mailbox: &str) -> impl FnOnce(RemoteError) -> Error + '_ {
    move |source| Error::Protocol {
        mailbox: mailbox.to_string(),
        source,
    }
}

impl Reconciler {
    /// Creates a reconciler writing into `archive` with `write_slots`
    /// concurrent writes.
    #[must_use]
    pub fn new(archive: Arc<Archive>, table: FlagTable, write_slots: usize) -> Self {
        Self {
            archive,
            table,
            write_slots,
        }
    }

    /// The archive new messages are written to.
    #[must_use]
    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// The flag table in use.
    #[must_use]
    pub const fn table(&self) -> &FlagTable {
        &self.table
    }

    /// Runs one pass. On success `index` holds the new state, sorted by
    /// UID; on failure it is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] when a command fails and
    /// [`Error::Storage`] when the archive cannot be written.
    pub async fn run<R: RemoteSession>(
        &self,
        session: &mut R,
        mailbox: MailboxSpec<'_>,
        index: &mut MailboxIndex,
    ) -> Result<Reconciled> {
        let selected = session
            .select(mailbox.name)
            .await
            .map_err(protocol(mailbox.name))?;

        let mut out = Reconciled::default();
        out.report.exists = selected.exists;

        if selected.exists == 0 {
            out.removed = index.digests().collect();
            out.report.removed = out.removed.len();
            index.clear();
            info!(mailbox = mailbox.id, removed = out.report.removed, "mailbox is empty");
            return Ok(out);
        }

        let mut work = index.clone();
        let new_uids = self
            .uid_stage(session, mailbox, selected.exists, &mut work, &mut out)
            .await?;

        out.removed = work.prune_deleted();
        out.report.removed = out.removed.len();
        if !out.removed.is_empty() {
            info!(mailbox = mailbox.id, count = out.removed.len(), "pruned vanished messages");
        }

        if !new_uids.is_empty() {
            out.report.new_messages = new_uids.len();
            let wanted = self
                .header_stage(session, mailbox, &new_uids, &mut work, &mut out)
                .await?;
            if !wanted.is_empty() {
                self.body_stage(session, mailbox, wanted, &mut out).await?;
            }
        }

        work.sort_by(Field::Uid);
        *index = work;

        let report = &out.report;
        info!(
            mailbox = mailbox.id,
            exists = report.exists,
            changed = report.flag_changes,
            new = report.new_messages,
            fetched = report.bodies_fetched,
            written_mb = report.archive.bytes / (1024 * 1024),
            removed = report.removed,
            skipped = report.skipped,
            "mailbox reconciled"
        );
        Ok(out)
    }

    /// Refreshes flags of known UIDs, marks vanished records and returns
    /// the UIDs the index has never seen.
    async fn uid_stage<R: RemoteSession>(
        &self,
        session: &mut R,
        mailbox: MailboxSpec<'_>,
        exists: u32,
        work: &mut MailboxIndex,
        out: &mut Reconciled,
    ) -> Result<Vec<u32>> {
        work.sort_by(Field::Uid);
        let mut seen = vec![false; work.len()];
        let mut new_uids = Vec::new();

        let (tx, mut rx) = mpsc::channel::<FetchedMessage>(CHANNEL_DEPTH);
        let consume = async {
            while let Some(message) = rx.recv().await {
                let Some(uid) = message.uid else {
                    warn!(mailbox = mailbox.id, seq = message.seq, "FETCH response without UID");
                    out.report.skipped += 1;
                    continue;
                };
                let bits = self
                    .table
                    .to_bits(message.flags.as_deref().unwrap_or_default());

                let Ok(pos) = work.find_uid(uid) else {
                    new_uids.push(uid);
                    continue;
                };
                seen[pos] = true;
                if let Some(record) = work.get_mut(pos)
                    && record.flags() != bits
                {
                    out.tickets.push(FlagTicket {
                        old: record.flags(),
                        new: bits,
                        digest: record.digest(),
                        extra: Vec::new(),
                    });
                    record.set_flags(bits);
                    out.report.flag_changes += 1;
                }
            }
        };

        let (fetched, ()) = tokio::join!(session.fetch_uid_flags(exists, tx), consume);
        fetched.map_err(protocol(mailbox.name))?;

        for pos in (0..seen.len()).filter(|&pos| !seen[pos]) {
            work.mark_deleted(pos);
        }
        debug!(mailbox = mailbox.id, new = new_uids.len(), "UID stage complete");
        Ok(new_uids)
    }

    /// Digests new messages, adds their records and returns the UIDs
    /// whose content must be fetched.
    async fn header_stage<R: RemoteSession>(
        &self,
        session: &mut R,
        mailbox: MailboxSpec<'_>,
        uids: &[u32],
        work: &mut MailboxIndex,
        out: &mut Reconciled,
    ) -> Result<HashMap<u32, Digest>> {
        work.sort_by(Field::Digest);
        let mut added = Vec::with_capacity(uids.len());
        let mut scheduled = HashSet::new();
        let mut wanted = HashMap::new();
        let mut storage_error = None;

        let (tx, mut rx) = mpsc::channel::<FetchedMessage>(CHANNEL_DEPTH);
        let consume = async {
            while let Some(message) = rx.recv().await {
                let (Some(uid), Some(section)) = (message.uid, message.section.as_deref()) else {
                    warn!(mailbox = mailbox.id, seq = message.seq, "header response without UID or section");
                    out.report.skipped += 1;
                    continue;
                };
                out.report.headers_fetched += 1;
                out.report.header_bytes += section.len();

                let headers = match Headers::parse(section) {
                    Ok(headers) => headers,
                    Err(e) => {
                        warn!(mailbox = mailbox.id, uid, error = %e, "skipping unreadable headers");
                        out.report.skipped += 1;
                        continue;
                    }
                };
                let digest = codec::digest(&headers);
                let bits = self
                    .table
                    .to_bits(message.flags.as_deref().unwrap_or_default());

                if work.search(Field::Digest, &digest).is_ok() {
                    out.report.reused += 1;
                }
                if scheduled.insert(digest) {
                    match self.archive.contains(&digest).await {
                        Ok(true) => {}
                        Ok(false) => {
                            wanted.insert(uid, digest);
                        }
                        Err(e) => {
                            storage_error.get_or_insert(Error::storage(self.archive.path(&digest), e));
                        }
                    }
                }

                added.push(IndexRecord::new(uid, &digest, bits));
                out.tickets.push(FlagTicket {
                    old: 0,
                    new: bits,
                    digest,
                    extra: mailbox.tags.to_vec(),
                });
            }
        };

        let (fetched, ()) = tokio::join!(session.fetch_headers(uids, tx), consume);
        if let Some(e) = storage_error {
            return Err(e);
        }
        fetched.map_err(protocol(mailbox.name))?;

        for record in added {
            work.push(record);
        }
        debug!(
            mailbox = mailbox.id,
            headers = out.report.headers_fetched,
            bytes = out.report.header_bytes,
            to_fetch = wanted.len(),
            "header stage complete"
        );
        Ok(wanted)
    }

    /// Fetches full messages and archives them.
    async fn body_stage<R: RemoteSession>(
        &self,
        session: &mut R,
        mailbox: MailboxSpec<'_>,
        wanted: HashMap<u32, Digest>,
        out: &mut Reconciled,
    ) -> Result<()> {
        let mut uids: Vec<u32> = wanted.keys().copied().collect();
        uids.sort_unstable();
        info!(mailbox = mailbox.id, count = uids.len(), "fetching new messages");

        let mut writer = ArchiveWriter::new(Arc::clone(&self.archive), self.write_slots);
        let mut fetched_bodies = 0;
        let mut skipped = 0;

        let (tx, rx) = mpsc::channel::<FetchedMessage>(CHANNEL_DEPTH);
        let write = async {
            // Dropped on early return so the fetch drains instead of blocking.
            let mut rx = rx;
            while let Some(message) = rx.recv().await {
                let Some(raw) = message.section else {
                    warn!(mailbox = mailbox.id, seq = message.seq, "body response without content");
                    skipped += 1;
                    continue;
                };
                fetched_bodies += 1;

                let (head, body) = codec::split_message(&raw);
                let headers = match Headers::parse(head) {
                    Ok(headers) => headers,
                    Err(e) => {
                        warn!(mailbox = mailbox.id, uid = ?message.uid, error = %e, "skipping unreadable message");
                        skipped += 1;
                        continue;
                    }
                };
                let digest = codec::digest(&headers);
                if let Some(expected) = message.uid.and_then(|uid| wanted.get(&uid))
                    && *expected != digest
                {
                    warn!(
                        mailbox = mailbox.id,
                        uid = ?message.uid,
                        "full message digests differently from its header fetch"
                    );
                }

                writer
                    .submit(WorkItem {
                        digest,
                        headers,
                        body: body.to_vec(),
                    })
                    .await?;
            }
            writer.finish().await
        };

        let (fetched, written) = tokio::join!(session.fetch_bodies(&uids, tx), write);
        out.report.archive = written?;
        fetched.map_err(protocol(mailbox.name))?;
        out.report.bodies_fetched = fetched_bodies;
        out.report.skipped += skipped;
        Ok(())
    }
}
