//! Batched tag updates and deletion confirmation.
//!
//! Tag operations accumulate per archive path while mailboxes are
//! reconciled. Once the tag store has indexed the new files, each path is
//! resolved to its `Message-ID` and the batch is sent in one go.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

use crate::archive::Archive;
use crate::codec::{Digest, Headers};
use crate::flags::{FlagTable, FlagTicket, TagOp};
use crate::index::{IndexError, MailboxIndex};
use crate::{Error, Result};

/// Tag added to a message once no mailbox holds it any more. No tracked
/// flag may map to it, or the marker would be pushed back to the server.
pub const OFFLINE_TAG: &str = "offline";

/// Header blocks larger than this are not searched for a `Message-ID`.
const MAX_HEADER_BYTES: usize = 1024 * 1024;

/// Pending tag operations keyed by archive path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagBatch {
    entries: BTreeMap<PathBuf, Vec<TagOp>>,
}

impl TagBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn add_ops(&mut self, path: PathBuf, ops: impl IntoIterator<Item = TagOp>) {
        let list = self.entries.entry(path).or_default();
        for op in ops {
            if !list.contains(&op) {
                list.push(op);
            }
        }
    }

    /// Queues the operations a ticket implies. Tickets with nothing to do
    /// are dropped.
    pub fn record(&mut self, archive: &Archive, table: &FlagTable, ticket: &FlagTicket) {
        let ops = table.ticket_ops(ticket);
        if !ops.is_empty() {
            self.add_ops(archive.path(&ticket.digest), ops);
        }
    }

    /// Queues `+offline` for a message no mailbox references.
    pub fn record_offline(&mut self, archive: &Archive, digest: &Digest) {
        self.add_ops(archive.path(digest), [TagOp::Add(OFFLINE_TAG.to_string())]);
    }

    /// Moves every entry of `other` into this batch.
    pub fn merge(&mut self, other: Self) {
        for (path, ops) in other.entries {
            self.add_ops(path, ops);
        }
    }

    /// Number of messages with pending operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if there is nothing to apply.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Pending operations for one archive path.
    #[must_use]
    pub fn ops(&self, path: &Path) -> Option<&[TagOp]> {
        self.entries.get(path).map(Vec::as_slice)
    }

    /// Resolves each path to its `Message-ID` and renders batch lines.
    /// Files that cannot be read or carry no `Message-ID` are skipped.
    pub async fn resolve(self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.entries.len());
        for (path, ops) in self.entries {
            match read_message_id(&path).await {
                Ok(Some(id)) => lines.push(batch_line(&ops, &id)),
                Ok(None) => warn!(path = %path.display(), "archived message has no Message-ID"),
                Err(e) => warn!(path = %path.display(), error = %e, "cannot read archived message"),
            }
        }
        debug!(lines = lines.len(), "resolved tag batch");
        lines
    }
}

fn batch_line(ops: &[TagOp], message_id: &str) -> String {
    let mut line = String::new();
    for op in ops {
        let (sign, tag) = match op {
            TagOp::Add(tag) => ('+', tag),
            TagOp::Remove(tag) => ('-', tag),
        };
        line.push(sign);
        line.push_str(&encode(tag));
        line.push(' ');
    }
    line.push_str("id:");
    line.push_str(&encode(message_id));
    line
}

/// Percent-encodes everything outside the characters the batch format
/// passes through unchanged.
fn encode(raw: &str) -> String {
    raw.bytes().fold(String::with_capacity(raw.len()), |mut out, b| {
        if b.is_ascii_alphanumeric() || b"+-_@=.,".contains(&b) {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02x}");
        }
        out
    })
}

async fn read_message_id(path: &Path) -> std::io::Result<Option<String>> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut head = Vec::new();
    loop {
        let start = head.len();
        if reader.read_until(b'\n', &mut head).await? == 0 {
            break;
        }
        let line = &head[start..];
        if line == b"\n" || line == b"\r\n" || head.len() > MAX_HEADER_BYTES {
            break;
        }
    }
    Ok(Headers::parse(&head)
        .ok()
        .and_then(|h| h.message_id().map(str::to_string)))
}

/// Digests dropped from some mailbox index, awaiting confirmation that no
/// other index still references them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingDeletes {
    digests: Vec<Digest>,
}

impl PendingDeletes {
    /// Adds digests to the buffer.
    pub fn extend(&mut self, digests: impl IntoIterator<Item = Digest>) {
        self.digests.extend(digests);
    }

    /// Moves every digest of `other` into this buffer.
    pub fn merge(&mut self, other: Self) {
        self.digests.extend(other.digests);
    }

    /// Number of buffered digests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.digests.len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    /// Returns the buffered digests that no index file in `index_dir`
    /// references. Every index must have been saved beforehand.
    ///
    /// # Errors
    ///
    /// Fails if the directory or an index file cannot be read.
    pub async fn confirm(mut self, index_dir: &Path) -> Result<Vec<Digest>> {
        if self.digests.is_empty() {
            return Ok(Vec::new());
        }
        self.digests.sort_unstable();
        self.digests.dedup();

        let referenced = referenced_digests(index_dir).await?;
        let confirmed: Vec<Digest> = self
            .digests
            .into_iter()
            .filter(|d| referenced.binary_search(d).is_err())
            .collect();
        debug!(confirmed = confirmed.len(), "confirmed deletions");
        Ok(confirmed)
    }
}

async fn referenced_digests(index_dir: &Path) -> Result<Vec<Digest>> {
    let storage = |e| Error::storage(index_dir, e);
    let mut all = Vec::new();
    let mut dir = match tokio::fs::read_dir(index_dir).await {
        Ok(dir) => dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(all),
        Err(e) => return Err(storage(e)),
    };

    while let Some(entry) = dir.next_entry().await.map_err(storage)? {
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden || !entry.file_type().await.map_err(storage)?.is_file() {
            continue;
        }
        match MailboxIndex::load(&path).await {
            Ok(index) => all.extend(index.digests()),
            Err(IndexError::Io(e)) => return Err(Error::storage(path, e)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable index"),
        }
    }
    all.sort_unstable();
    all.dedup();
    Ok(all)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::index::IndexRecord;

    fn ticket(seed: u8, old: u8, new: u8, extra: &[&str]) -> FlagTicket {
        FlagTicket {
            old,
            new,
            digest: [seed; 20],
            extra: extra.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn empty_tickets_are_dropped() {
        let archive = Archive::new("/a");
        let table = FlagTable::default();
        let mut batch = TagBatch::new();
        batch.record(&archive, &table, &ticket(1, 0, 0, &[]));
        assert!(batch.is_empty());

        batch.record(&archive, &table, &ticket(1, 0, 0, &["inbox"]));
        batch.record(&archive, &table, &ticket(1, 0, 0x01, &["inbox"]));
        assert_eq!(batch.len(), 1);
        let ops: Vec<String> = batch
            .ops(&archive.path(&[1; 20]))
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(ops, vec!["+inbox", "-unread"]);
    }

    #[test]
    fn lines_are_encoded() {
        let ops = [TagOp::Add("to do".into()), TagOp::Remove("unread".into())];
        assert_eq!(
            batch_line(&ops, "a b%c@example.com"),
            "+to%20do -unread id:a%20b%25c@example.com"
        );
    }

    #[tokio::test]
    async fn resolve_reads_message_ids_from_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path());
        let table = FlagTable::default();

        let stored = archive.path(&[1; 20]);
        std::fs::create_dir_all(stored.parent().unwrap()).unwrap();
        std::fs::write(&stored, "From: a@x\nMessage-ID: <one@x>\n\nMessage-ID: <body@x>\n").unwrap();

        let without_id = archive.path(&[2; 20]);
        std::fs::create_dir_all(without_id.parent().unwrap()).unwrap();
        std::fs::write(&without_id, "From: a@x\n\nbody\n").unwrap();

        let mut batch = TagBatch::new();
        batch.record(&archive, &table, &ticket(1, 0, 0x10, &[]));
        batch.record(&archive, &table, &ticket(2, 0, 0x10, &[]));
        batch.record(&archive, &table, &ticket(3, 0, 0x10, &[]));
        batch.record_offline(&archive, &[1; 20]);

        let lines = batch.resolve().await;
        assert_eq!(lines, vec!["+flagged +offline id:one@x"]);
    }

    #[tokio::test]
    async fn confirm_keeps_digests_still_referenced() {
        let dir = tempfile::tempdir().unwrap();
        let mut other = MailboxIndex::new();
        other.push(IndexRecord::new(1, &[7; 20], 0));
        other.save(&dir.path().join("aaaaaaaaaaaa")).await.unwrap();
        std::fs::write(dir.path().join(".tmpXYZ"), [0u8; 3]).unwrap();

        let mut pending = PendingDeletes::default();
        pending.extend([[7; 20], [8; 20], [8; 20]]);
        assert_eq!(pending.len(), 3);

        let confirmed = pending.confirm(dir.path()).await.unwrap();
        assert_eq!(confirmed, vec![[8; 20]]);
    }

    #[tokio::test]
    async fn confirm_without_index_dir_confirms_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut pending = PendingDeletes::default();
        pending.extend([[4; 20]]);
        let confirmed = pending.confirm(&dir.path().join("missing")).await.unwrap();
        assert_eq!(confirmed, vec![[4; 20]]);
        assert!(PendingDeletes::default().confirm(dir.path()).await.unwrap().is_empty());
    }
}
