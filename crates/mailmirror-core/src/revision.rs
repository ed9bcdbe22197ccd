//! Revision checkpoint and local-to-remote flag deltas.
//!
//! The tag store counts every change with a monotone revision counter. The
//! checkpoint file records the store's status line as it was before the
//! last run queried it, so the next run only needs tags changed since then.
//! A missing checkpoint, or one from a different database identity, means
//! a full scan.

use std::path::Path;

use tracing::{debug, trace, warn};

use crate::file_ops;
use crate::flags::{FlagEntry, FlagTable};
use crate::index::{DigestTail, Field, MailboxIndex};
use crate::tagstore::{TagStore, TagStoreError, digest_tail_from_path};

/// The tag store's status: message count, database identity and revision
/// counter. Serialized as one tab-separated line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionCheckpoint {
    /// Messages in the store.
    pub count: u64,
    /// Database identity.
    pub identity: String,
    /// Revision counter.
    pub counter: u64,
}

impl RevisionCheckpoint {
    /// Parses `count<TAB>identity<TAB>counter` from the first line.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let line = text.lines().next()?;
        let mut parts = line.split('\t');
        let count = parts.next()?.trim().parse().ok()?;
        let identity = parts.next()?.trim().to_string();
        let counter = parts.next()?.trim().parse().ok()?;
        if parts.next().is_some() || identity.is_empty() {
            return None;
        }
        Some(Self {
            count,
            identity,
            counter,
        })
    }

    /// The status line, newline-terminated.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!("{}\t{}\t{}\n", self.count, self.identity, self.counter)
    }

    /// Reads a checkpoint file. Missing or unreadable files yield `None`.
    pub async fn load(path: &Path) -> Option<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => {
                let parsed = Self::parse(&text);
                if parsed.is_none() {
                    warn!(path = %path.display(), "ignoring malformed checkpoint");
                }
                parsed
            }
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no checkpoint");
                None
            }
        }
    }

    /// Atomically replaces the checkpoint file.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        file_ops::spit_async(path, true, self.to_line().into_bytes()).await
    }
}

/// Which tag changes to ask the store for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaScope {
    /// Every message currently carrying the tag.
    Full,
    /// Messages changed at or after `counter` in database `identity`.
    Since {
        /// Database identity the counter belongs to.
        identity: String,
        /// First revision to include.
        counter: u64,
    },
}

impl DeltaScope {
    /// Chooses the scope from the stored checkpoint and the store's
    /// current status.
    #[must_use]
    pub fn new(previous: Option<&RevisionCheckpoint>, current: &RevisionCheckpoint) -> Self {
        match previous {
            Some(prev) if prev.identity == current.identity => Self::Since {
                identity: prev.identity.clone(),
                counter: prev.counter,
            },
            Some(prev) => {
                warn!(
                    previous = prev.identity,
                    current = current.identity,
                    "tag store identity changed, rescanning"
                );
                Self::Full
            }
            None => Self::Full,
        }
    }

    /// Query selecting messages that should carry `entry`'s remote flag.
    #[must_use]
    pub fn query(&self, entry: &FlagEntry) -> String {
        let tag = if entry.inverted {
            format!("not tag:{}", entry.tag)
        } else {
            format!("tag:{}", entry.tag)
        };
        match self {
            Self::Full => tag,
            Self::Since { counter, .. } => format!("lastmod:{counter}.. and {tag}"),
        }
    }

    /// Identity to pin queries to.
    #[must_use]
    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Full => None,
            Self::Since { identity, .. } => Some(identity),
        }
    }
}

/// Messages whose local tags ask for one remote flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagDelta {
    /// Bit in the record's flag byte.
    pub mask: u8,
    /// Remote flag to add.
    pub remote: String,
    /// Sorted, deduplicated digest tails.
    pub tails: Vec<DigestTail>,
}

/// Local tag changes grouped by flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDeltas {
    entries: Vec<FlagDelta>,
}

impl TagDeltas {
    /// Queries the store once per tracked flag.
    ///
    /// # Errors
    ///
    /// Propagates tag store failures.
    pub async fn collect<T: TagStore>(
        store: &T,
        table: &FlagTable,
        scope: &DeltaScope,
    ) -> Result<Self, TagStoreError> {
        let mut deltas = Self::default();
        for entry in table.entries() {
            let query = scope.query(entry);
            let count = store.count(&query, scope.identity()).await?;
            if count == 0 {
                continue;
            }

            let mut tails = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
            for path in store.search_files(&query, scope.identity()).await? {
                match digest_tail_from_path(&path) {
                    Some(tail) => tails.push(tail),
                    None => trace!(path = %path.display(), "not an archive file"),
                }
            }
            tails.sort_unstable();
            tails.dedup();
            debug!(query, matches = tails.len(), "collected tag delta");
            deltas.push(FlagDelta {
                mask: entry.mask,
                remote: entry.remote.clone(),
                tails,
            });
        }
        Ok(deltas)
    }

    fn push(&mut self, delta: FlagDelta) {
        if !delta.tails.is_empty() {
            self.entries.push(delta);
        }
    }

    /// Per-flag deltas.
    #[must_use]
    pub fn entries(&self) -> &[FlagDelta] {
        &self.entries
    }

    /// True if no message needs a remote flag.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unions another set of deltas into this one.
    pub fn merge(&mut self, other: &Self) {
        for delta in &other.entries {
            match self.entries.iter_mut().find(|d| d.mask == delta.mask) {
                Some(mine) => {
                    mine.tails.extend_from_slice(&delta.tails);
                    mine.tails.sort_unstable();
                    mine.tails.dedup();
                }
                None => self.entries.push(delta.clone()),
            }
        }
    }

    /// UIDs in `index` that lack a flag their local tags ask for, one plan
    /// per flag. Re-sorts the index by digest tail.
    #[must_use]
    pub fn plan(&self, index: &mut MailboxIndex) -> Vec<StorePlan> {
        index.sort_by(Field::DigestTail);
        self.entries
            .iter()
            .filter_map(|delta| {
                let mut uids: Vec<u32> = delta
                    .tails
                    .iter()
                    .flat_map(|tail| index.matching(Field::DigestTail, tail))
                    .map(|pos| index.records()[pos])
                    .filter(|r| r.flags() & delta.mask == 0)
                    .map(|r| r.uid())
                    .collect();
                if uids.is_empty() {
                    return None;
                }
                uids.sort_unstable();
                uids.dedup();
                Some(StorePlan {
                    mask: delta.mask,
                    flag: delta.remote.clone(),
                    uids,
                })
            })
            .collect()
    }
}

impl FromIterator<FlagDelta> for TagDeltas {
    fn from_iter<I: IntoIterator<Item = FlagDelta>>(iter: I) -> Self {
        let mut deltas = Self::default();
        for delta in iter {
            deltas.merge(&Self {
                entries: vec![delta],
            });
        }
        deltas.entries.retain(|d| !d.tails.is_empty());
        deltas
    }
}

/// One `UID STORE +FLAGS` to issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePlan {
    /// Bit to set locally once the store succeeds.
    pub mask: u8,
    /// Remote flag.
    pub flag: String,
    /// Target UIDs, ascending.
    pub uids: Vec<u32>,
}

impl StorePlan {
    /// Records a successful store in the index. Re-sorts the index by UID.
    pub fn apply(&self, index: &mut MailboxIndex) {
        index.sort_by(Field::Uid);
        for uid in &self.uids {
            if let Ok(pos) = index.find_uid(*uid)
                && let Some(record) = index.get_mut(pos)
            {
                record.set_flags(record.flags() | self.mask);
            }
        }
    }
}
