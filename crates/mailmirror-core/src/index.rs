//! Per-mailbox index of fixed-size records.
//!
//! Each record is 25 bytes: a little-endian UID (4), the content digest
//! (20) and a flag byte (1). The file on disk is the bare concatenation of
//! records sorted by UID. In memory the index is re-sorted by whichever
//! field the current stage searches on.

use std::cmp::Ordering;
use std::io;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use crate::codec::{DIGEST_LEN, Digest};
use crate::file_ops;

/// Size of one record in bytes.
pub const RECORD_LEN: usize = 4 + DIGEST_LEN + 1;

/// Flag byte of a record scheduled for removal. Sorts after every real
/// flag combination.
pub const DELETED: u8 = 0xff;

/// The last 19 bytes of a digest, which is all an archive file name
/// carries.
pub type DigestTail = [u8; DIGEST_LEN - 1];

/// Index errors.
#[derive(Debug, Error)]
pub enum IndexError {
    /// File length is not a multiple of [`RECORD_LEN`].
    #[error("index length {0} is not a multiple of {RECORD_LEN}")]
    Corrupt(usize),

    /// Reading or writing the index file failed.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// No record matches the search key.
    #[error("no matching record")]
    NotFound,
}

/// Fields an index can be sorted and searched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Compared numerically.
    Uid,
    /// Whole digest.
    Digest,
    /// Digest without its first byte.
    DigestTail,
    /// The flag byte.
    Flags,
}

impl Field {
    const fn range(self) -> std::ops::Range<usize> {
        match self {
            Self::Uid => 0..4,
            Self::Digest => 4..4 + DIGEST_LEN,
            Self::DigestTail => 5..4 + DIGEST_LEN,
            Self::Flags => 4 + DIGEST_LEN..RECORD_LEN,
        }
    }
}

/// One index record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexRecord([u8; RECORD_LEN]);

impl IndexRecord {
    /// Builds a record.
    #[must_use]
    pub fn new(uid: u32, digest: &Digest, flags: u8) -> Self {
        let mut raw = [0u8; RECORD_LEN];
        raw[Field::Uid.range()].copy_from_slice(&uid.to_le_bytes());
        raw[Field::Digest.range()].copy_from_slice(digest);
        raw[Field::Flags.range().start] = flags;
        Self(raw)
    }

    /// Server-assigned UID.
    #[must_use]
    pub fn uid(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Content digest.
    #[must_use]
    pub fn digest(&self) -> Digest {
        let mut out = [0u8; DIGEST_LEN];
        out.copy_from_slice(&self.0[Field::Digest.range()]);
        out
    }

    /// Flag bits, or [`DELETED`].
    #[must_use]
    pub const fn flags(&self) -> u8 {
        self.0[RECORD_LEN - 1]
    }

    /// Replaces the flag byte.
    pub const fn set_flags(&mut self, flags: u8) {
        self.0[RECORD_LEN - 1] = flags;
    }

    /// Bytes of one field.
    #[must_use]
    pub fn field(&self, field: Field) -> &[u8] {
        &self.0[field.range()]
    }

    fn compare(&self, other: &Self, field: Field) -> Ordering {
        match field {
            Field::Uid => self.uid().cmp(&other.uid()),
            _ => self.field(field).cmp(other.field(field)),
        }
    }
}

/// In-memory mailbox index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailboxIndex {
    records: Vec<IndexRecord>,
}

impl MailboxIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses raw index bytes.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Corrupt`] if the length is not a multiple of
    /// [`RECORD_LEN`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        if bytes.len() % RECORD_LEN != 0 {
            return Err(IndexError::Corrupt(bytes.len()));
        }
        let records = bytes
            .chunks_exact(RECORD_LEN)
            .map(|chunk| {
                let mut raw = [0u8; RECORD_LEN];
                raw.copy_from_slice(chunk);
                IndexRecord(raw)
            })
            .collect();
        Ok(Self { records })
    }

    /// Serializes the records in their current order.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.records.iter().flat_map(|r| r.0).collect()
    }

    /// Loads an index file.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read or is corrupt.
    pub async fn load(path: &Path) -> Result<Self, IndexError> {
        let bytes = tokio::fs::read(path).await?;
        Self::from_bytes(&bytes)
    }

    /// Loads an index file. A missing or corrupt file yields an empty
    /// index, which makes the next pass a full rescan.
    ///
    /// # Errors
    ///
    /// Fails if the file exists but cannot be read.
    pub async fn load_or_empty(path: &Path) -> Result<Self, IndexError> {
        match Self::load(path).await {
            Err(IndexError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(IndexError::Corrupt(len)) => {
                warn!(path = %path.display(), len, "corrupt index, rescanning mailbox");
                Ok(Self::new())
            }
            other => other,
        }
    }

    /// Sorts by UID and atomically replaces the file at `path`.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors.
    pub async fn save(&mut self, path: &Path) -> Result<(), IndexError> {
        self.sort_by(Field::Uid);
        file_ops::spit_async(path, true, self.to_bytes()).await?;
        Ok(())
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if the index has no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in their current order.
    #[must_use]
    pub fn records(&self) -> &[IndexRecord] {
        &self.records
    }

    /// Mutable record at `pos`.
    pub fn get_mut(&mut self, pos: usize) -> Option<&mut IndexRecord> {
        self.records.get_mut(pos)
    }

    /// Appends a record. The index is unsorted afterwards.
    pub fn push(&mut self, record: IndexRecord) {
        self.records.push(record);
    }

    /// Drops every record.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Stable sort on one field.
    pub fn sort_by(&mut self, field: Field) {
        self.records.sort_by(|a, b| a.compare(b, field));
    }

    /// Finds the first record whose `field` equals `key`. The index must be
    /// sorted by that field.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::NotFound`] when no record matches.
    pub fn search(&self, field: Field, key: &[u8]) -> Result<usize, IndexError> {
        let pos = match field {
            Field::Uid => {
                let uid = <[u8; 4]>::try_from(key)
                    .map(u32::from_le_bytes)
                    .map_err(|_| IndexError::NotFound)?;
                self.records.partition_point(|r| r.uid() < uid)
            }
            _ => self.records.partition_point(|r| r.field(field) < key),
        };
        match self.records.get(pos) {
            Some(r) if r.field(field) == key => Ok(pos),
            _ => Err(IndexError::NotFound),
        }
    }

    /// Position of `uid` in an index sorted by [`Field::Uid`].
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::NotFound`] when the UID is absent.
    pub fn find_uid(&self, uid: u32) -> Result<usize, IndexError> {
        self.search(Field::Uid, &uid.to_le_bytes())
    }

    /// Positions of every record matching `key` on `field`. The index must
    /// be sorted by that field.
    #[must_use]
    pub fn matching(&self, field: Field, key: &[u8]) -> std::ops::Range<usize> {
        let Ok(start) = self.search(field, key) else {
            return 0..0;
        };
        let len = self.records[start..]
            .iter()
            .take_while(|r| r.field(field) == key)
            .count();
        start..start + len
    }

    /// Marks the record at `pos` for removal.
    pub fn mark_deleted(&mut self, pos: usize) {
        if let Some(r) = self.records.get_mut(pos) {
            r.set_flags(DELETED);
        }
    }

    /// Removes every record marked [`DELETED`] and returns their digests.
    /// Leaves the index sorted by [`Field::Flags`].
    pub fn prune_deleted(&mut self) -> Vec<Digest> {
        self.sort_by(Field::Flags);
        let cut = self.records.partition_point(|r| r.flags() < DELETED);
        self.records
            .split_off(cut)
            .iter()
            .map(IndexRecord::digest)
            .collect()
    }

    /// Every digest in the index, in record order.
    pub fn digests(&self) -> impl Iterator<Item = Digest> + '_ {
        self.records.iter().map(IndexRecord::digest)
    }
}
