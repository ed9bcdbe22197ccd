//! Content-addressed message archive.
//!
//! A message with digest `d` lives at `<root>/<hex d[0]>/<hex d[1..]>`. A
//! sibling with a `.gz` suffix counts as present, so an archive compressed
//! out of band is not refilled. Files are only ever created, never
//! rewritten.
//!
//! [`ArchiveWriter`] owns a fixed pool of write slots. Each slot carries a
//! reusable render buffer, and a [`Semaphore`] with one permit per slot
//! bounds how many writes run at once.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::codec::{self, Digest, Headers};
use crate::file_ops;
use crate::{Error, Result};

/// Render buffers above this size are released instead of reused.
const MAX_RETAINED_BUFFER: usize = 8 * 1024 * 1024;

/// Location of archived messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    root: PathBuf,
}

impl Archive {
    /// Creates an archive rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Archive root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the archived message with this digest.
    #[must_use]
    pub fn path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join(codec::to_hex(&digest[..1]))
            .join(codec::to_hex(&digest[1..]))
    }

    /// True if the message, or its compressed sibling, is archived.
    ///
    /// # Errors
    ///
    /// Fails if existence cannot be determined.
    pub async fn contains(&self, digest: &Digest) -> io::Result<bool> {
        let path = self.path(digest);
        Ok(tokio::fs::try_exists(&path).await?
            || tokio::fs::try_exists(path.with_extension("gz")).await?)
    }

    fn contains_blocking(&self, digest: &Digest) -> io::Result<bool> {
        let path = self.path(digest);
        Ok(path.try_exists()? || path.with_extension("gz").try_exists()?)
    }
}

/// One message ready to be archived.
#[derive(Debug, Clone)]
pub struct WorkItem {
    /// Digest of `headers`.
    pub digest: Digest,
    /// Parsed header block.
    pub headers: Headers,
    /// Everything after the blank line.
    pub body: Vec<u8>,
}

/// Totals for one writer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Messages newly stored.
    pub written: usize,
    /// Messages already present.
    pub deduplicated: usize,
    /// Bytes stored.
    pub bytes: u64,
    /// Most writes observed in flight at once.
    pub peak_in_flight: usize,
}

#[derive(Debug, Default)]
struct WriteSlot {
    buffer: Vec<u8>,
}

#[derive(Debug, Default)]
struct Stats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

enum Written {
    Stored(u64),
    Duplicate,
}

/// Holds a slot and its permit for the duration of one write. The slot
/// goes back to the pool before the permit is released.
struct Lease {
    slot: WriteSlot,
    pool: Arc<Mutex<Vec<WriteSlot>>>,
    stats: Arc<Stats>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut slot = std::mem::take(&mut self.slot);
        if slot.buffer.capacity() > MAX_RETAINED_BUFFER {
            slot.buffer = Vec::new();
        }
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
        self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Writes messages into an [`Archive`] with bounded concurrency.
pub struct ArchiveWriter {
    archive: Arc<Archive>,
    pool: Arc<Mutex<Vec<WriteSlot>>>,
    permits: Arc<Semaphore>,
    stats: Arc<Stats>,
    jobs: JoinSet<Result<Written>>,
    report: WriteReport,
}

impl ArchiveWriter {
    /// Creates a writer with `slots` concurrent write slots (at least one).
    #[must_use]
    pub fn new(archive: Arc<Archive>, slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            archive,
            pool: Arc::new(Mutex::new(
                (0..slots).map(|_| WriteSlot::default()).collect(),
            )),
            permits: Arc::new(Semaphore::new(slots)),
            stats: Arc::new(Stats::default()),
            jobs: JoinSet::new(),
            report: WriteReport::default(),
        }
    }

    /// Waits for a free slot and starts writing `item` on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns the first storage error from any write finished so far.
    pub async fn submit(&mut self, item: WorkItem) -> Result<()> {
        while let Some(done) = self.jobs.try_join_next() {
            self.absorb(done)?;
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| Error::storage(self.archive.root(), io::Error::other(e)))?;
        let slot = self
            .pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_default();

        let in_flight = self.stats.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.peak.fetch_max(in_flight, Ordering::AcqRel);

        let mut lease = Lease {
            slot,
            pool: Arc::clone(&self.pool),
            stats: Arc::clone(&self.stats),
            _permit: permit,
        };
        let archive = Arc::clone(&self.archive);
        self.jobs
            .spawn_blocking(move || write_item(&archive, &mut lease.slot, &item));
        Ok(())
    }

    /// Waits for every write and returns the totals.
    ///
    /// # Errors
    ///
    /// Returns the first storage error.
    pub async fn finish(mut self) -> Result<WriteReport> {
        while let Some(done) = self.jobs.join_next().await {
            self.absorb(done)?;
        }
        self.report.peak_in_flight = self.stats.peak.load(Ordering::Acquire);
        debug!(
            written = self.report.written,
            deduplicated = self.report.deduplicated,
            bytes = self.report.bytes,
            peak = self.report.peak_in_flight,
            "archive writes complete"
        );
        Ok(self.report)
    }

    /// Drains `rx` into the archive until the sender is dropped.
    ///
    /// # Errors
    ///
    /// Returns the first storage error.
    pub async fn run(mut self, mut rx: mpsc::Receiver<WorkItem>) -> Result<WriteReport> {
        while let Some(item) = rx.recv().await {
            self.submit(item).await?;
        }
        self.finish().await
    }

    fn absorb(
        &mut self,
        done: std::result::Result<Result<Written>, tokio::task::JoinError>,
    ) -> Result<()> {
        let written = done.map_err(|e| Error::storage(self.archive.root(), io::Error::other(e)))??;
        match written {
            Written::Stored(bytes) => {
                self.report.written += 1;
                self.report.bytes += bytes;
            }
            Written::Duplicate => self.report.deduplicated += 1,
        }
        Ok(())
    }
}

fn write_item(archive: &Archive, slot: &mut WriteSlot, item: &WorkItem) -> Result<Written> {
    let path = archive.path(&item.digest);
    if archive
        .contains_blocking(&item.digest)
        .map_err(|e| Error::storage(&path, e))?
    {
        trace!(path = %path.display(), "already archived");
        return Ok(Written::Duplicate);
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| Error::storage(dir, e))?;
    }

    slot.buffer.clear();
    let len = codec::render(&item.headers, &item.body, &mut slot.buffer)
        .map_err(|e| Error::storage(&path, e))?;

    match file_ops::spit(&path, false, &slot.buffer) {
        Ok(()) => Ok(Written::Stored(len)),
        // Another writer stored the same digest first.
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Written::Duplicate),
        Err(e) => Err(Error::storage(&path, e)),
    }
}
