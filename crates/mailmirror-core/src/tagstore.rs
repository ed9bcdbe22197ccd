//! The local tag store.
//!
//! [`TagStore`] is the seam between the engine and the indexer that owns
//! local tags. [`Notmuch`] drives the `notmuch` command line tool.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::codec::{self, DIGEST_LEN};
use crate::index::DigestTail;
use crate::revision::RevisionCheckpoint;

/// Tag store failures.
#[derive(Debug, Error)]
pub enum TagStoreError {
    /// The tool could not be started or fed.
    #[error("failed to run {program}: {source}")]
    Spawn {
        /// Program path.
        program: String,
        /// Underlying I/O error.
        source: io::Error,
    },

    /// The tool exited unsuccessfully.
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        /// Subcommand that failed.
        command: String,
        /// Exit status.
        status: ExitStatus,
        /// Captured standard error.
        stderr: String,
    },

    /// The tool's output could not be understood.
    #[error("unexpected output from `{command}`: {output:?}")]
    Output {
        /// Subcommand.
        command: String,
        /// Offending output.
        output: String,
    },
}

/// Operations the engine needs from the local tag store.
///
/// `identity` scopes a query to one database instance; the store must
/// refuse the query if its own identity differs.
pub trait TagStore: Send + Sync {
    /// Current message count, database identity and revision counter.
    fn status(&self) -> impl Future<Output = Result<RevisionCheckpoint, TagStoreError>> + Send;

    /// Number of messages matching `query`.
    fn count(
        &self,
        query: &str,
        identity: Option<&str>,
    ) -> impl Future<Output = Result<u64, TagStoreError>> + Send;

    /// File paths of messages matching `query`.
    fn search_files(
        &self,
        query: &str,
        identity: Option<&str>,
    ) -> impl Future<Output = Result<Vec<PathBuf>, TagStoreError>> + Send;

    /// Picks up newly archived files.
    fn refresh(&self) -> impl Future<Output = Result<(), TagStoreError>> + Send;

    /// Applies tag lines of the form `+a -b id:<message-id>`, tags and
    /// message id percent-encoded.
    fn apply_batch(&self, lines: &[String]) -> impl Future<Output = Result<(), TagStoreError>> + Send;
}

/// [`TagStore`] backed by the `notmuch` binary.
#[derive(Debug, Clone)]
pub struct Notmuch {
    program: PathBuf,
}

impl Default for Notmuch {
    fn default() -> Self {
        Self::new("notmuch")
    }
}

impl Notmuch {
    /// Uses the given `notmuch` executable.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str], input: Option<Vec<u8>>) -> Result<String, TagStoreError> {
        let command = args.join(" ");
        let spawn_error = |source| TagStoreError::Spawn {
            program: self.program.display().to_string(),
            source,
        };
        trace!(command, "running notmuch");

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(&input).await.map_err(spawn_error)?;
            stdin.shutdown().await.map_err(spawn_error)?;
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        if !output.status.success() {
            return Err(TagStoreError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn identity_arg(identity: Option<&str>) -> Option<String> {
    identity.map(|id| format!("--uuid={id}"))
}

impl TagStore for Notmuch {
    async fn status(&self) -> Result<RevisionCheckpoint, TagStoreError> {
        let out = self.run(&["count", "--lastmod"], None).await?;
        RevisionCheckpoint::parse(&out).ok_or_else(|| TagStoreError::Output {
            command: "count --lastmod".into(),
            output: out,
        })
    }

    async fn count(&self, query: &str, identity: Option<&str>) -> Result<u64, TagStoreError> {
        let uuid = identity_arg(identity);
        let mut args = vec!["count"];
        args.extend(uuid.as_deref());
        args.push(query);
        let out = self.run(&args, None).await?;
        out.trim().parse().map_err(|_| TagStoreError::Output {
            command: format!("count {query}"),
            output: out,
        })
    }

    async fn search_files(
        &self,
        query: &str,
        identity: Option<&str>,
    ) -> Result<Vec<PathBuf>, TagStoreError> {
        let uuid = identity_arg(identity);
        let mut args = vec!["search", "--output=files"];
        args.extend(uuid.as_deref());
        args.push(query);
        let out = self.run(&args, None).await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    async fn refresh(&self) -> Result<(), TagStoreError> {
        self.run(&["new", "--quiet"], None).await.map(drop)
    }

    async fn apply_batch(&self, lines: &[String]) -> Result<(), TagStoreError> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut input = lines.join("\n").into_bytes();
        input.push(b'\n');
        self.run(&["tag", "--batch"], Some(input)).await?;
        debug!(lines = lines.len(), "applied tag batch");
        Ok(())
    }
}

/// Recovers the digest tail from an archive file name. Names that do not
/// start with 38 hex characters belong to something else.
#[must_use]
pub fn digest_tail_from_path(path: &Path) -> Option<DigestTail> {
    let name = path.file_name()?.to_str()?;
    codec::from_hex::<{ DIGEST_LEN - 1 }>(name.get(..(DIGEST_LEN - 1) * 2)?)
}
