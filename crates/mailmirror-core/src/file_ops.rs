//! Atomic file replacement.

use std::io::{self, Write};
use std::path::Path;

/// Writes `data` to a temporary file beside `path`, syncs it, then renames
/// it into place.
///
/// With `overwrite` false an existing `path` is left untouched and
/// [`io::ErrorKind::AlreadyExists`] is returned.
pub fn spit(path: &Path, overwrite: bool, data: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tf = tempfile::NamedTempFile::new_in(dir)?;
    tf.as_file_mut().write_all(data)?;
    tf.as_file_mut().sync_all()?;
    if overwrite {
        tf.persist(path)?;
    } else {
        tf.persist_noclobber(path)?;
    }
    Ok(())
}

/// Runs [`spit`] on the blocking pool.
pub async fn spit_async(path: &Path, overwrite: bool, data: Vec<u8>) -> io::Result<()> {
    let path = path.to_owned();
    tokio::task::spawn_blocking(move || spit(&path, overwrite, &data))
        .await
        .map_err(io::Error::other)?
}
