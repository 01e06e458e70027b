//! Functions for dealing with image files on the host file system
#![warn(missing_docs)]
#![warn(unsafe_code)]

use std::{
    fs,
    io::Write,
    path::Path,
    result::Result,
    time::SystemTime,
};

use log::debug;
use tempfile::NamedTempFile;

use crate::error::Error;

/// Open up a file and read in the data
///
/// # Arguments
///
/// * `path` - The image file to open and read
///
/// # Returns
///   Returns all the data as a u8 vector, or an
///   Err result if there was an error reading the file.
pub fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    Ok(fs::read(path)?)
}

/// The (mtime, size) fingerprint used to validate cached parses of an
/// image file.
pub fn fingerprint(path: &Path) -> Result<(SystemTime, u64), Error> {
    let meta = fs::metadata(path)?;
    let mtime = meta.modified()?;
    Ok((mtime, meta.len()))
}

/// Atomically replace `path` with `bytes`.
///
/// The data is written to a uniquely-named temporary file in the same
/// directory, synced, and renamed over the target, so readers observe
/// either the old image or the new one, never a torn write.  On any
/// failure before the rename the temporary file is removed.
///
/// An fsync failure after a complete write is tolerated (some host file
/// systems do not support it), as is a failure to carry over the
/// target's permissions.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;

    tmp.write_all(bytes)?;
    tmp.flush()?;
    if let Err(e) = tmp.as_file().sync_all() {
        debug!("fsync of {:?} failed, continuing: {}", tmp.path(), e);
    }

    // Carry the original permissions over; a fresh temp file defaults
    // to a restrictive mode.
    if let Ok(meta) = fs::metadata(path) {
        if let Err(e) = fs::set_permissions(tmp.path(), meta.permissions()) {
            debug!("chmod of {:?} failed, continuing: {}", tmp.path(), e);
        }
    }

    tmp.persist(path).map_err(|e| Error::from(e.error))?;
    Ok(())
}
