//! Process-wide cache of parsed images
//!
//! Parsed read-side state is memoized per absolute path and validated
//! against an (mtime, size) fingerprint.  Entries are immutable `Arc`s,
//! so concurrent readers share them safely; a racing double insert is
//! resolved last-writer-wins, both values being equivalent.  Every
//! write path invalidates by deleting the entry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::SystemTime;

use crate::disk_format::image::ParsedImage;

struct CacheEntry {
    mtime: SystemTime,
    size: u64,
    parsed: Arc<ParsedImage>,
}

type CacheMap = HashMap<PathBuf, CacheEntry>;

fn cache() -> &'static RwLock<CacheMap> {
    static CACHE: OnceLock<RwLock<CacheMap>> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn read_guard() -> RwLockReadGuard<'static, CacheMap> {
    match cache().read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_guard() -> RwLockWriteGuard<'static, CacheMap> {
    match cache().write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Return the cached parse for `path` if its fingerprint still
/// matches.
pub fn lookup(path: &Path, fingerprint: (SystemTime, u64)) -> Option<Arc<ParsedImage>> {
    let guard = read_guard();
    let entry = guard.get(path)?;
    if (entry.mtime, entry.size) == fingerprint {
        Some(Arc::clone(&entry.parsed))
    } else {
        None
    }
}

/// Install a parse for `path`.
pub fn install(path: &Path, fingerprint: (SystemTime, u64), parsed: Arc<ParsedImage>) {
    let mut guard = write_guard();
    guard.insert(
        path.to_path_buf(),
        CacheEntry {
            mtime: fingerprint.0,
            size: fingerprint.1,
            parsed,
        },
    );
}

/// Drop any cached parse for `path`.  Called by every write path.
pub fn invalidate(path: &Path) {
    let mut guard = write_guard();
    guard.remove(path);
}
