//! The live zone database.
//!
//! The server reads from whichever generation of `data.cdb` was loaded
//! last. [`Database::reload`] checks the file and, if it changed, loads the
//! new generation and swaps it in; queries already running keep the `Arc`
//! they started with.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;

use arc_swap::ArcSwap;
use log::{info, warn};
use metrics::increment_counter;

use crate::cdb::Cdb;
use crate::errors::DnsError;

/// What identifies a generation on disk. Every publish renames a new file
/// into place, so the inode changes even when size and mtime do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
    inode: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Result<Self, DnsError> {
        let meta = fs::metadata(path)?;
        Ok(Self {
            modified: meta.modified()?,
            len: meta.len(),
            inode: inode(&meta),
        })
    }
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> u64 {
    std::os::unix::fs::MetadataExt::ino(meta)
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> u64 {
    0
}

/// Holder of the current database generation.
#[derive(Debug)]
pub struct Database {
    path: PathBuf,
    current: ArcSwap<Cdb>,
    stamp: Mutex<Option<FileStamp>>,
}

impl Database {
    /// Load the database at `path`.
    ///
    /// A missing or unreadable file is not fatal: the server starts with an
    /// empty generation, answers SERVFAIL, and picks the file up on a later
    /// [`reload`](Self::reload).
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let db = Self {
            path: path.as_ref().to_path_buf(),
            current: ArcSwap::from_pointee(Cdb::empty()),
            stamp: Mutex::new(None),
        };
        if let Err(e) = db.reload() {
            warn!("Serving SERVFAIL until {} can be loaded: {}", db.path.display(), e);
        }
        db
    }

    /// Wrap an already loaded database. It is never reloaded from disk
    /// unless a file exists at `path`.
    pub fn from_cdb<P: AsRef<Path>>(path: P, cdb: Cdb) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            current: ArcSwap::from_pointee(cdb),
            stamp: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The current generation.
    pub fn snapshot(&self) -> Arc<Cdb> {
        self.current.load_full()
    }

    /// Load the file again if it was replaced or its modification time or
    /// size changed.
    ///
    /// # Returns
    /// `true` if a new generation was swapped in.
    pub fn reload(&self) -> Result<bool, DnsError> {
        let mut stamp = self.stamp.lock().unwrap_or_else(PoisonError::into_inner);

        let result = FileStamp::of(&self.path).and_then(|latest| {
            if *stamp == Some(latest) {
                return Ok(None);
            }
            Cdb::open(&self.path).map(|cdb| Some((latest, cdb)))
        });

        match result {
            Ok(None) => Ok(false),
            Ok(Some((latest, cdb))) => {
                info!("Loaded {} ({} bytes)", self.path.display(), cdb.len());
                self.current.store(Arc::new(cdb));
                *stamp = Some(latest);
                increment_counter!("dns_database_reloads_total");
                Ok(true)
            }
            Err(e) => {
                increment_counter!("dns_database_reload_failures_total");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::cdb::{CdbBuilder, CdbFile, CdbSink};

    fn publish(path: &Path, pairs: &[(&[u8], &[u8])]) {
        let mut file = CdbFile::start(path).unwrap();
        for (key, data) in pairs {
            file.add(key, data).unwrap();
        }
        file.finish().unwrap();
    }

    #[test]
    fn test_missing_file_serves_empty_generation() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("data.cdb"));
        assert!(db.snapshot().is_empty());
        assert!(db.reload().is_err());
    }

    #[test]
    fn test_reload_picks_up_new_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.cdb");
        publish(&path, &[(b"key", b"one")]);

        let db = Database::open(&path);
        let before = db.snapshot();
        assert_eq!(before.get(b"key").unwrap(), Some(&b"one"[..]));
        assert!(!db.reload().unwrap());

        publish(&path, &[(b"key", b"two"), (b"other", b"three")]);
        assert!(db.reload().unwrap());
        assert_eq!(db.snapshot().get(b"key").unwrap(), Some(&b"two"[..]));

        // A query holding the old generation still sees it.
        assert_eq!(before.get(b"key").unwrap(), Some(&b"one"[..]));
    }

    #[cfg(unix)]
    #[test]
    fn test_reload_sees_replacement_with_same_size_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.cdb");
        publish(&path, &[(b"key", b"one")]);
        let db = Database::open(&path);
        let modified = fs::metadata(&path).unwrap().modified().unwrap();

        publish(&path, &[(b"key", b"two")]);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(modified)
            .unwrap();

        assert!(db.reload().unwrap());
        assert_eq!(db.snapshot().get(b"key").unwrap(), Some(&b"two"[..]));
    }

    #[test]
    fn test_failed_reload_keeps_current_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.cdb");
        publish(&path, &[(b"key", b"one")]);
        let db = Database::open(&path);

        fs::remove_file(&path).unwrap();
        assert!(db.reload().is_err());
        assert_eq!(db.snapshot().get(b"key").unwrap(), Some(&b"one"[..]));
    }

    #[test]
    fn test_from_cdb() {
        let mut builder = CdbBuilder::new(Cursor::new(Vec::new())).unwrap();
        builder.add(b"k", b"v").unwrap();
        let cdb = Cdb::from_bytes(builder.finish().unwrap().into_inner()).unwrap();
        let db = Database::from_cdb("unused.cdb", cdb);
        assert_eq!(db.snapshot().get(b"k").unwrap(), Some(&b"v"[..]));
        assert_eq!(db.path(), Path::new("unused.cdb"));
    }
}
