//! Write side of the constant database.
//!
//! Records are streamed to the output as they are added; only the
//! `(hash, offset)` pairs are kept in memory until [`CdbBuilder::finish`]
//! lays out the subtables and writes the header.

use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use super::{hash, HEADER_SIZE, SUBTABLES};
use crate::errors::DnsError;

/// Anything that accepts `(key, data)` pairs for a constant database.
pub trait CdbSink {
    fn add(&mut self, key: &[u8], data: &[u8]) -> Result<(), DnsError>;
}

/// Builds a constant database into any seekable writer.
#[derive(Debug)]
pub struct CdbBuilder<W: Write + Seek> {
    out: W,
    slots: Vec<(u32, u32)>,
    pos: u32,
}

impl<W: Write + Seek> CdbBuilder<W> {
    /// Start a new database. The header is reserved now and written last.
    pub fn new(mut out: W) -> Result<Self, DnsError> {
        out.seek(SeekFrom::Start(u64::from(HEADER_SIZE)))?;
        Ok(Self {
            out,
            slots: Vec::new(),
            pos: HEADER_SIZE,
        })
    }

    /// Append one record. Repeated keys are all kept.
    pub fn add(&mut self, key: &[u8], data: &[u8]) -> Result<(), DnsError> {
        let keylen = u32::try_from(key.len())
            .map_err(|_| DnsError::resource("key longer than 4 GiB"))?;
        let datalen = u32::try_from(data.len())
            .map_err(|_| DnsError::resource("data longer than 4 GiB"))?;
        let next = self
            .pos
            .checked_add(8)
            .and_then(|p| p.checked_add(keylen))
            .and_then(|p| p.checked_add(datalen))
            .ok_or_else(|| DnsError::resource("database exceeds 4 GiB"))?;

        self.out.write_all(&keylen.to_le_bytes())?;
        self.out.write_all(&datalen.to_le_bytes())?;
        self.out.write_all(key)?;
        self.out.write_all(data)?;

        self.slots.push((hash(key), self.pos));
        self.pos = next;
        Ok(())
    }

    /// Number of records added so far.
    pub fn entries(&self) -> usize {
        self.slots.len()
    }

    /// Current size of the database in bytes.
    pub fn position(&self) -> u32 {
        self.pos
    }

    /// Write the hash subtables and the header, returning the writer.
    pub fn finish(mut self) -> Result<W, DnsError> {
        let mut buckets: Vec<Vec<(u32, u32)>> = vec![Vec::new(); SUBTABLES];
        for &(h, p) in &self.slots {
            buckets[(h & 255) as usize].push((h, p));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        let mut table: Vec<(u32, u32)> = Vec::new();

        for (i, bucket) in buckets.iter().enumerate() {
            let len = u32::try_from(bucket.len())
                .ok()
                .and_then(|n| n.checked_mul(2))
                .ok_or_else(|| DnsError::resource("too many records"))?;

            header[i * 8..i * 8 + 4].copy_from_slice(&self.pos.to_le_bytes());
            header[i * 8 + 4..i * 8 + 8].copy_from_slice(&len.to_le_bytes());

            table.clear();
            table.resize(len as usize, (0, 0));
            for &(h, p) in bucket {
                let mut slot = ((h >> 8) % len) as usize;
                while table[slot].1 != 0 {
                    slot += 1;
                    if slot == table.len() {
                        slot = 0;
                    }
                }
                table[slot] = (h, p);
            }

            for &(h, p) in &table {
                self.pos = self
                    .pos
                    .checked_add(8)
                    .ok_or_else(|| DnsError::resource("database exceeds 4 GiB"))?;
                self.out.write_all(&h.to_le_bytes())?;
                self.out.write_all(&p.to_le_bytes())?;
            }
        }

        self.out.seek(SeekFrom::Start(0))?;
        self.out.write_all(&header)?;
        self.out.flush()?;
        Ok(self.out)
    }
}

impl<W: Write + Seek> CdbSink for CdbBuilder<W> {
    fn add(&mut self, key: &[u8], data: &[u8]) -> Result<(), DnsError> {
        CdbBuilder::add(self, key, data)
    }
}

/// A database file that becomes visible only once it is complete.
///
/// Records go to a temporary file next to the destination; [`CdbFile::finish`]
/// syncs it and renames it over the destination. Readers therefore see
/// either the previous database or the new one, never a partial file.
/// Dropping an unfinished `CdbFile` removes the temporary file.
#[derive(Debug)]
pub struct CdbFile {
    builder: Option<CdbBuilder<BufWriter<File>>>,
    tmp: PathBuf,
    dest: PathBuf,
}

impl CdbFile {
    /// Start building `dest`, writing to `dest` with a `.tmp` extension.
    pub fn start<P: AsRef<Path>>(dest: P) -> Result<Self, DnsError> {
        let dest = dest.as_ref().to_path_buf();
        let tmp = dest.with_extension("tmp");
        Self::start_with_temp(dest, tmp)
    }

    /// Start building `dest`, writing to an explicit temporary path.
    pub fn start_with_temp(dest: PathBuf, tmp: PathBuf) -> Result<Self, DnsError> {
        let file = File::create(&tmp)?;
        let builder = CdbBuilder::new(BufWriter::new(file))?;
        debug!("Building {} via {}", dest.display(), tmp.display());
        Ok(Self {
            builder: Some(builder),
            tmp,
            dest,
        })
    }

    fn builder(&mut self) -> Result<&mut CdbBuilder<BufWriter<File>>, DnsError> {
        self.builder
            .as_mut()
            .ok_or_else(|| DnsError::resource("database already finished"))
    }

    pub fn entries(&self) -> usize {
        self.builder.as_ref().map_or(0, CdbBuilder::entries)
    }

    pub fn position(&self) -> u32 {
        self.builder.as_ref().map_or(0, CdbBuilder::position)
    }

    /// Complete the database and atomically publish it. On failure the
    /// temporary file is removed and `dest` is left as it was.
    pub fn finish(mut self) -> Result<(), DnsError> {
        let builder = self
            .builder
            .take()
            .ok_or_else(|| DnsError::resource("database already finished"))?;

        let published = publish(builder, &self.tmp, &self.dest);
        match &published {
            Ok(()) => debug!("Published {}", self.dest.display()),
            Err(_) => {
                if let Err(e) = fs::remove_file(&self.tmp) {
                    warn!("Failed to remove {}: {}", self.tmp.display(), e);
                }
            }
        }
        published
    }

    /// Abandon the build, leaving any previously published database alone.
    pub fn discard(mut self) -> Result<(), DnsError> {
        self.builder.take();
        fs::remove_file(&self.tmp)?;
        Ok(())
    }
}

fn publish(builder: CdbBuilder<BufWriter<File>>, tmp: &Path, dest: &Path) -> Result<(), DnsError> {
    let file = builder
        .finish()?
        .into_inner()
        .map_err(|e| DnsError::Io(e.into_error()))?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp, dest)?;
    Ok(())
}

impl CdbSink for CdbFile {
    fn add(&mut self, key: &[u8], data: &[u8]) -> Result<(), DnsError> {
        self.builder()?.add(key, data)
    }
}

impl Drop for CdbFile {
    fn drop(&mut self) {
        if self.builder.take().is_some() {
            if let Err(e) = fs::remove_file(&self.tmp) {
                warn!("Failed to remove {}: {}", self.tmp.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::cdb::{unpack_u32, Cdb};

    #[test]
    fn test_empty_database_layout() {
        let builder = CdbBuilder::new(Cursor::new(Vec::new())).unwrap();
        let bytes = builder.finish().unwrap().into_inner();
        assert_eq!(bytes.len(), HEADER_SIZE as usize);
        for i in 0..SUBTABLES {
            assert_eq!(unpack_u32(&bytes[i * 8..]), HEADER_SIZE);
            assert_eq!(unpack_u32(&bytes[i * 8 + 4..]), 0);
        }
    }

    #[test]
    fn test_subtable_has_twice_the_keys() {
        let mut builder = CdbBuilder::new(Cursor::new(Vec::new())).unwrap();
        builder.add(b"dup", b"1").unwrap();
        builder.add(b"dup", b"2").unwrap();
        builder.add(b"dup", b"3").unwrap();
        let bytes = builder.finish().unwrap().into_inner();

        let bucket = (hash(b"dup") & 255) as usize;
        assert_eq!(unpack_u32(&bytes[bucket * 8 + 4..]), 6);
        let records_end = HEADER_SIZE as usize + 3 * (8 + 3 + 1);
        assert_eq!(bytes.len(), records_end + 6 * 8);
    }

    #[test]
    fn test_record_layout_is_little_endian() {
        let mut builder = CdbBuilder::new(Cursor::new(Vec::new())).unwrap();
        builder.add(b"ab", b"xyz").unwrap();
        let bytes = builder.finish().unwrap().into_inner();
        let rec = &bytes[HEADER_SIZE as usize..];
        assert_eq!(&rec[..8], &[2, 0, 0, 0, 3, 0, 0, 0]);
        assert_eq!(&rec[8..13], b"abxyz");
    }

    #[test]
    fn test_offset_overflow_is_rejected() {
        let mut builder = CdbBuilder::new(Cursor::new(Vec::new())).unwrap();
        builder.pos = u32::MAX - 10;
        let err = builder.add(b"key", b"data").unwrap_err();
        assert!(matches!(err, DnsError::Resource(_)));
        assert_eq!(builder.entries(), 0);
    }

    #[test]
    fn test_file_is_published_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.cdb");

        let mut file = CdbFile::start(&dest).unwrap();
        file.add(b"key", b"first").unwrap();
        assert!(!dest.exists());
        assert!(dir.path().join("data.tmp").exists());
        file.finish().unwrap();

        assert!(!dir.path().join("data.tmp").exists());
        let cdb = Cdb::open(&dest).unwrap();
        assert_eq!(cdb.get(b"key").unwrap(), Some(&b"first"[..]));
    }

    #[test]
    fn test_discarded_build_keeps_previous_database() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.cdb");

        let mut file = CdbFile::start(&dest).unwrap();
        file.add(b"key", b"old").unwrap();
        file.finish().unwrap();

        let mut file = CdbFile::start(&dest).unwrap();
        file.add(b"key", b"new").unwrap();
        file.discard().unwrap();

        let cdb = Cdb::open(&dest).unwrap();
        assert_eq!(cdb.get(b"key").unwrap(), Some(&b"old"[..]));
        assert!(!dir.path().join("data.tmp").exists());
    }

    #[test]
    fn test_dropped_build_removes_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.cdb");
        {
            let mut file = CdbFile::start(&dest).unwrap();
            file.add(b"key", b"value").unwrap();
        }
        assert!(!dir.path().join("data.tmp").exists());
        assert!(!dest.exists());
    }

    #[test]
    fn test_failed_publish_removes_temporary_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("data.cdb");
        // A non-empty directory cannot be replaced by a rename.
        fs::create_dir(&dest).unwrap();
        fs::write(dest.join("occupied"), b"x").unwrap();

        let mut file = CdbFile::start(&dest).unwrap();
        file.add(b"key", b"value").unwrap();
        assert!(file.finish().is_err());

        assert!(!dir.path().join("data.tmp").exists());
        assert!(dest.join("occupied").exists());
    }
}
