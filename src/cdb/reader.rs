//! Read side of the constant database.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use super::{hash, unpack_u32};
use crate::errors::DnsError;

/// Bytes of a database, either mapped from its file or held in memory.
#[derive(Debug, Default)]
enum Image {
    #[default]
    Empty,
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Image {
    fn bytes(&self) -> &[u8] {
        match self {
            Image::Empty => &[],
            Image::Owned(data) => data,
            Image::Mapped(map) => map,
        }
    }
}

/// An opened constant database.
///
/// The file is mapped read-only and never changes once loaded, so a `Cdb`
/// can be shared between any number of concurrent lookups. Every lookup
/// carries its own cursor in a [`Find`].
#[derive(Debug, Default)]
pub struct Cdb {
    image: Image,
}

impl Cdb {
    /// Map a database file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DnsError> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if u32::try_from(len).is_err() {
            return Err(DnsError::resource("database larger than 4 GiB"));
        }
        if len == 0 {
            return Ok(Self::empty());
        }
        // SAFETY: databases are published by renaming a finished file into
        // place and are never written to afterwards.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self {
            image: Image::Mapped(map),
        })
    }

    /// Wrap an in-memory database image.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, DnsError> {
        if u32::try_from(data.len()).is_err() {
            return Err(DnsError::resource("database larger than 4 GiB"));
        }
        Ok(Self {
            image: Image::Owned(data),
        })
    }

    /// A database with no contents. Every lookup against it fails with a
    /// protocol error because even the header cannot be read.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Length of the database image in bytes.
    pub fn len(&self) -> u32 {
        self.image.bytes().len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.image.bytes().is_empty()
    }

    /// Bounds-checked read of `len` bytes at `pos`.
    pub fn read(&self, pos: u32, len: u32) -> Result<&[u8], DnsError> {
        let size = self.len();
        if pos > size || size - pos < len {
            return Err(DnsError::protocol(format!(
                "database read of {} bytes at {} past end {}",
                len, pos, size
            )));
        }
        Ok(&self.image.bytes()[pos as usize..(pos + len) as usize])
    }

    /// Start a fresh search for `key`. The returned cursor yields the data
    /// of every record stored under `key`.
    pub fn find<'c, 'k>(&'c self, key: &'k [u8]) -> Find<'c, 'k> {
        Find {
            cdb: self,
            key,
            state: None,
            done: false,
        }
    }

    /// Data of the first record stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<&[u8]>, DnsError> {
        self.find(key).next().transpose()
    }
}

#[derive(Debug, Clone, Copy)]
struct Probe {
    khash: u32,
    hpos: u32,
    hslots: u32,
    kpos: u32,
    loops: u32,
}

/// Cursor over the records stored under one key.
///
/// Yields `Err` once and then stops if the file turns out to be corrupt.
#[derive(Debug)]
pub struct Find<'c, 'k> {
    cdb: &'c Cdb,
    key: &'k [u8],
    state: Option<Probe>,
    done: bool,
}

impl<'c, 'k> Find<'c, 'k> {
    fn start(&self) -> Result<Option<Probe>, DnsError> {
        let khash = hash(self.key);
        let header = self.cdb.read((khash & 255) << 3, 8)?;
        let hslots = unpack_u32(&header[4..]);
        if hslots == 0 {
            return Ok(None);
        }
        let hpos = unpack_u32(header);
        let start = ((khash >> 8) % hslots)
            .checked_mul(8)
            .and_then(|off| off.checked_add(hpos))
            .ok_or_else(|| DnsError::protocol("subtable offset overflow"))?;
        Ok(Some(Probe {
            khash,
            hpos,
            hslots,
            kpos: start,
            loops: 0,
        }))
    }

    fn advance(&mut self) -> Result<Option<&'c [u8]>, DnsError> {
        let mut probe = match self.state {
            Some(probe) => probe,
            None => match self.start()? {
                Some(probe) => probe,
                None => return Ok(None),
            },
        };
        let table_end = probe
            .hslots
            .checked_mul(8)
            .and_then(|len| len.checked_add(probe.hpos))
            .ok_or_else(|| DnsError::protocol("subtable length overflow"))?;

        let found = loop {
            if probe.loops >= probe.hslots {
                break None;
            }
            let slot = self.cdb.read(probe.kpos, 8)?;
            let pos = unpack_u32(&slot[4..]);
            if pos == 0 {
                break None;
            }
            let slot_hash = unpack_u32(slot);

            probe.loops += 1;
            probe.kpos += 8;
            if probe.kpos == table_end {
                probe.kpos = probe.hpos;
            }

            if slot_hash != probe.khash {
                continue;
            }
            // A matching hash says nothing about the key itself.
            let lens = self.cdb.read(pos, 8)?;
            let keylen = unpack_u32(lens);
            if keylen as usize != self.key.len() {
                continue;
            }
            let datalen = unpack_u32(&lens[4..]);
            let key_pos = pos
                .checked_add(8)
                .ok_or_else(|| DnsError::protocol("record offset overflow"))?;
            if self.cdb.read(key_pos, keylen)? != self.key {
                continue;
            }
            let data_pos = key_pos
                .checked_add(keylen)
                .ok_or_else(|| DnsError::protocol("record offset overflow"))?;
            break Some(self.cdb.read(data_pos, datalen)?);
        };

        self.state = Some(probe);
        Ok(found)
    }
}

impl<'c, 'k> Iterator for Find<'c, 'k> {
    type Item = Result<&'c [u8], DnsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(data)) => Some(Ok(data)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
