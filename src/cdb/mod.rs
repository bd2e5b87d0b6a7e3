//! Constant database.
//!
//! An immutable hash table stored in a single file: a 2048-byte header of
//! 256 `(offset, slots)` pairs, the `(keylen, datalen, key, data)` records,
//! then 256 open-addressed subtables of `(hash, offset)` slots. All integers
//! are little-endian `u32`, so the file never exceeds 4 GiB.

pub mod builder;
pub mod reader;

pub use builder::{CdbBuilder, CdbFile, CdbSink};
pub use reader::{Cdb, Find};

/// Size of the fixed header holding the 256 subtable descriptors.
pub const HEADER_SIZE: u32 = 2048;

/// Number of subtables; a key lives in subtable `hash & 255`.
pub const SUBTABLES: usize = 256;

/// The djb hash: `h = (h + (h << 5)) ^ c`, starting from 5381.
pub fn hash(key: &[u8]) -> u32 {
    key.iter()
        .fold(5381u32, |h, &c| h.wrapping_add(h << 5) ^ u32::from(c))
}

pub(crate) fn unpack_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(word)
}
