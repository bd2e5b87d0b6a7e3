//! Zone record values as stored in the database.
//!
//! Layout: `type:2` `marker:1` `[location:2]` `ttl:4` `ttd:8` `rdata`, all
//! integers big-endian. The marker says whether the record is tagged with a
//! location and whether it was compiled from a `*` wildcard owner.

use crate::codec::packet_copy;
use crate::errors::DnsError;

/// Two-byte split-horizon tag. All zeros means "no location".
pub type Location = [u8; 2];

pub const NO_LOCATION: Location = [0, 0];

pub const MARKER_GLOBAL: u8 = b'=';
pub const MARKER_LOCATED: u8 = b'>';
pub const MARKER_WILD_GLOBAL: u8 = b'*';
pub const MARKER_WILD_LOCATED: u8 = b'+';

/// Distance between a plain marker and its wildcard twin (`'=' - '*'`).
const WILDCARD_SHIFT: u8 = MARKER_GLOBAL - MARKER_WILD_GLOBAL;

const SIGN_BIT: u64 = 1 << 63;

/// A decoded record value borrowing its rdata from the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub rtype: u16,
    pub wildcard: bool,
    pub location: Option<Location>,
    pub ttl: u32,
    pub ttd: u64,
    pub rdata: &'a [u8],
}

impl<'a> Record<'a> {
    /// Decode a record value.
    pub fn parse(blob: &'a [u8]) -> Result<Self, DnsError> {
        let mut pos = 0;
        let rtype = packet_copy(&mut pos, 2, blob)?;
        let rtype = u16::from_be_bytes([rtype[0], rtype[1]]);

        let (located, wildcard) = match packet_copy(&mut pos, 1, blob)?[0] {
            MARKER_GLOBAL => (false, false),
            MARKER_LOCATED => (true, false),
            MARKER_WILD_GLOBAL => (false, true),
            MARKER_WILD_LOCATED => (true, true),
            other => {
                return Err(DnsError::protocol(format!(
                    "unknown record marker {:#04x}",
                    other
                )))
            }
        };

        let location = if located {
            let loc = packet_copy(&mut pos, 2, blob)?;
            Some([loc[0], loc[1]])
        } else {
            None
        };

        let ttl = packet_copy(&mut pos, 4, blob)?;
        let ttl = u32::from_be_bytes([ttl[0], ttl[1], ttl[2], ttl[3]]);
        let mut ttd = [0u8; 8];
        ttd.copy_from_slice(packet_copy(&mut pos, 8, blob)?);

        Ok(Self {
            rtype,
            wildcard,
            location,
            ttl,
            ttd: u64::from_be_bytes(ttd),
            rdata: &blob[pos..],
        })
    }

    /// Whether a client in `location` may see this record.
    pub fn visible_from(&self, location: Location) -> bool {
        self.location.map_or(true, |tag| tag == location)
    }

    /// The TTL to serve at `now` (seconds since the epoch), or `None` if the
    /// record is not in effect.
    ///
    /// A TTD without the sign bit is the instant the record becomes active.
    /// A TTD with the sign bit set is `2^63` plus the instant it expires;
    /// until then the TTL counts down so caches never outlive it.
    pub fn live_ttl(&self, now: u64) -> Option<u32> {
        let age = now.wrapping_sub(self.ttd);
        if age >= SIGN_BIT {
            return None;
        }
        if age + u64::from(self.ttl) >= SIGN_BIT {
            return Some((SIGN_BIT - age) as u32);
        }
        Some(self.ttl)
    }
}

/// Encode a record value.
///
/// # Arguments
/// * `rtype` - Record type.
/// * `wildcard` - Whether the owner was a `*` label.
/// * `location` - Location tag, [`NO_LOCATION`] for global records.
/// * `ttl` - Time to live in seconds.
/// * `ttd` - Activation or expiry instant, see [`Record::live_ttl`].
/// * `rdata` - Type-specific data, names uncompressed.
pub fn encode(rtype: u16, wildcard: bool, location: Location, ttl: u32, ttd: u64, rdata: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(17 + rdata.len());
    blob.extend_from_slice(&rtype.to_be_bytes());

    let mut marker = if location == NO_LOCATION {
        MARKER_GLOBAL
    } else {
        MARKER_LOCATED
    };
    if wildcard {
        marker -= WILDCARD_SHIFT;
    }
    blob.push(marker);
    if location != NO_LOCATION {
        blob.extend_from_slice(&location);
    }

    blob.extend_from_slice(&ttl.to_be_bytes());
    blob.extend_from_slice(&ttd.to_be_bytes());
    blob.extend_from_slice(rdata);
    blob
}

/// The TTD stored for "expires at `instant`".
pub fn expiring_at(instant: u64) -> u64 {
    instant.wrapping_add(SIGN_BIT)
}
