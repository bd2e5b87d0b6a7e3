//! DNS protocol constants.
//!
//! Record types, classes, response codes and the header layout shared by
//! the response builder and the resolution engine.

use std::fmt;

/// Length of the fixed DNS header.
pub const HEADER_LEN: usize = 12;

/// Largest message the response builder will produce.
pub const MAX_MESSAGE_LEN: usize = 65535;

/// Largest UDP response without EDNS.
pub const UDP_MAX_RESPONSE: usize = 512;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_HINFO: u16 = 13;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_SRV: u16 = 33;
pub const TYPE_DNAME: u16 = 39;
pub const TYPE_IXFR: u16 = 251;
pub const TYPE_AXFR: u16 = 252;
pub const TYPE_ANY: u16 = 255;

pub const CLASS_IN: u16 = 1;
pub const CLASS_ANY: u16 = 255;

/// Header flag bits in byte 2.
pub const FLAG_QR: u8 = 0x80;
pub const FLAG_AA: u8 = 0x04;
pub const FLAG_TC: u8 = 0x02;

/// TTL of the synthetic HINFO record answering ANY queries.
pub const ANY_HINFO_TTL: u32 = 86400;

/// RDATA of the synthetic HINFO record: CPU "RFC8482", empty OS.
pub const ANY_HINFO_RDATA: &[u8] = b"\x07RFC8482\x00";

/// Response codes this server produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Rcode {
    NoError = 0,
    FormErr = 1,
    ServFail = 2,
    NxDomain = 3,
    NotImp = 4,
    Refused = 5,
}

impl Rcode {
    /// Codes that discard everything after the question.
    pub fn is_error(self) -> bool {
        !matches!(self, Rcode::NoError | Rcode::NxDomain)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Rcode::NoError => "NOERROR",
            Rcode::FormErr => "FORMERR",
            Rcode::ServFail => "SERVFAIL",
            Rcode::NxDomain => "NXDOMAIN",
            Rcode::NotImp => "NOTIMP",
            Rcode::Refused => "REFUSED",
        }
    }

    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Rcode::NoError),
            1 => Some(Rcode::FormErr),
            2 => Some(Rcode::ServFail),
            3 => Some(Rcode::NxDomain),
            4 => Some(Rcode::NotImp),
            5 => Some(Rcode::Refused),
            _ => None,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The response code carried in a response message.
///
/// # Arguments
/// * `message` - A DNS message of at least four bytes.
///
/// # Returns
/// The code, or `None` for short messages and codes this server never sends.
pub fn rcode_of(message: &[u8]) -> Option<Rcode> {
    message.get(3).and_then(|b| Rcode::from_u8(b & 0x0f))
}

/// Record sections; the value is the offset of the section's count in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Answer = 6,
    Authority = 8,
    Additional = 10,
}

impl Section {
    pub fn count_offset(self) -> usize {
        self as usize
    }
}

/// Mnemonic for a record type, used in log output.
pub fn type_name(rtype: u16) -> String {
    match rtype {
        TYPE_A => "A".to_string(),
        TYPE_NS => "NS".to_string(),
        TYPE_CNAME => "CNAME".to_string(),
        TYPE_SOA => "SOA".to_string(),
        TYPE_PTR => "PTR".to_string(),
        TYPE_HINFO => "HINFO".to_string(),
        TYPE_MX => "MX".to_string(),
        TYPE_TXT => "TXT".to_string(),
        TYPE_AAAA => "AAAA".to_string(),
        TYPE_SRV => "SRV".to_string(),
        TYPE_DNAME => "DNAME".to_string(),
        TYPE_IXFR => "IXFR".to_string(),
        TYPE_AXFR => "AXFR".to_string(),
        TYPE_ANY => "ANY".to_string(),
        other => format!("TYPE{}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_rcodes() {
        assert!(!Rcode::NoError.is_error());
        assert!(!Rcode::NxDomain.is_error());
        for rcode in [Rcode::FormErr, Rcode::ServFail, Rcode::NotImp, Rcode::Refused] {
            assert!(rcode.is_error());
        }
    }

    #[test]
    fn test_rcode_of() {
        assert_eq!(rcode_of(&[0, 0, 0x84, 0x03]), Some(Rcode::NxDomain));
        assert_eq!(rcode_of(&[0, 0, 0x80, 0x05]), Some(Rcode::Refused));
        assert_eq!(rcode_of(&[0, 0, 0x80]), None);
    }

    #[test]
    fn test_type_names() {
        assert_eq!(type_name(TYPE_AAAA), "AAAA");
        assert_eq!(type_name(65280), "TYPE65280");
    }
}
