//! Response message builder.
//!
//! A [`Response`] rewrites a query buffer in place into the answer: the
//! header and question are kept, records are appended with name
//! compression, and [`Response::finish`] enforces the transport's size limit.

use crate::codec::{domain_equal, domain_length, packet_copy, packet_get_name, packet_skip_name, packet_u16};
use crate::dns::{Rcode, Section, CLASS_IN, FLAG_AA, FLAG_QR, FLAG_TC, HEADER_LEN, MAX_MESSAGE_LEN};
use crate::errors::DnsError;

/// Names longer than this are never offered as compression targets.
const MAX_CACHED_NAME: usize = 128;

/// Number of compression targets remembered per message.
const MAX_CACHED_NAMES: usize = 128;

/// Offsets at or beyond this do not fit a compression pointer comfortably.
const MAX_CACHED_OFFSET: usize = 16384;

/// The question of a well-formed query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    /// Query name exactly as the client sent it.
    pub name: Vec<u8>,
    pub qtype: u16,
    pub qclass: u16,
}

/// What to do with an incoming message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Not a query (too short, or already a response). Send nothing.
    Ignore,
    /// The buffer already holds an error response with this code.
    Rejected(Rcode),
    /// A standard query; the buffer holds the header and echoed question.
    Question(Question),
}

#[derive(Debug)]
struct CachedName {
    name: Vec<u8>,
    pos: u16,
}

/// Builds a response in place over a query buffer.
#[derive(Debug)]
pub struct Response<'a> {
    buf: &'a mut Vec<u8>,
    names: Vec<CachedName>,
    rdata: usize,
}

impl<'a> Response<'a> {
    pub fn new(buf: &'a mut Vec<u8>) -> Self {
        Self {
            buf,
            names: Vec::new(),
            rdata: 0,
        }
    }

    /// Validate the query in the buffer and reset it to header plus question.
    ///
    /// The ID, RD bit and QDCOUNT are inherited from the query; the other
    /// counts are cleared and anything after the question is dropped.
    pub fn parse_query(&mut self) -> Query {
        self.names.clear();
        self.rdata = 0;

        if self.buf.len() < HEADER_LEN || self.buf[2] & FLAG_QR != 0 {
            self.buf.clear();
            return Query::Ignore;
        }

        // Any opcode, or AA/TC set by the client.
        if self.buf[2] & 0xfe != 0 {
            self.set_rcode(Rcode::NotImp);
            return Query::Rejected(Rcode::NotImp);
        }

        let question = match self.read_question() {
            Ok(question) => question,
            Err(_) => {
                self.set_rcode(Rcode::FormErr);
                return Query::Rejected(Rcode::FormErr);
            }
        };

        self.buf.truncate(HEADER_LEN);
        self.buf[6..HEADER_LEN].fill(0);

        let echoed = self
            .add_name(&question.name)
            .and_then(|_| self.add_u16(question.qtype))
            .and_then(|_| self.add_u16(question.qclass));
        if echoed.is_err() {
            self.set_rcode(Rcode::ServFail);
            return Query::Rejected(Rcode::ServFail);
        }

        Query::Question(question)
    }

    fn read_question(&self) -> Result<Question, DnsError> {
        if self.buf[4..6] != [0, 1] {
            return Err(DnsError::protocol("QDCOUNT is not 1"));
        }
        let mut pos = HEADER_LEN;
        let name = packet_get_name(&mut pos, self.buf.as_slice())?;
        let qtype = packet_u16(&mut pos, self.buf.as_slice())?;
        let qclass = packet_u16(&mut pos, self.buf.as_slice())?;
        Ok(Question { name, qtype, qclass })
    }

    /// Current message length.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The message built so far.
    pub fn as_bytes(&self) -> &[u8] {
        self.buf.as_slice()
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> Result<(), DnsError> {
        if self.buf.len() + bytes.len() > MAX_MESSAGE_LEN {
            return Err(DnsError::resource("response exceeds 65535 bytes"));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    pub fn add_u16(&mut self, value: u16) -> Result<(), DnsError> {
        self.add_bytes(&value.to_be_bytes())
    }

    pub fn add_u32(&mut self, value: u32) -> Result<(), DnsError> {
        self.add_bytes(&value.to_be_bytes())
    }

    /// Append a name, replacing its longest already-written suffix with a
    /// compression pointer.
    pub fn add_name(&mut self, name: &[u8]) -> Result<(), DnsError> {
        let mut rest = name;
        while let Some(&len) = rest.first() {
            if len == 0 {
                break;
            }

            let cached = self
                .names
                .iter()
                .find(|cached| domain_equal(rest, &cached.name))
                .map(|cached| cached.pos);
            if let Some(pos) = cached {
                return self.add_u16(0xc000 | pos);
            }

            let suffix_len = domain_length(rest);
            if suffix_len <= MAX_CACHED_NAME
                && self.buf.len() < MAX_CACHED_OFFSET
                && self.names.len() < MAX_CACHED_NAMES
            {
                self.names.push(CachedName {
                    name: rest[..suffix_len].to_vec(),
                    pos: self.buf.len() as u16,
                });
            }

            let label = usize::from(len) + 1;
            let bytes = rest
                .get(..label)
                .ok_or_else(|| DnsError::protocol("truncated label"))?;
            self.add_bytes(bytes)?;
            rest = &rest[label..];
        }
        self.add_bytes(&[0])
    }

    /// Begin a record of class IN; the rdata follows via the `add_*` methods.
    pub fn start_record(&mut self, owner: &[u8], rtype: u16, ttl: u32) -> Result<(), DnsError> {
        self.add_name(owner)?;
        self.add_u16(rtype)?;
        self.add_u16(CLASS_IN)?;
        self.add_u32(ttl)?;
        self.add_bytes(&[0, 0])?;
        self.rdata = self.buf.len();
        Ok(())
    }

    /// Patch the rdata length of the open record and count it in `section`.
    pub fn finish_record(&mut self, section: Section) {
        let rdlen = (self.buf.len() - self.rdata) as u16;
        self.buf[self.rdata - 2..self.rdata].copy_from_slice(&rdlen.to_be_bytes());

        let at = section.count_offset();
        self.buf[at + 1] = self.buf[at + 1].wrapping_add(1);
        if self.buf[at + 1] == 0 {
            self.buf[at] = self.buf[at].wrapping_add(1);
        }
        self.rdata = 0;
    }

    pub fn set_authoritative(&mut self, authoritative: bool) {
        if authoritative {
            self.buf[2] |= FLAG_AA;
        } else {
            self.buf[2] &= !FLAG_AA;
        }
    }

    /// Mark the message as a response with `rcode`.
    ///
    /// Error codes drop everything after the question, or the question too
    /// if it cannot be located, and clear AA.
    pub fn set_rcode(&mut self, rcode: Rcode) {
        if self.buf.len() < HEADER_LEN {
            return;
        }
        if rcode.is_error() {
            self.buf[2] &= !FLAG_AA;
            self.truncate_to_question(false);
        }
        self.buf[2] |= FLAG_QR;
        self.buf[3] = rcode as u8;
    }

    /// Apply the transport's size limit. Oversized messages are cut back to
    /// the question with TC set, and never exceed `max_len`.
    pub fn finish(&mut self, max_len: usize) {
        if self.buf.len() > max_len && self.buf.len() >= HEADER_LEN {
            self.truncate_to_question(true);
            self.buf[2] |= FLAG_TC;
        }
        self.buf.truncate(max_len);
    }

    fn truncate_to_question(&mut self, any_qdcount: bool) {
        let mut pos = HEADER_LEN;
        let keep_question = (any_qdcount || self.buf[4..6] == [0, 1])
            && packet_skip_name(&mut pos, self.buf.as_slice()).is_ok()
            && self.buf.len() >= pos + 4;

        if keep_question {
            self.buf[6..HEADER_LEN].fill(0);
            self.buf.truncate(pos + 4);
        } else {
            self.buf[4..HEADER_LEN].fill(0);
            self.buf.truncate(HEADER_LEN);
        }

        let len = self.buf.len();
        self.names.retain(|cached| usize::from(cached.pos) < len);
        self.rdata = 0;
    }

    /// Bounds-checked read of the message built so far.
    pub fn copy(&self, pos: &mut usize, len: usize) -> Result<&[u8], DnsError> {
        packet_copy(pos, len, self.buf.as_slice())
    }

    pub fn get_name(&self, pos: &mut usize) -> Result<Vec<u8>, DnsError> {
        packet_get_name(pos, self.buf.as_slice())
    }

    pub fn skip_name(&self, pos: &mut usize) -> Result<(), DnsError> {
        packet_skip_name(pos, self.buf.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::domain_from_dot;
    use crate::dns::{rcode_of, TYPE_A, TYPE_NS};

    fn query(name: &str, qtype: u16) -> Vec<u8> {
        let mut packet = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        packet.extend_from_slice(&domain_from_dot(name.as_bytes()).unwrap());
        packet.extend_from_slice(&qtype.to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet
    }

    fn count(buf: &[u8], section: Section) -> u16 {
        let at = section.count_offset();
        u16::from_be_bytes([buf[at], buf[at + 1]])
    }

    #[test]
    fn test_parse_query_echoes_question() {
        let mut buf = query("WWW.Example.com", TYPE_A);
        buf.extend_from_slice(b"\x00\x00\x29\x10\x00"); // trailing junk
        let expected_len = buf.len() - 5;

        let mut response = Response::new(&mut buf);
        let question = match response.parse_query() {
            Query::Question(q) => q,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(question.name, domain_from_dot(b"WWW.Example.com").unwrap());
        assert_eq!(question.qtype, TYPE_A);
        assert_eq!(question.qclass, CLASS_IN);
        assert_eq!(response.len(), expected_len);
        assert_eq!(&buf[..4], &[0x12, 0x34, 0x01, 0x00]);
    }

    #[test]
    fn test_parse_query_ignores_responses_and_runts() {
        let mut buf = query("example.com", TYPE_A);
        buf[2] |= FLAG_QR;
        assert_eq!(Response::new(&mut buf).parse_query(), Query::Ignore);
        assert!(buf.is_empty());

        let mut buf = vec![0u8; 11];
        assert_eq!(Response::new(&mut buf).parse_query(), Query::Ignore);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_query_rejects_opcodes() {
        let mut buf = query("example.com", TYPE_A);
        buf[2] |= 0x28; // opcode 5 (UPDATE)
        let full = buf.len();
        assert_eq!(Response::new(&mut buf).parse_query(), Query::Rejected(Rcode::NotImp));
        assert_eq!(rcode_of(&buf), Some(Rcode::NotImp));
        assert_eq!(buf.len(), full);
        assert_ne!(buf[2] & FLAG_QR, 0);
    }

    #[test]
    fn test_parse_query_rejects_bad_questions() {
        let mut buf = query("example.com", TYPE_A);
        buf[5] = 2;
        assert_eq!(Response::new(&mut buf).parse_query(), Query::Rejected(Rcode::FormErr));
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[4..12], &[0; 8]);

        let mut buf = query("example.com", TYPE_A);
        buf.truncate(buf.len() - 1);
        assert_eq!(Response::new(&mut buf).parse_query(), Query::Rejected(Rcode::FormErr));
        assert_eq!(buf.len(), HEADER_LEN);
    }

    #[test]
    fn test_records_are_compressed_and_counted() {
        let mut buf = query("www.example.com", TYPE_A);
        let mut response = Response::new(&mut buf);
        assert!(matches!(response.parse_query(), Query::Question(_)));
        let question_end = response.len();

        let owner = domain_from_dot(b"www.example.com").unwrap();
        response.start_record(&owner, TYPE_A, 300).unwrap();
        response.add_bytes(&[192, 0, 2, 1]).unwrap();
        response.finish_record(Section::Answer);

        // Owner is a pointer to the question name at offset 12.
        assert_eq!(&buf[question_end..question_end + 2], &[0xc0, 12]);
        assert_eq!(count(&buf, Section::Answer), 1);
        assert_eq!(&buf[question_end + 10..question_end + 12], &[0, 4]);
    }

    #[test]
    fn test_suffix_compression() {
        let mut buf = query("www.example.com", TYPE_NS);
        let mut response = Response::new(&mut buf);
        assert!(matches!(response.parse_query(), Query::Question(_)));
        let start = response.len();

        response
            .add_name(&domain_from_dot(b"ns1.EXAMPLE.com").unwrap())
            .unwrap();
        // "ns1" then a pointer to "example.com" at 16.
        assert_eq!(&buf[start..], b"\x03ns1\xc0\x10");
    }

    #[test]
    fn test_count_carries_into_high_byte() {
        let mut buf = query("a", TYPE_A);
        let mut response = Response::new(&mut buf);
        assert!(matches!(response.parse_query(), Query::Question(_)));
        for _ in 0..256 {
            response.start_record(b"\x01a\x00", TYPE_A, 0).unwrap();
            response.finish_record(Section::Additional);
        }
        assert_eq!(count(&buf, Section::Additional), 256);
    }

    #[test]
    fn test_error_rcode_truncates_to_question() {
        let mut buf = query("example.com", TYPE_A);
        let question_len = buf.len();
        let mut response = Response::new(&mut buf);
        assert!(matches!(response.parse_query(), Query::Question(_)));
        response.set_authoritative(true);
        response.start_record(b"\x07example\x03com\x00", TYPE_A, 1).unwrap();
        response.add_bytes(&[1, 2, 3, 4]).unwrap();
        response.finish_record(Section::Answer);

        response.set_rcode(Rcode::ServFail);
        assert_eq!(buf.len(), question_len);
        assert_eq!(buf[2] & FLAG_AA, 0);
        assert_ne!(buf[2] & FLAG_QR, 0);
        assert_eq!(rcode_of(&buf), Some(Rcode::ServFail));
        assert_eq!(count(&buf, Section::Answer), 0);
    }

    #[test]
    fn test_nxdomain_keeps_records() {
        let mut buf = query("example.com", TYPE_A);
        let mut response = Response::new(&mut buf);
        assert!(matches!(response.parse_query(), Query::Question(_)));
        response.set_authoritative(true);
        response.start_record(b"\x07example\x03com\x00", TYPE_A, 1).unwrap();
        response.finish_record(Section::Authority);
        let len = response.len();
        response.set_rcode(Rcode::NxDomain);
        assert_eq!(buf.len(), len);
        assert_ne!(buf[2] & FLAG_AA, 0);
        assert_eq!(rcode_of(&buf), Some(Rcode::NxDomain));
    }

    #[test]
    fn test_finish_truncates_and_sets_tc() {
        let mut buf = query("example.com", TYPE_A);
        let question_len = buf.len();
        let mut response = Response::new(&mut buf);
        assert!(matches!(response.parse_query(), Query::Question(_)));
        for i in 0..40u8 {
            response.start_record(b"\x07example\x03com\x00", TYPE_A, 1).unwrap();
            response.add_bytes(&[10, 0, 0, i]).unwrap();
            response.finish_record(Section::Answer);
        }
        assert!(response.len() > 512);
        response.set_rcode(Rcode::NoError);
        response.finish(512);

        assert_eq!(buf.len(), question_len);
        assert_ne!(buf[2] & FLAG_TC, 0);
        assert_eq!(count(&buf, Section::Answer), 0);
        assert_eq!(u16::from_be_bytes([buf[4], buf[5]]), 1);
    }

    #[test]
    fn test_finish_never_exceeds_max() {
        let mut buf = query("example.com", TYPE_A);
        let mut response = Response::new(&mut buf);
        assert!(matches!(response.parse_query(), Query::Question(_)));
        response.finish(14);
        assert_eq!(buf.len(), 14);
        assert_ne!(buf[2] & FLAG_TC, 0);
    }

    #[test]
    fn test_message_size_cap() {
        let mut buf = query("example.com", TYPE_A);
        let mut response = Response::new(&mut buf);
        assert!(matches!(response.parse_query(), Query::Question(_)));
        let filler = vec![0u8; MAX_MESSAGE_LEN - response.len()];
        response.add_bytes(&filler).unwrap();
        let err = response.add_bytes(&[0]).unwrap_err();
        assert!(matches!(err, DnsError::Resource(_)));
    }
}
