//! Zone-data compiler.
//!
//! Turns delimited text lines into database records. The first byte of a
//! line selects what it describes; the rest is split into fields on a
//! separator (`:` by default):
//!
//! ```text
//! .example.com:ns1.example.com:259200        SOA + NS
//! =www.example.com:192.0.2.10                A + PTR
//! @example.com:mail.example.com:10           MX
//! 'example.com:v=spf1 -all                   TXT
//! %in:4:10                                   location "in" for 10.0.0.0/8
//! ```
//!
//! A bad line is reported and skipped; it never aborts the run.

use std::io::BufRead;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use log::error;

use crate::cdb::CdbSink;
use crate::codec::{domain_from_dot, reverse_domain_v4, reverse_domain_v6, MAX_LABEL_LEN};
use crate::dns::{
    TYPE_A, TYPE_AAAA, TYPE_ANY, TYPE_AXFR, TYPE_CNAME, TYPE_DNAME, TYPE_IXFR, TYPE_MX, TYPE_NS,
    TYPE_PTR, TYPE_SOA, TYPE_SRV, TYPE_TXT,
};
use crate::errors::DnsError;
use crate::record::{self, Location, NO_LOCATION};

pub const DEFAULT_SEPARATOR: u8 = b':';

/// Fields after the leading byte; any beyond are ignored.
const MAX_FIELDS: usize = 15;

pub const DEFAULT_TTL_NAMESERVER: u32 = 259200;
pub const DEFAULT_TTL_POSITIVE: u32 = 86400;
pub const DEFAULT_TTL_NEGATIVE: u32 = 2560;

const SOA_REFRESH: u32 = 16384;
const SOA_RETRY: u32 = 2048;
const SOA_EXPIRE: u32 = 1048576;

/// Record types that have their own line kinds or are never served.
const PROHIBITED_GENERIC: [(u16, &str); 9] = [
    (0, "0"),
    (TYPE_NS, "NS"),
    (TYPE_CNAME, "CNAME"),
    (TYPE_SOA, "SOA"),
    (TYPE_PTR, "PTR"),
    (TYPE_MX, "MX"),
    (TYPE_DNAME, "DNAME"),
    (TYPE_IXFR, "IXFR"),
    (TYPE_AXFR, "AXFR"),
];

fn invalid(msg: String) -> DnsError {
    DnsError::Config(msg)
}

fn show(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Compiles zone-data lines into any [`CdbSink`].
#[derive(Debug)]
pub struct ZoneCompiler<S: CdbSink> {
    sink: S,
    separator: u8,
    rname: Option<Vec<u8>>,
    serial: u32,
    ttl_nameserver: u32,
    ttl_positive: u32,
    ttl_negative: u32,
    lines: usize,
    failures: usize,
}

impl<S: CdbSink> ZoneCompiler<S> {
    /// # Arguments
    /// * `sink` - Where the records go.
    /// * `serial` - Default SOA serial, usually the input's modification time.
    pub fn new(sink: S, serial: u32) -> Self {
        Self {
            sink,
            separator: DEFAULT_SEPARATOR,
            rname: None,
            serial,
            ttl_nameserver: DEFAULT_TTL_NAMESERVER,
            ttl_positive: DEFAULT_TTL_POSITIVE,
            ttl_negative: DEFAULT_TTL_NEGATIVE,
            lines: 0,
            failures: 0,
        }
    }

    /// Use `separator` between fields. Newline and backslash are refused.
    pub fn with_separator(mut self, separator: u8) -> Result<Self, DnsError> {
        if separator == b'\n' || separator == b'\\' {
            return Err(invalid("Invalid field separator".to_string()));
        }
        self.separator = separator;
        Ok(self)
    }

    /// Lines read so far.
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Lines rejected so far.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Compile every line of `input`.
    ///
    /// Rejected lines are logged as `<line>: <reason>` and counted. Only
    /// read errors and database write errors end the run early.
    pub fn compile<R: BufRead>(&mut self, mut input: R) -> Result<(), DnsError> {
        let mut line = Vec::new();
        loop {
            line.clear();
            if input.read_until(b'\n', &mut line)? == 0 {
                return Ok(());
            }
            self.lines += 1;
            match self.compile_line(&line) {
                Ok(()) => {}
                Err(DnsError::Config(msg)) => {
                    error!("{}: {}", self.lines, msg);
                    self.failures += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Compile a single line. Comments and blank lines are accepted silently.
    pub fn compile_line(&mut self, line: &[u8]) -> Result<(), DnsError> {
        let end = line
            .iter()
            .rposition(|&b| !matches!(b, b' ' | b'\t' | b'\n'))
            .map_or(0, |i| i + 1);
        let line = &line[..end];

        let Some((&kind, rest)) = line.split_first() else {
            return Ok(());
        };
        if kind == b'#' {
            return Ok(());
        }
        let f = split_fields(rest, self.separator);

        match kind {
            b'%' => self.location_prefix(&f),
            b'!' => self.set_defaults(&f),
            b'Z' => self.soa(&f),
            b'.' | b'&' => self.nameserver(&f, kind == b'.'),
            b'+' | b'=' => self.address(&f, kind == b'='),
            b'@' => self.mail_exchanger(&f),
            b'S' => self.service(&f),
            b'C' => self.alias(&f, TYPE_CNAME),
            b'^' => self.alias(&f, TYPE_PTR),
            b'\'' => self.text(&f),
            b':' => self.generic(&f),
            b'-' => self.placeholder(&f),
            other => Err(invalid(format!(
                "Unrecognized leading character: {}",
                other as char
            ))),
        }
    }

    fn emit(&mut self, owner: &[u8], rtype: u16, ttl: u32, ttd: u64, location: Location, rdata: &[u8]) -> Result<(), DnsError> {
        let (owner, wildcard) = match owner {
            [1, b'*', parent @ ..] => (parent, true),
            _ => (owner, false),
        };
        let blob = record::encode(rtype, wildcard, location, ttl, ttd, rdata);
        self.sink.add(&owner.to_ascii_lowercase(), &blob)
    }

    fn location_prefix(&mut self, f: &[Vec<u8>]) -> Result<(), DnsError> {
        let location = parse_location(&f[0])?;
        let prefix = match f[1].as_slice() {
            b"4" => parse_prefix_v4(&f[2]),
            b"6" => parse_prefix_v6(&f[2]),
            _ => None,
        };
        let Some(prefix) = prefix else {
            return Err(invalid(format!(
                "Invalid address prefix: {}:{}",
                show(&f[1]),
                show(&f[2])
            )));
        };

        let mut key = vec![0, b'%', f[1][0]];
        key.extend_from_slice(&prefix);
        self.sink.add(&key, &location)
    }

    fn set_defaults(&mut self, f: &[Vec<u8>]) -> Result<(), DnsError> {
        let rname = if f[0].is_empty() {
            None
        } else {
            Some(parse_mail(&f[0])?)
        };
        let ttl_nameserver = parse_u32(&f[1], self.ttl_nameserver)?;
        let ttl_positive = parse_u32(&f[2], self.ttl_positive)?;
        let ttl_negative = parse_u32(&f[3], self.ttl_negative)?;
        let serial = parse_u32(&f[4], self.serial)?;

        self.rname = rname;
        self.ttl_nameserver = ttl_nameserver;
        self.ttl_positive = ttl_positive;
        self.ttl_negative = ttl_negative;
        self.serial = serial;
        Ok(())
    }

    fn soa(&mut self, f: &[Vec<u8>]) -> Result<(), DnsError> {
        let zone = parse_name(&f[0])?;
        let mname = parse_name(&f[1])?;
        let rname = parse_mail(&f[2])?;
        let ttl = parse_ttl(&f[8], self.ttl_negative)?;
        let ttd = parse_ttd(&f[9])?;
        let location = parse_location(&f[10])?;

        let mut rdata = mname;
        rdata.extend_from_slice(&rname);
        for (field, default) in [
            (&f[3], self.serial),
            (&f[4], SOA_REFRESH),
            (&f[5], SOA_RETRY),
            (&f[6], SOA_EXPIRE),
            (&f[7], ttl),
        ] {
            rdata.extend_from_slice(&parse_u32(field, default)?.to_be_bytes());
        }
        self.emit(&zone, TYPE_SOA, ttl, ttd, location, &rdata)
    }

    fn nameserver(&mut self, f: &[Vec<u8>], with_soa: bool) -> Result<(), DnsError> {
        let zone = parse_name(&f[0])?;
        let ns = parse_name(&f[1])?;
        let ttl = parse_ttl(&f[2], self.ttl_nameserver)?;
        let ttd = parse_ttd(&f[3])?;
        let location = parse_location(&f[4])?;

        if with_soa {
            let mut rdata = ns.clone();
            match &self.rname {
                Some(rname) => rdata.extend_from_slice(rname),
                None => {
                    rdata.extend_from_slice(b"\x0ahostmaster");
                    rdata.extend_from_slice(&zone);
                }
            }
            for value in [self.serial, SOA_REFRESH, SOA_RETRY, SOA_EXPIRE, self.ttl_negative] {
                rdata.extend_from_slice(&value.to_be_bytes());
            }
            let soa_ttl = if ttl == 0 { 0 } else { self.ttl_negative };
            self.emit(&zone, TYPE_SOA, soa_ttl, ttd, location, &rdata)?;
        }

        self.emit(&zone, TYPE_NS, ttl, ttd, location, &ns)
    }

    fn address(&mut self, f: &[Vec<u8>], with_ptr: bool) -> Result<(), DnsError> {
        let name = parse_name(&f[0])?;
        let ttl = parse_ttl(&f[2], self.ttl_positive)?;
        let ttd = parse_ttd(&f[3])?;
        let location = parse_location(&f[4])?;

        let text = String::from_utf8_lossy(&f[1]);
        let (rtype, rdata, reverse) = if let Some(v4) = parse_ipv4(&f[1]) {
            (TYPE_A, v4.octets().to_vec(), reverse_domain_v4(v4))
        } else if let Some(v6) = parse_ipv6(&text) {
            (TYPE_AAAA, v6.octets().to_vec(), reverse_domain_v6(v6))
        } else if f[1].is_empty() {
            return Err(invalid("Missing IP address".to_string()));
        } else {
            return Err(invalid(format!("Invalid IP address: {}", show(&f[1]))));
        };

        self.emit(&name, rtype, ttl, ttd, location, &rdata)?;
        if with_ptr {
            self.emit(&reverse, TYPE_PTR, ttl, ttd, location, &name)?;
        }
        Ok(())
    }

    fn mail_exchanger(&mut self, f: &[Vec<u8>]) -> Result<(), DnsError> {
        let name = parse_name(&f[0])?;
        let exchanger = parse_name(&f[1])?;
        let preference = parse_u16(&f[2], 0)?;
        let ttl = parse_ttl(&f[3], self.ttl_positive)?;
        let ttd = parse_ttd(&f[4])?;
        let location = parse_location(&f[5])?;

        let mut rdata = preference.to_be_bytes().to_vec();
        rdata.extend_from_slice(&exchanger);
        self.emit(&name, TYPE_MX, ttl, ttd, location, &rdata)
    }

    fn service(&mut self, f: &[Vec<u8>]) -> Result<(), DnsError> {
        let name = parse_name(&f[0])?;
        let target = parse_name(&f[1])?;
        let priority = parse_u16(&f[3], 0)?;
        let weight = parse_u16(&f[4], 0)?;
        let port = parse_u16(&f[2], 0)?;
        let ttl = parse_ttl(&f[5], self.ttl_positive)?;
        let ttd = parse_ttd(&f[6])?;
        let location = parse_location(&f[7])?;

        let mut rdata = Vec::with_capacity(6 + target.len());
        rdata.extend_from_slice(&priority.to_be_bytes());
        rdata.extend_from_slice(&weight.to_be_bytes());
        rdata.extend_from_slice(&port.to_be_bytes());
        rdata.extend_from_slice(&target);
        self.emit(&name, TYPE_SRV, ttl, ttd, location, &rdata)
    }

    fn alias(&mut self, f: &[Vec<u8>], rtype: u16) -> Result<(), DnsError> {
        let name = parse_name(&f[0])?;
        let target = parse_name(&f[1])?;
        let ttl = parse_ttl(&f[2], self.ttl_positive)?;
        let ttd = parse_ttd(&f[3])?;
        let location = parse_location(&f[4])?;
        self.emit(&name, rtype, ttl, ttd, location, &target)
    }

    fn text(&mut self, f: &[Vec<u8>]) -> Result<(), DnsError> {
        let name = parse_name(&f[0])?;
        let ttl = parse_ttl(&f[2], self.ttl_positive)?;
        let ttd = parse_ttd(&f[3])?;
        let location = parse_location(&f[4])?;

        let text = parse_text(&f[1]);
        let mut rdata = Vec::with_capacity(text.len() + text.len() / 255 + 1);
        for chunk in text.chunks(255) {
            rdata.push(chunk.len() as u8);
            rdata.extend_from_slice(chunk);
        }
        self.emit(&name, TYPE_TXT, ttl, ttd, location, &rdata)
    }

    fn generic(&mut self, f: &[Vec<u8>]) -> Result<(), DnsError> {
        let name = parse_name(&f[0])?;
        let rtype = parse_u16(&f[1], 0)?;
        let ttl = parse_ttl(&f[3], self.ttl_positive)?;
        let ttd = parse_ttd(&f[4])?;
        let location = parse_location(&f[5])?;

        if let Some((_, label)) = PROHIBITED_GENERIC.iter().find(|(t, _)| *t == rtype) {
            return Err(invalid(format!("Type {} is prohibited", label)));
        }
        self.emit(&name, rtype, ttl, ttd, location, &parse_text(&f[2]))
    }

    fn placeholder(&mut self, f: &[Vec<u8>]) -> Result<(), DnsError> {
        let name = parse_name(&f[0])?;
        let ttd = parse_ttd(&f[1])?;
        let location = parse_location(&f[2])?;
        self.emit(&name, TYPE_ANY, 0, ttd, location, &[])
    }
}

/// Split on `separator`. `\<separator>` is a literal separator; any other
/// backslash pair is kept for the field parsers.
fn split_fields(rest: &[u8], separator: u8) -> Vec<Vec<u8>> {
    let mut fields = vec![Vec::new(); MAX_FIELDS];
    let mut j = 0;
    let mut i = 0;
    while i < rest.len() && j < MAX_FIELDS {
        let byte = rest[i];
        match rest.get(i + 1) {
            Some(&next) if byte == b'\\' && next != b'\n' => {
                if next == separator {
                    fields[j].push(separator);
                } else {
                    fields[j].extend_from_slice(&[byte, next]);
                }
                i += 2;
            }
            _ => {
                if byte == separator {
                    j += 1;
                } else {
                    fields[j].push(byte);
                }
                i += 1;
            }
        }
    }
    fields
}

/// Four decimal octets; leading zeros are allowed (`192.000.2.1`).
fn parse_ipv4(text: &[u8]) -> Option<Ipv4Addr> {
    match parse_prefix_v4(text)?[..] {
        [a, b, c, d] => Some(Ipv4Addr::new(a, b, c, d)),
        _ => None,
    }
}

/// Colons clash with the default separator, so dots may stand in for them.
fn parse_ipv6(text: &str) -> Option<Ipv6Addr> {
    text.parse()
        .ok()
        .or_else(|| text.replace('.', ":").parse().ok())
}

fn parse_location(field: &[u8]) -> Result<Location, DnsError> {
    match *field {
        [] => Ok(NO_LOCATION),
        [a] => Ok([a, 0]),
        [a, b] => Ok([a, b]),
        _ => Err(invalid(format!("Invalid location code: {}", show(field)))),
    }
}

fn parse_name(field: &[u8]) -> Result<Vec<u8>, DnsError> {
    domain_from_dot(field).map_err(|_| invalid(format!("Invalid domain name: {}", show(field))))
}

/// `local@domain` becomes a name whose first label is `local`, dots and all.
fn parse_mail(field: &[u8]) -> Result<Vec<u8>, DnsError> {
    let Some(at) = field.iter().position(|&b| b == b'@') else {
        return parse_name(field);
    };
    if at > MAX_LABEL_LEN {
        return Err(invalid(format!("Email local part is too long: {}", show(field))));
    }
    let domain = domain_from_dot(&field[at + 1..])
        .map_err(|_| invalid(format!("Invalid email domain: {}", show(field))))?;

    let mut name = Vec::with_capacity(1 + at + domain.len());
    name.push(at as u8);
    name.extend_from_slice(&field[..at]);
    name.extend_from_slice(&domain);
    Ok(name)
}

/// Decode `\DDD` octal and `\X` escapes.
///
/// A third octal digit is only taken while the value is below 32, so the
/// result always fits a byte.
fn parse_text(field: &[u8]) -> Vec<u8> {
    let is_octal = |b: Option<&u8>| matches!(b, Some(b'0'..=b'7'));

    let mut out = Vec::with_capacity(field.len());
    let mut bytes = field.iter().peekable();
    while let Some(&b) = bytes.next() {
        let mut byte = b;
        if byte == b'\\' {
            let Some(&escaped) = bytes.next() else {
                break;
            };
            byte = escaped;
            if (b'0'..=b'7').contains(&byte) {
                byte -= b'0';
                if is_octal(bytes.peek().copied()) {
                    byte = (byte << 3) + (bytes.next().copied().unwrap_or(b'0') - b'0');
                    if byte < 32 && is_octal(bytes.peek().copied()) {
                        byte = (byte << 3) + (bytes.next().copied().unwrap_or(b'0') - b'0');
                    }
                }
            }
        }
        out.push(byte);
    }
    out
}

fn digits<T: FromStr>(field: &[u8]) -> Option<T> {
    if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(field).ok()?.parse().ok()
}

fn parse_ttl(field: &[u8], default: u32) -> Result<u32, DnsError> {
    if field.is_empty() {
        return Ok(default);
    }
    digits(field).ok_or_else(|| invalid(format!("Invalid TTL: {}", show(field))))
}

/// Empty or plain digits: active from that instant (0 means always).
/// `+N` is the same; `-N` expires at N.
fn parse_ttd(field: &[u8]) -> Result<u64, DnsError> {
    if field.is_empty() {
        return Ok(0);
    }
    let parsed = match field.split_first() {
        Some((b'+', rest)) => digits(rest),
        Some((b'-', rest)) => digits(rest).map(record::expiring_at),
        _ => digits(field),
    };
    parsed.ok_or_else(|| invalid(format!("Invalid TTD: {}", show(field))))
}

fn parse_u16(field: &[u8], default: u16) -> Result<u16, DnsError> {
    if field.is_empty() {
        return Ok(default);
    }
    digits(field).ok_or_else(|| invalid(format!("Invalid 16-bit value: {}", show(field))))
}

fn parse_u32(field: &[u8], default: u32) -> Result<u32, DnsError> {
    if field.is_empty() {
        return Ok(default);
    }
    digits(field).ok_or_else(|| invalid(format!("Invalid 32-bit value: {}", show(field))))
}

/// `a[.b[.c[.d]]]` as up to four bytes; empty means the zero-length prefix.
fn parse_prefix_v4(text: &[u8]) -> Option<Vec<u8>> {
    if text.is_empty() {
        return Some(Vec::new());
    }
    let parts: Vec<&[u8]> = text.split(|&b| b == b'.').collect();
    if parts.len() > 4 {
        return None;
    }
    parts.into_iter().map(digits::<u8>).collect()
}

/// Colon- or dot-separated groups of up to four hex digits, two bytes each.
fn parse_prefix_v6(text: &[u8]) -> Option<Vec<u8>> {
    if text.is_empty() {
        return Some(Vec::new());
    }
    let groups: Vec<&[u8]> = text.split(|&b| b == b':' || b == b'.').collect();
    if groups.len() > 8 {
        return None;
    }
    let mut bytes = Vec::with_capacity(groups.len() * 2);
    for group in groups {
        if group.is_empty() || group.len() > 4 || !group.iter().all(u8::is_ascii_hexdigit) {
            return None;
        }
        let value = u16::from_str_radix(std::str::from_utf8(group).ok()?, 16).ok()?;
        bytes.extend_from_slice(&value.to_be_bytes());
    }
    Some(bytes)
}
