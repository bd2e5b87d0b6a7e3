//! Domain-name and packet primitives.
//!
//! Domain names are kept in wire form throughout: length-prefixed labels
//! ending with the zero-length root label, at most 255 bytes in total.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::errors::DnsError;

/// Longest encoded domain name, including the root label.
pub const MAX_NAME_LEN: usize = 255;

/// Longest single label.
pub const MAX_LABEL_LEN: usize = 63;

/// Upper bound on label and pointer steps while decoding one name.
const MAX_NAME_STEPS: usize = 1000;

/// Length of a wire-form name including the terminating zero label.
///
/// An unterminated name is measured up to the end of the slice.
pub fn domain_length(name: &[u8]) -> usize {
    let mut len = 0;
    while let Some(&byte) = name.get(len) {
        if byte == 0 {
            return len + 1;
        }
        len += usize::from(byte) + 1;
    }
    name.len()
}

/// Case-insensitive (ASCII) comparison of two wire-form names.
pub fn domain_equal(a: &[u8], b: &[u8]) -> bool {
    let len = domain_length(a);
    // Label lengths never exceed 63, below 'A', so folding them is harmless.
    len == domain_length(b) && a[..len].eq_ignore_ascii_case(&b[..len])
}

/// Parse a dotted presentation name such as `www.example.com`.
///
/// `\DDD` (octal) and `\X` escapes produce literal bytes, so `\046` puts a
/// dot inside a label. Empty labels are skipped.
pub fn domain_from_dot(text: &[u8]) -> Result<Vec<u8>, DnsError> {
    let mut name = Vec::with_capacity(MAX_NAME_LEN);
    let mut label: Vec<u8> = Vec::with_capacity(MAX_LABEL_LEN);
    let mut bytes = text.iter().copied().peekable();

    while let Some(mut byte) = bytes.next() {
        if byte == b'.' {
            push_label(&mut name, &mut label)?;
            continue;
        }

        if byte == b'\\' {
            let Some(escaped) = bytes.next() else {
                break;
            };
            byte = escaped;
            if (b'0'..=b'7').contains(&byte) {
                byte -= b'0';
                for _ in 0..2 {
                    match bytes.peek() {
                        Some(&digit @ b'0'..=b'7') => {
                            byte = (byte << 3).wrapping_add(digit - b'0');
                            bytes.next();
                        }
                        _ => break,
                    }
                }
            }
        }

        if label.len() >= MAX_LABEL_LEN {
            return Err(DnsError::protocol("label longer than 63 bytes"));
        }
        label.push(byte);
    }

    push_label(&mut name, &mut label)?;
    if name.len() + 1 > MAX_NAME_LEN {
        return Err(DnsError::protocol("name longer than 255 bytes"));
    }
    name.push(0);
    Ok(name)
}

fn push_label(name: &mut Vec<u8>, label: &mut Vec<u8>) -> Result<(), DnsError> {
    if label.is_empty() {
        return Ok(());
    }
    if name.len() + label.len() + 1 > MAX_NAME_LEN {
        return Err(DnsError::protocol("name longer than 255 bytes"));
    }
    name.push(label.len() as u8);
    name.extend_from_slice(label);
    label.clear();
    Ok(())
}

/// Render a wire-form name as dotted text, escaping `.`, `\` and any
/// non-printable byte as `\DDD`. The root renders as `.`.
pub fn domain_to_dot(name: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0;

    while let Some(&len) = name.get(pos) {
        if len == 0 {
            break;
        }
        if !out.is_empty() {
            out.push('.');
        }
        let end = (pos + 1 + usize::from(len)).min(name.len());
        for &byte in &name[pos + 1..end] {
            match byte {
                b'.' | b'\\' => out.push_str(&format!("\\{:03o}", byte)),
                0x21..=0x7e => out.push(byte as char),
                _ => out.push_str(&format!("\\{:03o}", byte)),
            }
        }
        pos = end;
    }

    if out.is_empty() {
        out.push('.');
    }
    out
}

/// `d.c.b.a.in-addr.arpa` for the address `a.b.c.d`.
pub fn reverse_domain_v4(ip: Ipv4Addr) -> Vec<u8> {
    let mut name = Vec::with_capacity(30);
    for octet in ip.octets().iter().rev() {
        let digits = octet.to_string();
        name.push(digits.len() as u8);
        name.extend_from_slice(digits.as_bytes());
    }
    name.extend_from_slice(b"\x07in-addr\x04arpa\x00");
    name
}

/// The nibble-reversed `ip6.arpa` name for an IPv6 address.
pub fn reverse_domain_v6(ip: Ipv6Addr) -> Vec<u8> {
    const XDIGIT: &[u8; 16] = b"0123456789abcdef";

    let mut name = Vec::with_capacity(74);
    for octet in ip.octets().iter().rev() {
        name.extend_from_slice(&[1, XDIGIT[usize::from(octet & 15)]]);
        name.extend_from_slice(&[1, XDIGIT[usize::from(octet >> 4)]]);
    }
    name.extend_from_slice(b"\x03ip6\x04arpa\x00");
    name
}

/// Bounds-checked slice of `len` bytes at `*pos`; advances `*pos`.
pub fn packet_copy<'a>(pos: &mut usize, len: usize, packet: &'a [u8]) -> Result<&'a [u8], DnsError> {
    let end = pos
        .checked_add(len)
        .filter(|&end| end <= packet.len())
        .ok_or_else(|| DnsError::protocol("field extends past end of packet"))?;
    let out = &packet[*pos..end];
    *pos = end;
    Ok(out)
}

/// Read a big-endian `u16` at `*pos`; advances `*pos`.
pub fn packet_u16(pos: &mut usize, packet: &[u8]) -> Result<u16, DnsError> {
    let bytes = packet_copy(pos, 2, packet)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Decode a possibly compressed name at `*pos`.
///
/// `*pos` ends up just past the name as it appears at `*pos`: past the
/// terminating label, or past the first compression pointer.
pub fn packet_get_name(pos: &mut usize, packet: &[u8]) -> Result<Vec<u8>, DnsError> {
    let malformed = || DnsError::protocol("malformed domain name");

    let mut cursor = *pos;
    let mut first_jump = None;
    let mut steps = 0;
    let mut pending = 0u8;
    let mut name = Vec::with_capacity(MAX_NAME_LEN);

    loop {
        steps += 1;
        if cursor >= packet.len() || steps >= MAX_NAME_STEPS {
            return Err(malformed());
        }
        let mut byte = packet[cursor];
        cursor += 1;

        if pending > 0 {
            if name.len() >= MAX_NAME_LEN {
                return Err(malformed());
            }
            name.push(byte);
            pending -= 1;
            continue;
        }

        while byte >= 192 {
            let high = usize::from(byte - 192) << 8;
            steps += 1;
            if cursor >= packet.len() || steps >= MAX_NAME_STEPS {
                return Err(malformed());
            }
            let low = usize::from(packet[cursor]);
            cursor += 1;
            first_jump.get_or_insert(cursor);

            cursor = high + low;
            if cursor >= packet.len() {
                return Err(malformed());
            }
            byte = packet[cursor];
            cursor += 1;
        }

        if byte >= 64 || name.len() >= MAX_NAME_LEN {
            return Err(malformed());
        }
        name.push(byte);
        pending = byte;
        if byte == 0 {
            break;
        }
    }

    *pos = first_jump.unwrap_or(cursor);
    Ok(name)
}

/// Advance `*pos` past a name without decoding it.
pub fn packet_skip_name(pos: &mut usize, packet: &[u8]) -> Result<(), DnsError> {
    let mut cursor = *pos;
    while let Some(&byte) = packet.get(cursor) {
        cursor += 1;
        if byte >= 192 {
            *pos = cursor + 1;
            return Ok(());
        }
        if byte >= 64 {
            break;
        }
        if byte == 0 {
            *pos = cursor;
            return Ok(());
        }
        cursor += usize::from(byte);
    }
    Err(DnsError::protocol("malformed domain name"))
}
