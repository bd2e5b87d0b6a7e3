//! Query resolution against a zone database.
//!
//! A query is answered in phases: find the delegation point for the name
//! ("bailiwick"), answer from exact or wildcard records when this server is
//! authoritative (following CNAMEs by restarting), add the zone SOA or the
//! delegation NS set to the authority section, then attach A/AAAA glue for
//! NS, MX and SRV targets.

use std::net::IpAddr;

use chrono::Utc;
use log::{debug, warn};

use crate::cdb::{Cdb, Find};
use crate::codec::{domain_equal, domain_to_dot, packet_copy, packet_get_name};
use crate::dns::{
    type_name, Rcode, Section, ANY_HINFO_RDATA, ANY_HINFO_TTL, CLASS_ANY, CLASS_IN, HEADER_LEN, TYPE_A,
    TYPE_AAAA, TYPE_ANY, TYPE_AXFR, TYPE_CNAME, TYPE_HINFO, TYPE_IXFR, TYPE_MX, TYPE_NS, TYPE_PTR,
    TYPE_SOA, TYPE_SRV,
};
use crate::errors::DnsError;
use crate::record::{Location, Record, NO_LOCATION};
use crate::response::{Query, Response};

/// CNAMEs followed before the partial answer is returned as is.
pub const MAX_CNAME_HOPS: u32 = 16;

/// Answer the query in `buf` in place, using the current time.
///
/// # Arguments
/// * `cdb` - The zone database.
/// * `buf` - The raw query; replaced by the response.
/// * `max_len` - Largest response the transport can carry.
/// * `client` - Address of the client, for location-based answers.
///
/// # Returns
/// The response length. Zero means nothing should be sent.
pub fn lookup(cdb: &Cdb, buf: &mut Vec<u8>, max_len: usize, client: IpAddr) -> usize {
    let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
    lookup_at(cdb, buf, max_len, client, now)
}

/// Same as [`lookup`] with an explicit clock, in seconds since the epoch.
pub fn lookup_at(cdb: &Cdb, buf: &mut Vec<u8>, max_len: usize, client: IpAddr, now: u64) -> usize {
    let mut response = Response::new(buf);

    let question = match response.parse_query() {
        Query::Ignore => return 0,
        Query::Rejected(rcode) => {
            debug!("Rejected query from {}: {}", client, rcode);
            response.finish(max_len);
            return response.len();
        }
        Query::Question(question) => question,
    };

    match question.qclass {
        CLASS_IN => response.set_authoritative(true),
        CLASS_ANY => response.set_authoritative(false),
        other => {
            debug!("Unsupported class {} from {}", other, client);
            response.set_rcode(Rcode::FormErr);
            response.finish(max_len);
            return response.len();
        }
    }

    let mut qname = question.name;
    qname.make_ascii_lowercase();
    debug!(
        "Query from {}: {} {}",
        client,
        domain_to_dot(&qname),
        type_name(question.qtype)
    );

    let mut resolver = Resolver {
        cdb,
        now,
        location: NO_LOCATION,
        response,
    };
    let result = resolver
        .locate(client)
        .and_then(|_| resolver.respond(qname, question.qtype));
    if let Err(e) = result {
        warn!("SERVFAIL for query from {}: {}", client, e);
        resolver.response.set_rcode(Rcode::ServFail);
    }

    resolver.response.finish(max_len);
    resolver.response.len()
}

/// A record that is in effect, with the TTL to serve.
struct Live<'c> {
    record: Record<'c>,
    ttl: u32,
}

/// Records under one name that the client may see right now.
struct Records<'c, 'k> {
    find: Find<'c, 'k>,
    location: Location,
    now: u64,
    wildcard: bool,
}

impl<'c, 'k> Iterator for Records<'c, 'k> {
    type Item = Result<Live<'c>, DnsError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let data = match self.find.next()? {
                Ok(data) => data,
                Err(e) => return Some(Err(e)),
            };
            let record = match Record::parse(data) {
                Ok(record) => record,
                Err(e) => return Some(Err(e)),
            };
            if !record.visible_from(self.location) || record.wildcard != self.wildcard {
                continue;
            }
            if let Some(ttl) = record.live_ttl(self.now) {
                return Some(Ok(Live { record, ttl }));
            }
        }
    }
}

/// Delegation point of a query name.
struct Zone {
    /// Offset of the zone apex within the query name.
    control: usize,
    /// Whether the apex carries an SOA visible to this client.
    authoritative: bool,
}

enum Answer {
    Done { found: bool },
    Restart(Vec<u8>),
}

struct Resolver<'c, 'b> {
    cdb: &'c Cdb,
    now: u64,
    location: Location,
    response: Response<'b>,
}

fn suffix(name: &[u8], offset: usize) -> &[u8] {
    name.get(offset..).unwrap_or_default()
}

impl<'c, 'b> Resolver<'c, 'b> {
    fn records<'k>(&self, name: &'k [u8], wildcard: bool) -> Records<'c, 'k> {
        Records {
            find: self.cdb.find(name),
            location: self.location,
            now: self.now,
            wildcard,
        }
    }

    /// Pick the client's location from the longest matching address prefix.
    fn locate(&mut self, client: IpAddr) -> Result<(), DnsError> {
        self.location = NO_LOCATION;

        let client = match client {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(client, IpAddr::V4),
            v4 => v4,
        };
        let (key, step) = match client {
            IpAddr::V4(v4) => ([&b"\0%4"[..], &v4.octets()[..]].concat(), 1),
            IpAddr::V6(v6) => ([&b"\0%6"[..], &v6.octets()[..]].concat(), 2),
        };

        for len in (3..=key.len()).rev().step_by(step) {
            if let Some(data) = self.cdb.get(&key[..len])? {
                if let [a, b] = *data {
                    self.location = [a, b];
                }
                break;
            }
        }
        Ok(())
    }

    fn respond(&mut self, mut qname: Vec<u8>, qtype: u16) -> Result<(), DnsError> {
        if qtype == TYPE_AXFR || qtype == TYPE_IXFR {
            self.response.set_rcode(Rcode::NotImp);
            return Ok(());
        }

        let mut restarts = 0;
        loop {
            let answer_start = self.response.len();

            let zone = match self.bailiwick(&qname)? {
                Some(zone) => zone,
                None if restarts == 0 => {
                    self.response.set_rcode(Rcode::Refused);
                    return Ok(());
                }
                None => {
                    // A CNAME led out of our zones; keep the chain so far.
                    self.response.set_rcode(Rcode::NoError);
                    return Ok(());
                }
            };
            let apex = suffix(&qname, zone.control).to_vec();

            if !zone.authoritative {
                if restarts == 0 {
                    self.response.set_authoritative(false);
                }
                self.response.set_rcode(Rcode::NoError);
                self.referral(&apex)?;
                return self.additional(answer_start);
            }

            match self.answer(&qname, qtype, zone.control, &mut restarts)? {
                Answer::Restart(target) => {
                    debug!("Following CNAME to {}", domain_to_dot(&target));
                    qname = target;
                }
                Answer::Done { found } => {
                    if found {
                        if qtype == TYPE_ANY {
                            self.response.start_record(&qname, TYPE_HINFO, ANY_HINFO_TTL)?;
                            self.response.add_bytes(ANY_HINFO_RDATA)?;
                            self.response.finish_record(Section::Answer);
                        }
                        self.response.set_rcode(Rcode::NoError);
                    } else {
                        self.response.set_rcode(Rcode::NxDomain);
                    }

                    if self.response.len() == answer_start {
                        self.authority_soa(&apex)?;
                    }
                    return self.additional(answer_start);
                }
            }
        }
    }

    /// Walk up from `qname` to the closest name carrying NS records.
    fn bailiwick(&self, qname: &[u8]) -> Result<Option<Zone>, DnsError> {
        let mut control = 0;
        loop {
            let name = suffix(qname, control);
            let mut soa = 0;
            let mut ns = 0;
            for live in self.records(name, false) {
                match live?.record.rtype {
                    TYPE_SOA => soa += 1,
                    TYPE_NS => ns += 1,
                    _ => {}
                }
            }
            if ns > 0 {
                return Ok(Some(Zone {
                    control,
                    authoritative: soa > 0,
                }));
            }
            match name.first() {
                Some(&len) if len > 0 => control += usize::from(len) + 1,
                _ => return Ok(None),
            }
        }
    }

    fn answer(&mut self, qname: &[u8], qtype: u16, control: usize, restarts: &mut u32) -> Result<Answer, DnsError> {
        let mut found = false;
        let mut gave_soa = false;
        let mut wild = 0;

        loop {
            let owner = suffix(qname, wild);
            for live in self.records(owner, wild != 0) {
                let Live { record, ttl } = live?;
                found = true;

                if qtype == TYPE_ANY && record.rtype != TYPE_CNAME {
                    continue;
                }
                if gave_soa && record.rtype == TYPE_SOA {
                    continue;
                }
                if record.rtype != qtype && record.rtype != TYPE_CNAME {
                    continue;
                }

                self.response.start_record(qname, record.rtype, ttl)?;
                let rdata = record.rdata;
                let mut pos = 0;
                match record.rtype {
                    TYPE_NS | TYPE_PTR => {
                        self.copy_name(rdata, &mut pos)?;
                    }
                    TYPE_CNAME => {
                        let mut target = self.copy_name(rdata, &mut pos)?;
                        if qtype != TYPE_CNAME {
                            *restarts += 1;
                            if *restarts < MAX_CNAME_HOPS {
                                self.response.finish_record(Section::Answer);
                                target.make_ascii_lowercase();
                                return Ok(Answer::Restart(target));
                            }
                        }
                    }
                    TYPE_MX => {
                        self.copy_bytes(rdata, &mut pos, 2)?;
                        self.copy_name(rdata, &mut pos)?;
                    }
                    TYPE_SOA => {
                        self.copy_soa(rdata)?;
                        gave_soa = true;
                    }
                    _ => self.response.add_bytes(rdata)?,
                }
                self.response.finish_record(Section::Answer);
            }

            if found || wild == control {
                break;
            }
            let len = match owner.first() {
                Some(&len) if len > 0 => len,
                _ => break,
            };
            // RFC 1034 4.3.3: an existing name blocks wildcards above it.
            if wild != 0 && self.records(owner, false).next().transpose()?.is_some() {
                break;
            }
            wild += usize::from(len) + 1;
        }

        Ok(Answer::Done { found })
    }

    fn authority_soa(&mut self, apex: &[u8]) -> Result<(), DnsError> {
        for live in self.records(apex, false) {
            let Live { record, ttl } = live?;
            if record.rtype == TYPE_SOA {
                self.response.start_record(apex, TYPE_SOA, ttl)?;
                self.copy_soa(record.rdata)?;
                self.response.finish_record(Section::Authority);
                break;
            }
        }
        Ok(())
    }

    fn referral(&mut self, apex: &[u8]) -> Result<(), DnsError> {
        if !self.want(apex, TYPE_NS) {
            return Ok(());
        }
        for live in self.records(apex, false) {
            let Live { record, ttl } = live?;
            if record.rtype == TYPE_NS {
                self.response.start_record(apex, TYPE_NS, ttl)?;
                self.copy_name(record.rdata, &mut 0)?;
                self.response.finish_record(Section::Authority);
            }
        }
        Ok(())
    }

    /// Attach glue for the NS, MX and SRV targets of records from `pos` on.
    fn additional(&mut self, mut pos: usize) -> Result<(), DnsError> {
        let end = self.response.len();
        while pos < end {
            self.response.skip_name(&mut pos)?;
            let rtype = self.response.copy(&mut pos, 2)?;
            let rtype = u16::from_be_bytes([rtype[0], rtype[1]]);
            pos += 6;
            let rdlen = self.response.copy(&mut pos, 2)?;
            let rdlen = usize::from(u16::from_be_bytes([rdlen[0], rdlen[1]]));

            let target_offset = match rtype {
                TYPE_NS => Some(0),
                TYPE_MX => Some(2),
                TYPE_SRV => Some(6),
                _ => None,
            };
            if let Some(offset) = target_offset {
                let mut target = self.response.get_name(&mut (pos + offset))?;
                target.make_ascii_lowercase();
                self.glue(&target, TYPE_A, 4)?;
                self.glue(&target, TYPE_AAAA, 16)?;
            }
            pos += rdlen;
        }
        Ok(())
    }

    fn glue(&mut self, name: &[u8], rtype: u16, len: usize) -> Result<(), DnsError> {
        if !self.want(name, rtype) {
            return Ok(());
        }
        for live in self.records(name, false) {
            let Live { record, ttl } = live?;
            if record.rtype == rtype {
                self.response.start_record(name, rtype, ttl)?;
                self.copy_bytes(record.rdata, &mut 0, len)?;
                self.response.finish_record(Section::Additional);
            }
        }
        Ok(())
    }

    /// False if the response already holds a record of `rtype` owned by `name`.
    fn want(&self, name: &[u8], rtype: u16) -> bool {
        let mut pos = HEADER_LEN;
        if self.response.skip_name(&mut pos).is_err() {
            return true;
        }
        pos += 4;

        while let Ok(owner) = self.response.get_name(&mut pos) {
            let Ok(fixed) = self.response.copy(&mut pos, 10) else {
                break;
            };
            if fixed[..2] == rtype.to_be_bytes() && domain_equal(&owner, name) {
                return false;
            }
            pos += usize::from(u16::from_be_bytes([fixed[8], fixed[9]]));
        }
        true
    }

    fn copy_name(&mut self, rdata: &[u8], pos: &mut usize) -> Result<Vec<u8>, DnsError> {
        let name = packet_get_name(pos, rdata)?;
        self.response.add_name(&name)?;
        Ok(name)
    }

    fn copy_bytes(&mut self, rdata: &[u8], pos: &mut usize, len: usize) -> Result<(), DnsError> {
        let bytes = packet_copy(pos, len, rdata)?;
        self.response.add_bytes(bytes)
    }

    fn copy_soa(&mut self, rdata: &[u8]) -> Result<(), DnsError> {
        let mut pos = 0;
        self.copy_name(rdata, &mut pos)?;
        self.copy_name(rdata, &mut pos)?;
        self.copy_bytes(rdata, &mut pos, 20)
    }
}
