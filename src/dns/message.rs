//! DNS message wire codec (RFC 1035, RFC 6891).
//!
//! Message layout:
//! ```text
//!     +---------------------+
//!     |        Header       |  12 bytes
//!     +---------------------+
//!     |       Question      |  QDCOUNT entries
//!     +---------------------+
//!     |        Answer       |  ANCOUNT resource records
//!     +---------------------+
//!     |      Authority      |  NSCOUNT resource records
//!     +---------------------+
//!     |      Additional     |  ARCOUNT resource records
//!     +---------------------+
//! ```
//!
//! Names decode with compression-pointer support (RFC 1035 Section 4.1.4)
//! and encode uncompressed: every name this toolkit synthesizes is unique
//! per query, so pointers would never be reused.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_OPT: u16 = 41;
pub const TYPE_TSIG: u16 = 250;

pub const CLASS_INET: u16 = 1;
pub const CLASS_CHAOS: u16 = 3;
pub const CLASS_ANY: u16 = 255;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_NOTAUTH: u8 = 9;

/// EDNS0 option code for client subnet (RFC 7871).
pub const EDNS_CLIENT_SUBNET: u16 = 8;

const MAX_POINTER_JUMPS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("truncated message")]
    Truncated,
    #[error("malformed name")]
    BadName,
    #[error("malformed record: {0}")]
    BadRecord(&'static str),
}

/// Appends a trailing dot when missing; DNS names here are always FQDNs.
pub fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// EDNS0 client-subnet option, held in the fixed 26-byte form the tracer
/// echoes: IPv4 addresses are stored IPv4-mapped so the container width does
/// not depend on the family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSubnet {
    pub family: u16,
    pub code: u16,
    pub netmask: u8,
    pub scope: u8,
    pub address: [u8; 16],
}

impl ClientSubnet {
    pub fn parse(option: &EdnsOption) -> Option<Self> {
        if option.code != EDNS_CLIENT_SUBNET || option.data.len() < 4 {
            return None;
        }
        let d = &option.data;
        let family = u16::from_be_bytes([d[0], d[1]]);
        let netmask = d[2];
        let scope = d[3];
        let addr_bytes = &d[4..];

        let mut address = [0u8; 16];
        match family {
            1 => {
                let mut v4 = [0u8; 4];
                for (i, b) in addr_bytes.iter().take(4).enumerate() {
                    v4[i] = *b;
                }
                address = Ipv4Addr::from(v4).to_ipv6_mapped().octets();
            }
            2 => {
                for (i, b) in addr_bytes.iter().take(16).enumerate() {
                    address[i] = *b;
                }
            }
            _ => return None,
        }

        Some(Self {
            family,
            code: option.code,
            netmask,
            scope,
            address,
        })
    }

    /// The big-endian packing echoed by the `e0` handler:
    /// `family(2) code(2) netmask(1) scope(1) address(16)`.
    pub fn pack(&self) -> [u8; 22] {
        let mut out = [0u8; 22];
        out[0..2].copy_from_slice(&self.family.to_be_bytes());
        out[2..4].copy_from_slice(&self.code.to_be_bytes());
        out[4] = self.netmask;
        out[5] = self.scope;
        out[6..22].copy_from_slice(&self.address);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdnsOption {
    pub code: u16,
    pub data: Vec<u8>,
}

/// TSIG RDATA (RFC 2845).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsigData {
    pub algorithm: String,
    pub time_signed: u64,
    pub fudge: u16,
    pub mac: Vec<u8>,
    pub original_id: u16,
    pub error: u16,
    pub other: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ns(String),
    Cname(String),
    Txt(Vec<String>),
    Opt(Vec<EdnsOption>),
    Tsig(TsigData),
    Unknown(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    /// Class for ordinary records; requestor payload size for OPT.
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl Record {
    pub fn a(name: &str, addr: Ipv4Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: TYPE_A,
            class: CLASS_INET,
            ttl,
            rdata: RData::A(addr),
        }
    }

    pub fn aaaa(name: &str, addr: Ipv6Addr, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: TYPE_AAAA,
            class: CLASS_INET,
            ttl,
            rdata: RData::Aaaa(addr),
        }
    }

    pub fn ns(name: &str, target: &str, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: TYPE_NS,
            class: CLASS_INET,
            ttl,
            rdata: RData::Ns(target.to_string()),
        }
    }

    pub fn cname(name: &str, target: &str, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: TYPE_CNAME,
            class: CLASS_INET,
            ttl,
            rdata: RData::Cname(target.to_string()),
        }
    }

    pub fn txt(name: &str, class: u16, text: String, ttl: u32) -> Self {
        Self {
            name: name.to_string(),
            rtype: TYPE_TXT,
            class,
            ttl,
            rdata: RData::Txt(vec![text]),
        }
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        write_name(out, &self.name);
        out.extend_from_slice(&self.rtype.to_be_bytes());
        out.extend_from_slice(&self.class.to_be_bytes());
        out.extend_from_slice(&self.ttl.to_be_bytes());

        let mut rdata = Vec::new();
        match &self.rdata {
            RData::A(addr) => rdata.extend_from_slice(&addr.octets()),
            RData::Aaaa(addr) => rdata.extend_from_slice(&addr.octets()),
            RData::Ns(target) | RData::Cname(target) => write_name(&mut rdata, target),
            RData::Txt(strings) => {
                for s in strings {
                    for chunk in s.as_bytes().chunks(255) {
                        rdata.push(chunk.len() as u8);
                        rdata.extend_from_slice(chunk);
                    }
                }
            }
            RData::Opt(options) => {
                for opt in options {
                    rdata.extend_from_slice(&opt.code.to_be_bytes());
                    rdata.extend_from_slice(&(opt.data.len() as u16).to_be_bytes());
                    rdata.extend_from_slice(&opt.data);
                }
            }
            RData::Tsig(tsig) => {
                write_name(&mut rdata, &tsig.algorithm);
                rdata.extend_from_slice(&tsig.time_signed.to_be_bytes()[2..8]);
                rdata.extend_from_slice(&tsig.fudge.to_be_bytes());
                rdata.extend_from_slice(&(tsig.mac.len() as u16).to_be_bytes());
                rdata.extend_from_slice(&tsig.mac);
                rdata.extend_from_slice(&tsig.original_id.to_be_bytes());
                rdata.extend_from_slice(&tsig.error.to_be_bytes());
                rdata.extend_from_slice(&(tsig.other.len() as u16).to_be_bytes());
                rdata.extend_from_slice(&tsig.other);
            }
            RData::Unknown(bytes) => rdata.extend_from_slice(bytes),
        }

        out.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        out.extend_from_slice(&rdata);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub header: Header,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
    /// Byte offset of the TSIG record in the wire this message was decoded
    /// from, when present. Needed to rebuild the unsigned form for MAC
    /// verification.
    pub tsig_start: Option<usize>,
}

impl Message {
    /// A response skeleton: same id, question echoed, RD copied through.
    pub fn reply_to(request: &Message) -> Self {
        Self {
            header: Header {
                id: request.header.id,
                response: true,
                opcode: request.header.opcode,
                recursion_desired: request.header.recursion_desired,
                ..Header::default()
            },
            questions: request.questions.clone(),
            ..Self::default()
        }
    }

    pub fn edns(&self) -> Option<&Record> {
        self.additionals.iter().find(|r| r.rtype == TYPE_OPT)
    }

    pub fn client_subnet(&self) -> Option<ClientSubnet> {
        let opt = self.edns()?;
        if let RData::Opt(options) = &opt.rdata {
            options.iter().find_map(ClientSubnet::parse)
        } else {
            None
        }
    }

    /// The request TSIG, which must sit last in the additional section.
    pub fn tsig(&self) -> Option<(&Record, &TsigData)> {
        let record = self.additionals.last()?;
        if let RData::Tsig(data) = &record.rdata {
            Some((record, data))
        } else {
            None
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.header.id.to_be_bytes());

        let mut flags = (self.header.rcode & 0x0F) as u16;
        flags |= (self.header.opcode as u16 & 0x0F) << 11;
        if self.header.response {
            flags |= 0x8000;
        }
        if self.header.authoritative {
            flags |= 0x0400;
        }
        if self.header.truncated {
            flags |= 0x0200;
        }
        if self.header.recursion_desired {
            flags |= 0x0100;
        }
        if self.header.recursion_available {
            flags |= 0x0080;
        }
        out.extend_from_slice(&flags.to_be_bytes());

        out.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.authorities.len() as u16).to_be_bytes());
        out.extend_from_slice(&(self.additionals.len() as u16).to_be_bytes());

        for q in &self.questions {
            write_name(&mut out, &q.name);
            out.extend_from_slice(&q.qtype.to_be_bytes());
            out.extend_from_slice(&q.qclass.to_be_bytes());
        }
        for record in self
            .answers
            .iter()
            .chain(&self.authorities)
            .chain(&self.additionals)
        {
            record.encode_into(&mut out);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DnsError> {
        if buf.len() < 12 {
            return Err(DnsError::Truncated);
        }

        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
        let ancount = u16::from_be_bytes([buf[6], buf[7]]);
        let nscount = u16::from_be_bytes([buf[8], buf[9]]);
        let arcount = u16::from_be_bytes([buf[10], buf[11]]);

        let header = Header {
            id,
            response: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0F) as u8,
            authoritative: flags & 0x0400 != 0,
            truncated: flags & 0x0200 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            rcode: (flags & 0x0F) as u8,
        };

        let mut pos = 12;
        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let name = parse_name(buf, &mut pos)?;
            if pos + 4 > buf.len() {
                return Err(DnsError::Truncated);
            }
            let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
            let qclass = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
            pos += 4;
            questions.push(Question {
                name,
                qtype,
                qclass,
            });
        }

        let mut message = Message {
            header,
            questions,
            ..Self::default()
        };
        for _ in 0..ancount {
            let record = parse_record(buf, &mut pos)?;
            message.answers.push(record);
        }
        for _ in 0..nscount {
            let record = parse_record(buf, &mut pos)?;
            message.authorities.push(record);
        }
        for _ in 0..arcount {
            let start = pos;
            let record = parse_record(buf, &mut pos)?;
            if record.rtype == TYPE_TSIG {
                message.tsig_start = Some(start);
            }
            message.additionals.push(record);
        }
        Ok(message)
    }
}

/// Writes `name` as length-prefixed labels plus the root terminator. Labels
/// here are bounded by construction (the longest is the 58-char tracer
/// label); anything longer is clamped to the wire maximum of 63.
pub(crate) fn write_name(out: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        if label.is_empty() {
            continue;
        }
        let bytes = label.as_bytes();
        let len = bytes.len().min(63);
        out.push(len as u8);
        out.extend_from_slice(&bytes[..len]);
    }
    out.push(0);
}

/// Reads a possibly-compressed name at `*pos`, advancing past it. The
/// returned name carries a trailing dot (root is `.`).
pub(crate) fn parse_name(buf: &[u8], pos: &mut usize) -> Result<String, DnsError> {
    let mut name = String::new();
    let mut cursor = *pos;
    let mut jumped = false;
    let mut resume = 0usize;
    let mut jumps = 0usize;

    loop {
        let len = *buf.get(cursor).ok_or(DnsError::Truncated)? as usize;

        if len == 0 {
            cursor += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            let low = *buf.get(cursor + 1).ok_or(DnsError::Truncated)? as usize;
            if !jumped {
                resume = cursor + 2;
                jumped = true;
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(DnsError::BadName);
            }
            cursor = ((len & 0x3F) << 8) | low;
            continue;
        }

        if len > 63 {
            return Err(DnsError::BadName);
        }
        let label = buf
            .get(cursor + 1..cursor + 1 + len)
            .ok_or(DnsError::Truncated)?;
        name.push_str(&String::from_utf8_lossy(label));
        name.push('.');
        cursor += 1 + len;

        if name.len() > 255 {
            return Err(DnsError::BadName);
        }
    }

    *pos = if jumped { resume } else { cursor };
    if name.is_empty() {
        name.push('.');
    }
    Ok(name)
}

fn parse_record(buf: &[u8], pos: &mut usize) -> Result<Record, DnsError> {
    let name = parse_name(buf, pos)?;
    if *pos + 10 > buf.len() {
        return Err(DnsError::Truncated);
    }
    let rtype = u16::from_be_bytes([buf[*pos], buf[*pos + 1]]);
    let class = u16::from_be_bytes([buf[*pos + 2], buf[*pos + 3]]);
    let ttl = u32::from_be_bytes([
        buf[*pos + 4],
        buf[*pos + 5],
        buf[*pos + 6],
        buf[*pos + 7],
    ]);
    let rdlength = u16::from_be_bytes([buf[*pos + 8], buf[*pos + 9]]) as usize;
    *pos += 10;

    if *pos + rdlength > buf.len() {
        return Err(DnsError::Truncated);
    }
    let rdata_start = *pos;
    let rdata_bytes = &buf[rdata_start..rdata_start + rdlength];
    *pos += rdlength;

    let rdata = match rtype {
        TYPE_A => {
            if rdlength != 4 {
                return Err(DnsError::BadRecord("A rdata length"));
            }
            RData::A(Ipv4Addr::new(
                rdata_bytes[0],
                rdata_bytes[1],
                rdata_bytes[2],
                rdata_bytes[3],
            ))
        }
        TYPE_AAAA => {
            if rdlength != 16 {
                return Err(DnsError::BadRecord("AAAA rdata length"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(rdata_bytes);
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        TYPE_NS => {
            let mut name_pos = rdata_start;
            RData::Ns(parse_name(buf, &mut name_pos)?)
        }
        TYPE_CNAME => {
            let mut name_pos = rdata_start;
            RData::Cname(parse_name(buf, &mut name_pos)?)
        }
        TYPE_TXT => {
            let mut strings = Vec::new();
            let mut i = 0;
            while i < rdata_bytes.len() {
                let len = rdata_bytes[i] as usize;
                let chunk = rdata_bytes
                    .get(i + 1..i + 1 + len)
                    .ok_or(DnsError::BadRecord("TXT char-string"))?;
                strings.push(String::from_utf8_lossy(chunk).to_string());
                i += 1 + len;
            }
            RData::Txt(strings)
        }
        TYPE_OPT => {
            let mut options = Vec::new();
            let mut i = 0;
            while i + 4 <= rdata_bytes.len() {
                let code = u16::from_be_bytes([rdata_bytes[i], rdata_bytes[i + 1]]);
                let len = u16::from_be_bytes([rdata_bytes[i + 2], rdata_bytes[i + 3]]) as usize;
                let data = rdata_bytes
                    .get(i + 4..i + 4 + len)
                    .ok_or(DnsError::BadRecord("OPT option"))?;
                options.push(EdnsOption {
                    code,
                    data: data.to_vec(),
                });
                i += 4 + len;
            }
            RData::Opt(options)
        }
        TYPE_TSIG => {
            let mut tsig_pos = rdata_start;
            let algorithm = parse_name(buf, &mut tsig_pos)?;
            let fixed = buf
                .get(tsig_pos..tsig_pos + 10)
                .ok_or(DnsError::BadRecord("TSIG header"))?;
            let time_signed = u64::from_be_bytes([
                0, 0, fixed[0], fixed[1], fixed[2], fixed[3], fixed[4], fixed[5],
            ]);
            let fudge = u16::from_be_bytes([fixed[6], fixed[7]]);
            let mac_len = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;
            tsig_pos += 10;
            let mac = buf
                .get(tsig_pos..tsig_pos + mac_len)
                .ok_or(DnsError::BadRecord("TSIG mac"))?
                .to_vec();
            tsig_pos += mac_len;
            let tail = buf
                .get(tsig_pos..tsig_pos + 6)
                .ok_or(DnsError::BadRecord("TSIG tail"))?;
            let original_id = u16::from_be_bytes([tail[0], tail[1]]);
            let error = u16::from_be_bytes([tail[2], tail[3]]);
            let other_len = u16::from_be_bytes([tail[4], tail[5]]) as usize;
            tsig_pos += 6;
            let other = buf
                .get(tsig_pos..tsig_pos + other_len)
                .ok_or(DnsError::BadRecord("TSIG other"))?
                .to_vec();
            RData::Tsig(TsigData {
                algorithm,
                time_signed,
                fudge,
                mac,
                original_id,
                error,
                other,
            })
        }
        _ => RData::Unknown(rdata_bytes.to_vec()),
    };

    Ok(Record {
        name,
        rtype,
        class,
        ttl,
        rdata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(name: &str, qtype: u16) -> Message {
        Message {
            header: Header {
                id: 0x1234,
                recursion_desired: true,
                ..Header::default()
            },
            questions: vec![Question {
                name: fqdn(name),
                qtype,
                qclass: CLASS_INET,
            }],
            ..Message::default()
        }
    }

    #[test]
    fn fqdn_appends_one_dot() {
        assert_eq!(fqdn("v1.nxdomain.us"), "v1.nxdomain.us.");
        assert_eq!(fqdn("v1.nxdomain.us."), "v1.nxdomain.us.");
    }

    #[test]
    fn round_trips_a_full_message() {
        let mut msg = question("example.com", TYPE_A);
        msg.header.response = true;
        msg.header.authoritative = true;
        msg.header.rcode = RCODE_NXDOMAIN;
        msg.answers
            .push(Record::a("example.com.", Ipv4Addr::new(192, 0, 2, 1), 60));
        msg.answers.push(Record::aaaa(
            "example.com.",
            "2001:db8::1".parse().unwrap(),
            60,
        ));
        msg.authorities
            .push(Record::ns("example.com.", "ns1.example.com.", 60));
        msg.additionals.push(Record::txt(
            "example.com.",
            CLASS_CHAOS,
            "203.0.113.9:4242/udp".to_string(),
            60,
        ));
        msg.additionals
            .push(Record::cname("alias.example.com.", "example.com.", 60));

        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.header, msg.header);
        assert_eq!(decoded.questions, msg.questions);
        assert_eq!(decoded.answers, msg.answers);
        assert_eq!(decoded.authorities, msg.authorities);
        assert_eq!(decoded.additionals, msg.additionals);
    }

    #[test]
    fn decodes_compression_pointers() {
        // Hand-built response: question example.com, answer name is a
        // pointer back to offset 12.
        let mut wire = Vec::new();
        wire.extend_from_slice(&0x0001u16.to_be_bytes()); // id
        wire.extend_from_slice(&0x8000u16.to_be_bytes()); // response
        wire.extend_from_slice(&1u16.to_be_bytes()); // qd
        wire.extend_from_slice(&1u16.to_be_bytes()); // an
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&0u16.to_be_bytes());
        write_name(&mut wire, "example.com.");
        wire.extend_from_slice(&TYPE_A.to_be_bytes());
        wire.extend_from_slice(&CLASS_INET.to_be_bytes());
        wire.extend_from_slice(&[0xC0, 12]); // pointer to the question name
        wire.extend_from_slice(&TYPE_A.to_be_bytes());
        wire.extend_from_slice(&CLASS_INET.to_be_bytes());
        wire.extend_from_slice(&60u32.to_be_bytes());
        wire.extend_from_slice(&4u16.to_be_bytes());
        wire.extend_from_slice(&[192, 0, 2, 7]);

        let msg = Message::decode(&wire).unwrap();
        assert_eq!(msg.answers[0].name, "example.com.");
        assert_eq!(msg.answers[0].rdata, RData::A(Ipv4Addr::new(192, 0, 2, 7)));
    }

    #[test]
    fn pointer_loops_are_rejected() {
        let mut wire = vec![0u8; 12];
        wire[5] = 1; // one question
        wire.extend_from_slice(&[0xC0, 12]); // points at itself
        wire.extend_from_slice(&TYPE_A.to_be_bytes());
        wire.extend_from_slice(&CLASS_INET.to_be_bytes());
        assert_eq!(Message::decode(&wire).unwrap_err(), DnsError::BadName);
    }

    #[test]
    fn parses_edns_client_subnet() {
        let mut msg = question("e0test.example.com", TYPE_A);
        let ecs = EdnsOption {
            code: EDNS_CLIENT_SUBNET,
            data: vec![0, 1, 24, 0, 198, 51, 100],
        };
        msg.additionals.push(Record {
            name: ".".to_string(),
            rtype: TYPE_OPT,
            class: 4096,
            ttl: 0,
            rdata: RData::Opt(vec![ecs]),
        });

        let decoded = Message::decode(&msg.encode()).unwrap();
        let subnet = decoded.client_subnet().expect("ECS missing");
        assert_eq!(subnet.family, 1);
        assert_eq!(subnet.netmask, 24);
        assert_eq!(subnet.scope, 0);
        let want = Ipv4Addr::new(198, 51, 100, 0).to_ipv6_mapped().octets();
        assert_eq!(subnet.address, want);

        let packed = subnet.pack();
        assert_eq!(&packed[0..2], &[0, 1]);
        assert_eq!(&packed[2..4], &[0, 8]);
        assert_eq!(packed[4], 24);
        assert_eq!(&packed[6..22], &subnet.address);
    }

    #[test]
    fn tsig_record_round_trips() {
        let mut msg = question("example.com", TYPE_A);
        msg.additionals.push(Record {
            name: "probe-key.".to_string(),
            rtype: TYPE_TSIG,
            class: CLASS_ANY,
            ttl: 0,
            rdata: RData::Tsig(TsigData {
                algorithm: "hmac-md5.sig-alg.reg.int.".to_string(),
                time_signed: 1_700_000_000,
                fudge: 300,
                mac: vec![0xAA; 16],
                original_id: 0x1234,
                error: 0,
                other: vec![],
            }),
        });

        let wire = msg.encode();
        let decoded = Message::decode(&wire).unwrap();
        let (record, data) = decoded.tsig().expect("TSIG missing");
        assert_eq!(record.name, "probe-key.");
        assert_eq!(data.algorithm, "hmac-md5.sig-alg.reg.int.");
        assert_eq!(data.time_signed, 1_700_000_000);
        assert_eq!(data.fudge, 300);
        assert_eq!(data.mac, vec![0xAA; 16]);
        assert!(decoded.tsig_start.is_some());
        // The recorded offset points at the start of the TSIG record.
        let start = decoded.tsig_start.unwrap();
        assert_eq!(wire[start] as usize, "probe-key".len());
    }

    #[test]
    fn truncated_input_fails_cleanly() {
        assert_eq!(Message::decode(&[0; 5]).unwrap_err(), DnsError::Truncated);
        let msg = question("example.com", TYPE_A);
        let wire = msg.encode();
        assert!(Message::decode(&wire[..wire.len() - 3]).is_err());
    }
}
