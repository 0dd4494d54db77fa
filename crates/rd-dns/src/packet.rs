//! DNS wire format parser and serializer (RFC 1035).
//!
//! Parses whole messages into [`DnsMessage`] so that the forwarding engine
//! can rewrite questions, prepend records and re-encode. Name compression
//! pointers are followed on parse; on encode, owner names equal to the
//! question name are compressed with a pointer to offset 12.

use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::records::{DnsRecord, RData, RecordClass, RecordType};

const HEADER_LEN: usize = 12;

/// Legacy maximum UDP payload (RFC 1035 §4.2.1).
pub const MAX_UDP_SIZE: usize = 512;

// Header flag bits.
const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const RCODE_MASK: u16 = 0x000F;

// RCODE constants.
pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_NOTIMP: u8 = 4;
pub const RCODE_REFUSED: u8 = 5;

pub fn rcode_name(rcode: u8) -> &'static str {
    match rcode {
        RCODE_NOERROR => "NOERROR",
        RCODE_FORMERR => "FORMERR",
        RCODE_SERVFAIL => "SERVFAIL",
        RCODE_NXDOMAIN => "NXDOMAIN",
        RCODE_NOTIMP => "NOTIMP",
        RCODE_REFUSED => "REFUSED",
        _ => "UNKNOWN",
    }
}

#[derive(Error, Debug)]
pub enum DnsParseError {
    #[error("packet truncated at offset {0}")]
    Truncated(usize),
    #[error("name compression loop detected")]
    CompressionLoop,
    #[error("invalid UTF-8 in name")]
    InvalidUtf8,
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("name too long (exceeds 253 characters)")]
    NameTooLong,
    #[error("label too long: {0} bytes (max 63)")]
    LabelTooLong(usize),
}

/// A parsed DNS question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

/// A fully parsed DNS message, request or response.
#[derive(Debug, Clone)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authority: Vec<DnsRecord>,
    pub additional: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Build a recursion-desired query for a single question.
    pub fn query(id: u16, name: &str, qtype: RecordType) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            questions: vec![DnsQuestion {
                name: name.to_lowercase(),
                qtype,
                qclass: RecordClass::In,
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// Build an empty reply to `req`: same id and question, QR set, the
    /// client's RD bit echoed and RA set.
    pub fn reply_to(req: &DnsMessage) -> Self {
        Self {
            id: req.id,
            flags: FLAG_QR | (req.flags & FLAG_RD) | FLAG_RA,
            questions: req.questions.clone(),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// Build an empty reply to `req` carrying the given rcode.
    pub fn error_reply(req: &DnsMessage, rcode: u8) -> Self {
        let mut m = Self::reply_to(req);
        m.set_rcode(rcode);
        m
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    pub fn opcode(&self) -> u8 {
        ((self.flags >> 11) & 0xF) as u8
    }

    pub fn authoritative(&self) -> bool {
        self.flags & FLAG_AA != 0
    }

    pub fn truncated(&self) -> bool {
        self.flags & FLAG_TC != 0
    }

    pub fn recursion_desired(&self) -> bool {
        self.flags & FLAG_RD != 0
    }

    pub fn recursion_available(&self) -> bool {
        self.flags & FLAG_RA != 0
    }

    pub fn rcode(&self) -> u8 {
        (self.flags & RCODE_MASK) as u8
    }

    pub fn set_authoritative(&mut self, on: bool) {
        self.set_flag(FLAG_AA, on);
    }

    pub fn set_recursion_available(&mut self, on: bool) {
        self.set_flag(FLAG_RA, on);
    }

    pub fn set_rcode(&mut self, rcode: u8) {
        self.flags = (self.flags & !RCODE_MASK) | (rcode as u16 & RCODE_MASK);
    }

    fn set_flag(&mut self, bit: u16, on: bool) {
        if on {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    /// Parse a DNS message from raw bytes.
    ///
    /// Question and record owner names are lowercased. OPT pseudo-records
    /// (type 41) are dropped per RFC 6891; they must not be cached or
    /// forwarded back to clients.
    pub fn parse(buf: &[u8]) -> Result<Self, DnsParseError> {
        if buf.len() < HEADER_LEN {
            return Err(DnsParseError::TooShort(buf.len()));
        }
        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        let qd_count = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        let an_count = u16::from_be_bytes([buf[6], buf[7]]) as usize;
        let ns_count = u16::from_be_bytes([buf[8], buf[9]]) as usize;
        let ar_count = u16::from_be_bytes([buf[10], buf[11]]) as usize;

        let mut offset = HEADER_LEN;
        let mut questions = Vec::with_capacity(qd_count);
        for _ in 0..qd_count {
            let (name, new_offset) = parse_name(buf, offset)?;
            offset = new_offset;
            if offset + 4 > buf.len() {
                return Err(DnsParseError::Truncated(offset));
            }
            let qtype = RecordType::from_u16(u16::from_be_bytes([buf[offset], buf[offset + 1]]));
            let qclass =
                RecordClass::from_u16(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
            offset += 4;
            questions.push(DnsQuestion {
                name: name.to_lowercase(),
                qtype,
                qclass,
            });
        }

        let mut msg = Self {
            id,
            flags,
            questions,
            answers: Vec::with_capacity(an_count),
            authority: Vec::with_capacity(ns_count),
            additional: Vec::with_capacity(ar_count),
        };

        for (count, section) in [(an_count, 0u8), (ns_count, 1), (ar_count, 2)] {
            for _ in 0..count {
                if offset >= buf.len() {
                    break;
                }
                let (record, new_offset, rtype_raw) = parse_record(buf, offset)?;
                offset = new_offset;
                if rtype_raw == 41 {
                    continue;
                }
                match section {
                    0 => msg.answers.push(record),
                    1 => msg.authority.push(record),
                    _ => msg.additional.push(record),
                }
            }
        }

        Ok(msg)
    }

    /// Encode the message to wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAX_UDP_SIZE);

        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.authority.len() as u16).to_be_bytes());
        buf.extend_from_slice(&(self.additional.len() as u16).to_be_bytes());

        for q in &self.questions {
            encode_name(&q.name, &mut buf);
            buf.extend_from_slice(&q.qtype.to_u16().to_be_bytes());
            buf.extend_from_slice(&q.qclass.to_u16().to_be_bytes());
        }

        let qname = self.questions.first().map(|q| q.name.as_str());
        for record in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            match qname {
                Some(name) if record.name.eq_ignore_ascii_case(name) => {
                    // Pointer to the question name at offset 12.
                    buf.extend_from_slice(&[0xC0, HEADER_LEN as u8]);
                }
                _ => encode_name(&record.name, &mut buf),
            }
            buf.extend_from_slice(&record.rtype.to_u16().to_be_bytes());
            buf.extend_from_slice(&record.class.to_u16().to_be_bytes());
            buf.extend_from_slice(&record.ttl.to_be_bytes());
            encode_rdata(&record.rdata, &mut buf);
        }

        buf
    }
}

/// Compression pointers a single name may chase before the chain is
/// declared a loop.
const MAX_POINTER_HOPS: usize = 8;

/// Decode a possibly-compressed DNS name starting at `start`. Returns the
/// name and the offset of the first byte after it at the reference site (a
/// pointer occupies two bytes there, wherever its target lives).
pub fn parse_name(buf: &[u8], start: usize) -> Result<(String, usize), DnsParseError> {
    let mut labels: Vec<&str> = Vec::new();
    let mut wire_len = 0usize;
    let mut pos = start;
    let mut resume_at: Option<usize> = None;
    let mut hops = 0usize;

    loop {
        let &marker = buf.get(pos).ok_or(DnsParseError::Truncated(pos))?;
        match marker {
            0 => {
                pos += 1;
                break;
            }
            1..=63 => {
                let len = marker as usize;
                let raw = buf
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(DnsParseError::Truncated(pos))?;
                labels.push(std::str::from_utf8(raw).map_err(|_| DnsParseError::InvalidUtf8)?);
                // RFC 1035 §2.3.4: 255 octets on the wire per name.
                wire_len += len + 1;
                if wire_len > 254 {
                    return Err(DnsParseError::NameTooLong);
                }
                pos += 1 + len;
            }
            0xC0.. => {
                let &low = buf.get(pos + 1).ok_or(DnsParseError::Truncated(pos))?;
                resume_at.get_or_insert(pos + 2);
                hops += 1;
                if hops > MAX_POINTER_HOPS {
                    return Err(DnsParseError::CompressionLoop);
                }
                pos = ((marker as usize & 0x3F) << 8) | low as usize;
            }
            // 0x40-0xBF: reserved label types
            _ => return Err(DnsParseError::LabelTooLong(marker as usize)),
        }
    }

    Ok((labels.join("."), resume_at.unwrap_or(pos)))
}

/// Encode a DNS name into wire format labels. Empty labels (a root name,
/// stray dots) are dropped; the terminating zero octet is always written.
pub fn encode_name(name: &str, buf: &mut Vec<u8>) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        let len = bytes.len().min(63);
        buf.push(len as u8);
        buf.extend_from_slice(&bytes[..len]);
    }
    buf.push(0);
}

fn parse_record(buf: &[u8], offset: usize) -> Result<(DnsRecord, usize, u16), DnsParseError> {
    let (name, mut offset) = parse_name(buf, offset)?;

    if offset + 10 > buf.len() {
        return Err(DnsParseError::Truncated(offset));
    }

    let rtype_raw = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
    let rtype = RecordType::from_u16(rtype_raw);
    let class = RecordClass::from_u16(u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]));
    let ttl = u32::from_be_bytes([
        buf[offset + 4],
        buf[offset + 5],
        buf[offset + 6],
        buf[offset + 7],
    ]);
    let rdlength = u16::from_be_bytes([buf[offset + 8], buf[offset + 9]]) as usize;
    offset += 10;

    if offset + rdlength > buf.len() {
        return Err(DnsParseError::Truncated(offset));
    }

    let rdata = parse_rdata(buf, offset, rdlength, rtype)?;
    offset += rdlength;

    Ok((
        DnsRecord {
            name: name.to_lowercase(),
            rtype,
            class,
            ttl,
            rdata,
        },
        offset,
        rtype_raw,
    ))
}

fn parse_rdata(
    buf: &[u8],
    offset: usize,
    rdlength: usize,
    rtype: RecordType,
) -> Result<RData, DnsParseError> {
    match rtype {
        RecordType::A => {
            if rdlength != 4 {
                return Ok(RData::Raw(buf[offset..offset + rdlength].to_vec()));
            }
            Ok(RData::A(Ipv4Addr::new(
                buf[offset],
                buf[offset + 1],
                buf[offset + 2],
                buf[offset + 3],
            )))
        }
        RecordType::Aaaa => {
            if rdlength != 16 {
                return Ok(RData::Raw(buf[offset..offset + rdlength].to_vec()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[offset..offset + 16]);
            Ok(RData::Aaaa(Ipv6Addr::from(octets)))
        }
        RecordType::Cname | RecordType::Ptr | RecordType::Ns => {
            let (name, _) = parse_name(buf, offset)?;
            Ok(match rtype {
                RecordType::Cname => RData::Cname(name),
                RecordType::Ptr => RData::Ptr(name),
                _ => RData::Ns(name),
            })
        }
        RecordType::Mx => {
            if rdlength < 3 {
                return Ok(RData::Raw(buf[offset..offset + rdlength].to_vec()));
            }
            let preference = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let (exchange, _) = parse_name(buf, offset + 2)?;
            Ok(RData::Mx {
                preference,
                exchange,
            })
        }
        RecordType::Srv => {
            if rdlength < 7 {
                return Ok(RData::Raw(buf[offset..offset + rdlength].to_vec()));
            }
            let priority = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
            let weight = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]);
            let port = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
            let (target, _) = parse_name(buf, offset + 6)?;
            Ok(RData::Srv {
                priority,
                weight,
                port,
                target,
            })
        }
        RecordType::Txt => {
            // One or more <length><string> pairs.
            let mut strings = Vec::new();
            let mut pos = offset;
            let end = offset + rdlength;
            while pos < end {
                let len = buf[pos] as usize;
                pos += 1;
                if pos + len > end {
                    break;
                }
                match std::str::from_utf8(&buf[pos..pos + len]) {
                    Ok(s) => strings.push(s.to_string()),
                    Err(_) => return Ok(RData::Raw(buf[offset..offset + rdlength].to_vec())),
                }
                pos += len;
            }
            Ok(RData::Txt(strings))
        }
        RecordType::Soa => {
            let (mname, next) = parse_name(buf, offset)?;
            let (rname, o) = parse_name(buf, next)?;
            if o + 20 > buf.len() {
                return Ok(RData::Raw(buf[offset..offset + rdlength].to_vec()));
            }
            Ok(RData::Soa {
                mname,
                rname,
                serial: u32::from_be_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]),
                refresh: u32::from_be_bytes([buf[o + 4], buf[o + 5], buf[o + 6], buf[o + 7]]),
                retry: u32::from_be_bytes([buf[o + 8], buf[o + 9], buf[o + 10], buf[o + 11]]),
                expire: u32::from_be_bytes([buf[o + 12], buf[o + 13], buf[o + 14], buf[o + 15]]),
                minimum: u32::from_be_bytes([buf[o + 16], buf[o + 17], buf[o + 18], buf[o + 19]]),
            })
        }
        _ => Ok(RData::Raw(buf[offset..offset + rdlength].to_vec())),
    }
}

fn encode_rdata(rdata: &RData, buf: &mut Vec<u8>) {
    match rdata {
        RData::A(ip) => {
            buf.extend_from_slice(&4u16.to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
        RData::Aaaa(ip) => {
            buf.extend_from_slice(&16u16.to_be_bytes());
            buf.extend_from_slice(&ip.octets());
        }
        RData::Cname(name) | RData::Ptr(name) | RData::Ns(name) => {
            let mut rdata_buf = Vec::new();
            encode_name(name, &mut rdata_buf);
            buf.extend_from_slice(&(rdata_buf.len() as u16).to_be_bytes());
            buf.extend_from_slice(&rdata_buf);
        }
        RData::Mx {
            preference,
            exchange,
        } => {
            let mut rdata_buf = Vec::new();
            rdata_buf.extend_from_slice(&preference.to_be_bytes());
            encode_name(exchange, &mut rdata_buf);
            buf.extend_from_slice(&(rdata_buf.len() as u16).to_be_bytes());
            buf.extend_from_slice(&rdata_buf);
        }
        RData::Txt(strings) => {
            let mut rdata_buf = Vec::new();
            for s in strings {
                for chunk in s.as_bytes().chunks(255) {
                    rdata_buf.push(chunk.len() as u8);
                    rdata_buf.extend_from_slice(chunk);
                }
            }
            if strings.is_empty() {
                rdata_buf.push(0);
            }
            buf.extend_from_slice(&(rdata_buf.len() as u16).to_be_bytes());
            buf.extend_from_slice(&rdata_buf);
        }
        RData::Soa {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            let mut rdata_buf = Vec::new();
            encode_name(mname, &mut rdata_buf);
            encode_name(rname, &mut rdata_buf);
            rdata_buf.extend_from_slice(&serial.to_be_bytes());
            rdata_buf.extend_from_slice(&refresh.to_be_bytes());
            rdata_buf.extend_from_slice(&retry.to_be_bytes());
            rdata_buf.extend_from_slice(&expire.to_be_bytes());
            rdata_buf.extend_from_slice(&minimum.to_be_bytes());
            buf.extend_from_slice(&(rdata_buf.len() as u16).to_be_bytes());
            buf.extend_from_slice(&rdata_buf);
        }
        RData::Srv {
            priority,
            weight,
            port,
            target,
        } => {
            let mut rdata_buf = Vec::new();
            rdata_buf.extend_from_slice(&priority.to_be_bytes());
            rdata_buf.extend_from_slice(&weight.to_be_bytes());
            rdata_buf.extend_from_slice(&port.to_be_bytes());
            encode_name(target, &mut rdata_buf);
            buf.extend_from_slice(&(rdata_buf.len() as u16).to_be_bytes());
            buf.extend_from_slice(&rdata_buf);
        }
        RData::Raw(data) => {
            buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
            buf.extend_from_slice(data);
        }
    }
}

/// Shrink an oversized reply to fit `max_size`: set the TC flag, zero the
/// record counts, and cut the message down to its header and question
/// section so no partial record bytes ever reach the wire.
pub fn truncate_for_udp(response: &mut Vec<u8>, max_size: usize) {
    if response.len() <= max_size || response.len() < HEADER_LEN {
        return;
    }

    // Find where the question section ends; an unwalkable or oversized
    // question keeps just the bare header.
    let qd_count = u16::from_be_bytes([response[4], response[5]]);
    let mut keep = HEADER_LEN;
    for _ in 0..qd_count {
        match parse_name(response, keep) {
            Ok((_, after)) if after + 4 <= response.len() => keep = after + 4,
            _ => {
                keep = HEADER_LEN;
                break;
            }
        }
    }
    if keep > max_size {
        keep = HEADER_LEN;
    }
    if keep == HEADER_LEN {
        response[4] = 0;
        response[5] = 0;
    }

    response[2] |= (FLAG_TC >> 8) as u8;
    for count_byte in &mut response[6..HEADER_LEN] {
        *count_byte = 0;
    }
    response.truncate(keep);
}
