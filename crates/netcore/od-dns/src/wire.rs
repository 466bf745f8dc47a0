//! Minimal DNS wire codec: enough to answer authoritative queries and to
//! send PTR lookups upstream. Names are handled as lowercase dotted
//! strings without the trailing dot.

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use thiserror::Error;

pub const TYPE_A: u16 = 1;
pub const TYPE_NS: u16 = 2;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_SOA: u16 = 6;
pub const TYPE_PTR: u16 = 12;
pub const TYPE_MX: u16 = 15;
pub const TYPE_TXT: u16 = 16;
pub const TYPE_AAAA: u16 = 28;
pub const TYPE_ANY: u16 = 255;
pub const TYPE_CAA: u16 = 257;

pub const CLASS_IN: u16 = 1;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_FORMERR: u8 = 1;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_NXDOMAIN: u8 = 3;
pub const RCODE_NOTIMP: u8 = 4;
pub const RCODE_REFUSED: u8 = 5;

const HEADER_LEN: usize = 12;
const MAX_POINTER_HOPS: usize = 32;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated message")]
    Truncated,
    #[error("malformed name")]
    BadName,
    #[error("no question")]
    NoQuestion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: u16,
    pub recursion_desired: bool,
    pub rcode: u8,
    pub question: Question,
    pub answers: Vec<Record>,
}

#[derive(Debug, Clone)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub ttl: u32,
    pub rdata: RData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    Ns(String),
    Ptr(String),
    Mx { preference: u16, exchange: String },
    Txt(String),
    Caa { flags: u8, tag: String, value: String },
    Soa {
        primary: String,
        email: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    Other(Vec<u8>),
}

// ── parsing ─────────────────────────────────────────────────────

/// Parse an incoming query (header + first question).
pub fn parse_query(buf: &[u8]) -> Result<Message, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    if qdcount == 0 {
        return Err(WireError::NoQuestion);
    }
    let mut pos = HEADER_LEN;
    let name = read_name(buf, &mut pos)?;
    if pos + 4 > buf.len() {
        return Err(WireError::Truncated);
    }
    let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
    let qclass = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);

    Ok(Message {
        id,
        recursion_desired: flags & 0x0100 != 0,
        rcode: (flags & 0x000F) as u8,
        question: Question { name, qtype, qclass },
        answers: Vec::new(),
    })
}

/// Parse a full response (used for upstream PTR lookups).
pub fn parse_response(buf: &[u8]) -> Result<Message, WireError> {
    if buf.len() < HEADER_LEN {
        return Err(WireError::Truncated);
    }
    let id = u16::from_be_bytes([buf[0], buf[1]]);
    let flags = u16::from_be_bytes([buf[2], buf[3]]);
    let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
    let ancount = u16::from_be_bytes([buf[6], buf[7]]);

    let mut pos = HEADER_LEN;
    let mut question = None;
    for _ in 0..qdcount {
        let name = read_name(buf, &mut pos)?;
        if pos + 4 > buf.len() {
            return Err(WireError::Truncated);
        }
        let qtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let qclass = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
        pos += 4;
        question.get_or_insert(Question { name, qtype, qclass });
    }
    let question = question.ok_or(WireError::NoQuestion)?;

    let mut answers = Vec::new();
    for _ in 0..ancount {
        let name = read_name(buf, &mut pos)?;
        if pos + 10 > buf.len() {
            return Err(WireError::Truncated);
        }
        let rtype = u16::from_be_bytes([buf[pos], buf[pos + 1]]);
        let ttl = u32::from_be_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]);
        let rdlen = u16::from_be_bytes([buf[pos + 8], buf[pos + 9]]) as usize;
        pos += 10;
        if pos + rdlen > buf.len() {
            return Err(WireError::Truncated);
        }
        let rdata = parse_rdata(buf, pos, rdlen, rtype)?;
        pos += rdlen;
        answers.push(Record { name, rtype, ttl, rdata });
    }

    Ok(Message {
        id,
        recursion_desired: flags & 0x0100 != 0,
        rcode: (flags & 0x000F) as u8,
        question,
        answers,
    })
}

fn parse_rdata(buf: &[u8], pos: usize, rdlen: usize, rtype: u16) -> Result<RData, WireError> {
    let slice = &buf[pos..pos + rdlen];
    Ok(match rtype {
        TYPE_A if rdlen == 4 => RData::A(Ipv4Addr::new(slice[0], slice[1], slice[2], slice[3])),
        TYPE_AAAA if rdlen == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(slice);
            RData::Aaaa(Ipv6Addr::from(octets))
        }
        TYPE_PTR | TYPE_CNAME | TYPE_NS => {
            let mut name_pos = pos;
            let name = read_name(buf, &mut name_pos)?;
            match rtype {
                TYPE_PTR => RData::Ptr(name),
                TYPE_CNAME => RData::Cname(name),
                _ => RData::Ns(name),
            }
        }
        _ => RData::Other(slice.to_vec()),
    })
}

/// Read a (possibly compressed) name, advancing `pos` past its in-place
/// encoding.
fn read_name(buf: &[u8], pos: &mut usize) -> Result<String, WireError> {
    let mut labels: Vec<String> = Vec::new();
    let mut cursor = *pos;
    let mut jumped = false;
    let mut hops = 0;

    loop {
        let len = *buf.get(cursor).ok_or(WireError::Truncated)? as usize;
        if len & 0xC0 == 0xC0 {
            let next = *buf.get(cursor + 1).ok_or(WireError::Truncated)? as usize;
            if !jumped {
                *pos = cursor + 2;
                jumped = true;
            }
            cursor = ((len & 0x3F) << 8) | next;
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(WireError::BadName);
            }
            continue;
        }
        if len == 0 {
            if !jumped {
                *pos = cursor + 1;
            }
            break;
        }
        if len > 63 || cursor + 1 + len > buf.len() {
            return Err(WireError::BadName);
        }
        let label = &buf[cursor + 1..cursor + 1 + len];
        labels.push(String::from_utf8_lossy(label).to_lowercase());
        cursor += 1 + len;
    }

    Ok(labels.join("."))
}

// ── encoding ────────────────────────────────────────────────────

/// Encode a response to `query`. The question is echoed; answer and
/// authority owner names equal to the question name compress to a pointer
/// at the question offset.
pub fn encode_response(
    query: &Message,
    rcode: u8,
    answers: &[Record],
    authority: &[Record],
) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(512);
    let mut flags: u16 = 0x8000 | 0x0400; // QR + AA
    if query.recursion_desired {
        flags |= 0x0100;
    }
    flags |= rcode as u16 & 0x000F;

    buf.put_u16(query.id);
    buf.put_u16(flags);
    buf.put_u16(1);
    buf.put_u16(answers.len() as u16);
    buf.put_u16(authority.len() as u16);
    buf.put_u16(0);

    let qname_offset = buf.len() as u16;
    write_name(&mut buf, &query.question.name);
    buf.put_u16(query.question.qtype);
    buf.put_u16(query.question.qclass);

    for record in answers.iter().chain(authority) {
        if record.name.eq_ignore_ascii_case(&query.question.name) {
            buf.put_u16(0xC000 | qname_offset);
        } else {
            write_name(&mut buf, &record.name);
        }
        buf.put_u16(record.rtype);
        buf.put_u16(CLASS_IN);
        buf.put_u32(record.ttl);
        write_rdata(&mut buf, &record.rdata);
    }

    buf.to_vec()
}

/// Encode a recursive query (for upstream lookups).
pub fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(64);
    buf.put_u16(id);
    buf.put_u16(0x0100); // RD
    buf.put_u16(1);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    write_name(&mut buf, name);
    buf.put_u16(qtype);
    buf.put_u16(CLASS_IN);
    buf.to_vec()
}

fn write_name(buf: &mut BytesMut, name: &str) {
    for label in name.split('.').filter(|l| !l.is_empty()) {
        let bytes = label.as_bytes();
        let len = bytes.len().min(63);
        buf.put_u8(len as u8);
        buf.put_slice(&bytes[..len]);
    }
    buf.put_u8(0);
}

fn write_rdata(buf: &mut BytesMut, rdata: &RData) {
    let start = buf.len();
    buf.put_u16(0); // placeholder length
    match rdata {
        RData::A(addr) => buf.put_slice(&addr.octets()),
        RData::Aaaa(addr) => buf.put_slice(&addr.octets()),
        RData::Cname(name) | RData::Ns(name) | RData::Ptr(name) => write_name(buf, name),
        RData::Mx { preference, exchange } => {
            buf.put_u16(*preference);
            write_name(buf, exchange);
        }
        RData::Txt(text) => {
            // Character strings cap at 255 bytes each.
            for chunk in text.as_bytes().chunks(255) {
                buf.put_u8(chunk.len() as u8);
                buf.put_slice(chunk);
            }
        }
        RData::Caa { flags, tag, value } => {
            buf.put_u8(*flags);
            buf.put_u8(tag.len().min(255) as u8);
            buf.put_slice(&tag.as_bytes()[..tag.len().min(255)]);
            buf.put_slice(value.as_bytes());
        }
        RData::Soa { primary, email, serial, refresh, retry, expire, minimum } => {
            write_name(buf, primary);
            write_name(buf, email);
            buf.put_u32(*serial);
            buf.put_u32(*refresh);
            buf.put_u32(*retry);
            buf.put_u32(*expire);
            buf.put_u32(*minimum);
        }
        RData::Other(raw) => buf.put_slice(raw),
    }
    let rdlen = (buf.len() - start - 2) as u16;
    buf[start..start + 2].copy_from_slice(&rdlen.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_for(name: &str, qtype: u16) -> Message {
        Message {
            id: 0x1234,
            recursion_desired: true,
            rcode: 0,
            question: Question { name: name.into(), qtype, qclass: CLASS_IN },
            answers: Vec::new(),
        }
    }

    #[test]
    fn query_roundtrip() {
        let raw = encode_query(0xBEEF, "web.example.com", TYPE_A);
        let parsed = parse_query(&raw).unwrap();
        assert_eq!(parsed.id, 0xBEEF);
        assert!(parsed.recursion_desired);
        assert_eq!(parsed.question.name, "web.example.com");
        assert_eq!(parsed.question.qtype, TYPE_A);
    }

    #[test]
    fn response_roundtrip_with_compression() {
        let query = query_for("web.example.com", TYPE_A);
        let answers = vec![Record {
            name: "web.example.com".into(),
            rtype: TYPE_A,
            ttl: 3600,
            rdata: RData::A(Ipv4Addr::new(5, 6, 7, 8)),
        }];
        let raw = encode_response(&query, RCODE_NOERROR, &answers, &[]);
        let parsed = parse_response(&raw).unwrap();
        assert_eq!(parsed.id, 0x1234);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].name, "web.example.com");
        assert_eq!(parsed.answers[0].rdata, RData::A(Ipv4Addr::new(5, 6, 7, 8)));
        assert_eq!(parsed.answers[0].ttl, 3600);
    }

    #[test]
    fn ptr_answer_parses() {
        let query = query_for("4.3.2.1.in-addr.arpa", TYPE_PTR);
        let answers = vec![Record {
            name: "4.3.2.1.in-addr.arpa".into(),
            rtype: TYPE_PTR,
            ttl: 300,
            rdata: RData::Ptr("mail.example.com".into()),
        }];
        let raw = encode_response(&query, RCODE_NOERROR, &answers, &[]);
        let parsed = parse_response(&raw).unwrap();
        assert_eq!(parsed.answers[0].rdata, RData::Ptr("mail.example.com".into()));
    }

    #[test]
    fn nxdomain_keeps_rcode() {
        let query = query_for("nope.example.com", TYPE_A);
        let raw = encode_response(&query, RCODE_NXDOMAIN, &[], &[]);
        let parsed = parse_response(&raw).unwrap();
        assert_eq!(parsed.rcode, RCODE_NXDOMAIN);
        assert!(parsed.answers.is_empty());
    }

    #[test]
    fn malformed_pointer_loop_rejected() {
        // Header + a name that points at itself.
        let mut raw = vec![0u8; 12];
        raw[5] = 1; // qdcount = 1
        raw.extend_from_slice(&[0xC0, 0x0C]); // pointer to offset 12 (itself)
        raw.extend_from_slice(&[0, 1, 0, 1]);
        assert!(parse_query(&raw).is_err());
    }

    #[test]
    fn truncated_message_rejected() {
        assert!(parse_query(&[0, 1, 2]).is_err());
    }

    #[test]
    fn txt_chunks_long_values() {
        let query = query_for("example.com", TYPE_TXT);
        let long = "x".repeat(300);
        let answers = vec![Record {
            name: "example.com".into(),
            rtype: TYPE_TXT,
            ttl: 100,
            rdata: RData::Txt(long.clone()),
        }];
        let raw = encode_response(&query, RCODE_NOERROR, &answers, &[]);
        // 2 chunks: 255 + 45, each with a length byte.
        let parsed = parse_response(&raw).unwrap();
        match &parsed.answers[0].rdata {
            RData::Other(bytes) => assert_eq!(bytes.len(), 302),
            other => panic!("unexpected rdata {other:?}"),
        }
    }
}
