//! DNS message parsing and construction.
//!
//! Messages are handled both on their own (for upstream resolution) and
//! embedded in raw IPv4/UDP datagrams read from the virtual device, where
//! answers are replaced and the IP and UDP checksums recomputed.

use std::net::{Ipv4Addr, SocketAddrV4};

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::checksum::{internet_checksum, udp_checksum};

const HEADER_LEN: usize = 12;
const IPV4_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const IPPROTO_UDP: u8 = 17;

pub const DNS_PORT: u16 = 53;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_ANY: u16 = 255;
pub const CLASS_IN: u16 = 1;

const FLAG_QR: u16 = 0x8000;
const FLAG_AA: u16 = 0x0400;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;
const OPCODE_MASK: u16 = 0x7800;

/// Compression pointers followed while reading one name.
const MAX_POINTER_JUMPS: usize = 16;
const MAX_NAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_CNAME_CHAIN: usize = 16;

/// TTL of answers written by [`rewrite_with_fresh_answers`].
const FRESH_ANSWER_TTL: u32 = 300;

/// Resolved IPv4 addresses keyed by lowercase queried name.
pub type AnswerMap = FxHashMap<String, Vec<Ipv4Addr>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DnsError {
    #[error("not an IPv4 packet")]
    NotIpv4,

    #[error("not a UDP packet")]
    NotUdp,

    #[error("packet truncated")]
    Truncated,

    #[error("malformed domain name")]
    MalformedName,

    #[error("message too large to encode")]
    TooLarge,
}

/// A DNS question section entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// Record data the engine understands; everything else is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Cname(String),
    Other(Vec<u8>),
}

/// A DNS resource record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: RData,
}

impl DnsRecord {
    pub fn a(name: &str, ttl: u32, addr: Ipv4Addr) -> Self {
        Self {
            name: name.to_string(),
            rtype: TYPE_A,
            class: CLASS_IN,
            ttl,
            rdata: RData::A(addr),
        }
    }
}

/// A parsed DNS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
    pub authority: Vec<DnsRecord>,
    pub additional: Vec<DnsRecord>,
}

impl DnsMessage {
    /// Build a recursive query for the A records of `name`.
    pub fn query(id: u16, name: &str) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            questions: vec![DnsQuestion {
                name: name.to_string(),
                qtype: TYPE_A,
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// Parse a DNS message from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self, DnsError> {
        if data.len() < HEADER_LEN {
            return Err(DnsError::Truncated);
        }

        let mut reader = Reader::new(data);
        let id = reader.u16()?;
        let flags = reader.u16()?;
        let qdcount = reader.u16()?;
        let ancount = reader.u16()?;
        let nscount = reader.u16()?;
        let arcount = reader.u16()?;

        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let name = reader.name()?;
            let qtype = reader.u16()?;
            let qclass = reader.u16()?;
            questions.push(DnsQuestion {
                name,
                qtype,
                qclass,
            });
        }

        let answers = reader.records(ancount)?;
        let authority = reader.records(nscount)?;
        let additional = reader.records(arcount)?;

        Ok(Self {
            id,
            flags,
            questions,
            answers,
            authority,
            additional,
        })
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    /// Lowercase names of every question.
    pub fn query_names(&self) -> Vec<String> {
        self.questions
            .iter()
            .map(|q| q.name.to_ascii_lowercase())
            .collect()
    }

    /// Addresses `name` resolves to, following CNAME records in the answer
    /// section until the chain ends, then collecting the A records there.
    pub fn resolve_chain(&self, name: &str) -> Vec<Ipv4Addr> {
        let mut target = name;
        for _ in 0..MAX_CNAME_CHAIN {
            let next = self.answers.iter().find_map(|r| match &r.rdata {
                RData::Cname(cname) if r.name.eq_ignore_ascii_case(target) => Some(cname),
                _ => None,
            });
            match next {
                Some(cname) => target = cname,
                None => break,
            }
        }

        self.answers
            .iter()
            .filter_map(|r| match r.rdata {
                RData::A(addr) if r.name.eq_ignore_ascii_case(target) => Some(addr),
                _ => None,
            })
            .collect()
    }

    /// Resolved addresses for every question, keyed by lowercase name.
    pub fn answer_ips(&self) -> AnswerMap {
        let mut map = AnswerMap::default();
        for q in &self.questions {
            let ips = self.resolve_chain(&q.name);
            map.entry(q.name.to_ascii_lowercase())
                .or_insert_with(Vec::new)
                .extend(ips);
        }
        map
    }

    /// Encode the message to wire format bytes.
    ///
    /// Answer names equal to a question name are written as compression
    /// pointers to that question. Records of unknown type are written with
    /// their original rdata.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DnsError> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        for count in [
            self.questions.len(),
            self.answers.len(),
            self.authority.len(),
            self.additional.len(),
        ] {
            let count = u16::try_from(count).map_err(|_| DnsError::TooLarge)?;
            data.extend_from_slice(&count.to_be_bytes());
        }

        // Questions
        let mut question_offsets: Vec<(&str, u16)> = Vec::with_capacity(self.questions.len());
        for q in &self.questions {
            if let Ok(offset) = u16::try_from(data.len()) {
                if offset < 0x4000 {
                    question_offsets.push((q.name.as_str(), offset));
                }
            }
            encode_domain(&mut data, &q.name)?;
            data.extend_from_slice(&q.qtype.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        // Answers, authority, additional
        for record in self
            .answers
            .iter()
            .chain(&self.authority)
            .chain(&self.additional)
        {
            let pointer = question_offsets
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&record.name))
                .map(|(_, offset)| 0xC000 | offset);
            match pointer {
                Some(pointer) => data.extend_from_slice(&pointer.to_be_bytes()),
                None => encode_domain(&mut data, &record.name)?,
            }
            data.extend_from_slice(&record.rtype.to_be_bytes());
            data.extend_from_slice(&record.class.to_be_bytes());
            data.extend_from_slice(&record.ttl.to_be_bytes());

            let rdata = match &record.rdata {
                RData::A(addr) => addr.octets().to_vec(),
                RData::Cname(cname) => {
                    let mut buf = Vec::with_capacity(cname.len() + 2);
                    encode_domain(&mut buf, cname)?;
                    buf
                }
                RData::Other(bytes) => bytes.clone(),
            };
            let rdlength = u16::try_from(rdata.len()).map_err(|_| DnsError::TooLarge)?;
            data.extend_from_slice(&rdlength.to_be_bytes());
            data.extend_from_slice(&rdata);
        }

        Ok(data)
    }
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) -> Result<(), DnsError> {
    let domain = domain.trim_end_matches('.');
    if domain.len() > MAX_NAME_LEN {
        return Err(DnsError::MalformedName);
    }
    if !domain.is_empty() {
        for label in domain.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL_LEN {
                return Err(DnsError::MalformedName);
            }
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
    }
    buf.push(0);
    Ok(())
}

/// Bounds-checked cursor over a DNS message.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DnsError> {
        let slice = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(DnsError::Truncated)?;
        self.pos += len;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, DnsError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DnsError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn name(&mut self) -> Result<String, DnsError> {
        let (name, end) = read_name(self.data, self.pos)?;
        self.pos = end;
        Ok(name)
    }

    fn records(&mut self, count: u16) -> Result<Vec<DnsRecord>, DnsError> {
        let mut records = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = self.name()?;
            let rtype = self.u16()?;
            let class = self.u16()?;
            let ttl = self.u32()?;
            let rdlength = self.u16()? as usize;
            let rdata_start = self.pos;
            let raw = self.bytes(rdlength)?;

            let rdata = match (rtype, class) {
                (TYPE_A, CLASS_IN) if rdlength == 4 => {
                    RData::A(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
                }
                (TYPE_CNAME, CLASS_IN) => RData::Cname(read_name(self.data, rdata_start)?.0),
                _ => RData::Other(raw.to_vec()),
            };

            records.push(DnsRecord {
                name,
                rtype,
                class,
                ttl,
                rdata,
            });
        }
        Ok(records)
    }
}

/// Read a possibly compressed name starting at `start`.
///
/// Returns the dot-joined name and the offset just past the name as it
/// appears at `start`. Pointers are followed iteratively, at most
/// `MAX_POINTER_JUMPS` times.
fn read_name(msg: &[u8], start: usize) -> Result<(String, usize), DnsError> {
    let mut name = String::new();
    let mut pos = start;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = *msg.get(pos).ok_or(DnsError::Truncated)? as usize;
        match len & 0xC0 {
            0xC0 => {
                let low = *msg.get(pos + 1).ok_or(DnsError::Truncated)? as usize;
                end.get_or_insert(pos + 2);
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(DnsError::MalformedName);
                }
                pos = ((len & 0x3F) << 8) | low;
            }
            0x00 if len == 0 => {
                return Ok((name, end.unwrap_or(pos + 1)));
            }
            0x00 => {
                let label = msg
                    .get(pos + 1..pos + 1 + len)
                    .ok_or(DnsError::Truncated)?;
                let label = std::str::from_utf8(label).map_err(|_| DnsError::MalformedName)?;
                if !name.is_empty() {
                    name.push('.');
                }
                name.push_str(label);
                if name.len() > MAX_NAME_LEN {
                    return Err(DnsError::MalformedName);
                }
                pos += 1 + len;
            }
            // 0x40 and 0x80 label types are reserved
            _ => return Err(DnsError::MalformedName),
        }
    }
}

/// An IPv4/UDP datagram split into its parts.
struct UdpDatagram<'a> {
    ip_header: &'a [u8],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    fn parse(packet: &'a [u8]) -> Result<Self, DnsError> {
        let first = *packet.first().ok_or(DnsError::Truncated)?;
        if first >> 4 != 4 {
            return Err(DnsError::NotIpv4);
        }
        if packet.len() < IPV4_MIN_HEADER_LEN {
            return Err(DnsError::Truncated);
        }
        if packet[9] != IPPROTO_UDP {
            return Err(DnsError::NotUdp);
        }

        let header_len = (first & 0x0F) as usize * 4;
        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if header_len < IPV4_MIN_HEADER_LEN
            || total_len < header_len + UDP_HEADER_LEN
            || packet.len() < total_len
        {
            return Err(DnsError::Truncated);
        }

        let udp = &packet[header_len..total_len];
        let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
        if udp_len < UDP_HEADER_LEN || udp_len > udp.len() {
            return Err(DnsError::Truncated);
        }

        let src_ip = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
        let dst_ip = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
        let src_port = u16::from_be_bytes([udp[0], udp[1]]);
        let dst_port = u16::from_be_bytes([udp[2], udp[3]]);

        Ok(Self {
            ip_header: &packet[..header_len],
            src: SocketAddrV4::new(src_ip, src_port),
            dst: SocketAddrV4::new(dst_ip, dst_port),
            payload: &udp[UDP_HEADER_LEN..udp_len],
        })
    }
}

/// A DNS message carried in an IPv4/UDP datagram.
#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub message: DnsMessage,
}

impl DnsPacket {
    /// Parse a datagram whose source or destination port is 53.
    pub fn parse(packet: &[u8]) -> Result<Option<Self>, DnsError> {
        let datagram = UdpDatagram::parse(packet)?;
        if datagram.src.port() != DNS_PORT && datagram.dst.port() != DNS_PORT {
            return Ok(None);
        }
        let message = DnsMessage::parse(datagram.payload)?;
        Ok(Some(Self {
            src: datagram.src,
            dst: datagram.dst,
            message,
        }))
    }
}

/// True if `packet` is an IPv4/UDP datagram to or from port 53 carrying a
/// well-formed DNS message.
pub fn is_dns(packet: &[u8]) -> bool {
    matches!(DnsPacket::parse(packet), Ok(Some(_)))
}

/// Names queried by the DNS message inside `packet`.
pub fn extract_query_names(packet: &[u8]) -> Result<Vec<String>, DnsError> {
    let datagram = UdpDatagram::parse(packet)?;
    Ok(DnsMessage::parse(datagram.payload)?.query_names())
}

/// Addresses each question resolves to, following CNAME chains.
pub fn extract_answer_ips(packet: &[u8]) -> Result<AnswerMap, DnsError> {
    let datagram = UdpDatagram::parse(packet)?;
    Ok(DnsMessage::parse(datagram.payload)?.answer_ips())
}

/// Replace the answers in `packet` with fresh A records and repair lengths
/// and checksums.
///
/// Each A (or ANY) question receives one record per address found under its
/// lowercase name in `answers`; questions without entries get none. The
/// header becomes an authoritative, recursion-available response. With
/// `spoof_as_reply` the IP addresses and UDP ports are swapped, turning an
/// intercepted request into its reply.
pub fn rewrite_with_fresh_answers(
    packet: &[u8],
    answers: &AnswerMap,
    spoof_as_reply: bool,
) -> Result<Vec<u8>, DnsError> {
    let datagram = UdpDatagram::parse(packet)?;
    let mut message = DnsMessage::parse(datagram.payload)?;

    message.flags = (message.flags & (OPCODE_MASK | FLAG_RD)) | FLAG_QR | FLAG_AA | FLAG_RA;
    message.answers = message
        .questions
        .iter()
        .filter(|q| q.qtype == TYPE_A || q.qtype == TYPE_ANY)
        .flat_map(|q| {
            answers
                .get(&q.name.to_ascii_lowercase())
                .into_iter()
                .flatten()
                .map(|addr| DnsRecord::a(&q.name, FRESH_ANSWER_TTL, *addr))
        })
        .collect();
    message.authority.clear();
    message.additional.clear();

    let payload = message.to_bytes()?;
    let (src, dst) = if spoof_as_reply {
        (datagram.dst, datagram.src)
    } else {
        (datagram.src, datagram.dst)
    };
    build_udp_packet(datagram.ip_header, src, dst, &payload)
}

/// Build an IPv4/UDP datagram reusing `ip_header` (options included) as a
/// template, with fresh lengths and checksums.
pub fn build_udp_packet(
    ip_header: &[u8],
    src: SocketAddrV4,
    dst: SocketAddrV4,
    payload: &[u8],
) -> Result<Vec<u8>, DnsError> {
    let header_len = ip_header.len();
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = u16::try_from(header_len + udp_len).map_err(|_| DnsError::TooLarge)?;

    let mut out = Vec::with_capacity(total_len as usize);
    out.extend_from_slice(ip_header);
    out[2..4].copy_from_slice(&total_len.to_be_bytes());
    out[10..12].copy_from_slice(&[0, 0]);
    out[12..16].copy_from_slice(&src.ip().octets());
    out[16..20].copy_from_slice(&dst.ip().octets());
    let ip_checksum = internet_checksum(&out[..header_len]);
    out[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    out.extend_from_slice(&src.port().to_be_bytes());
    out.extend_from_slice(&dst.port().to_be_bytes());
    out.extend_from_slice(&(udp_len as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(payload);
    let checksum = udp_checksum(*src.ip(), *dst.ip(), &out[header_len..]);
    out[header_len + 6..header_len + 8].copy_from_slice(&checksum.to_be_bytes());

    Ok(out)
}

/// Minimal 20-byte IPv4 header template for UDP, used when no captured
/// header is available.
pub fn ipv4_udp_header_template() -> [u8; IPV4_MIN_HEADER_LEN] {
    let mut header = [0u8; IPV4_MIN_HEADER_LEN];
    header[0] = 0x45;
    header[8] = 64; // TTL
    header[9] = IPPROTO_UDP;
    header
}
