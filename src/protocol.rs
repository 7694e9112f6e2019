//! Tagged tunnel wire protocol.
//!
//! Every plaintext begins with a one-byte tag followed by a fixed layout:
//!
//! | Tag    | Frame           | Payload                                  |
//! |--------|-----------------|------------------------------------------|
//! | `0x01` | ClientHandshake | 32-byte identification                   |
//! | `0x02` | ServerHandshake | tunnel IPv4, gateway IPv4, optional port |
//! | `0x03` | ClientData      | 32-byte identification + payload         |
//! | `0x04` | ServerData      | payload                                  |
//!
//! The whole plaintext is encrypted before it leaves the host.

use std::fmt;
use std::net::Ipv4Addr;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const TAG_CLIENT_HANDSHAKE: u8 = 0x01;
pub const TAG_SERVER_HANDSHAKE: u8 = 0x02;
pub const TAG_CLIENT_DATA: u8 = 0x03;
pub const TAG_SERVER_DATA: u8 = 0x04;

/// Tag of the out-of-band quota query. Shares its value with ServerHandshake;
/// the two never travel in the same direction.
pub const TAG_QUOTA_QUERY: u8 = 0x02;

pub const IDENTIFICATION_LEN: usize = 32;
const SERVER_HANDSHAKE_LEN: usize = 8;
const DATA_PORT_LEN: usize = 2;
const QUOTA_RESPONSE_LEN: usize = 5;

/// Errors from parsing a plaintext frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("unknown tag {0:#04x}")]
    UnknownTag(u8),

    #[error("frame with tag {tag:#04x} needs {needed} bytes, got {got}")]
    ShortBuffer { tag: u8, needed: usize, got: usize },
}

/// 32-byte token identifying the user to the remote endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identification([u8; IDENTIFICATION_LEN]);

impl Identification {
    /// Digest a user-supplied name into an identification token.
    pub fn from_name(name: &str) -> Self {
        Self(Sha256::digest(name.as_bytes()).into())
    }

    pub fn from_bytes(bytes: [u8; IDENTIFICATION_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IDENTIFICATION_LEN] {
        &self.0
    }

    fn read(buf: &[u8]) -> Option<Self> {
        buf.get(..IDENTIFICATION_LEN)?.try_into().ok().map(Self)
    }
}

impl fmt::Debug for Identification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identification(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "..)")
    }
}

/// One plaintext frame of the tunnel protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    ClientHandshake {
        identification: Identification,
    },
    ServerHandshake {
        tunnel_ip: Ipv4Addr,
        gateway: Ipv4Addr,
        /// Port the remote wants data sent to, when it differs from the
        /// handshake port.
        data_port: Option<u16>,
    },
    ClientData {
        identification: Identification,
        payload: Vec<u8>,
    },
    ServerData {
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::ClientHandshake { .. } => TAG_CLIENT_HANDSHAKE,
            Frame::ServerHandshake { .. } => TAG_SERVER_HANDSHAKE,
            Frame::ClientData { .. } => TAG_CLIENT_DATA,
            Frame::ServerData { .. } => TAG_SERVER_DATA,
        }
    }

    /// Encode the frame to its plaintext wire form.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + IDENTIFICATION_LEN + self.payload_len());
        out.push(self.tag());
        match self {
            Frame::ClientHandshake { identification } => {
                out.extend_from_slice(identification.as_bytes());
            }
            Frame::ServerHandshake {
                tunnel_ip,
                gateway,
                data_port,
            } => {
                out.extend_from_slice(&tunnel_ip.octets());
                out.extend_from_slice(&gateway.octets());
                if let Some(port) = data_port {
                    out.extend_from_slice(&port.to_be_bytes());
                }
            }
            Frame::ClientData {
                identification,
                payload,
            } => {
                out.extend_from_slice(identification.as_bytes());
                out.extend_from_slice(payload);
            }
            Frame::ServerData { payload } => {
                out.extend_from_slice(payload);
            }
        }
        out
    }

    /// Decode a plaintext frame.
    ///
    /// Returns the frame and the number of bytes it covers. Any frame that
    /// would consist of the tag byte alone is rejected, including a
    /// ServerData frame with an empty payload.
    pub fn unmarshal(buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
        let (&tag, body) = buf.split_first().ok_or(ProtocolError::Empty)?;
        let short = |needed: usize| ProtocolError::ShortBuffer {
            tag,
            needed: needed + 1,
            got: buf.len(),
        };

        match tag {
            TAG_CLIENT_HANDSHAKE => {
                let identification =
                    Identification::read(body).ok_or_else(|| short(IDENTIFICATION_LEN))?;
                Ok((
                    Frame::ClientHandshake { identification },
                    1 + IDENTIFICATION_LEN,
                ))
            }
            TAG_SERVER_HANDSHAKE => {
                if body.len() < SERVER_HANDSHAKE_LEN {
                    return Err(short(SERVER_HANDSHAKE_LEN));
                }
                let tunnel_ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let gateway = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
                let data_port = body
                    .get(SERVER_HANDSHAKE_LEN..SERVER_HANDSHAKE_LEN + DATA_PORT_LEN)
                    .map(|p| u16::from_be_bytes([p[0], p[1]]));
                let consumed = 1
                    + SERVER_HANDSHAKE_LEN
                    + if data_port.is_some() { DATA_PORT_LEN } else { 0 };
                Ok((
                    Frame::ServerHandshake {
                        tunnel_ip,
                        gateway,
                        data_port,
                    },
                    consumed,
                ))
            }
            TAG_CLIENT_DATA => {
                let identification =
                    Identification::read(body).ok_or_else(|| short(IDENTIFICATION_LEN))?;
                Ok((
                    Frame::ClientData {
                        identification,
                        payload: body[IDENTIFICATION_LEN..].to_vec(),
                    },
                    buf.len(),
                ))
            }
            TAG_SERVER_DATA => {
                if body.is_empty() {
                    return Err(short(1));
                }
                Ok((
                    Frame::ServerData {
                        payload: body.to_vec(),
                    },
                    buf.len(),
                ))
            }
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::ClientData { payload, .. } | Frame::ServerData { payload } => payload.len(),
            _ => SERVER_HANDSHAKE_LEN + DATA_PORT_LEN,
        }
    }
}

/// Plaintext of an out-of-band quota query.
pub fn quota_request(identification: &Identification) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + IDENTIFICATION_LEN);
    out.push(TAG_QUOTA_QUERY);
    out.extend_from_slice(identification.as_bytes());
    out
}

/// Parse a quota response: any tag byte followed by a big-endian remaining quota.
pub fn parse_quota_response(buf: &[u8]) -> Result<u32, ProtocolError> {
    match buf {
        [] => Err(ProtocolError::Empty),
        [_, a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        [tag, ..] => Err(ProtocolError::ShortBuffer {
            tag: *tag,
            needed: QUOTA_RESPONSE_LEN,
            got: buf.len(),
        }),
    }
}
