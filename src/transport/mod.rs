//! Encrypted UDP transport to the tunnel endpoint.
//!
//! Provides the client session (handshake, relay, accounting) and the
//! out-of-band quota query.

pub mod quota;
pub mod session;

use std::io;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::crypto::{Cipher, CryptoError, Units};
use crate::protocol::{Frame, ProtocolError};

pub use quota::query_quota;
pub use session::{SessionConfig, SessionEvent, SessionState, TunnelSession};

/// Receive buffer size; large enough for any UDP datagram.
pub const MAX_DATAGRAM_SIZE: usize = 65536;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("session is not connected")]
    NotConnected,

    #[error("handshake retry budget exhausted")]
    HandshakeExhausted,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("no quota response within {0:?}")]
    QuotaTimeout(Duration),
}

/// Datagram encoding on the tunnel socket.
///
/// A datagram is either one ciphertext or, when length-prefixed, one or
/// more independent units each carrying its own frame.
#[derive(Debug, Clone)]
pub struct Wire {
    cipher: Cipher,
    length_prefixed: bool,
}

impl Wire {
    pub fn new(cipher: Cipher, length_prefixed: bool) -> Self {
        Self {
            cipher,
            length_prefixed,
        }
    }

    /// Encrypt one plaintext into a datagram.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if self.length_prefixed {
            self.cipher.encrypt_all(plaintext)
        } else {
            Ok(self.cipher.encrypt(plaintext))
        }
    }

    pub fn seal_frame(&self, frame: &Frame) -> Result<Vec<u8>, CryptoError> {
        self.seal(&frame.marshal())
    }

    /// Decrypt every plaintext carried by `datagram`.
    pub fn open(&self, datagram: &[u8]) -> Vec<Result<Vec<u8>, CryptoError>> {
        if !self.length_prefixed {
            return vec![self.cipher.decrypt(datagram)];
        }

        let mut units = Units::new(datagram);
        let plaintexts: Vec<_> = units.by_ref().map(|u| self.cipher.decrypt(u)).collect();
        if units.consumed() < datagram.len() {
            debug!(
                trailing = datagram.len() - units.consumed(),
                "dropping incomplete unit"
            );
        }
        plaintexts
    }

    /// Frames carried by `datagram`. Undecryptable or unparsable units are
    /// dropped.
    pub fn open_frames(&self, datagram: &[u8]) -> Vec<Frame> {
        self.open(datagram)
            .into_iter()
            .filter_map(|plain| {
                let plain = plain
                    .map_err(|e| debug!(error = %e, "dropping undecryptable unit"))
                    .ok()?;
                Frame::unmarshal(&plain)
                    .map(|(frame, _)| frame)
                    .map_err(|e| debug!(error = %e, "dropping malformed frame"))
                    .ok()
            })
            .collect()
    }
}
