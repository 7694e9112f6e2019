//! Symmetric encryption of tunnel frames.
//!
//! Two schemes share one key, derived from the shared secret with SHA-256:
//!
//! - **Block**: AES-256 in 8-bit CFB mode. The plaintext is padded to a
//!   multiple of 32 bytes (PKCS#7 style, every pad byte holds the pad
//!   length) and a fresh 16-byte IV is prepended.
//! - **Stream**: ChaCha20 with a fresh 8-byte nonce prepended. No padding.
//!
//! The scheme is chosen by configuration; nothing on the wire identifies it.

use std::fmt;

use aes::Aes256;
use aes::cipher::{AsyncStreamCipher, KeyIvInit, StreamCipher};
use chacha20::ChaCha20Legacy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 16;
pub const NONCE_LEN: usize = 8;
pub const PAD_LEN: usize = 32;

/// Length prefix of one unit produced by [`Cipher::encrypt_all`].
pub const UNIT_PREFIX_LEN: usize = 2;

type Aes256Cfb8Enc = cfb8::Encryptor<Aes256>;
type Aes256Cfb8Dec = cfb8::Decryptor<Aes256>;

/// Errors from decrypting or framing ciphertext.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid padding")]
    Padding,

    #[error("ciphertext truncated: {len} bytes")]
    Truncated { len: usize },

    #[error("encrypted unit of {len} bytes does not fit a 16-bit length prefix")]
    TooLarge { len: usize },
}

/// Which scheme a [`Cipher`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherKind {
    #[default]
    Block,
    Stream,
}

/// Derive the session key from a shared secret.
pub fn derive_key(secret: &[u8]) -> [u8; KEY_LEN] {
    Sha256::digest(secret).into()
}

/// Encrypts and decrypts opaque buffers with a key derived once per session.
#[derive(Clone)]
pub struct Cipher {
    kind: CipherKind,
    key: [u8; KEY_LEN],
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn new(kind: CipherKind, secret: &[u8]) -> Self {
        Self {
            kind,
            key: derive_key(secret),
        }
    }

    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Encrypt `plaintext` with a fresh IV or nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        match self.kind {
            CipherKind::Block => {
                let iv: [u8; IV_LEN] = rand::random();
                let mut out = Vec::with_capacity(IV_LEN + plaintext.len() + PAD_LEN);
                out.extend_from_slice(&iv);
                out.extend_from_slice(plaintext);
                pad(&mut out, IV_LEN, PAD_LEN);
                Aes256Cfb8Enc::new(&self.key.into(), &iv.into()).encrypt(&mut out[IV_LEN..]);
                out
            }
            CipherKind::Stream => {
                let nonce: [u8; NONCE_LEN] = rand::random();
                let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(plaintext);
                ChaCha20Legacy::new(&self.key.into(), &nonce.into())
                    .apply_keystream(&mut out[NONCE_LEN..]);
                out
            }
        }
    }

    /// Decrypt a buffer produced by [`Cipher::encrypt`].
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self.kind {
            CipherKind::Block => {
                if ciphertext.len() < IV_LEN {
                    return Err(CryptoError::Truncated {
                        len: ciphertext.len(),
                    });
                }
                let (iv, body) = ciphertext.split_at(IV_LEN);
                let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::Truncated {
                    len: ciphertext.len(),
                })?;
                let mut plain = body.to_vec();
                Aes256Cfb8Dec::new(&self.key.into(), &iv.into()).decrypt(&mut plain);
                unpad(&mut plain, PAD_LEN)?;
                Ok(plain)
            }
            CipherKind::Stream => {
                if ciphertext.len() < NONCE_LEN {
                    return Err(CryptoError::Truncated {
                        len: ciphertext.len(),
                    });
                }
                let (nonce, body) = ciphertext.split_at(NONCE_LEN);
                let nonce: [u8; NONCE_LEN] =
                    nonce.try_into().map_err(|_| CryptoError::Truncated {
                        len: ciphertext.len(),
                    })?;
                let mut plain = body.to_vec();
                ChaCha20Legacy::new(&self.key.into(), &nonce.into()).apply_keystream(&mut plain);
                Ok(plain)
            }
        }
    }

    /// Encrypt `plaintext` as one unit prefixed with its 2-byte big-endian length.
    pub fn encrypt_all(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let unit = self.encrypt(plaintext);
        let len =
            u16::try_from(unit.len()).map_err(|_| CryptoError::TooLarge { len: unit.len() })?;

        let mut out = Vec::with_capacity(UNIT_PREFIX_LEN + unit.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&unit);
        Ok(out)
    }

    /// Decrypt consecutive length-prefixed units.
    ///
    /// Returns the concatenated plaintext and the number of input bytes
    /// consumed. A truncated trailing unit is left unconsumed without error;
    /// the caller should wait for more data.
    pub fn decrypt_all(&self, buf: &[u8]) -> Result<(Vec<u8>, usize), CryptoError> {
        let mut plain = Vec::new();
        let mut units = Units::new(buf);
        for unit in &mut units {
            plain.extend_from_slice(&self.decrypt(unit)?);
        }
        Ok((plain, units.consumed()))
    }
}

/// Iterator over the complete length-prefixed units at the front of a buffer.
pub struct Units<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Units<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes covered by the units yielded so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }
}

impl<'a> Iterator for Units<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.pos..];
        if rest.len() < UNIT_PREFIX_LEN {
            return None;
        }
        let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
        let unit = rest.get(UNIT_PREFIX_LEN..UNIT_PREFIX_LEN + len)?;
        self.pos += UNIT_PREFIX_LEN + len;
        Some(unit)
    }
}

/// Pad the bytes of `buf` after `start` to a multiple of `block`.
fn pad(buf: &mut Vec<u8>, start: usize, block: usize) {
    let n = block - (buf.len() - start) % block;
    buf.resize(buf.len() + n, n as u8);
}

fn unpad(buf: &mut Vec<u8>, block: usize) -> Result<(), CryptoError> {
    if buf.is_empty() || buf.len() % block != 0 {
        return Err(CryptoError::Padding);
    }
    let n = buf[buf.len() - 1] as usize;
    if n == 0 || n > block || buf[buf.len() - n..].iter().any(|&b| b as usize != n) {
        return Err(CryptoError::Padding);
    }
    buf.truncate(buf.len() - n);
    Ok(())
}
