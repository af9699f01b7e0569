//! Authenticated streaming encryption for backup payloads.
//!
//! On-disk layout: a fixed 76-byte header followed by ciphertext framed in
//! independently authenticated chunks.
//!
//! | offset | size | field                              |
//! |--------|------|------------------------------------|
//! | 0      | 16   | magic                              |
//! | 16     | 16   | algorithm identifier               |
//! | 32     | 12   | base nonce                         |
//! | 44     | 32   | KDF salt (all-zero for raw keys)   |
//! | 76     | ...  | framed ciphertext                  |
//!
//! Each frame is a 4-byte big-endian ciphertext length followed by the
//! AES-256-GCM ciphertext (plaintext + 16-byte tag). The chunk index and a
//! final-chunk flag form the associated data, so reordering or truncating
//! chunks fails authentication.

pub mod keys;
pub mod stream;

pub use keys::{resolve_key, KeyMode, KeySource, PBKDF2_ITERATIONS};
pub use stream::{DecryptingReader, EncryptingReader};

use crate::error::{Result, SafedumpError};

/// File magic; the first 16 bytes of every encrypted artifact.
pub const MAGIC: [u8; 16] = *b"SAFEDUMP-ENCv1\0\0";

/// Algorithm identifier stored at offset 16.
pub const ALGORITHM_ID: [u8; 16] = *b"AES-256-GCM\0\0\0\0\0";

pub const HEADER_LEN: usize = 76;
pub const NONCE_LEN: usize = 12;
pub const SALT_LEN: usize = 32;

/// Plaintext bytes per encrypted chunk.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// GCM authentication tag length.
pub const TAG_LEN: usize = 16;

/// Parsed encryption header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub nonce: [u8; NONCE_LEN],
    pub salt: [u8; SALT_LEN],
}

impl Header {
    pub fn new(nonce: [u8; NONCE_LEN], salt: [u8; SALT_LEN]) -> Self {
        Self { nonce, salt }
    }

    /// True when the salt is all zero, meaning a raw key was supplied and
    /// no derivation is needed.
    pub fn raw_key(&self) -> bool {
        self.salt.iter().all(|&b| b == 0)
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..16].copy_from_slice(&MAGIC);
        out[16..32].copy_from_slice(&ALGORITHM_ID);
        out[32..44].copy_from_slice(&self.nonce);
        out[44..76].copy_from_slice(&self.salt);
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SafedumpError::Crypto("header truncated".to_string()));
        }
        if bytes[0..16] != MAGIC {
            return Err(SafedumpError::Crypto("bad magic".to_string()));
        }
        if bytes[16..32] != ALGORITHM_ID {
            return Err(SafedumpError::Crypto(
                "unsupported algorithm identifier".to_string(),
            ));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[32..44]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[44..76]);
        Ok(Self { nonce, salt })
    }
}

/// Auto-detect: does a payload start with the encryption magic?
pub fn is_encrypted(first_bytes: &[u8]) -> bool {
    first_bytes.len() >= MAGIC.len() && first_bytes[..MAGIC.len()] == MAGIC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = Header::new([7u8; NONCE_LEN], [9u8; SALT_LEN]);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        assert_eq!(Header::parse(&encoded).unwrap(), header);
        assert!(!header.raw_key());
    }

    #[test]
    fn test_zero_salt_means_raw_key() {
        let header = Header::new([1u8; NONCE_LEN], [0u8; SALT_LEN]);
        assert!(header.raw_key());
    }

    #[test]
    fn test_parse_rejects_wrong_magic() {
        let mut bytes = Header::new([0u8; NONCE_LEN], [0u8; SALT_LEN]).encode();
        bytes[0] ^= 0xff;
        assert!(Header::parse(&bytes).is_err());
    }

    #[test]
    fn test_is_encrypted_detection() {
        assert!(is_encrypted(&MAGIC));
        assert!(!is_encrypted(b"PGDMP")); // pg_dump custom format magic
        assert!(!is_encrypted(&MAGIC[..8]));
    }
}
