//! Key material resolution.
//!
//! A key arrives from a file, an environment variable, or an interactive
//! passphrase. Raw 32-byte values (binary or base64) are used directly;
//! anything else is treated as a passphrase and run through
//! PBKDF2-HMAC-SHA256 with a per-file random salt. Which source was used is
//! never recorded; the derived-vs-raw mode is implied by the header salt.

use crate::error::{Result, SafedumpError};
use base64::Engine as _;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use std::path::PathBuf;

use super::SALT_LEN;

/// PBKDF2 iteration count for passphrase-derived keys.
pub const PBKDF2_ITERATIONS: u32 = 600_000;

pub const KEY_LEN: usize = 32;

/// Where key material comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    File(PathBuf),
    Env(String),
    Passphrase(String),
}

impl KeySource {
    /// Read the raw material bytes for this source.
    pub fn material(&self) -> Result<Vec<u8>> {
        match self {
            KeySource::File(path) => std::fs::read(path).map_err(|e| {
                SafedumpError::Crypto(format!("cannot read key file {}: {}", path.display(), e))
            }),
            KeySource::Env(var) => std::env::var(var)
                .map(|v| v.into_bytes())
                .map_err(|_| SafedumpError::Crypto(format!("key variable {} not set", var))),
            KeySource::Passphrase(p) => Ok(p.as_bytes().to_vec()),
        }
    }
}

/// How the 32-byte key was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Raw 32-byte key (binary or base64); header salt stays zero.
    Raw,
    /// PBKDF2-derived from a passphrase; salt recorded in the header.
    Derived,
}

/// Turn key material into a 32-byte key. Raw binary and base64-encoded
/// 32-byte keys bypass derivation.
pub fn resolve_key(material: &[u8], salt: &[u8; SALT_LEN]) -> (Box<[u8; KEY_LEN]>, KeyMode) {
    let trimmed: &[u8] = {
        let mut m = material;
        while let [rest @ .., last] = m {
            if last.is_ascii_whitespace() {
                m = rest;
            } else {
                break;
            }
        }
        m
    };

    if trimmed.len() == KEY_LEN {
        let mut key = Box::new([0u8; KEY_LEN]);
        key.copy_from_slice(trimmed);
        return (key, KeyMode::Raw);
    }

    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
        if decoded.len() == KEY_LEN {
            let mut key = Box::new([0u8; KEY_LEN]);
            key.copy_from_slice(&decoded);
            return (key, KeyMode::Raw);
        }
    }

    let mut key = Box::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(trimmed, salt, PBKDF2_ITERATIONS, key.as_mut());
    (key, KeyMode::Derived)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_binary_key_bypasses_kdf() {
        let material = [0x42u8; KEY_LEN];
        let (key, mode) = resolve_key(&material, &[0u8; SALT_LEN]);
        assert_eq!(mode, KeyMode::Raw);
        assert_eq!(*key, material);
    }

    #[test]
    fn test_base64_key_bypasses_kdf() {
        let raw = [0x17u8; KEY_LEN];
        let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
        // Key files commonly end with a newline
        let material = format!("{}\n", encoded);
        let (key, mode) = resolve_key(material.as_bytes(), &[0u8; SALT_LEN]);
        assert_eq!(mode, KeyMode::Raw);
        assert_eq!(*key, raw);
    }

    #[test]
    fn test_passphrase_is_derived_and_salt_sensitive() {
        let (k1, mode) = resolve_key(b"correct horse battery staple", &[1u8; SALT_LEN]);
        assert_eq!(mode, KeyMode::Derived);
        let (k2, _) = resolve_key(b"correct horse battery staple", &[2u8; SALT_LEN]);
        assert_ne!(*k1, *k2);
        // Deterministic for the same salt
        let (k3, _) = resolve_key(b"correct horse battery staple", &[1u8; SALT_LEN]);
        assert_eq!(*k1, *k3);
    }

    #[test]
    fn test_env_source() {
        std::env::set_var("SAFEDUMP_TEST_KEY", "some passphrase");
        let material = KeySource::Env("SAFEDUMP_TEST_KEY".to_string())
            .material()
            .unwrap();
        assert_eq!(material, b"some passphrase");
        assert!(KeySource::Env("SAFEDUMP_TEST_KEY_MISSING".to_string())
            .material()
            .is_err());
    }
}
