//! Protection of cache entries stored outside the process.
//!
//! Per-token keys are derived from the operator secret with HMAC-SHA384 over
//! the token and the strategy name, so the same token always lands on the
//! same cache key and the two strategies never share key material. The
//! 48-byte output is split into three 16-byte keys:
//!
//! | bytes  | use                                  |
//! |--------|--------------------------------------|
//! | 0..16  | encryption key (`ENCRYPT` only)      |
//! | 16..32 | cache key material                   |
//! | 32..48 | MAC key                              |
//!
//! A protected blob is `base64(HMAC-SHA384(mac_key, data)) || data`, where
//! `data` is the serialized entry (`MAC`) or a Fernet token over it
//! (`ENCRYPT`). Fernet is itself AES-CBC plus HMAC; the outer MAC is checked
//! first so tampering never reaches the decryptor.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use hmac::{KeyInit, Mac};
use sha2::Sha384;
use subtle::ConstantTimeEq;

use crate::{Error, Result};

type HmacSha384 = hmac::Hmac<Sha384>;

/// Length of the base64 encoded HMAC-SHA384 prefix
const MAC_PREFIX_LEN: usize = 64;

/// How cache entries are protected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionStrategy {
    /// Integrity only
    Mac,
    /// Confidentiality and integrity
    Encrypt,
}

impl ProtectionStrategy {
    /// Parse `memcache_security_strategy`; `None`/empty means cleartext
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
            return Ok(None);
        }
        if trimmed.eq_ignore_ascii_case("mac") {
            Ok(Some(Self::Mac))
        } else if trimmed.eq_ignore_ascii_case("encrypt") {
            Ok(Some(Self::Encrypt))
        } else {
            Err(Error::Config(format!(
                "memcache_security_strategy must be MAC or ENCRYPT, got {raw}"
            )))
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Mac => "MAC",
            Self::Encrypt => "ENCRYPT",
        }
    }
}

/// Failed to protect or unprotect a cache blob.
///
/// Never leaves the cache layer: every variant is a cache miss.
#[derive(Debug, thiserror::Error)]
pub enum ProtectionError {
    /// Blob shorter than its MAC prefix
    #[error("protected blob truncated")]
    Truncated,
    /// MAC mismatch
    #[error("cache entry failed integrity check")]
    Integrity,
    /// Fernet rejected the ciphertext
    #[error("cache entry could not be decrypted")]
    Decrypt,
    /// Key material could not be used
    #[error("invalid key material")]
    Key,
}

/// Keys derived for one token
#[derive(Clone)]
pub struct DerivedKeys {
    strategy: ProtectionStrategy,
    encryption_key: [u8; 16],
    cache_key: [u8; 16],
    mac_key: [u8; 16],
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

fn hmac_sha384(key: &[u8], parts: &[&[u8]]) -> std::result::Result<Vec<u8>, ProtectionError> {
    let mut mac = HmacSha384::new_from_slice(key).map_err(|_| ProtectionError::Key)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Derive the per-token keys
pub fn derive_keys(
    token: &str,
    secret: &[u8],
    strategy: ProtectionStrategy,
) -> std::result::Result<DerivedKeys, ProtectionError> {
    let digest = hmac_sha384(secret, &[token.as_bytes(), strategy.as_str().as_bytes()])?;
    let mut keys = DerivedKeys {
        strategy,
        encryption_key: [0; 16],
        cache_key: [0; 16],
        mac_key: [0; 16],
    };
    keys.encryption_key.copy_from_slice(&digest[0..16]);
    keys.cache_key.copy_from_slice(&digest[16..32]);
    keys.mac_key.copy_from_slice(&digest[32..48]);
    Ok(keys)
}

impl DerivedKeys {
    /// Hex form of the cache key material
    #[must_use]
    pub fn cache_key_hex(&self) -> String {
        hex::encode(self.cache_key)
    }

    fn fernet(&self) -> std::result::Result<fernet::Fernet, ProtectionError> {
        let mut raw = [0u8; 32];
        raw[..16].copy_from_slice(&self.mac_key);
        raw[16..].copy_from_slice(&self.encryption_key);
        fernet::Fernet::new(&URL_SAFE.encode(raw)).ok_or(ProtectionError::Key)
    }

    fn sign(&self, data: &[u8]) -> std::result::Result<String, ProtectionError> {
        Ok(STANDARD.encode(hmac_sha384(&self.mac_key, &[data])?))
    }

    /// Protect a serialized entry
    pub fn protect(&self, plaintext: &[u8]) -> std::result::Result<Vec<u8>, ProtectionError> {
        let data = match self.strategy {
            ProtectionStrategy::Mac => plaintext.to_vec(),
            ProtectionStrategy::Encrypt => self.fernet()?.encrypt(plaintext).into_bytes(),
        };
        let mut blob = self.sign(&data)?.into_bytes();
        blob.extend_from_slice(&data);
        Ok(blob)
    }

    /// Verify and recover a serialized entry
    pub fn unprotect(&self, blob: &[u8]) -> std::result::Result<Vec<u8>, ProtectionError> {
        if blob.len() < MAC_PREFIX_LEN {
            return Err(ProtectionError::Truncated);
        }
        let (received, data) = blob.split_at(MAC_PREFIX_LEN);
        let expected = self.sign(data)?;
        if !bool::from(expected.as_bytes().ct_eq(received)) {
            return Err(ProtectionError::Integrity);
        }
        match self.strategy {
            ProtectionStrategy::Mac => Ok(data.to_vec()),
            ProtectionStrategy::Encrypt => {
                let token = std::str::from_utf8(data).map_err(|_| ProtectionError::Decrypt)?;
                self.fernet()?
                    .decrypt(token)
                    .map_err(|_| ProtectionError::Decrypt)
            }
        }
    }
}
