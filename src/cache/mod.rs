//! Token validation cache.
//!
//! [`TokenCache`] turns a raw token into a backend key, wraps entries with the
//! configured [`ProtectionStrategy`], and collapses every failure below it
//! (backend I/O, integrity, decode) into [`CacheLookup::Miss`]. Validation
//! must always be able to proceed without the cache.

pub mod backend;
pub mod crypt;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

pub use backend::{CacheBackend, InMemoryBackend, MemcachedBackend};
pub use crypt::{DerivedKeys, ProtectionError, ProtectionStrategy, derive_keys};

use crate::config::{CacheBackendKind, CacheConfig};
use crate::identity::TokenPayload;
use crate::Result;

const KEY_PREFIX: &str = "keystone.token.";

/// Stored form of a validation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CacheEntry {
    /// Token previously confirmed invalid
    Invalid,
    /// Token previously validated
    Valid {
        /// Claims as returned by the identity service
        payload: TokenPayload,
        /// Token expiry, checked again on every read
        expires: DateTime<Utc>,
        /// When the entry was written
        cached_at: DateTime<Utc>,
    },
}

/// Outcome of a cache read
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Nothing usable cached
    Miss,
    /// Cached "confirmed invalid" marker
    Invalid,
    /// Cached valid payload, not yet expired
    Valid {
        /// Claims
        payload: TokenPayload,
        /// When the entry was written
        cached_at: DateTime<Utc>,
    },
}

/// Cache of validation results keyed by token hash
pub struct TokenCache {
    backend: Arc<dyn CacheBackend>,
    protection: Option<(ProtectionStrategy, Vec<u8>)>,
    max_ttl: Duration,
}

struct EntryKey {
    key: String,
    keys: Option<DerivedKeys>,
}

impl TokenCache {
    /// Cache over `backend`; `protection` of `None` stores cleartext
    #[must_use]
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        protection: Option<(ProtectionStrategy, Vec<u8>)>,
        max_ttl: Duration,
    ) -> Self {
        if protection.is_none() {
            debug!("Token cache entries are stored unprotected");
        }
        Self {
            backend,
            protection,
            max_ttl,
        }
    }

    /// Cache described by the `cache` configuration section
    pub fn from_config(config: &CacheConfig, io_timeout: Duration) -> Result<Self> {
        let backend: Arc<dyn CacheBackend> = match config.backend {
            CacheBackendKind::Memory => Arc::new(InMemoryBackend::new(config.max_entries)),
            CacheBackendKind::Memcached => {
                Arc::new(MemcachedBackend::new(&config.memcached_servers, io_timeout))
            }
        };
        Ok(Self::new(backend, config.protection()?, config.token_cache_time))
    }

    fn entry_key(&self, token: &str) -> Option<EntryKey> {
        match &self.protection {
            None => Some(EntryKey {
                key: format!("{KEY_PREFIX}{}", hex::encode(Sha256::digest(token.as_bytes()))),
                keys: None,
            }),
            Some((strategy, secret)) => match derive_keys(token, secret, *strategy) {
                Ok(keys) => Some(EntryKey {
                    key: format!("{KEY_PREFIX}{}", keys.cache_key_hex()),
                    keys: Some(keys),
                }),
                Err(e) => {
                    warn!(error = %e, "Cache key derivation failed");
                    None
                }
            },
        }
    }

    /// Look up a token's cached result at `now`
    pub async fn get(&self, token: &str, now: DateTime<Utc>) -> CacheLookup {
        let Some(EntryKey { key, keys }) = self.entry_key(token) else {
            return CacheLookup::Miss;
        };
        let blob = match self.backend.get(&key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return CacheLookup::Miss,
            Err(e) => {
                warn!(error = %e, "Token cache read failed");
                return CacheLookup::Miss;
            }
        };
        let plaintext = match &keys {
            None => blob,
            Some(keys) => match keys.unprotect(&blob) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!(error = %e, "Discarding tampered token cache entry");
                    return CacheLookup::Miss;
                }
            },
        };
        match serde_json::from_slice::<CacheEntry>(&plaintext) {
            Ok(CacheEntry::Invalid) => CacheLookup::Invalid,
            Ok(CacheEntry::Valid {
                payload,
                expires,
                cached_at,
            }) => {
                if expires <= now {
                    debug!("Cached token has expired");
                    CacheLookup::Invalid
                } else {
                    CacheLookup::Valid { payload, cached_at }
                }
            }
            Err(e) => {
                warn!(error = %e, "Undecodable token cache entry");
                CacheLookup::Miss
            }
        }
    }

    /// Remember a validated payload until its expiry (capped by the
    /// configured cache time)
    pub async fn store_valid(&self, token: &str, payload: &TokenPayload, now: DateTime<Utc>) {
        let expires = payload.expires_at();
        let Ok(remaining) = (expires - now).to_std() else {
            return;
        };
        let ttl = remaining.min(self.max_ttl);
        if ttl.is_zero() {
            return;
        }
        let entry = CacheEntry::Valid {
            payload: payload.clone(),
            expires,
            cached_at: now,
        };
        self.store(token, &entry, ttl).await;
    }

    /// Remember that a token is invalid
    pub async fn store_invalid(&self, token: &str) {
        self.store(token, &CacheEntry::Invalid, self.max_ttl).await;
    }

    async fn store(&self, token: &str, entry: &CacheEntry, ttl: Duration) {
        let Some(EntryKey { key, keys }) = self.entry_key(token) else {
            return;
        };
        let plaintext = match serde_json::to_vec(entry) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "Cannot serialize token cache entry");
                return;
            }
        };
        let blob = match &keys {
            None => plaintext,
            Some(keys) => match keys.protect(&plaintext) {
                Ok(blob) => blob,
                Err(e) => {
                    warn!(error = %e, "Cannot protect token cache entry");
                    return;
                }
            },
        };
        if let Err(e) = self.backend.set(&key, blob, ttl).await {
            warn!(error = %e, "Token cache write failed");
        }
    }
}
