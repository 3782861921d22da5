//! Revocation list management
//!
//! The list is read from memory while fresh, then from `revoked.json` in the
//! signing directory while that is fresh (another worker may have fetched
//! it), and otherwise fetched, verified and persisted. A failed refresh keeps
//! serving the newest list known, however stale; only with no list at all
//! does it surface as a service error.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::admin_token::AdminTokenManager;
use crate::identity::{IdentityApi, VersionSelector};
use crate::signing::{REVOKED_FILE, SignedDocumentVerifier};
use crate::{Error, Result};

/// Revoked token identifiers as of `fetched_at`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevocationList {
    ids: BTreeSet<String>,
    fetched_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RevokedDocument {
    revoked: Vec<RevokedEntry>,
}

#[derive(Debug, Deserialize)]
struct RevokedEntry {
    id: String,
}

impl RevocationList {
    /// List from identifiers
    pub fn new(ids: impl IntoIterator<Item = String>, fetched_at: DateTime<Utc>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            fetched_at,
        }
    }

    /// Parse the verified `{"revoked": [{"id": ...}]}` document
    pub fn parse(document: &[u8], fetched_at: DateTime<Utc>) -> Result<Self> {
        let doc: RevokedDocument = serde_json::from_slice(document)
            .map_err(|e| Error::service(format!("Malformed revocation list: {e}")))?;
        Ok(Self::new(doc.revoked.into_iter().map(|e| e.id), fetched_at))
    }

    /// Whether `id` is revoked
    #[must_use]
    pub fn is_revoked(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// When the list was fetched from the identity service
    #[must_use]
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }

    /// Number of revoked ids
    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether nothing is revoked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now - self.fetched_at < ttl
    }
}

/// Serves the current revocation list
pub struct RevocationListManager {
    api: Arc<dyn IdentityApi>,
    versions: Arc<VersionSelector>,
    admin: Arc<AdminTokenManager>,
    verifier: Arc<SignedDocumentVerifier>,
    ttl: chrono::Duration,
    current: RwLock<Option<Arc<RevocationList>>>,
    refresh: Mutex<()>,
}

impl RevocationListManager {
    /// Manager refreshing every `ttl`
    #[must_use]
    pub fn new(
        api: Arc<dyn IdentityApi>,
        versions: Arc<VersionSelector>,
        admin: Arc<AdminTokenManager>,
        verifier: Arc<SignedDocumentVerifier>,
        ttl: Duration,
    ) -> Self {
        Self {
            api,
            versions,
            admin,
            verifier,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            current: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    async fn fresh_in_memory(&self, now: DateTime<Utc>) -> Option<Arc<RevocationList>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|list| list.is_fresh(now, self.ttl))
            .cloned()
    }

    /// Current list, refreshing it if stale
    pub async fn get_list(&self) -> Result<Arc<RevocationList>> {
        if let Some(list) = self.fresh_in_memory(Utc::now()).await {
            return Ok(list);
        }

        let _refresh = self.refresh.lock().await;
        let now = Utc::now();
        // Another request may have refreshed while we waited
        if let Some(list) = self.fresh_in_memory(now).await {
            return Ok(list);
        }

        let on_disk = self.load_persisted().await;
        if let Some(list) = on_disk.as_ref().filter(|l| l.is_fresh(now, self.ttl)) {
            debug!(entries = list.len(), "Using revocation list persisted by another worker");
            return Ok(self.remember(list.clone()).await);
        }

        match self.fetch(now).await {
            Ok(list) => {
                info!(entries = list.len(), "Fetched revocation list");
                Ok(self.remember(list).await)
            }
            Err(e) => {
                let memory = self.current.read().await.clone();
                let fallback = match (memory, on_disk) {
                    (Some(mem), Some(disk)) if disk.fetched_at > mem.fetched_at => {
                        Some(self.remember(disk).await)
                    }
                    (Some(mem), _) => Some(mem),
                    (None, Some(disk)) => Some(self.remember(disk).await),
                    (None, None) => None,
                };
                match fallback {
                    Some(list) => {
                        warn!(
                            error = %e,
                            fetched_at = %list.fetched_at,
                            "Revocation list refresh failed, keeping stale list"
                        );
                        Ok(list)
                    }
                    None => Err(Error::service(format!(
                        "No revocation list available: {e}"
                    ))),
                }
            }
        }
    }

    async fn remember(&self, list: RevocationList) -> Arc<RevocationList> {
        let list = Arc::new(list);
        *self.current.write().await = Some(list.clone());
        list
    }

    async fn load_persisted(&self) -> Option<RevocationList> {
        let dir = self.verifier.signing_dir();
        match dir.read_with_mtime(REVOKED_FILE).await {
            Ok(Some((contents, mtime))) => match RevocationList::parse(&contents, mtime.into()) {
                Ok(list) => Some(list),
                Err(e) => {
                    warn!(error = %e, "Ignoring unreadable persisted revocation list");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Cannot read persisted revocation list");
                None
            }
        }
    }

    async fn fetch(&self, now: DateTime<Utc>) -> Result<RevocationList> {
        let version = self.versions.version().await?;
        let api = &self.api;
        let signed = self
            .admin
            .with_admin_token(|token| async move { api.revocation_list(version, &token).await })
            .await?;

        let document = self.verifier.verify(&signed).await.map_err(|e| match e {
            Error::InvalidToken(reason) => {
                Error::service(format!("Revocation list signature invalid: {reason}"))
            }
            other => other,
        })?;
        let list = RevocationList::parse(&document, now)?;

        // The persisted copy is a cache for other workers; failing to write
        // it does not invalidate the fetched list
        if let Err(e) = self
            .verifier
            .signing_dir()
            .write_atomic(REVOKED_FILE, &document)
            .await
        {
            warn!(error = %e, "Cannot persist revocation list");
        }
        Ok(list)
    }
}
