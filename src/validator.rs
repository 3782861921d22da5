//! Token validation
//!
//! Signed tokens are verified offline against the signing certificates;
//! opaque tokens are introspected with the admin token. Either way the
//! resulting payload must name a user, be unexpired and not be revoked.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::admin_token::AdminTokenManager;
use crate::identity::{IdentityApi, IdentityError, TokenPayload, VersionSelector};
use crate::revocation::{RevocationList, RevocationListManager};
use crate::signing::{SignedDocumentVerifier, is_signed_token, token_to_cms_pem};
use crate::{Error, Result};

/// Token shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// CMS signed document carrying its own claims
    Signed,
    /// Identifier resolved by the identity service
    Opaque,
}

impl TokenKind {
    /// Classify a raw token
    #[must_use]
    pub fn of(token: &str) -> Self {
        if is_signed_token(token) {
            Self::Signed
        } else {
            Self::Opaque
        }
    }
}

/// Hex SHA-256 of a token
#[must_use]
pub fn token_hash(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Short, non-reversible token label for logs
pub(crate) fn fingerprint(token: &str) -> String {
    let mut hash = token_hash(token);
    hash.truncate(12);
    hash
}

/// Identifiers under which a token may appear in the revocation list
#[must_use]
pub fn revocation_ids(token: &str) -> Vec<String> {
    match TokenKind::of(token) {
        TokenKind::Signed => vec![token_hash(token)],
        TokenKind::Opaque => vec![token.to_string(), token_hash(token)],
    }
}

/// Whether any of the token's identifiers is in `list`
#[must_use]
pub fn is_revoked(list: &RevocationList, token: &str) -> bool {
    revocation_ids(token).iter().any(|id| list.is_revoked(id))
}

/// Answers whether a token is valid and what it claims
pub struct TokenValidator {
    api: Arc<dyn IdentityApi>,
    versions: Arc<VersionSelector>,
    admin: Arc<AdminTokenManager>,
    verifier: Arc<SignedDocumentVerifier>,
    revocation: Option<Arc<RevocationListManager>>,
}

impl TokenValidator {
    /// Validator; `revocation` of `None` disables revocation checks
    #[must_use]
    pub fn new(
        api: Arc<dyn IdentityApi>,
        versions: Arc<VersionSelector>,
        admin: Arc<AdminTokenManager>,
        verifier: Arc<SignedDocumentVerifier>,
        revocation: Option<Arc<RevocationListManager>>,
    ) -> Self {
        Self {
            api,
            versions,
            admin,
            verifier,
            revocation,
        }
    }

    /// Validate `token` at `now`
    pub async fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<TokenPayload> {
        let kind = TokenKind::of(token);
        debug!(token = %fingerprint(token), ?kind, "Validating token");

        let payload = match kind {
            TokenKind::Signed => self.verify_signed(token).await?,
            TokenKind::Opaque => self.introspect(token).await?,
        };
        payload.check_claims(now)?;

        if let Some(list) = self.revocation_list().await?
            && is_revoked(&list, token)
        {
            return Err(Error::invalid_token("token has been revoked"));
        }
        Ok(payload)
    }

    /// Current revocation list, `None` when revocation checks are disabled
    pub async fn revocation_list(&self) -> Result<Option<Arc<RevocationList>>> {
        match &self.revocation {
            Some(manager) => manager.get_list().await.map(Some),
            None => Ok(None),
        }
    }

    async fn verify_signed(&self, token: &str) -> Result<TokenPayload> {
        let content = self.verifier.verify(&token_to_cms_pem(token)).await?;
        TokenPayload::from_slice(&content)
            .map_err(|e| Error::invalid_token(format!("signed token content unusable: {e}")))
    }

    async fn introspect(&self, token: &str) -> Result<TokenPayload> {
        let version = self.versions.version().await?;
        let api = &self.api;
        // A 404 here is about the caller's token; anywhere else it is a service fault
        self.admin
            .with_admin_token(|admin| async move {
                match api.validate_token(version, &admin, token).await {
                    Err(IdentityError::NotFound) => Ok(None),
                    other => other.map(Some),
                }
            })
            .await?
            .ok_or_else(|| Error::invalid_token("token not found"))
    }
}
