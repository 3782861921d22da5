//! Identity service client.
//!
//! [`IdentityApi`] is the seam between the middleware and the identity
//! service's REST endpoints. [`HttpIdentityApi`] is the production
//! implementation; tests substitute an in-memory fake.
//!
//! Calls made on behalf of the middleware carry the admin token; only the
//! password exchange and the version probe are unauthenticated.

mod http;
pub mod payload;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::info;

pub use http::HttpIdentityApi;
pub use payload::TokenPayload;

use crate::{Error, Result};

/// Identity API generation used for introspection and admin calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    /// Legacy `/v2.0` API
    V2,
    /// Current `/v3` API
    V3,
}

impl ApiVersion {
    /// Parse an `auth_version` setting (`v2.0`, `v2`, `v3`, `v3.x`)
    pub fn parse(raw: &str) -> Result<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        if lower == "v2" || lower.starts_with("v2.") {
            Ok(Self::V2)
        } else if lower == "v3" || lower.starts_with("v3.") {
            Ok(Self::V3)
        } else {
            Err(Error::Config(format!("Unsupported auth_version: {raw}")))
        }
    }

    /// Pick the best version from a version document's ids
    #[must_use]
    pub fn select<'a>(ids: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        let mut best = None;
        for id in ids {
            match Self::parse(id) {
                Ok(Self::V3) => return Some(Self::V3),
                Ok(Self::V2) => best = Some(Self::V2),
                Err(_) => {}
            }
        }
        best
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V2 => f.write_str("v2.0"),
            Self::V3 => f.write_str("v3"),
        }
    }
}

/// Failures of a single identity service call
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// 401: the admin token (or the credentials) were rejected
    #[error("identity service rejected the admin credentials")]
    Unauthorized,

    /// 404: the looked-up resource does not exist
    #[error("identity service returned 404 Not Found")]
    NotFound,

    /// Any other non-success status
    #[error("identity service returned HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body excerpt
        body: String,
    },

    /// Transport failure after retries
    #[error("identity service unreachable: {0}")]
    Network(String),

    /// Success status but unusable body
    #[error("malformed identity service response: {0}")]
    Malformed(String),
}

impl From<IdentityError> for Error {
    fn from(e: IdentityError) -> Self {
        match e {
            IdentityError::Network(msg) => Self::Network(msg),
            other => Self::Service(other.to_string()),
        }
    }
}

/// Password credentials of the middleware's service user
#[derive(Clone)]
pub struct AdminCredentials {
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// Project (tenant) to scope the token to
    pub project_name: String,
    /// User's domain (v3)
    pub user_domain_name: String,
    /// Project's domain (v3)
    pub project_domain_name: String,
}

impl fmt::Debug for AdminCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("project_name", &self.project_name)
            .finish_non_exhaustive()
    }
}

/// Token issued to the middleware by the password exchange
#[derive(Clone)]
pub struct IssuedToken {
    /// Token id sent as `X-Auth-Token`
    pub id: String,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("id", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Identity service REST surface used by the middleware
#[async_trait]
pub trait IdentityApi: Send + Sync + 'static {
    /// Version ids advertised at the identity root
    async fn versions(&self) -> std::result::Result<Vec<String>, IdentityError>;

    /// Exchange the service user's password for a token
    async fn authenticate(
        &self,
        version: ApiVersion,
        credentials: &AdminCredentials,
    ) -> std::result::Result<IssuedToken, IdentityError>;

    /// Introspect a caller's opaque token
    async fn validate_token(
        &self,
        version: ApiVersion,
        admin_token: &str,
        token: &str,
    ) -> std::result::Result<TokenPayload, IdentityError>;

    /// Signed revocation list document (PEM armored CMS)
    async fn revocation_list(
        &self,
        version: ApiVersion,
        admin_token: &str,
    ) -> std::result::Result<String, IdentityError>;

    /// Token signing certificate (PEM)
    async fn signing_certificate(
        &self,
        version: ApiVersion,
        admin_token: &str,
    ) -> std::result::Result<String, IdentityError>;

    /// CA certificate of the signing certificate (PEM)
    async fn ca_certificate(
        &self,
        version: ApiVersion,
        admin_token: &str,
    ) -> std::result::Result<String, IdentityError>;
}

/// Version document at the identity root
#[derive(Debug, Deserialize)]
pub(crate) struct VersionsDocument {
    versions: VersionValues,
}

#[derive(Debug, Deserialize)]
struct VersionValues {
    values: Vec<VersionEntry>,
}

#[derive(Debug, Deserialize)]
struct VersionEntry {
    id: String,
}

impl VersionsDocument {
    pub(crate) fn into_ids(self) -> Vec<String> {
        self.versions.values.into_iter().map(|v| v.id).collect()
    }
}

/// Decides once per process which API generation to speak
pub struct VersionSelector {
    api: Arc<dyn IdentityApi>,
    selected: OnceCell<ApiVersion>,
}

impl VersionSelector {
    /// Selector that probes the identity service on first use
    #[must_use]
    pub fn probing(api: Arc<dyn IdentityApi>) -> Self {
        Self {
            api,
            selected: OnceCell::new(),
        }
    }

    /// Selector pinned to a configured version; never probes
    #[must_use]
    pub fn fixed(api: Arc<dyn IdentityApi>, version: ApiVersion) -> Self {
        Self {
            api,
            selected: OnceCell::new_with(Some(version)),
        }
    }

    /// The API generation to use, probing on first call
    pub async fn version(&self) -> Result<ApiVersion> {
        self.selected
            .get_or_try_init(|| async {
                let ids = self.api.versions().await?;
                let version = ApiVersion::select(ids.iter().map(String::as_str)).ok_or_else(|| {
                    Error::service(format!(
                        "identity service advertises no supported API version (got {ids:?})"
                    ))
                })?;
                info!(version = %version, "Selected identity API version");
                Ok(version)
            })
            .await
            .copied()
    }
}
