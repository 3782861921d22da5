//! The middleware's own privileged token.
//!
//! One [`AdminTokenManager`] per middleware instance holds at most one issued
//! token. It is refreshed lazily: when absent, when within
//! [`REFRESH_MARGIN_SECS`] of expiry, or after the identity service
//! rejected it. Administrative calls go through
//! [`AdminTokenManager::with_admin_token`], which re-authenticates and
//! retries exactly once on a 401.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AuthTokenConfig;
use crate::identity::{AdminCredentials, IdentityApi, IdentityError, IssuedToken, VersionSelector};
use crate::{Error, Result};

/// Tokens this close to expiry (seconds) are replaced before use
pub const REFRESH_MARGIN_SECS: i64 = 30;

/// Holds and refreshes the admin token
pub struct AdminTokenManager {
    api: Arc<dyn IdentityApi>,
    versions: Arc<VersionSelector>,
    credentials: Option<AdminCredentials>,
    current: Mutex<Option<IssuedToken>>,
    refresh_margin: Duration,
}

impl AdminTokenManager {
    /// Manager exchanging `credentials` for tokens; without credentials every
    /// administrative call fails with a service error
    #[must_use]
    pub fn new(
        api: Arc<dyn IdentityApi>,
        versions: Arc<VersionSelector>,
        credentials: Option<AdminCredentials>,
    ) -> Self {
        Self {
            api,
            versions,
            credentials,
            current: Mutex::new(None),
            refresh_margin: Duration::seconds(REFRESH_MARGIN_SECS),
        }
    }

    /// Admin credentials from configuration, if a user and password are set
    #[must_use]
    pub fn credentials_from_config(config: &AuthTokenConfig) -> Option<AdminCredentials> {
        match (&config.admin_user, &config.admin_password) {
            (Some(username), Some(password)) => Some(AdminCredentials {
                username: username.clone(),
                password: password.clone(),
                project_name: config.admin_tenant_name.clone(),
                user_domain_name: config.admin_user_domain_name.clone(),
                project_domain_name: config.admin_project_domain_name.clone(),
            }),
            _ => None,
        }
    }

    /// Current admin token id, authenticating first if needed
    pub async fn get_admin_token(&self) -> Result<String> {
        let mut current = self.current.lock().await;
        if let Some(token) = current.as_ref() {
            if token.expires_at - self.refresh_margin > Utc::now() {
                return Ok(token.id.clone());
            }
            debug!(expires_at = %token.expires_at, "Admin token is about to expire");
        }

        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| Error::service("admin_user and admin_password are not configured"))?;
        let version = self.versions.version().await?;
        let issued = self
            .api
            .authenticate(version, credentials)
            .await
            .map_err(|e| match e {
                IdentityError::Network(msg) => Error::Network(msg),
                other => Error::service(format!("Cannot obtain admin token: {other}")),
            })?;

        if issued.id.is_empty() || issued.expires_at <= Utc::now() {
            return Err(Error::service("identity service issued an unusable admin token"));
        }

        info!(
            user = %credentials.username,
            expires_at = %issued.expires_at,
            "Obtained admin token"
        );
        let id = issued.id.clone();
        *current = Some(issued);
        Ok(id)
    }

    /// Forget the cached token so the next call re-authenticates
    pub async fn invalidate(&self) {
        *self.current.lock().await = None;
    }

    /// Forget the cached token only if it is still `rejected`; a concurrent
    /// caller may already have replaced it
    async fn invalidate_if_current(&self, rejected: &str) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|t| t.id == rejected) {
            *current = None;
        }
    }

    /// Run an administrative call with the admin token.
    ///
    /// A 401 invalidates the token and the call is repeated once with a
    /// fresh one; a second 401 is a service error.
    pub async fn with_admin_token<T, F, Fut>(&self, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, IdentityError>>,
    {
        let token = self.get_admin_token().await?;
        match call(token.clone()).await {
            Err(IdentityError::Unauthorized) => {
                warn!("Identity service rejected the admin token, re-authenticating");
                self.invalidate_if_current(&token).await;
                let fresh = self.get_admin_token().await?;
                match call(fresh).await {
                    Err(IdentityError::Unauthorized) => Err(Error::service(
                        "identity service rejected a freshly issued admin token",
                    )),
                    other => other.map_err(Error::from),
                }
            }
            other => other.map_err(Error::from),
        }
    }
}
