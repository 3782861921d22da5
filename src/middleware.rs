//! Auth token middleware
//!
//! For every request:
//! - identity headers supplied by the caller are removed
//! - the token from `X-Auth-Token` (or legacy `X-Storage-Token`) is looked
//!   up in the cache, otherwise validated and the result cached
//! - a valid token adds identity headers and `X-Identity-Status: Confirmed`
//! - an invalid or missing token is rejected with 401, or forwarded with
//!   `X-Identity-Status: Invalid` when `delay_auth_decision` is set
//! - an identity service failure is a 503; the request is never forwarded

use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Request, StatusCode, header::WWW_AUTHENTICATE},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::admin_token::AdminTokenManager;
use crate::cache::{CacheLookup, TokenCache};
use crate::config::AuthTokenConfig;
use crate::headers::{AttributeSet, IDENTITY_STATUS, normalize, strip_identity_headers};
use crate::identity::{ApiVersion, HttpIdentityApi, IdentityApi, VersionSelector};
use crate::revocation::RevocationListManager;
use crate::signing::{CmsBackend, OpensslCms, SignedDocumentVerifier, SigningDir};
use crate::validator::{TokenValidator, fingerprint, is_revoked};
use crate::{Error, Result};

/// Inbound header carrying the caller's token
pub const AUTH_TOKEN_HEADER: &str = "x-auth-token";
/// Legacy alias of [`AUTH_TOKEN_HEADER`]
pub const STORAGE_TOKEN_HEADER: &str = "x-storage-token";

/// Outcome of authenticating one request
#[derive(Debug)]
pub enum Decision {
    /// Token valid; identity to forward
    Confirmed(AttributeSet),
    /// Token missing or invalid
    Rejected(String),
    /// The identity service could not be used to decide
    Unavailable(Error),
}

/// Per-application middleware state
pub struct AuthProtocol {
    validator: TokenValidator,
    cache: TokenCache,
    delay_auth_decision: bool,
    include_service_catalog: bool,
    www_authenticate: HeaderValue,
}

impl AuthProtocol {
    /// Build every collaborator from configuration
    pub fn from_config(config: &AuthTokenConfig) -> Result<Self> {
        config.validate()?;
        let api: Arc<dyn IdentityApi> = Arc::new(HttpIdentityApi::from_config(config)?);
        let cache = TokenCache::from_config(&config.cache, config.http_request_timeout)?;
        let signing_dir = SigningDir::open(config.signing_dir_path()?)?;
        let cms = Arc::new(OpensslCms::new(config.openssl_binary.clone()));
        Self::new(config, api, cache, signing_dir, cms)
    }

    /// Build with injected identity client, cache and verifier
    pub fn new(
        config: &AuthTokenConfig,
        api: Arc<dyn IdentityApi>,
        cache: TokenCache,
        signing_dir: SigningDir,
        cms: Arc<dyn CmsBackend>,
    ) -> Result<Self> {
        let versions = Arc::new(match &config.auth_version {
            Some(v) => VersionSelector::fixed(api.clone(), ApiVersion::parse(v)?),
            None => VersionSelector::probing(api.clone()),
        });
        let admin = Arc::new(AdminTokenManager::new(
            api.clone(),
            versions.clone(),
            AdminTokenManager::credentials_from_config(config),
        ));
        let verifier = Arc::new(SignedDocumentVerifier::new(
            cms,
            signing_dir,
            api.clone(),
            versions.clone(),
            admin.clone(),
        ));
        let revocation = config.check_revocations.then(|| {
            Arc::new(RevocationListManager::new(
                api.clone(),
                versions.clone(),
                admin.clone(),
                verifier.clone(),
                config.revocation_cache_time,
            ))
        });

        let uri = config.www_authenticate_url()?;
        let www_authenticate = HeaderValue::from_str(&format!("Keystone uri='{uri}'"))
            .map_err(|e| Error::Config(format!("Invalid www_authenticate_uri {uri}: {e}")))?;

        info!(
            identity = %uri,
            delay_auth_decision = config.delay_auth_decision,
            check_revocations = config.check_revocations,
            "Auth token middleware configured"
        );

        Ok(Self {
            validator: TokenValidator::new(api, versions, admin, verifier, revocation),
            cache,
            delay_auth_decision: config.delay_auth_decision,
            include_service_catalog: config.include_service_catalog,
            www_authenticate,
        })
    }

    /// Decide on the token carried by `headers`
    pub async fn authenticate(&self, headers: &HeaderMap) -> Decision {
        self.decide(extract_token(headers)).await
    }

    async fn decide(&self, token: Option<&str>) -> Decision {
        match token {
            Some(token) => self.authenticate_token(token).await,
            None => Decision::Rejected("no token supplied".into()),
        }
    }

    /// Decide on a raw token
    pub async fn authenticate_token(&self, token: &str) -> Decision {
        let now = Utc::now();
        match self.cache.get(token, now).await {
            CacheLookup::Invalid => {
                debug!(token = %fingerprint(token), "Token cached as invalid");
                return Decision::Rejected("token is invalid".into());
            }
            CacheLookup::Valid { payload, cached_at } => {
                // The entry may have been written by another worker with an
                // older list, so every hit is checked against ours
                return match self.validator.revocation_list().await {
                    Ok(Some(list)) if is_revoked(&list, token) => {
                        info!(
                            token = %fingerprint(token),
                            cached_at = %cached_at,
                            "Cached token has been revoked"
                        );
                        self.cache.store_invalid(token).await;
                        Decision::Rejected("token has been revoked".into())
                    }
                    Ok(_) => {
                        debug!(token = %fingerprint(token), "Token served from cache");
                        Decision::Confirmed(normalize(&payload, self.include_service_catalog))
                    }
                    Err(e) => Decision::Unavailable(e),
                };
            }
            CacheLookup::Miss => {}
        }

        match self.validator.validate(token, now).await {
            Ok(payload) => {
                self.cache.store_valid(token, &payload, now).await;
                Decision::Confirmed(normalize(&payload, self.include_service_catalog))
            }
            Err(Error::InvalidToken(reason)) => {
                info!(token = %fingerprint(token), reason = %reason, "Token rejected");
                self.cache.store_invalid(token).await;
                Decision::Rejected(reason)
            }
            Err(e) => Decision::Unavailable(e),
        }
    }
}

/// First non-empty token header
fn extract_token(headers: &HeaderMap) -> Option<&str> {
    [AUTH_TOKEN_HEADER, STORAGE_TOKEN_HEADER]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .find(|v| !v.is_empty())
}

/// Axum middleware; install with
/// `axum::middleware::from_fn_with_state(Arc<AuthProtocol>, auth_token_middleware)`
pub async fn auth_token_middleware(
    State(auth): State<Arc<AuthProtocol>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    strip_identity_headers(request.headers_mut());
    let path = request.uri().path().to_string();

    let token = extract_token(request.headers()).map(str::to_owned);
    let decision = match auth.decide(token.as_deref()).await {
        Decision::Confirmed(attrs) => match attrs.apply(request.headers_mut()) {
            Ok(()) => Decision::Confirmed(attrs),
            Err(e) => Decision::Rejected(e.to_string()),
        },
        other => other,
    };
    match decision {
        Decision::Confirmed(attrs) => {
            debug!(path = %path, user = %attrs.user_id, "Authenticated request");
            request
                .headers_mut()
                .insert(IDENTITY_STATUS, HeaderValue::from_static("Confirmed"));
            request.extensions_mut().insert(attrs);
            next.run(request).await
        }
        Decision::Rejected(reason) if auth.delay_auth_decision => {
            debug!(path = %path, reason = %reason, "Deferring auth decision downstream");
            request
                .headers_mut()
                .insert(IDENTITY_STATUS, HeaderValue::from_static("Invalid"));
            next.run(request).await
        }
        Decision::Rejected(reason) => {
            warn!(path = %path, reason = %reason, "Rejecting request");
            unauthorized_response(&auth.www_authenticate)
        }
        Decision::Unavailable(e) => {
            warn!(path = %path, error = %e, "Cannot authenticate request");
            unavailable_response(&e)
        }
    }
}

/// Create a 401 Unauthorized response
fn unauthorized_response(www_authenticate: &HeaderValue) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, www_authenticate.clone())],
        Json(json!({
            "error": {
                "code": 401,
                "title": "Unauthorized",
                "message": "The request you have made requires authentication."
            }
        })),
    )
        .into_response()
}

/// Create a 503 (or 500 for local faults) response
fn unavailable_response(error: &Error) -> Response {
    let status = error.status_code();
    (
        status,
        Json(json!({
            "error": {
                "code": status.as_u16(),
                "title": status.canonical_reason().unwrap_or("Error"),
                "message": "Authentication is temporarily unavailable."
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_token_precedence() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_token(&headers), None);

        headers.insert(STORAGE_TOKEN_HEADER, HeaderValue::from_static("legacy"));
        assert_eq!(extract_token(&headers), Some("legacy"));

        headers.insert(AUTH_TOKEN_HEADER, HeaderValue::from_static("  "));
        assert_eq!(extract_token(&headers), Some("legacy"));

        headers.insert(AUTH_TOKEN_HEADER, HeaderValue::from_static("primary"));
        assert_eq!(extract_token(&headers), Some("primary"));
    }

    #[test]
    fn test_unauthorized_response_hint() {
        let value = HeaderValue::from_static("Keystone uri='https://id.example.com:5000'");
        let response = unauthorized_response(&value);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], value);
    }

    #[test]
    fn test_unavailable_status() {
        let response = unavailable_response(&Error::Network("timed out".into()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let response = unavailable_response(&Error::Config("bad".into()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
