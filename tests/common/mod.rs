//! Shared fixtures for the middleware integration tests
//!
//! `FakeIdentity` stands in for the identity service and counts every call;
//! `FakeCms` accepts PEM armored base64 without checking signatures.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    middleware::from_fn_with_state,
    routing::get,
};
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use keystone_authtoken::cache::{CacheBackend, InMemoryBackend, TokenCache};
use keystone_authtoken::identity::{
    AdminCredentials, ApiVersion, IdentityApi, IdentityError, IssuedToken, TokenPayload,
};
use keystone_authtoken::signing::{CmsBackend, CmsError, SigningDir};
use keystone_authtoken::{AuthProtocol, AuthTokenConfig, auth_token_middleware};

pub const PUBLIC_URL: &str = "https://keystone.example.com:5000";
pub const SIGNING_CERT: &str = include_str!("../fixtures/signing_cert.pem");
pub const CA_CERT: &str = include_str!("../fixtures/cacert.pem");
pub const UNTRUSTED_CA: &str = include_str!("../fixtures/untrusted_ca.pem");

/// In-memory identity service
#[derive(Default)]
pub struct FakeIdentity {
    tokens: Mutex<HashMap<String, TokenPayload>>,
    revoked: Mutex<Vec<String>>,
    /// Raw revocation document; overrides `revoked` when set
    pub revocation_document: Mutex<Option<String>>,
    pub ca_certificate: Mutex<Option<String>>,

    /// Upcoming introspections answered with 401
    pub reject_admin_token: AtomicUsize,
    pub introspection_down: AtomicBool,
    pub revocation_down: AtomicBool,
    /// Version root and certificate endpoints answer 404
    pub versions_missing: AtomicBool,
    pub certificates_missing: AtomicBool,

    pub versions_calls: AtomicUsize,
    pub authenticate_calls: AtomicUsize,
    pub validate_calls: AtomicUsize,
    pub revocation_calls: AtomicUsize,
    pub certificate_calls: AtomicUsize,
}

impl FakeIdentity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn issue(&self, token: &str, payload: TokenPayload) {
        self.tokens.lock().unwrap().insert(token.to_string(), payload);
    }

    pub fn revoke(&self, id: &str) {
        self.revoked.lock().unwrap().push(id.to_string());
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityApi for FakeIdentity {
    async fn versions(&self) -> Result<Vec<String>, IdentityError> {
        self.versions_calls.fetch_add(1, Ordering::SeqCst);
        if self.versions_missing.load(Ordering::SeqCst) {
            return Err(IdentityError::NotFound);
        }
        Ok(vec!["v3.14".into(), "v2.0".into()])
    }

    async fn authenticate(
        &self,
        _version: ApiVersion,
        credentials: &AdminCredentials,
    ) -> Result<IssuedToken, IdentityError> {
        let n = self.authenticate_calls.fetch_add(1, Ordering::SeqCst);
        if credentials.password != "secret" {
            return Err(IdentityError::Unauthorized);
        }
        Ok(IssuedToken {
            id: format!("admin-{n}"),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn validate_token(
        &self,
        _version: ApiVersion,
        admin_token: &str,
        token: &str,
    ) -> Result<TokenPayload, IdentityError> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        assert!(admin_token.starts_with("admin-"));
        if self.introspection_down.load(Ordering::SeqCst) {
            return Err(IdentityError::Network("connection refused".into()));
        }
        let pending = self.reject_admin_token.load(Ordering::SeqCst);
        if pending > 0 {
            self.reject_admin_token.store(pending - 1, Ordering::SeqCst);
            return Err(IdentityError::Unauthorized);
        }
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or(IdentityError::NotFound)
    }

    async fn revocation_list(
        &self,
        _version: ApiVersion,
        _admin_token: &str,
    ) -> Result<String, IdentityError> {
        self.revocation_calls.fetch_add(1, Ordering::SeqCst);
        if self.revocation_down.load(Ordering::SeqCst) {
            return Err(IdentityError::Network("connection timed out".into()));
        }
        if let Some(doc) = self.revocation_document.lock().unwrap().clone() {
            return Ok(doc);
        }
        let revoked: Vec<Value> = self
            .revoked
            .lock()
            .unwrap()
            .iter()
            .map(|id| json!({"id": id, "expires": "2099-01-01T00:00:00Z"}))
            .collect();
        Ok(armor(json!({"revoked": revoked}).to_string().as_bytes()))
    }

    async fn signing_certificate(
        &self,
        _version: ApiVersion,
        _admin_token: &str,
    ) -> Result<String, IdentityError> {
        self.certificate_calls.fetch_add(1, Ordering::SeqCst);
        if self.certificates_missing.load(Ordering::SeqCst) {
            return Err(IdentityError::NotFound);
        }
        Ok(SIGNING_CERT.to_string())
    }

    async fn ca_certificate(
        &self,
        _version: ApiVersion,
        _admin_token: &str,
    ) -> Result<String, IdentityError> {
        self.certificate_calls.fetch_add(1, Ordering::SeqCst);
        if self.certificates_missing.load(Ordering::SeqCst) {
            return Err(IdentityError::NotFound);
        }
        Ok(self
            .ca_certificate
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| CA_CERT.to_string()))
    }
}

/// PEM armor around base64 content, as `FakeCms` expects
pub fn armor(content: &[u8]) -> String {
    let body = base64::engine::general_purpose::STANDARD.encode(content);
    format!("-----BEGIN CMS-----\n{body}\n-----END CMS-----\n")
}

/// Accepts any armored base64 document once certificates are on disk
#[derive(Default)]
pub struct FakeCms {
    pub calls: AtomicUsize,
}

#[async_trait]
impl CmsBackend for FakeCms {
    async fn verify(&self, pem: &str, signing_cert: &Path, ca_cert: &Path) -> Result<Vec<u8>, CmsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !signing_cert.exists() || !ca_cert.exists() {
            return Err(CmsError::MissingCertificates);
        }
        let body: String = pem.lines().filter(|l| !l.starts_with("-----")).collect();
        base64::engine::general_purpose::STANDARD
            .decode(body.trim())
            .map_err(|e| CmsError::Invalid(e.to_string()))
    }
}

/// v3 token payload scoped to `demo` in the default domain
pub fn v3_payload(user_id: &str, expires_at: DateTime<Utc>) -> TokenPayload {
    serde_json::from_value(json!({
        "token": {
            "expires_at": expires_at.to_rfc3339(),
            "user": {
                "id": user_id,
                "name": "alice",
                "domain": {"id": "default", "name": "Default"}
            },
            "project": {
                "id": "p-1234",
                "name": "demo",
                "domain": {"id": "default", "name": "Default"}
            },
            "roles": [{"id": "r1", "name": "member"}, {"id": "r2", "name": "reader"}],
            "catalog": [{"type": "compute", "endpoints": []}]
        }
    }))
    .unwrap()
}

pub fn valid_payload(user_id: &str) -> TokenPayload {
    v3_payload(user_id, Utc::now() + Duration::hours(2))
}

pub fn config(signing_dir: &Path) -> AuthTokenConfig {
    AuthTokenConfig {
        identity_uri: Some("https://identity.internal:35357".into()),
        www_authenticate_uri: Some(PUBLIC_URL.into()),
        admin_user: Some("authtoken".into()),
        admin_password: Some("secret".into()),
        admin_tenant_name: "service".into(),
        signing_dir: Some(signing_dir.to_path_buf()),
        ..Default::default()
    }
}

/// Middleware in front of a handler echoing the headers it received
pub struct TestApp {
    pub router: Router,
    pub auth: Arc<AuthProtocol>,
    pub signing_dir: PathBuf,
}

impl TestApp {
    pub fn new(
        config: &AuthTokenConfig,
        identity: Arc<dyn IdentityApi>,
        cms: Arc<dyn CmsBackend>,
    ) -> Self {
        Self::with_backend(config, identity, cms, Arc::new(InMemoryBackend::new(1000)))
    }

    /// App whose token cache lives in `backend`, possibly shared with others
    pub fn with_backend(
        config: &AuthTokenConfig,
        identity: Arc<dyn IdentityApi>,
        cms: Arc<dyn CmsBackend>,
        backend: Arc<dyn CacheBackend>,
    ) -> Self {
        let signing_dir = config.signing_dir.clone().unwrap();
        let cache = TokenCache::new(
            backend,
            config.cache.protection().unwrap(),
            config.cache.token_cache_time,
        );
        let auth = Arc::new(
            AuthProtocol::new(
                config,
                identity,
                cache,
                SigningDir::open(&signing_dir).unwrap(),
                cms,
            )
            .unwrap(),
        );
        let router = Router::new()
            .route("/", get(echo_headers))
            .layer(from_fn_with_state(auth.clone(), auth_token_middleware));
        Self {
            router,
            auth,
            signing_dir,
        }
    }

    pub async fn send(&self, headers: &[(&str, &str)]) -> (StatusCode, HeaderMap, Value) {
        let mut request = Request::builder().uri("/");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = self
            .router
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, headers, json)
    }

    pub async fn with_token(&self, token: &str) -> (StatusCode, HeaderMap, Value) {
        self.send(&[("x-auth-token", token)]).await
    }
}

async fn echo_headers(headers: HeaderMap) -> Json<Value> {
    let seen: serde_json::Map<String, Value> = headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-"))
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            )
        })
        .collect();
    Json(Value::Object(seen))
}
