//! `reqwest` implementation of [`IdentityApi`]

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use super::payload::{TokenPayload, timestamp};
use super::{AdminCredentials, ApiVersion, IdentityApi, IdentityError, IssuedToken, VersionsDocument};
use crate::config::AuthTokenConfig;
use crate::retry::{RetryPolicy, with_retry};
use crate::{Error, Result};

const AUTH_TOKEN_HEADER: &str = "X-Auth-Token";
const SUBJECT_TOKEN_HEADER: &str = "X-Subject-Token";

/// Identity service client over HTTP(S)
pub struct HttpIdentityApi {
    client: Client,
    base_url: Url,
    retry: RetryPolicy,
    include_catalog: bool,
}

#[derive(Debug, Deserialize)]
struct V2AuthResponse {
    access: V2AuthAccess,
}

#[derive(Debug, Deserialize)]
struct V2AuthAccess {
    token: V2AuthToken,
}

#[derive(Debug, Deserialize)]
struct V2AuthToken {
    id: String,
    expires: String,
}

#[derive(Debug, Deserialize)]
struct V3AuthResponse {
    token: V3AuthToken,
}

#[derive(Debug, Deserialize)]
struct V3AuthToken {
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct SignedDocument {
    signed: String,
}

impl HttpIdentityApi {
    /// Build the client from middleware configuration
    pub fn from_config(config: &AuthTokenConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.http_connect_timeout)
            .timeout(config.http_request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .danger_accept_invalid_certs(config.insecure);

        if let Some(cafile) = &config.cafile {
            let pem = std::fs::read(cafile)?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("Invalid cafile {}: {e}", cafile.display())))?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(certfile), Some(keyfile)) = (&config.certfile, &config.keyfile) {
            let mut pem = std::fs::read(certfile)?;
            pem.extend_from_slice(b"\n");
            pem.extend(std::fs::read(keyfile)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| Error::Config(format!("Invalid TLS client identity: {e}")))?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| Error::Config(format!("Cannot build HTTP client: {e}")))?;

        Ok(Self::new(
            client,
            config.identity_url()?,
            RetryPolicy::new(config.http_request_max_retries),
            config.include_service_catalog,
        ))
    }

    /// Client against `base_url` (which must end in `/`)
    #[must_use]
    pub fn new(client: Client, base_url: Url, retry: RetryPolicy, include_catalog: bool) -> Self {
        Self {
            client,
            base_url,
            retry,
            include_catalog,
        }
    }

    fn endpoint(&self, path: &str) -> std::result::Result<Url, IdentityError> {
        self.base_url
            .join(path)
            .map_err(|e| IdentityError::Malformed(format!("bad endpoint {path}: {e}")))
    }

    /// Send with bounded retries on transport failures; statuses are not retried
    async fn send(
        &self,
        name: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> std::result::Result<Response, IdentityError> {
        let response = with_retry(
            &self.retry,
            name,
            || build().send(),
            |e: &reqwest::Error| e.is_timeout() || e.is_connect() || e.is_request(),
        )
        .await
        .map_err(|e| IdentityError::Network(e.to_string()))?;

        check_status(response).await
    }

    async fn fetch_text(
        &self,
        name: &str,
        path: &str,
        admin_token: &str,
    ) -> std::result::Result<String, IdentityError> {
        let url = self.endpoint(path)?;
        let response = self
            .send(name, || {
                self.client
                    .get(url.clone())
                    .header(AUTH_TOKEN_HEADER, admin_token)
            })
            .await?;
        response
            .text()
            .await
            .map_err(|e| IdentityError::Network(e.to_string()))
    }
}

async fn check_status(response: Response) -> std::result::Result<Response, IdentityError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match status {
        StatusCode::UNAUTHORIZED => Err(IdentityError::Unauthorized),
        StatusCode::NOT_FOUND => Err(IdentityError::NotFound),
        _ => {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(256);
            Err(IdentityError::Status {
                status: status.as_u16(),
                body,
            })
        }
    }
}

async fn json_body<T: for<'de> Deserialize<'de>>(
    response: Response,
) -> std::result::Result<T, IdentityError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| IdentityError::Network(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| IdentityError::Malformed(e.to_string()))
}

fn parse_expiry(raw: &str) -> std::result::Result<chrono::DateTime<chrono::Utc>, IdentityError> {
    timestamp::parse(raw).ok_or_else(|| IdentityError::Malformed(format!("bad expiry {raw}")))
}

#[async_trait]
impl IdentityApi for HttpIdentityApi {
    async fn versions(&self) -> std::result::Result<Vec<String>, IdentityError> {
        let url = self.base_url.clone();
        // The root answers 300 Multiple Choices with the version document
        let response = with_retry(
            &self.retry,
            "versions",
            || self.client.get(url.clone()).send(),
            |e: &reqwest::Error| e.is_timeout() || e.is_connect(),
        )
        .await
        .map_err(|e| IdentityError::Network(e.to_string()))?;

        let response = if response.status() == StatusCode::MULTIPLE_CHOICES {
            response
        } else {
            check_status(response).await?
        };
        let doc: VersionsDocument = json_body(response).await?;
        Ok(doc.into_ids())
    }

    async fn authenticate(
        &self,
        version: ApiVersion,
        credentials: &AdminCredentials,
    ) -> std::result::Result<IssuedToken, IdentityError> {
        match version {
            ApiVersion::V2 => {
                let url = self.endpoint("v2.0/tokens")?;
                let body = json!({
                    "auth": {
                        "passwordCredentials": {
                            "username": credentials.username,
                            "password": credentials.password,
                        },
                        "tenantName": credentials.project_name,
                    }
                });
                let response = self
                    .send("authenticate", || self.client.post(url.clone()).json(&body))
                    .await?;
                let parsed: V2AuthResponse = json_body(response).await?;
                Ok(IssuedToken {
                    expires_at: parse_expiry(&parsed.access.token.expires)?,
                    id: parsed.access.token.id,
                })
            }
            ApiVersion::V3 => {
                let url = self.endpoint("v3/auth/tokens")?;
                let body = json!({
                    "auth": {
                        "identity": {
                            "methods": ["password"],
                            "password": {
                                "user": {
                                    "name": credentials.username,
                                    "password": credentials.password,
                                    "domain": {"name": credentials.user_domain_name},
                                }
                            }
                        },
                        "scope": {
                            "project": {
                                "name": credentials.project_name,
                                "domain": {"name": credentials.project_domain_name},
                            }
                        }
                    }
                });
                let response = self
                    .send("authenticate", || {
                        self.client
                            .post(url.clone())
                            .query(&[("nocatalog", "")])
                            .json(&body)
                    })
                    .await?;
                let id = response
                    .headers()
                    .get(SUBJECT_TOKEN_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
                    .ok_or_else(|| IdentityError::Malformed("missing X-Subject-Token".into()))?;
                let parsed: V3AuthResponse = json_body(response).await?;
                Ok(IssuedToken {
                    id,
                    expires_at: parse_expiry(&parsed.token.expires_at)?,
                })
            }
        }
    }

    async fn validate_token(
        &self,
        version: ApiVersion,
        admin_token: &str,
        token: &str,
    ) -> std::result::Result<TokenPayload, IdentityError> {
        let response = match version {
            ApiVersion::V2 => {
                // Reject path tricks before embedding the token in the URL
                if token.is_empty() || token.contains(['/', '?', '#', '%']) {
                    return Err(IdentityError::NotFound);
                }
                let url = self.endpoint(&format!("v2.0/tokens/{token}"))?;
                self.send("validate_token", || {
                    self.client
                        .get(url.clone())
                        .header(AUTH_TOKEN_HEADER, admin_token)
                })
                .await?
            }
            ApiVersion::V3 => {
                let url = self.endpoint("v3/auth/tokens")?;
                let include_catalog = self.include_catalog;
                self.send("validate_token", || {
                    let request = self
                        .client
                        .get(url.clone())
                        .header(AUTH_TOKEN_HEADER, admin_token)
                        .header(SUBJECT_TOKEN_HEADER, token);
                    if include_catalog {
                        request
                    } else {
                        request.query(&[("nocatalog", "")])
                    }
                })
                .await?
            }
        };
        debug!(version = %version, "Token introspection succeeded");
        json_body(response).await
    }

    async fn revocation_list(
        &self,
        version: ApiVersion,
        admin_token: &str,
    ) -> std::result::Result<String, IdentityError> {
        let path = match version {
            ApiVersion::V2 => "v2.0/tokens/revoked",
            ApiVersion::V3 => "v3/auth/tokens/OS-PKI/revoked",
        };
        let body = self.fetch_text("revocation_list", path, admin_token).await?;
        let doc: SignedDocument =
            serde_json::from_str(&body).map_err(|e| IdentityError::Malformed(e.to_string()))?;
        Ok(doc.signed)
    }

    async fn signing_certificate(
        &self,
        version: ApiVersion,
        admin_token: &str,
    ) -> std::result::Result<String, IdentityError> {
        let path = match version {
            ApiVersion::V2 => "v2.0/certificates/signing",
            ApiVersion::V3 => "v3/OS-SIMPLE-CERT/certificates",
        };
        self.fetch_text("signing_certificate", path, admin_token).await
    }

    async fn ca_certificate(
        &self,
        version: ApiVersion,
        admin_token: &str,
    ) -> std::result::Result<String, IdentityError> {
        let path = match version {
            ApiVersion::V2 => "v2.0/certificates/ca",
            ApiVersion::V3 => "v3/OS-SIMPLE-CERT/ca",
        };
        self.fetch_text("ca_certificate", path, admin_token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(base: &str) -> HttpIdentityApi {
        HttpIdentityApi::new(
            Client::new(),
            Url::parse(base).unwrap(),
            RetryPolicy::immediate(0),
            true,
        )
    }

    #[test]
    fn test_endpoint_joins_under_prefix() {
        let api = api("https://id.example.com/identity/");
        assert_eq!(
            api.endpoint("v3/auth/tokens").unwrap().as_str(),
            "https://id.example.com/identity/v3/auth/tokens"
        );
    }

    #[tokio::test]
    async fn test_v2_rejects_path_tokens_without_network() {
        let api = api("http://127.0.0.1:9/");
        let result = api
            .validate_token(ApiVersion::V2, "admin", "../../v3/users")
            .await;
        assert!(matches!(result, Err(IdentityError::NotFound)));
    }

    #[test]
    fn test_from_config_rejects_bad_uri() {
        let config = AuthTokenConfig {
            identity_uri: Some("not a url".into()),
            ..Default::default()
        };
        assert!(matches!(
            HttpIdentityApi::from_config(&config),
            Err(Error::Config(_))
        ));
    }
}
