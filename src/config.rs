//! Configuration management

use std::{path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::ProtectionStrategy;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Auth token middleware settings
    pub auth_token: AuthTokenConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or describes an invalid middleware setup.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // KEYSTONE_AUTHTOKEN_AUTH_TOKEN__ADMIN_USER=... style overrides
        figment = figment.merge(Env::prefixed("KEYSTONE_AUTHTOKEN_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.auth_token.validate()?;
        Ok(config)
    }
}

/// Settings recognized by the auth token middleware
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthTokenConfig {
    /// Identity service host (admin endpoint)
    pub auth_host: String,
    /// Identity service port
    pub auth_port: u16,
    /// `http` or `https`
    pub auth_protocol: String,
    /// Path prefix of the admin endpoint, e.g. `/identity`
    pub auth_admin_prefix: String,
    /// Full identity URI; overrides host/port/protocol/prefix when set
    pub identity_uri: Option<String>,
    /// Public identity URL advertised in `WWW-Authenticate`
    pub www_authenticate_uri: Option<String>,
    /// `v2.0` or `v3`; skips the version probe when set
    pub auth_version: Option<String>,
    /// Forward unauthenticated requests with `X-Identity-Status: Invalid`
    pub delay_auth_decision: bool,

    /// Middleware's own service user
    pub admin_user: Option<String>,
    /// Password of the service user
    pub admin_password: Option<String>,
    /// Project (tenant) the admin token is scoped to
    pub admin_tenant_name: String,
    /// Domain of the service user (v3 only)
    pub admin_user_domain_name: String,
    /// Domain of the admin project (v3 only)
    pub admin_project_domain_name: String,

    /// TLS client certificate (PEM)
    pub certfile: Option<PathBuf>,
    /// TLS client key (PEM)
    pub keyfile: Option<PathBuf>,
    /// CA bundle used to verify the identity service
    pub cafile: Option<PathBuf>,
    /// Skip TLS verification of the identity service
    pub insecure: bool,

    /// Add `X-Service-Catalog` to forwarded requests
    pub include_service_catalog: bool,
    /// Consult the revocation list on every validation
    pub check_revocations: bool,
    /// How long a fetched revocation list stays fresh
    #[serde(with = "humantime_serde")]
    pub revocation_cache_time: Duration,
    /// Directory holding certificates and the persisted revocation list
    pub signing_dir: Option<PathBuf>,
    /// `openssl` executable used for CMS verification
    pub openssl_binary: String,

    /// Connect timeout for identity service calls
    #[serde(with = "humantime_serde")]
    pub http_connect_timeout: Duration,
    /// Overall timeout for one identity service call
    #[serde(with = "humantime_serde")]
    pub http_request_timeout: Duration,
    /// Retries after a transport failure
    pub http_request_max_retries: u32,

    /// Token cache settings
    pub cache: CacheConfig,
}

impl Default for AuthTokenConfig {
    fn default() -> Self {
        Self {
            auth_host: "127.0.0.1".to_string(),
            auth_port: 35357,
            auth_protocol: "https".to_string(),
            auth_admin_prefix: String::new(),
            identity_uri: None,
            www_authenticate_uri: None,
            auth_version: None,
            delay_auth_decision: false,
            admin_user: None,
            admin_password: None,
            admin_tenant_name: "admin".to_string(),
            admin_user_domain_name: "Default".to_string(),
            admin_project_domain_name: "Default".to_string(),
            certfile: None,
            keyfile: None,
            cafile: None,
            insecure: false,
            include_service_catalog: true,
            check_revocations: true,
            revocation_cache_time: Duration::from_secs(10),
            signing_dir: None,
            openssl_binary: "openssl".to_string(),
            http_connect_timeout: Duration::from_secs(5),
            http_request_timeout: Duration::from_secs(10),
            http_request_max_retries: 3,
            cache: CacheConfig::default(),
        }
    }
}

impl AuthTokenConfig {
    /// Identity service admin URI, always with a trailing slash so relative
    /// paths join beneath the prefix
    pub fn identity_url(&self) -> Result<Url> {
        let raw = match &self.identity_uri {
            Some(uri) => uri.clone(),
            None => format!(
                "{}://{}:{}{}",
                self.auth_protocol, self.auth_host, self.auth_port, self.auth_admin_prefix
            ),
        };
        let mut url =
            Url::parse(&raw).map_err(|e| Error::Config(format!("Invalid identity URI {raw}: {e}")))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    /// URL named in the `WWW-Authenticate` header of 401 responses
    pub fn www_authenticate_url(&self) -> Result<String> {
        match &self.www_authenticate_uri {
            Some(uri) => Ok(uri.clone()),
            None => Ok(self.identity_url()?.to_string()),
        }
    }

    /// Signing directory, defaulting to `~/.keystone-authtoken`
    pub fn signing_dir_path(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.signing_dir {
            return Ok(dir.clone());
        }
        dirs::home_dir()
            .map(|home| home.join(".keystone-authtoken"))
            .ok_or_else(|| Error::Config("Cannot determine home directory for signing_dir".into()))
    }

    /// Reject configurations the middleware cannot run with
    pub fn validate(&self) -> Result<()> {
        self.identity_url()?;
        self.cache.protection()?;
        if let Some(version) = &self.auth_version {
            crate::identity::ApiVersion::parse(version)?;
        }
        if self.cache.backend == CacheBackendKind::Memcached && self.cache.memcached_servers.is_empty() {
            return Err(Error::Config(
                "cache.backend is memcached but no memcached_servers are configured".into(),
            ));
        }
        if self.certfile.is_some() != self.keyfile.is_some() {
            return Err(Error::Config("certfile and keyfile must be set together".into()));
        }
        Ok(())
    }
}

/// Which store holds validated tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    /// Per-process map
    #[default]
    Memory,
    /// Shared memcached pool
    Memcached,
}

/// Token cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend selection
    pub backend: CacheBackendKind,
    /// `host:port` entries for the memcached backend
    pub memcached_servers: Vec<String>,
    /// Upper bound on how long a validation result is cached
    #[serde(with = "humantime_serde")]
    pub token_cache_time: Duration,
    /// `MAC`, `ENCRYPT`, or unset for cleartext
    pub memcache_security_strategy: Option<String>,
    /// Secret the per-token keys are derived from
    pub memcache_secret_key: Option<String>,
    /// Entry bound of the in-process backend
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::Memory,
            memcached_servers: Vec::new(),
            token_cache_time: Duration::from_secs(300),
            memcache_security_strategy: None,
            memcache_secret_key: None,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    /// Resolve the protection strategy and secret
    pub fn protection(&self) -> Result<Option<(ProtectionStrategy, Vec<u8>)>> {
        let Some(raw) = self.memcache_security_strategy.as_deref() else {
            return Ok(None);
        };
        let Some(strategy) = ProtectionStrategy::parse(raw)? else {
            return Ok(None);
        };
        match self.memcache_secret_key.as_deref() {
            Some(secret) if !secret.is_empty() => Ok(Some((strategy, secret.as_bytes().to_vec()))),
            _ => Err(Error::Config(
                "memcache_secret_key must be set when memcache_security_strategy is configured"
                    .into(),
            )),
        }
    }
}

/// Serde helpers for human readable durations (`"30s"`, `"5m"`, `"1h"`, `"250ms"`)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a duration as whole seconds (`"30s"`) or milliseconds
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a duration string or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value is not a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(s.trim()).map_err(serde::de::Error::custom),
        }
    }

    /// Parse `"100ms"`, `"30s"`, `"5m"`, `"1h"` or `"30"`
    pub fn parse(s: &str) -> Result<Duration, String> {
        let num = |v: &str| v.trim().parse::<u64>().map_err(|e| format!("{s}: {e}"));
        if let Some(ms) = s.strip_suffix("ms") {
            num(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            num(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            num(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            num(hours).map(|h| Duration::from_secs(h * 3600))
        } else {
            num(s).map(Duration::from_secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_identity_url_from_parts() {
        let config = AuthTokenConfig {
            auth_host: "keystone.local".into(),
            auth_port: 5000,
            auth_protocol: "http".into(),
            auth_admin_prefix: "/identity".into(),
            ..Default::default()
        };
        assert_eq!(
            config.identity_url().unwrap().as_str(),
            "http://keystone.local:5000/identity/"
        );
    }

    #[test]
    fn test_identity_uri_overrides_parts() {
        let config = AuthTokenConfig {
            identity_uri: Some("https://id.example.com/admin".into()),
            auth_host: "ignored".into(),
            ..Default::default()
        };
        assert_eq!(
            config.identity_url().unwrap().as_str(),
            "https://id.example.com/admin/"
        );
        assert_eq!(
            config.www_authenticate_url().unwrap(),
            "https://id.example.com/admin/"
        );
    }

    #[test]
    fn test_www_authenticate_uri_explicit() {
        let config = AuthTokenConfig {
            www_authenticate_uri: Some("https://public.example.com:5000".into()),
            ..Default::default()
        };
        assert_eq!(
            config.www_authenticate_url().unwrap(),
            "https://public.example.com:5000"
        );
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let mut config = AuthTokenConfig::default();
        config.cache.memcache_security_strategy = Some("rot13".into());
        config.cache.memcache_secret_key = Some("s3cret".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_strategy_without_secret_rejected() {
        let mut config = AuthTokenConfig::default();
        config.cache.memcache_security_strategy = Some("MAC".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_strategy_none_is_cleartext() {
        let mut config = AuthTokenConfig::default();
        config.cache.memcache_security_strategy = Some("None".into());
        assert!(config.cache.protection().unwrap().is_none());
    }

    #[test]
    fn test_memcached_without_servers_rejected() {
        let mut config = AuthTokenConfig::default();
        config.cache.backend = CacheBackendKind::Memcached;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_bad_auth_version_rejected() {
        let config = AuthTokenConfig {
            auth_version: Some("v9".into()),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_humantime_parse() {
        assert_eq!(humantime_serde::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(humantime_serde::parse("42").unwrap(), Duration::from_secs(42));
        assert!(humantime_serde::parse("soon").is_err());
    }

    #[test]
    fn test_deserialized_from_yaml() {
        let yaml = r#"
auth_token:
  identity_uri: "https://keystone.example.com:35357"
  delay_auth_decision: true
  admin_user: nova
  revocation_cache_time: 2m
  cache:
    backend: memcached
    memcached_servers: ["10.0.0.5:11211"]
    token_cache_time: 600
    memcache_security_strategy: ENCRYPT
    memcache_secret_key: swordfish
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let auth = &config.auth_token;
        assert!(auth.delay_auth_decision);
        assert_eq!(auth.admin_user.as_deref(), Some("nova"));
        assert_eq!(auth.revocation_cache_time, Duration::from_secs(120));
        assert_eq!(auth.cache.backend, CacheBackendKind::Memcached);
        assert_eq!(auth.cache.token_cache_time, Duration::from_secs(600));
        assert!(auth.validate().is_ok());
        assert_eq!(
            auth.cache.protection().unwrap().map(|(s, _)| s),
            Some(ProtectionStrategy::Encrypt)
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authtoken.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "auth_token:").unwrap();
        writeln!(f, "  auth_host: id.internal").unwrap();
        writeln!(f, "  auth_port: 5000").unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.auth_token.auth_host, "id.internal");
        assert_eq!(config.auth_token.auth_port, 5000);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/authtoken.yaml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
