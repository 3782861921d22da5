//! Token payloads as returned by the identity service.
//!
//! The two API generations nest claims differently. Both are kept as-is in a
//! tagged enum so the externally tagged JSON form (`{"access": ...}` or
//! `{"token": ...}`) is exactly the wire body, and the header normalizer
//! matches on the variant instead of probing attributes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Validated token claims in either wire generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenPayload {
    /// Legacy (v2.0) `access` document
    #[serde(rename = "access")]
    V2(V2Access),
    /// Current (v3) `token` document
    #[serde(rename = "token")]
    V3(V3Token),
}

/// v2.0 `access` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2Access {
    /// Token metadata
    pub token: V2TokenInfo,
    /// Authenticated user
    pub user: V2User,
    /// Service catalog, passed through untouched
    #[serde(
        rename = "serviceCatalog",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_catalog: Option<Value>,
}

/// v2.0 `access.token`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2TokenInfo {
    /// Token id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Expiry
    #[serde(with = "timestamp")]
    pub expires: DateTime<Utc>,
    /// Project (tenant) scope, absent for unscoped tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<IdName>,
}

/// v2.0 `access.user`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V2User {
    /// User id
    pub id: String,
    /// User name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Granted roles
    #[serde(default)]
    pub roles: Vec<RoleRef>,
}

/// v3 `token` body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V3Token {
    /// Expiry
    #[serde(with = "timestamp")]
    pub expires_at: DateTime<Utc>,
    /// Authenticated user
    pub user: V3User,
    /// Project scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<V3Project>,
    /// Domain scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<IdName>,
    /// Granted roles
    #[serde(default)]
    pub roles: Vec<RoleRef>,
    /// Service catalog, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<Value>,
}

/// v3 `token.user`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V3User {
    /// User id
    pub id: String,
    /// User name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Owning domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<IdName>,
}

/// v3 `token.project`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct V3Project {
    /// Project id
    pub id: String,
    /// Project name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Owning domain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<IdName>,
}

/// `{id, name}` reference used for tenants, projects and domains
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdName {
    /// Resource id
    pub id: String,
    /// Resource name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Role reference; only the name is carried downstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    /// Role id (v3 only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Role name
    pub name: String,
}

impl TokenPayload {
    /// Parse a wire document (`{"access": ...}` or `{"token": ...}`)
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::service(format!("Malformed token payload: {e}")))
    }

    /// Expiry timestamp
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        match self {
            Self::V2(access) => access.token.expires,
            Self::V3(token) => token.expires_at,
        }
    }

    /// User id
    #[must_use]
    pub fn user_id(&self) -> &str {
        match self {
            Self::V2(access) => &access.user.id,
            Self::V3(token) => &token.user.id,
        }
    }

    /// Whether the token has expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() <= now
    }

    /// Reject payloads that must never be forwarded: no user id, or expired
    pub fn check_claims(&self, now: DateTime<Utc>) -> Result<()> {
        if self.user_id().trim().is_empty() {
            return Err(Error::invalid_token("token payload has no user id"));
        }
        if self.is_expired_at(now) {
            return Err(Error::invalid_token(format!(
                "token expired at {}",
                self.expires_at().to_rfc3339()
            )));
        }
        Ok(())
    }
}

/// Lenient timestamp (de)serialization.
///
/// The identity service emits RFC 3339 with and without fractional seconds,
/// and older releases omit the zone suffix; zoneless values are UTC.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Parse an identity-service timestamp
    #[must_use]
    pub fn parse(s: &str) -> Option<DateTime<Utc>> {
        let s = s.trim();
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Serialize as RFC 3339 UTC
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    /// Deserialize any accepted timestamp form
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string is not a timestamp.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_v2_document() {
        let body = json!({
            "access": {
                "token": {
                    "id": "abc",
                    "expires": "2030-01-01T00:00:00Z",
                    "tenant": {"id": "t1", "name": "demo"}
                },
                "user": {"id": "u1", "name": "alice", "roles": [{"name": "member"}]},
                "serviceCatalog": [{"type": "compute"}]
            }
        });
        let payload = TokenPayload::from_slice(body.to_string().as_bytes()).unwrap();
        let TokenPayload::V2(access) = &payload else {
            panic!("expected v2 payload");
        };
        assert_eq!(access.user.roles[0].name, "member");
        assert_eq!(payload.user_id(), "u1");
        assert_eq!(
            payload.expires_at(),
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_parse_v3_document() {
        let body = json!({
            "token": {
                "expires_at": "2030-06-01T12:00:00.000000Z",
                "user": {"id": "u1", "name": "alice", "domain": {"id": "d1", "name": "Users"}},
                "project": {"id": "p1", "name": "web", "domain": {"id": "d2", "name": "Apps"}},
                "roles": [{"id": "r1", "name": "reader"}]
            }
        });
        let payload = TokenPayload::from_slice(body.to_string().as_bytes()).unwrap();
        let TokenPayload::V3(token) = &payload else {
            panic!("expected v3 payload");
        };
        assert_eq!(token.project.as_ref().unwrap().name.as_deref(), Some("web"));
        assert!(token.catalog.is_none());
    }

    #[test]
    fn test_missing_user_id_is_malformed() {
        let body = json!({
            "token": {"expires_at": "2030-06-01T12:00:00Z", "user": {"name": "alice"}}
        });
        assert!(TokenPayload::from_slice(body.to_string().as_bytes()).is_err());
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let payload = TokenPayload::V3(V3Token {
            expires_at: Utc::now() + Duration::hours(1),
            user: V3User {
                id: "  ".into(),
                name: None,
                domain: None,
            },
            project: None,
            domain: None,
            roles: vec![],
            catalog: None,
        });
        assert!(payload.check_claims(Utc::now()).unwrap_err().is_invalid_token());
    }

    #[test]
    fn test_expired_payload_rejected() {
        let body = json!({
            "access": {
                "token": {"expires": "2001-01-01T00:00:00"},
                "user": {"id": "u1"}
            }
        });
        let payload = TokenPayload::from_slice(body.to_string().as_bytes()).unwrap();
        assert!(payload.check_claims(Utc::now()).unwrap_err().is_invalid_token());
    }

    #[test]
    fn test_timestamp_forms() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 4, 5, 6, 7).unwrap();
        assert_eq!(timestamp::parse("2024-03-04T05:06:07Z"), Some(expected));
        assert_eq!(timestamp::parse("2024-03-04T05:06:07"), Some(expected));
        assert_eq!(timestamp::parse("2024-03-04T05:06:07.000000Z"), Some(expected));
        assert_eq!(timestamp::parse("2024-03-04T07:06:07+02:00"), Some(expected));
        assert_eq!(timestamp::parse("yesterday"), None);
    }

    #[test]
    fn test_cache_serialization_is_wire_form() {
        let body = json!({
            "token": {
                "expires_at": "2030-06-01T12:00:00Z",
                "user": {"id": "u1"},
                "domain": {"id": "d1", "name": "Ops"},
                "roles": [{"name": "admin"}]
            }
        });
        let payload = TokenPayload::from_slice(body.to_string().as_bytes()).unwrap();
        let encoded = serde_json::to_value(&payload).unwrap();
        assert!(encoded.get("token").is_some());
        let decoded: TokenPayload = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, payload);
    }
}
