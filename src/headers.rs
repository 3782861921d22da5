//! Identity headers passed to the protected service.
//!
//! [`normalize`] reduces both payload generations to one [`AttributeSet`];
//! [`AttributeSet::apply`] writes it as request headers, canonical names and
//! deprecated aliases alike.

use axum::http::{HeaderMap, HeaderValue};
use serde::Serialize;
use tracing::warn;

use crate::identity::payload::{IdName, RoleRef};
use crate::identity::TokenPayload;
use crate::{Error, Result};

/// `Confirmed` or `Invalid`
pub const IDENTITY_STATUS: &str = "x-identity-status";
/// Domain scope id
pub const DOMAIN_ID: &str = "x-domain-id";
/// Domain scope name
pub const DOMAIN_NAME: &str = "x-domain-name";
/// Project scope id
pub const PROJECT_ID: &str = "x-project-id";
/// Project scope name
pub const PROJECT_NAME: &str = "x-project-name";
/// Id of the project's domain
pub const PROJECT_DOMAIN_ID: &str = "x-project-domain-id";
/// Name of the project's domain
pub const PROJECT_DOMAIN_NAME: &str = "x-project-domain-name";
/// User id
pub const USER_ID: &str = "x-user-id";
/// User name
pub const USER_NAME: &str = "x-user-name";
/// Id of the user's domain
pub const USER_DOMAIN_ID: &str = "x-user-domain-id";
/// Name of the user's domain
pub const USER_DOMAIN_NAME: &str = "x-user-domain-name";
/// Comma separated role names
pub const ROLES: &str = "x-roles";
/// JSON service catalog
pub const SERVICE_CATALOG: &str = "x-service-catalog";

/// Deprecated alias of [`PROJECT_ID`]
pub const TENANT_ID: &str = "x-tenant-id";
/// Deprecated alias of [`PROJECT_NAME`]
pub const TENANT_NAME: &str = "x-tenant-name";
/// Deprecated alias of [`PROJECT_NAME`]
pub const TENANT: &str = "x-tenant";
/// Deprecated alias of [`USER_NAME`]
pub const USER: &str = "x-user";
/// Deprecated alias of [`ROLES`]
pub const ROLE: &str = "x-role";

/// Every header this middleware owns; removed from inbound requests
pub const IDENTITY_HEADERS: [&str; 18] = [
    IDENTITY_STATUS,
    DOMAIN_ID,
    DOMAIN_NAME,
    PROJECT_ID,
    PROJECT_NAME,
    PROJECT_DOMAIN_ID,
    PROJECT_DOMAIN_NAME,
    USER_ID,
    USER_NAME,
    USER_DOMAIN_ID,
    USER_DOMAIN_NAME,
    ROLES,
    SERVICE_CATALOG,
    TENANT_ID,
    TENANT_NAME,
    TENANT,
    USER,
    ROLE,
];

/// Domain assumed for v2 payloads, which carry no domains
pub const DEFAULT_DOMAIN_ID: &str = "default";
/// Name of [`DEFAULT_DOMAIN_ID`]
pub const DEFAULT_DOMAIN_NAME: &str = "Default";

/// Authorization scope of a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Scope {
    /// Scoped to a project
    Project {
        /// Project id
        id: String,
        /// Project name
        name: Option<String>,
        /// Owning domain id
        domain_id: Option<String>,
        /// Owning domain name
        domain_name: Option<String>,
    },
    /// Scoped to a domain
    Domain {
        /// Domain id
        id: String,
        /// Domain name
        name: Option<String>,
    },
    /// Identity only
    Unscoped,
}

/// Normalized identity of a validated token.
///
/// Inserted into request extensions on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttributeSet {
    /// User id
    pub user_id: String,
    /// User name
    pub user_name: Option<String>,
    /// User's domain id
    pub user_domain_id: Option<String>,
    /// User's domain name
    pub user_domain_name: Option<String>,
    /// Project or domain scope
    pub scope: Scope,
    /// Role names
    pub roles: Vec<String>,
    /// Serialized service catalog
    pub service_catalog: Option<String>,
}

fn role_names(roles: &[RoleRef]) -> Vec<String> {
    roles.iter().map(|r| r.name.clone()).collect()
}

fn split(domain: Option<&IdName>) -> (Option<String>, Option<String>) {
    match domain {
        Some(d) => (Some(d.id.clone()), d.name.clone()),
        None => (None, None),
    }
}

/// Reduce either payload generation to an [`AttributeSet`]
#[must_use]
pub fn normalize(payload: &TokenPayload, include_catalog: bool) -> AttributeSet {
    let (attrs, catalog) = match payload {
        TokenPayload::V2(access) => {
            let scope = match &access.token.tenant {
                Some(tenant) => Scope::Project {
                    id: tenant.id.clone(),
                    name: tenant.name.clone(),
                    domain_id: Some(DEFAULT_DOMAIN_ID.to_string()),
                    domain_name: Some(DEFAULT_DOMAIN_NAME.to_string()),
                },
                None => Scope::Unscoped,
            };
            let attrs = AttributeSet {
                user_id: access.user.id.clone(),
                user_name: access.user.name.clone(),
                user_domain_id: Some(DEFAULT_DOMAIN_ID.to_string()),
                user_domain_name: Some(DEFAULT_DOMAIN_NAME.to_string()),
                scope,
                roles: role_names(&access.user.roles),
                service_catalog: None,
            };
            (attrs, access.service_catalog.as_ref())
        }
        TokenPayload::V3(token) => {
            let (user_domain_id, user_domain_name) = split(token.user.domain.as_ref());
            let scope = match (&token.project, &token.domain) {
                (Some(project), _) => {
                    let (domain_id, domain_name) = split(project.domain.as_ref());
                    Scope::Project {
                        id: project.id.clone(),
                        name: project.name.clone(),
                        domain_id,
                        domain_name,
                    }
                }
                (None, Some(domain)) => Scope::Domain {
                    id: domain.id.clone(),
                    name: domain.name.clone(),
                },
                (None, None) => Scope::Unscoped,
            };
            let attrs = AttributeSet {
                user_id: token.user.id.clone(),
                user_name: token.user.name.clone(),
                user_domain_id,
                user_domain_name,
                scope,
                roles: role_names(&token.roles),
                service_catalog: None,
            };
            (attrs, token.catalog.as_ref())
        }
    };

    AttributeSet {
        service_catalog: catalog
            .filter(|_| include_catalog)
            .map(serde_json::Value::to_string),
        ..attrs
    }
}

impl AttributeSet {
    /// Header name/value pairs, canonical names first, then aliases
    #[must_use]
    pub fn to_headers(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::with_capacity(16);
        let mut push = |name: &'static str, value: Option<&String>| {
            if let Some(v) = value {
                out.push((name, v.clone()));
            }
        };

        push(USER_ID, Some(&self.user_id));
        push(USER_NAME, self.user_name.as_ref());
        push(USER_DOMAIN_ID, self.user_domain_id.as_ref());
        push(USER_DOMAIN_NAME, self.user_domain_name.as_ref());
        match &self.scope {
            Scope::Project {
                id,
                name,
                domain_id,
                domain_name,
            } => {
                push(PROJECT_ID, Some(id));
                push(PROJECT_NAME, name.as_ref());
                push(PROJECT_DOMAIN_ID, domain_id.as_ref());
                push(PROJECT_DOMAIN_NAME, domain_name.as_ref());
            }
            Scope::Domain { id, name } => {
                push(DOMAIN_ID, Some(id));
                push(DOMAIN_NAME, name.as_ref());
            }
            Scope::Unscoped => {}
        }
        let roles = self.roles.join(",");
        push(ROLES, Some(&roles));
        push(SERVICE_CATALOG, self.service_catalog.as_ref());

        if let Scope::Project { id, name, .. } = &self.scope {
            push(TENANT_ID, Some(id));
            push(TENANT_NAME, name.as_ref());
            push(TENANT, name.as_ref());
        }
        push(USER, self.user_name.as_ref());
        push(ROLE, Some(&roles));
        out
    }

    /// Write the attributes into `headers`, replacing existing values.
    ///
    /// Optional attributes that cannot be encoded are skipped. A user id
    /// that cannot be encoded fails the whole set and leaves `headers`
    /// untouched.
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<()> {
        let mut encoded = Vec::with_capacity(16);
        for (name, value) in self.to_headers() {
            match HeaderValue::from_bytes(value.as_bytes()) {
                Ok(v) => encoded.push((name, v)),
                Err(_) if name == USER_ID => {
                    return Err(Error::invalid_token("user id cannot be sent as a header"));
                }
                Err(_) => warn!(header = %name, "Skipping identity header with unencodable value"),
            }
        }
        for (name, value) in encoded {
            headers.insert(name, value);
        }
        Ok(())
    }
}

/// Remove every identity header a caller may have forged
pub fn strip_identity_headers(headers: &mut HeaderMap) {
    for name in IDENTITY_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn parse(value: serde_json::Value) -> TokenPayload {
        TokenPayload::from_slice(value.to_string().as_bytes()).unwrap()
    }

    fn header<'a>(headers: &'a [(&'static str, String)], name: &str) -> Option<&'a str> {
        headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_v2_defaults_domains() {
        let payload = parse(json!({
            "access": {
                "token": {"id": "t", "expires": "2099-01-01T00:00:00Z", "tenant": {"id": "p1", "name": "demo"}},
                "user": {"id": "u1", "name": "alice", "roles": [{"name": "member"}, {"name": "admin"}]},
                "serviceCatalog": [{"type": "identity"}]
            }
        }));
        let attrs = normalize(&payload, true);
        assert_eq!(
            attrs,
            AttributeSet {
                user_id: "u1".into(),
                user_name: Some("alice".into()),
                user_domain_id: Some("default".into()),
                user_domain_name: Some("Default".into()),
                scope: Scope::Project {
                    id: "p1".into(),
                    name: Some("demo".into()),
                    domain_id: Some("default".into()),
                    domain_name: Some("Default".into()),
                },
                roles: vec!["member".into(), "admin".into()],
                service_catalog: Some(r#"[{"type":"identity"}]"#.into()),
            }
        );
    }

    #[test]
    fn test_v3_domain_scope_excludes_project() {
        let payload = parse(json!({
            "token": {
                "expires_at": "2099-01-01T00:00:00Z",
                "user": {"id": "u2", "name": "bob", "domain": {"id": "d9", "name": "Ops"}},
                "domain": {"id": "d1", "name": "Infra"},
                "roles": [{"id": "r", "name": "reader"}]
            }
        }));
        let headers = normalize(&payload, true).to_headers();
        assert_eq!(header(&headers, DOMAIN_ID), Some("d1"));
        assert_eq!(header(&headers, DOMAIN_NAME), Some("Infra"));
        assert_eq!(header(&headers, USER_DOMAIN_NAME), Some("Ops"));
        assert_eq!(header(&headers, PROJECT_ID), None);
        assert_eq!(header(&headers, TENANT_ID), None);
        assert_eq!(header(&headers, ROLES), Some("reader"));
    }

    #[test]
    fn test_v3_project_scope_headers_and_aliases() {
        let payload = parse(json!({
            "token": {
                "expires_at": "2099-01-01T00:00:00Z",
                "user": {"id": "u3", "name": "carol", "domain": {"id": "default", "name": "Default"}},
                "project": {"id": "p7", "name": "web", "domain": {"id": "d2", "name": "Apps"}},
                "roles": [{"name": "member"}, {"name": "reader"}],
                "catalog": [{"type": "compute"}]
            }
        }));
        let headers = normalize(&payload, false).to_headers();
        assert_eq!(header(&headers, PROJECT_ID), Some("p7"));
        assert_eq!(header(&headers, PROJECT_DOMAIN_ID), Some("d2"));
        assert_eq!(header(&headers, TENANT_ID), Some("p7"));
        assert_eq!(header(&headers, TENANT), Some("web"));
        assert_eq!(header(&headers, USER), Some("carol"));
        assert_eq!(header(&headers, ROLE), Some("member,reader"));
        assert_eq!(header(&headers, SERVICE_CATALOG), None);
    }

    #[test]
    fn test_unscoped_token() {
        let payload = parse(json!({
            "token": {"expires_at": "2099-01-01T00:00:00Z", "user": {"id": "u4"}}
        }));
        let attrs = normalize(&payload, true);
        assert_eq!(attrs.scope, Scope::Unscoped);
        let headers = attrs.to_headers();
        assert_eq!(header(&headers, ROLES), Some(""));
        assert_eq!(header(&headers, USER_NAME), None);
    }

    #[test]
    fn test_strip_and_apply() {
        let mut headers = HeaderMap::new();
        headers.insert(USER_ID, HeaderValue::from_static("forged"));
        headers.insert(ROLE, HeaderValue::from_static("admin"));
        headers.insert(IDENTITY_STATUS, HeaderValue::from_static("Confirmed"));
        headers.insert("x-request-id", HeaderValue::from_static("r1"));

        strip_identity_headers(&mut headers);
        assert_eq!(headers.len(), 1);

        let payload = parse(json!({
            "token": {"expires_at": "2099-01-01T00:00:00Z", "user": {"id": "u5", "name": "Zoë"}}
        }));
        normalize(&payload, true).apply(&mut headers).unwrap();
        assert_eq!(headers[USER_ID], "u5");
        assert_eq!(headers[USER_NAME].as_bytes(), "Zoë".as_bytes());
    }

    #[test]
    fn test_unencodable_user_id_fails_apply() {
        let payload = parse(json!({
            "token": {
                "expires_at": "2099-01-01T00:00:00Z",
                "user": {"id": "u5\nx-roles: admin", "name": "mallory"}
            }
        }));
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("r1"));

        let err = normalize(&payload, true).apply(&mut headers).unwrap_err();
        assert!(err.is_invalid_token());
        assert_eq!(headers.len(), 1);
        assert!(headers.get(USER_NAME).is_none());
    }

    #[test]
    fn test_unencodable_optional_value_is_skipped() {
        let payload = parse(json!({
            "token": {
                "expires_at": "2099-01-01T00:00:00Z",
                "user": {"id": "u6", "name": "bad\u{7f}name"}
            }
        }));
        let mut headers = HeaderMap::new();
        normalize(&payload, true).apply(&mut headers).unwrap();
        assert_eq!(headers[USER_ID], "u6");
        assert!(headers.get(USER_NAME).is_none());
    }
}
