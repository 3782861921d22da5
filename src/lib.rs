//! Keystone auth token middleware
//!
//! Authenticates every request to a protected axum service against an
//! OpenStack-style identity service before the request reaches a handler.
//!
//! # Features
//!
//! - **Signed and opaque tokens**: CMS tokens verified offline, others
//!   introspected with the middleware's own admin token
//! - **Token cache**: in-process or memcached, optionally MAC'd or encrypted
//! - **Revocation list**: fetched, verified, persisted and shared with other
//!   workers through the signing directory
//! - **Normalized identity headers** for v2.0 and v3 tokens, including the
//!   deprecated aliases
//! - **Delayed auth decision**: leave rejection to the protected service
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use axum::{Router, middleware::from_fn_with_state, routing::get};
//! use keystone_authtoken::{AuthProtocol, Config, auth_token_middleware};
//!
//! # fn build() -> keystone_authtoken::Result<Router> {
//! let config = Config::load(None)?;
//! let auth = Arc::new(AuthProtocol::from_config(&config.auth_token)?);
//! let app = Router::new()
//!     .route("/", get(|| async { "ok" }))
//!     .layer(from_fn_with_state(auth, auth_token_middleware));
//! # Ok(app)
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin_token;
pub mod cache;
pub mod config;
pub mod error;
pub mod headers;
pub mod identity;
pub mod middleware;
pub mod retry;
pub mod revocation;
pub mod signing;
pub mod validator;

pub use config::{AuthTokenConfig, Config};
pub use error::{Error, Result};
pub use headers::AttributeSet;
pub use middleware::{AuthProtocol, Decision, auth_token_middleware};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging for a service embedding the middleware
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Config(format!("Cannot install tracing subscriber: {e}")))
}
