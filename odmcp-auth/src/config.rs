//! Configuration for the gateway's identity and routing layer
//!
//! Loaded from TOML. Every section has defaults, durations use humantime
//! notation (`"1h"`, `"5m"`, `"10s"`).

use crate::error::{OdmcpError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Complete gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Session lifetimes and sweeps
    pub sessions: SessionSettings,
    /// Identity provider
    pub provider: ProviderConfig,
    /// Backend destinations
    pub destinations: DestinationConfig,
    /// Authentication behaviour and remediation
    pub auth: AuthSettings,
    /// Tool classification
    pub operations: OperationSettings,
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            OdmcpError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable; errors here are fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.destinations.discovery.trim().is_empty() {
            return Err(OdmcpError::Configuration(
                "destinations.discovery must name a backend destination".to_string(),
            ));
        }
        if !self.destinations.single_destination && self.destinations.operational.trim().is_empty()
        {
            return Err(OdmcpError::Configuration(
                "destinations.operational must name a backend destination".to_string(),
            ));
        }

        if self.sessions.default_ttl.is_zero() {
            return Err(OdmcpError::Configuration(
                "sessions.default_ttl must be greater than zero".to_string(),
            ));
        }
        if self.sessions.cleanup_interval.is_zero() {
            return Err(OdmcpError::Configuration(
                "sessions.cleanup_interval must be greater than zero".to_string(),
            ));
        }

        if self.auth.session_parameter.trim().is_empty() {
            return Err(OdmcpError::Configuration(
                "auth.session_parameter must not be empty".to_string(),
            ));
        }

        let login_url = self.login_url().ok_or_else(|| {
            OdmcpError::Configuration(
                "auth.login_url or provider.authorization_endpoint must be set".to_string(),
            )
        })?;
        url::Url::parse(login_url).map_err(|e| {
            OdmcpError::Configuration(format!("Invalid login URL '{}': {}", login_url, e))
        })?;

        self.provider.validate()
    }

    /// URL callers are sent to when they need to authenticate
    pub fn login_url(&self) -> Option<&str> {
        self.auth
            .login_url
            .as_deref()
            .or(self.provider.authorization_endpoint.as_deref())
    }
}

/// Session lifetimes and sweep intervals
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// TTL for identity sessions created without an explicit one
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,

    /// How often expired identity sessions are swept
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Channels older than this are closed by maintenance
    #[serde(with = "humantime_serde")]
    pub channel_max_age: Duration,

    /// Refresh a caller credential this long before it expires
    #[serde(with = "humantime_serde")]
    pub refresh_skew: Duration,

    /// Upper bound on graceful shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_deadline: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            channel_max_age: Duration::from_secs(24 * 60 * 60),
            refresh_skew: Duration::from_secs(60),
            shutdown_deadline: Duration::from_secs(10),
        }
    }
}

/// Which identity provider implementation to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// OAuth2 / OpenID Connect provider reached over HTTP
    #[default]
    Oidc,
    /// Fixed token table, for development and tests
    Static,
}

/// Identity provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider implementation
    pub kind: ProviderKind,

    /// Browser entry point of the login flow
    pub authorization_endpoint: Option<String>,

    /// Token endpoint (code exchange and refresh)
    pub token_endpoint: Option<String>,

    /// RFC 7662 introspection endpoint, used when no local key is configured
    pub introspection_endpoint: Option<String>,

    /// OAuth client id
    pub client_id: Option<String>,

    /// OAuth client secret
    pub client_secret: Option<String>,

    /// Redirect URI registered with the provider
    pub redirect_uri: Option<String>,

    /// Expected `aud` claim
    pub audience: Option<String>,

    /// Expected `iss` claim
    pub issuer: Option<String>,

    /// HS256 secret for local token validation
    pub jwt_secret: Option<String>,

    /// RS256 public key (PEM) for local token validation
    pub jwt_public_key_pem: Option<String>,

    /// Scopes requested at login
    pub scopes: Vec<String>,

    /// Bound on every provider call; independent of session TTL
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Token table for the static provider
    pub static_tokens: Vec<StaticTokenConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Oidc,
            authorization_endpoint: None,
            token_endpoint: None,
            introspection_endpoint: None,
            client_id: None,
            client_secret: None,
            redirect_uri: None,
            audience: None,
            issuer: None,
            jwt_secret: None,
            jwt_public_key_pem: None,
            scopes: vec!["openid".to_string()],
            request_timeout: Duration::from_secs(10),
            static_tokens: Vec::new(),
        }
    }
}

impl ProviderConfig {
    fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            return Err(OdmcpError::Configuration(
                "provider.request_timeout must be greater than zero".to_string(),
            ));
        }

        match self.kind {
            ProviderKind::Oidc => {
                if self.token_endpoint.is_none() {
                    return Err(OdmcpError::Configuration(
                        "provider.token_endpoint is required for the oidc provider".to_string(),
                    ));
                }
                if self.client_id.is_none() {
                    return Err(OdmcpError::Configuration(
                        "provider.client_id is required for the oidc provider".to_string(),
                    ));
                }
                if self.jwt_secret.is_none()
                    && self.jwt_public_key_pem.is_none()
                    && self.introspection_endpoint.is_none()
                {
                    return Err(OdmcpError::Configuration(
                        "oidc provider needs jwt_secret, jwt_public_key_pem or introspection_endpoint"
                            .to_string(),
                    ));
                }
            }
            ProviderKind::Static => {
                if self.static_tokens.is_empty() {
                    return Err(OdmcpError::Configuration(
                        "provider.static_tokens must not be empty for the static provider"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

/// One token -> identity mapping for the static provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticTokenConfig {
    /// Bearer token value
    pub token: String,
    /// Subject id
    pub subject_id: String,
    /// Display name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
    /// Tenant
    #[serde(default)]
    pub tenant: Option<String>,
    /// Granted permissions (bare or namespaced)
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Named backend destinations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationConfig {
    /// Destination for discovery/metadata calls (technical credential)
    pub discovery: String,

    /// Destination for operational calls (caller identity, technical fallback)
    pub operational: String,

    /// Route both classes to the discovery destination
    pub single_destination: bool,
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            discovery: "odata-technical".to_string(),
            operational: "odata-principal".to_string(),
            single_destination: false,
        }
    }
}

/// Authentication behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Gateway login entry point advertised in remediation
    pub login_url: Option<String>,

    /// Tool argument that carries the identity session id
    pub session_parameter: String,

    /// Allow the process-wide fallback identity for authenticated convenience tools
    pub allow_environment_fallback: bool,

    /// Refresh caller credentials close to expiry before propagating them
    pub refresh_credentials: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            login_url: Some("http://127.0.0.1:8080/auth/login".to_string()),
            session_parameter: "session_id".to_string(),
            allow_environment_fallback: false,
            refresh_credentials: true,
        }
    }
}

/// Tool classification tables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationSettings {
    /// Catalog/schema tools usable without authentication
    pub discovery_tools: Vec<String>,

    /// Non-mutating tools that personalise output and need an identity
    pub convenience_tools: Vec<String>,

    /// Parameterized tools whose variant argument selects read/create/update/delete
    pub execute_tools: Vec<String>,
}

impl Default for OperationSettings {
    fn default() -> Self {
        Self {
            discovery_tools: [
                "discover-services",
                "search-services",
                "get-service-metadata",
                "get-entity-schema",
                "list-entity-sets",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            convenience_tools: ["whoami", "recommend-services"]
                .into_iter()
                .map(String::from)
                .collect(),
            execute_tools: vec!["execute-entity-operation".to_string()],
        }
    }
}
