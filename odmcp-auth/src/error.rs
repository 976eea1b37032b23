//! Error types for odmcp
//!
//! Two layers live here. [`OdmcpError`] is the crate error returned by the
//! store, the bridge, the provider client and configuration loading.
//! [`AccessError`] is the structured contract handed to the tool dispatcher
//! when a call cannot proceed: `{code, message, remediation?}`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for odmcp operations
pub type Result<T> = std::result::Result<T, OdmcpError>;

/// odmcp-specific errors
#[derive(Debug, thiserror::Error)]
pub enum OdmcpError {
    /// Identity session does not exist or is no longer live
    #[error("Identity session not found")]
    IdentitySessionNotFound,

    /// Channel session does not exist
    #[error("Channel session not found")]
    ChannelNotFound,

    /// Subject or credential data failed validation
    #[error("Invalid identity: {0}")]
    InvalidIdentity(String),

    /// Gateway is not configured correctly
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Identity provider could not be reached or answered with a server error
    #[error("Identity provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Identity provider refused the request (bad code, revoked refresh token, ...)
    #[error("Identity provider rejected request: {0}")]
    ProviderRejected(String),

    /// Token failed validation (signature, audience, expiry, inactive)
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OdmcpError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OdmcpError::Http(_) | OdmcpError::ProviderUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for OdmcpError {
    fn from(err: serde_json::Error) -> Self {
        OdmcpError::Internal(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for OdmcpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            OdmcpError::ProviderUnavailable(err.to_string())
        } else {
            OdmcpError::Http(err.to_string())
        }
    }
}

impl From<toml::de::Error> for OdmcpError {
    fn from(err: toml::de::Error) -> Self {
        OdmcpError::Configuration(format!("Failed to parse config: {}", err))
    }
}

/// Stable error codes returned to the tool dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// No usable identity for a call that requires one
    SessionRequired,
    /// An explicitly supplied session id is no longer valid
    SessionExpired,
    /// Authenticated convenience call found no identity through any strategy
    AuthenticationRequired,
    /// The channel's associated identity session no longer resolves
    AssociatedSessionExpired,
    /// Identity resolved but lacks the required permission
    InsufficientPermissions,
    /// Gateway misconfiguration
    ConfigurationError,
    /// Identity provider could not be reached
    ProviderUnavailable,
}

impl ErrorCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SessionRequired => "SessionRequired",
            ErrorCode::SessionExpired => "SessionExpired",
            ErrorCode::AuthenticationRequired => "AuthenticationRequired",
            ErrorCode::AssociatedSessionExpired => "AssociatedSessionExpired",
            ErrorCode::InsufficientPermissions => "InsufficientPermissions",
            ErrorCode::ConfigurationError => "ConfigurationError",
            ErrorCode::ProviderUnavailable => "ProviderUnavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-usable next steps attached to an [`AccessError`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remediation {
    /// Where to authenticate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_url: Option<String>,

    /// Name of the call argument that carries the session id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_name: Option<String>,

    /// Human-readable steps, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
}

/// Structured resolution/authorization failure
///
/// Returned, never thrown, across the public boundary so dispatchers can render
/// remediation text without matching on strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{code}: {message}")]
pub struct AccessError {
    /// Error code
    pub code: ErrorCode,

    /// Human-readable message
    pub message: String,

    /// Next steps for the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<Remediation>,

    /// Permission the operation needed (only for `InsufficientPermissions`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_permission: Option<String>,

    /// Permissions the identity actually carries (only for `InsufficientPermissions`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granted_permissions: Option<Vec<String>>,
}

impl AccessError {
    /// Create an error without remediation
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            remediation: None,
            required_permission: None,
            granted_permissions: None,
        }
    }

    /// Attach remediation
    pub fn with_remediation(mut self, remediation: Remediation) -> Self {
        self.remediation = Some(remediation);
        self
    }

    /// Build an `InsufficientPermissions` error carrying both sides of the check
    pub fn insufficient_permissions(
        required: impl Into<String>,
        granted: impl IntoIterator<Item = String>,
    ) -> Self {
        let required = required.into();
        let mut granted: Vec<String> = granted.into_iter().collect();
        granted.sort();

        Self {
            code: ErrorCode::InsufficientPermissions,
            message: format!(
                "This operation requires the '{}' permission, which your identity does not grant",
                required
            ),
            remediation: Some(Remediation {
                entry_url: None,
                parameter_name: None,
                steps: vec![format!(
                    "Ask your administrator to assign a role that includes '{}'",
                    required
                )],
            }),
            required_permission: Some(required),
            granted_permissions: Some(granted),
        }
    }
}

impl From<&OdmcpError> for AccessError {
    fn from(err: &OdmcpError) -> Self {
        match err {
            OdmcpError::ProviderUnavailable(_) | OdmcpError::Http(_) => AccessError::new(
                ErrorCode::ProviderUnavailable,
                "The identity provider is currently unavailable, try again shortly",
            ),
            OdmcpError::Configuration(msg) => {
                AccessError::new(ErrorCode::ConfigurationError, msg.clone())
            }
            // Store-level misses must not leak identifiers
            OdmcpError::IdentitySessionNotFound | OdmcpError::ChannelNotFound => {
                AccessError::new(ErrorCode::SessionRequired, "No usable session was found")
            }
            OdmcpError::ProviderRejected(_) | OdmcpError::InvalidToken(_) => AccessError::new(
                ErrorCode::AuthenticationRequired,
                "The identity provider did not accept the supplied credentials",
            ),
            OdmcpError::InvalidIdentity(_) => AccessError::new(
                ErrorCode::AuthenticationRequired,
                "The identity provider returned identity data the gateway cannot use",
            ),
            OdmcpError::Internal(_) => {
                AccessError::new(ErrorCode::ConfigurationError, "Internal gateway error")
            }
        }
    }
}

impl From<OdmcpError> for AccessError {
    fn from(err: OdmcpError) -> Self {
        AccessError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_serializes_as_name() {
        let json = serde_json::to_string(&ErrorCode::AssociatedSessionExpired).unwrap();
        assert_eq!(json, "\"AssociatedSessionExpired\"");
        assert_eq!(ErrorCode::SessionExpired.to_string(), "SessionExpired");
    }

    #[test]
    fn test_access_error_payload_shape() {
        let err = AccessError::new(ErrorCode::SessionRequired, "Authenticate first").with_remediation(
            Remediation {
                entry_url: Some("https://gw.example/auth/login".to_string()),
                parameter_name: Some("session_id".to_string()),
                steps: vec!["Open the login URL".to_string()],
            },
        );

        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "SessionRequired");
        assert_eq!(value["message"], "Authenticate first");
        assert_eq!(value["remediation"]["entryUrl"], "https://gw.example/auth/login");
        assert_eq!(value["remediation"]["parameterName"], "session_id");
        assert!(value.get("requiredPermission").is_none());
    }

    #[test]
    fn test_insufficient_permissions_carries_both_sets() {
        let err = AccessError::insufficient_permissions(
            "write",
            vec!["read".to_string(), "discover".to_string()],
        );

        assert_eq!(err.code, ErrorCode::InsufficientPermissions);
        assert_eq!(err.required_permission.as_deref(), Some("write"));
        assert_eq!(
            err.granted_permissions,
            Some(vec!["discover".to_string(), "read".to_string()])
        );
    }

    #[test]
    fn test_not_found_translation_hides_identifiers() {
        let err: AccessError = OdmcpError::IdentitySessionNotFound.into();
        assert_eq!(err.code, ErrorCode::SessionRequired);
        assert!(!err.message.contains("session id"));
    }

    #[test]
    fn test_retryable() {
        assert!(OdmcpError::ProviderUnavailable("down".into()).is_retryable());
        assert!(!OdmcpError::ProviderRejected("invalid_grant".into()).is_retryable());
    }

    #[test]
    fn test_unusable_identity_data_asks_for_authentication() {
        let err: AccessError = OdmcpError::InvalidIdentity("Invalid subject: email".into()).into();
        assert_eq!(err.code, ErrorCode::AuthenticationRequired);
        assert!(!err.message.contains("email"));
    }
}
