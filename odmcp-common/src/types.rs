//! Common types for the odmcp gateway

use chrono::{DateTime, Utc};
use odmcp_auth::{
    AssociationOutcome, AuthenticationMode, Authorization, EffectiveCredential, LoginOutcome,
    Permission, ResolutionSource, ResolvedIdentity,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use validator::Validate;

/// Tool-call authorization request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuthorizeRequest {
    /// Tool name
    #[validate(length(min = 1, max = 255))]
    pub operation: String,

    /// `mode` argument of parameterized tools
    #[serde(default)]
    pub variant: Option<String>,

    /// Session id supplied in the tool arguments
    #[serde(default)]
    pub session_id: Option<String>,

    /// Calling channel
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// Subject the call runs as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectSummary {
    /// Subject id
    pub subject_id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    /// How the identity was resolved
    pub source: ResolutionSource,

    /// Session expiry
    pub session_expires_at: DateTime<Utc>,
}

/// Successful authorization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizeResponse {
    /// Identity, absent for anonymous calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<SubjectSummary>,

    /// Permission that was checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_permission: Option<Permission>,

    /// Granted permissions after hierarchy expansion
    pub effective_permissions: BTreeSet<Permission>,

    /// Backend destination name
    pub destination: String,

    /// Authentication mode of the destination
    pub authentication_mode: AuthenticationMode,

    /// Credential the backend call should use
    pub effective_credential: EffectiveCredential,

    /// Caller access token to forward, when propagating
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller_token: Option<String>,
}

impl From<&Authorization> for AuthorizeResponse {
    fn from(auth: &Authorization) -> Self {
        let subject = match &auth.identity {
            ResolvedIdentity::Anonymous => None,
            ResolvedIdentity::Authenticated { session, source } => Some(SubjectSummary {
                subject_id: session.subject.subject_id.clone(),
                display_name: session.subject.display_name.clone(),
                tenant: session.subject.tenant.clone(),
                source: *source,
                session_expires_at: session.expires_at,
            }),
        };

        Self {
            subject,
            required_permission: auth.decision.required_permission,
            effective_permissions: auth.decision.effective_permissions.clone(),
            destination: auth.backend.context.destination_name.clone(),
            authentication_mode: auth.backend.context.mode,
            effective_credential: auth.backend.effective,
            caller_token: auth
                .backend
                .credential
                .as_ref()
                .map(|credential| credential.access_token.clone()),
        }
    }
}

/// Open (or register) a channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OpenChannelRequest {
    /// Transport-assigned id; generated when absent
    #[serde(default)]
    pub channel_id: Option<String>,

    /// Opaque metadata
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Channel open result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelResponse {
    /// Channel id
    pub channel_id: String,

    /// False when the channel already existed
    pub created: bool,
}

/// Associate a channel with an identity session
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AssociateRequest {
    /// Identity session id
    #[validate(length(min = 1))]
    pub session_id: String,
}

/// Association result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationStatus {
    /// Newly associated
    Associated,
    /// Already associated with this session
    AlreadyAssociated,
    /// Kept an existing association to another session
    Kept,
}

impl From<&AssociationOutcome> for AssociationStatus {
    fn from(outcome: &AssociationOutcome) -> Self {
        match outcome {
            AssociationOutcome::Associated => AssociationStatus::Associated,
            AssociationOutcome::AlreadyAssociated => AssociationStatus::AlreadyAssociated,
            AssociationOutcome::Kept { .. } => AssociationStatus::Kept,
        }
    }
}

/// Association response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssociateResponse {
    /// Outcome
    pub status: AssociationStatus,
}

/// Auto-association request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AutoAssociateRequest {
    /// Identity session id
    #[validate(length(min = 1))]
    pub session_id: String,
}

/// Auto-association response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoAssociateResponse {
    /// Whether a channel was associated
    pub associated: bool,
}

/// Query of the browser login start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginQuery {
    /// Channel to associate after login
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// Browser login start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginStartResponse {
    /// Provider URL to open
    pub authorization_url: String,
    /// State parameter
    pub state: String,
}

/// Provider redirect back to the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackQuery {
    /// Authorization code
    pub code: String,
    /// State from the login start
    #[serde(default)]
    pub state: Option<String>,
}

/// Log in with a bearer token
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TokenLoginRequest {
    /// Bearer token
    #[validate(length(min = 1))]
    pub token: String,

    /// Channel to associate
    #[serde(default)]
    pub channel_id: Option<String>,
}

/// Completed login
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    /// New identity session id; pass it as the session parameter
    pub session_id: String,
    /// Subject id
    pub subject_id: String,
    /// Session expiry
    pub expires_at: DateTime<Utc>,
    /// Whether a channel now points at the session
    pub associated: bool,
}

impl From<&LoginOutcome> for LoginResponse {
    fn from(outcome: &LoginOutcome) -> Self {
        Self {
            session_id: outcome.session.id.to_string(),
            subject_id: outcome.session.subject.subject_id.clone(),
            expires_at: outcome.session.expires_at,
            associated: outcome.associated,
        }
    }
}

/// Logout request
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct LogoutRequest {
    /// Identity session id
    #[validate(length(min = 1))]
    pub session_id: String,
}

/// Logout result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoutResponse {
    /// Channels closed by the cascade
    pub channels_closed: usize,
}

/// Health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// "healthy"
    pub status: String,
    /// Gateway version
    pub version: String,
    /// Stored identity sessions
    pub sessions: usize,
    /// Open channels
    pub channels: usize,
}
