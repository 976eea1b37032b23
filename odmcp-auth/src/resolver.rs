//! Authentication Resolver
//!
//! Turns "explicit session id, channel, fallback" into an identity using one
//! of three policies:
//!
//! - `Strict` (operational calls): explicit id, else an explicit channel
//!   association. A bad explicit id fails immediately and nothing falls
//!   through to a weaker identity; automatic associations are ignored.
//! - `Permissive` (discovery calls): always anonymous, no lookups.
//! - `Authenticated` (convenience calls): explicit id, channel, then the
//!   process-wide fallback identity when allowed.

use crate::error::{AccessError, ErrorCode, Remediation};
use crate::session::{ChannelId, ChannelLookup, ChannelSessionBridge, IdentitySession, IdentitySessionId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// How strictly a call's identity is resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Explicit session or channel association only
    Strict,
    /// No identity needed
    Permissive,
    /// Any identity source, including the fallback identity
    Authenticated,
}

/// Where a resolved identity came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    /// Session id supplied with the call
    ExplicitSession,
    /// Association of the calling channel
    Channel,
    /// Process-wide fallback identity
    Fallback,
}

/// Identity a call runs as
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedIdentity {
    /// No identity; empty permissions
    Anonymous,
    /// Live identity session
    Authenticated {
        /// The session
        session: IdentitySession,
        /// How it was found
        source: ResolutionSource,
    },
}

impl ResolvedIdentity {
    /// Session, when authenticated
    pub fn session(&self) -> Option<&IdentitySession> {
        match self {
            ResolvedIdentity::Anonymous => None,
            ResolvedIdentity::Authenticated { session, .. } => Some(session),
        }
    }

    /// Whether the call is anonymous
    pub fn is_anonymous(&self) -> bool {
        matches!(self, ResolvedIdentity::Anonymous)
    }

    /// Granted permissions; empty for anonymous calls
    pub fn granted_permissions(&self) -> BTreeSet<String> {
        self.session()
            .map(|session| session.granted_permissions.clone())
            .unwrap_or_default()
    }
}

/// Runs the strategy chain for a policy
pub struct AuthenticationResolver {
    bridge: ChannelSessionBridge,
    login_url: String,
    session_parameter: String,
    fallback: RwLock<Option<IdentitySessionId>>,
}

impl AuthenticationResolver {
    /// Create a resolver; `login_url` and `session_parameter` feed remediation
    pub fn new(
        bridge: ChannelSessionBridge,
        login_url: impl Into<String>,
        session_parameter: impl Into<String>,
    ) -> Self {
        Self {
            bridge,
            login_url: login_url.into(),
            session_parameter: session_parameter.into(),
            fallback: RwLock::new(None),
        }
    }

    /// Set or clear the process-wide fallback identity
    pub fn set_fallback_identity(&self, identity: Option<IdentitySessionId>) {
        *self.fallback.write() = identity;
    }

    /// Current fallback identity id
    pub fn fallback_identity(&self) -> Option<IdentitySessionId> {
        self.fallback.read().clone()
    }

    /// Resolve the identity for one call
    ///
    /// Empty ids count as absent. `environment_fallback_allowed` only matters
    /// for the `Authenticated` policy.
    pub async fn resolve(
        &self,
        policy: ResolutionPolicy,
        explicit: Option<&str>,
        channel: Option<&ChannelId>,
        environment_fallback_allowed: bool,
    ) -> Result<ResolvedIdentity, AccessError> {
        let explicit = explicit.map(str::trim).filter(|id| !id.is_empty());
        let channel = channel.filter(|id| !id.as_str().trim().is_empty());

        let result = match policy {
            ResolutionPolicy::Permissive => Ok(ResolvedIdentity::Anonymous),
            ResolutionPolicy::Strict => self.resolve_strict(explicit, channel).await,
            ResolutionPolicy::Authenticated => {
                self.resolve_authenticated(explicit, channel, environment_fallback_allowed)
                    .await
            }
        };

        if let Err(err) = &result {
            debug!(?policy, code = %err.code, "Identity resolution failed");
        }
        result
    }

    async fn resolve_strict(
        &self,
        explicit: Option<&str>,
        channel: Option<&ChannelId>,
    ) -> Result<ResolvedIdentity, AccessError> {
        if let Some(id) = explicit {
            return match self.bridge.store().get(&IdentitySessionId::from(id)).await {
                Some(session) => Ok(authenticated(session, ResolutionSource::ExplicitSession)),
                None => Err(self.session_expired()),
            };
        }

        if let Some(channel) = channel {
            match self.bridge.lookup(channel).await {
                ChannelLookup::Resolved(session) => {
                    return Ok(authenticated(session, ResolutionSource::Channel));
                }
                ChannelLookup::AutoAssociated(session) => {
                    debug!(
                        channel = %channel,
                        session = %session.id.fingerprint(),
                        "Ignoring automatic channel association for a strict call"
                    );
                }
                ChannelLookup::AssociationExpired => return Err(self.associated_session_expired()),
                ChannelLookup::Unassociated | ChannelLookup::UnknownChannel => {}
            }
        }

        Err(self.session_required())
    }

    async fn resolve_authenticated(
        &self,
        explicit: Option<&str>,
        channel: Option<&ChannelId>,
        environment_fallback_allowed: bool,
    ) -> Result<ResolvedIdentity, AccessError> {
        if let Some(id) = explicit {
            if let Some(session) = self.bridge.store().get(&IdentitySessionId::from(id)).await {
                return Ok(authenticated(session, ResolutionSource::ExplicitSession));
            }
            debug!("Explicit session did not resolve, trying other sources");
        }

        if let Some(channel) = channel {
            if let Some(session) = self.bridge.resolve_identity_for(channel).await {
                return Ok(authenticated(session, ResolutionSource::Channel));
            }
        }

        if environment_fallback_allowed {
            if let Some(id) = self.fallback_identity() {
                if let Some(session) = self.bridge.store().get(&id).await {
                    debug!(session = %id.fingerprint(), "Using fallback identity");
                    return Ok(authenticated(session, ResolutionSource::Fallback));
                }
            }
        }

        Err(self.authentication_required())
    }

    fn remediation(&self, steps: Vec<String>) -> Remediation {
        Remediation {
            entry_url: Some(self.login_url.clone()),
            parameter_name: Some(self.session_parameter.clone()),
            steps,
        }
    }

    fn session_required(&self) -> AccessError {
        AccessError::new(
            ErrorCode::SessionRequired,
            "This operation works on business data and requires an authenticated session",
        )
        .with_remediation(self.remediation(vec![
            format!("Sign in at {}", self.login_url),
            format!(
                "Pass the returned session id as '{}' in the tool call",
                self.session_parameter
            ),
        ]))
    }

    fn session_expired(&self) -> AccessError {
        AccessError::new(
            ErrorCode::SessionExpired,
            "The supplied session is no longer valid",
        )
        .with_remediation(self.remediation(vec![
            format!("Sign in again at {}", self.login_url),
            format!(
                "Replace '{}' with the new session id",
                self.session_parameter
            ),
        ]))
    }

    fn associated_session_expired(&self) -> AccessError {
        AccessError::new(
            ErrorCode::AssociatedSessionExpired,
            "The session associated with this connection has expired",
        )
        .with_remediation(self.remediation(vec![
            format!("Sign in again at {}", self.login_url),
            format!(
                "Or pass a valid session id as '{}'",
                self.session_parameter
            ),
        ]))
    }

    fn authentication_required(&self) -> AccessError {
        AccessError::new(
            ErrorCode::AuthenticationRequired,
            "This tool personalises its output and needs to know who you are",
        )
        .with_remediation(self.remediation(vec![
            format!("Sign in at {}", self.login_url),
            format!(
                "Pass the returned session id as '{}'",
                self.session_parameter
            ),
        ]))
    }
}

fn authenticated(session: IdentitySession, source: ResolutionSource) -> ResolvedIdentity {
    ResolvedIdentity::Authenticated { session, source }
}
