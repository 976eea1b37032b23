//! Session context
//!
//! One `SessionContext` is built at startup and shared (behind an `Arc`) by
//! every handler. It owns the identity store, the channel bridge and the
//! decision components, and is the single entry point for tool-call
//! authorization:
//!
//! ```text
//! catalog -> classify -> resolve identity -> check permission
//!         -> refresh caller credential (no locks held) -> bind backend
//! ```

use crate::authorization::{AuthorizationDecision, AuthorizationEngine};
use crate::config::GatewayConfig;
use crate::error::{AccessError, OdmcpError, Result};
use crate::operations::OperationCatalog;
use crate::provider::{self, IdentityProvider, ProviderGrant};
use crate::resolver::{AuthenticationResolver, ResolvedIdentity};
use crate::routing::{BackendBinding, CredentialRouter, OperationClass};
use crate::session::{
    AssociationOutcome, ChannelId, ChannelSessionBridge, IdentitySession, IdentitySessionId,
    IdentitySessionStore, IdentityUpdate,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pending browser logins older than this are forgotten
const LOGIN_STATE_TTL: Duration = Duration::from_secs(10 * 60);

/// One tool call to authorize
#[derive(Debug, Clone, Default)]
pub struct AuthorizeParams {
    /// Tool name
    pub operation: String,
    /// `mode` argument of parameterized tools
    pub variant: Option<String>,
    /// Session id supplied in the call arguments
    pub session_id: Option<String>,
    /// Calling channel
    pub channel_id: Option<ChannelId>,
}

impl AuthorizeParams {
    /// Params for `operation`
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Self::default()
        }
    }

    /// Set the `mode` variant
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Set the explicit session id
    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the calling channel
    pub fn with_channel(mut self, channel: ChannelId) -> Self {
        self.channel_id = Some(channel);
        self
    }
}

/// A call that may proceed
#[derive(Debug, Clone)]
pub struct Authorization {
    /// Identity the call runs as
    pub identity: ResolvedIdentity,
    /// Permission check outcome
    pub decision: AuthorizationDecision,
    /// Backend context and credential
    pub backend: BackendBinding,
}

/// Browser login started by [`SessionContext::login_url`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    /// URL to open
    pub url: String,
    /// Opaque state echoed back by the provider
    pub state: String,
}

/// Result of a completed login
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Newly created identity session
    pub session: IdentitySession,
    /// Whether a channel now points at the session
    pub associated: bool,
}

struct PendingLogin {
    channel: Option<ChannelId>,
    started: DateTime<Utc>,
}

/// Shared state for identity bridging and credential routing
pub struct SessionContext {
    store: IdentitySessionStore,
    bridge: ChannelSessionBridge,
    resolver: AuthenticationResolver,
    engine: AuthorizationEngine,
    router: CredentialRouter,
    catalog: Arc<OperationCatalog>,
    provider: Arc<dyn IdentityProvider>,
    allow_environment_fallback: bool,
    refresh_credentials: bool,
    refresh_skew: Duration,
    cleanup_interval: Duration,
    channel_max_age: Duration,
    pending_logins: Mutex<HashMap<String, PendingLogin>>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl SessionContext {
    /// Build a context with an explicit identity provider
    pub fn new(config: &GatewayConfig, provider: Arc<dyn IdentityProvider>) -> Result<Self> {
        config.validate()?;
        let login_url = config
            .login_url()
            .ok_or_else(|| OdmcpError::Configuration("No login URL configured".to_string()))?;

        let store = IdentitySessionStore::new(&config.sessions);
        let bridge = ChannelSessionBridge::new(store.clone());
        let catalog = Arc::new(OperationCatalog::new(&config.operations));

        Ok(Self {
            resolver: AuthenticationResolver::new(
                bridge.clone(),
                login_url,
                config.auth.session_parameter.clone(),
            ),
            engine: AuthorizationEngine::new(Arc::clone(&catalog)),
            router: CredentialRouter::new(&config.destinations, Arc::clone(&catalog)),
            catalog,
            store,
            bridge,
            provider,
            allow_environment_fallback: config.auth.allow_environment_fallback,
            refresh_credentials: config.auth.refresh_credentials,
            refresh_skew: config.sessions.refresh_skew,
            cleanup_interval: config.sessions.cleanup_interval,
            channel_max_age: config.sessions.channel_max_age,
            pending_logins: Mutex::new(HashMap::new()),
            maintenance: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    /// Build a context with the provider named in the configuration
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let provider = provider::from_config(&config.provider)?;
        Self::new(config, provider)
    }

    /// Identity session store
    pub fn store(&self) -> &IdentitySessionStore {
        &self.store
    }

    /// Channel bridge
    pub fn bridge(&self) -> &ChannelSessionBridge {
        &self.bridge
    }

    /// Authorize one tool call
    ///
    /// Failures come back as structured [`AccessError`]s; nothing reaches a
    /// backend unless this returns `Ok`.
    pub async fn authorize(
        &self,
        params: &AuthorizeParams,
    ) -> std::result::Result<Authorization, AccessError> {
        let variant = params.variant.as_deref();
        let profile = self.catalog.profile(&params.operation, variant);

        let identity = self
            .resolver
            .resolve(
                profile.policy,
                params.session_id.as_deref(),
                params.channel_id.as_ref(),
                self.allow_environment_fallback,
            )
            .await?;

        let granted = identity.granted_permissions();
        let decision = self
            .engine
            .decide_for(&params.operation, variant, &granted);
        if !decision.granted {
            let required = profile
                .required
                .map(|p| p.as_str().to_string())
                .unwrap_or_default();
            info!(
                operation = %params.operation,
                required = %required,
                "Permission denied"
            );
            return Err(AccessError::insufficient_permissions(required, granted));
        }

        let identity = if profile.class == OperationClass::Operational && self.refresh_credentials {
            self.refresh_if_needed(identity).await
        } else {
            identity
        };

        let backend = self
            .router
            .bind(profile.class, identity.session().map(|s| &s.credential));

        debug!(
            operation = %params.operation,
            class = ?profile.class,
            destination = %backend.context.destination_name,
            effective = ?backend.effective,
            "Tool call authorized"
        );

        Ok(Authorization {
            identity,
            decision,
            backend,
        })
    }

    async fn refresh_if_needed(&self, identity: ResolvedIdentity) -> ResolvedIdentity {
        let ResolvedIdentity::Authenticated { session, source } = identity else {
            return identity;
        };

        let credential = &session.credential;
        let Some(refresh_token) = credential.refresh_token.clone() else {
            return ResolvedIdentity::Authenticated { session, source };
        };
        if !credential.expires_within(Utc::now(), self.refresh_skew) {
            return ResolvedIdentity::Authenticated { session, source };
        }

        // network call; no session lock is held here
        let grant = match self.provider.refresh(&refresh_token).await {
            Ok(grant) => grant,
            Err(err) => {
                warn!(
                    session = %session.id.fingerprint(),
                    error = %err,
                    "Credential refresh failed, continuing with current credential"
                );
                return ResolvedIdentity::Authenticated { session, source };
            }
        };

        if grant.subject.subject_id != session.subject_id() {
            warn!(
                session = %session.id.fingerprint(),
                "Refreshed credential belongs to a different subject, ignoring it"
            );
            return ResolvedIdentity::Authenticated { session, source };
        }

        match self
            .store
            .update(&session.id, IdentityUpdate::credential(grant.credential))
            .await
        {
            Ok(updated) => {
                debug!(session = %updated.id.fingerprint(), "Caller credential refreshed");
                ResolvedIdentity::Authenticated {
                    session: updated,
                    source,
                }
            }
            Err(err) => {
                warn!(session = %session.id.fingerprint(), error = %err, "Could not store refreshed credential");
                ResolvedIdentity::Authenticated { session, source }
            }
        }
    }

    /// Open a channel with a generated id
    pub fn open_channel(&self, metadata: Option<serde_json::Value>) -> ChannelId {
        self.bridge.open_channel(metadata)
    }

    /// Open a channel under a transport-assigned id
    pub fn register_channel(&self, id: ChannelId, metadata: Option<serde_json::Value>) -> bool {
        self.bridge.register_channel(id, metadata)
    }

    /// Close a channel
    pub async fn close_channel(&self, channel: &ChannelId) -> bool {
        self.bridge.close_channel(channel).await
    }

    /// Associate a channel with an identity session
    pub async fn associate(
        &self,
        channel: &ChannelId,
        identity: &IdentitySessionId,
    ) -> Result<AssociationOutcome> {
        self.bridge.associate(channel, identity).await
    }

    /// Attach an identity to the newest unassociated channel
    pub async fn auto_associate(&self, identity: &IdentitySessionId) -> bool {
        self.bridge.auto_associate(identity).await
    }

    /// Start a browser login; `channel` is associated once it completes
    pub fn login_url(&self, channel: Option<ChannelId>) -> Result<LoginStart> {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let state = URL_SAFE_NO_PAD.encode(bytes);

        let url = self.provider.authorization_url(&state)?;

        let now = Utc::now();
        let mut pending = self.pending_logins.lock();
        pending.retain(|_, login| {
            (now - login.started)
                .to_std()
                .map(|age| age < LOGIN_STATE_TTL)
                .unwrap_or(true)
        });
        pending.insert(
            state.clone(),
            PendingLogin {
                channel,
                started: now,
            },
        );

        Ok(LoginStart { url, state })
    }

    /// Channel recorded for a login `state`; each state is usable once
    pub fn take_login_state(&self, state: &str) -> Option<Option<ChannelId>> {
        self.pending_logins
            .lock()
            .remove(state)
            .map(|login| login.channel)
    }

    /// Finish a browser login
    ///
    /// Without a channel the session is attached to the newest unassociated
    /// channel, if any. Such an automatic association only serves convenience
    /// tools; operational calls still need the session id or an explicit
    /// association.
    pub async fn complete_login(
        &self,
        code: &str,
        channel: Option<&ChannelId>,
    ) -> Result<LoginOutcome> {
        let grant = self.provider.exchange_code(code).await?;
        self.establish(grant, channel).await
    }

    /// Log in with a bearer token validated by the provider
    pub async fn login_with_token(
        &self,
        token: &str,
        channel: Option<&ChannelId>,
    ) -> Result<LoginOutcome> {
        let grant = self.provider.validate_token(token).await?;
        self.establish(grant, channel).await
    }

    async fn establish(
        &self,
        grant: ProviderGrant,
        channel: Option<&ChannelId>,
    ) -> Result<LoginOutcome> {
        let session = self.store.create(grant.subject, grant.credential, None).await?;

        let associated = match channel {
            Some(channel) => match self.bridge.associate(channel, &session.id).await {
                Ok(AssociationOutcome::Associated | AssociationOutcome::AlreadyAssociated) => true,
                Ok(AssociationOutcome::Kept { .. }) => false,
                Err(err) => {
                    warn!(channel = %channel, error = %err, "Could not associate login with channel");
                    false
                }
            },
            None => self.bridge.auto_associate(&session.id).await,
        };

        info!(
            session = %session.id.fingerprint(),
            subject = %session.subject_id(),
            associated,
            "Login completed"
        );
        Ok(LoginOutcome {
            session,
            associated,
        })
    }

    /// Log out: close the session's channels and invalidate it
    pub async fn logout(&self, identity: &IdentitySessionId) -> usize {
        if self.resolver.fallback_identity().as_ref() == Some(identity) {
            self.resolver.set_fallback_identity(None);
        }
        self.bridge
            .invalidate_for_identity(identity, Some("logout"))
            .await
    }

    /// Set or clear the process-wide fallback identity
    pub fn set_fallback_identity(&self, identity: Option<IdentitySessionId>) {
        if identity.is_some() && !self.allow_environment_fallback {
            warn!("Fallback identity set but auth.allow_environment_fallback is off; it will not be used");
        }
        self.resolver.set_fallback_identity(identity);
    }

    /// Start the periodic channel sweep
    pub fn start_maintenance(&self) {
        let mut slot = self.maintenance.lock();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let bridge = self.bridge.clone();
        let token = self.shutdown.clone();
        let period = self.cleanup_interval;
        let max_age = self.channel_max_age;

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        bridge.cleanup(max_age).await;
                    }
                }
            }
            debug!("Channel maintenance stopped");
        }));
        info!(interval = ?period, max_age = ?max_age, "Channel maintenance started");
    }

    /// Stop background work and sweep expired sessions
    ///
    /// Anything still running at `deadline` is abandoned.
    pub async fn shutdown(&self, deadline: Duration) {
        let started = Instant::now();
        self.shutdown.cancel();

        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("Channel maintenance did not stop before the deadline, abandoning it");
                abort.abort();
            }
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        self.store.shutdown(remaining).await;
        info!(
            sessions = self.store.len(),
            channels = self.bridge.len(),
            "Session context shut down"
        );
    }
}
