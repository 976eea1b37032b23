//! Identity Session Store
//!
//! Owns every authenticated identity session: creation, lookup, mutation,
//! expiry, invalidation and the per-subject index.

use super::lock::{KeyedGuard, KeyedMutex};
use crate::config::SessionSettings;
use crate::error::{OdmcpError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::{Validate, ValidateEmail};

/// Floor for the sweep period; `tokio::time::interval` rejects zero
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_millis(100);

/// Opaque, unguessable identity session id
///
/// `Debug` prints only a fingerprint so ids do not end up in logs by accident.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentitySessionId(String);

impl IdentitySessionId {
    /// Generate a fresh id from 256 bits of OS randomness
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(URL_SAFE_NO_PAD.encode(bytes))
    }

    /// Raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short, non-reversible tag safe for log output
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_bytes());
        hex::encode(&digest[..6])
    }
}

impl From<String> for IdentitySessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for IdentitySessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for IdentitySessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for IdentitySessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentitySessionId({})", self.fingerprint())
    }
}

/// Subject claims taken from the identity provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SubjectInfo {
    /// Subject identifier (`sub` claim)
    #[validate(length(min = 1, max = 255))]
    pub subject_id: String,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(email)]
    pub email: Option<String>,

    /// Tenant / zone the subject belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

impl SubjectInfo {
    /// Subject with only an id
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            display_name: None,
            email: None,
            tenant: None,
        }
    }

    /// Set the display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Set the email address
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Set the tenant
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Trim optional attributes and drop the ones that are blank or malformed
    ///
    /// Providers routinely send `""` for attributes they do not know; only the
    /// subject id is mandatory.
    pub fn sanitized(self) -> Self {
        let email = non_blank(self.email).filter(|email| {
            let valid = email.validate_email();
            if !valid {
                debug!(subject = %self.subject_id, "Dropping malformed email attribute");
            }
            valid
        });

        Self {
            display_name: non_blank(self.display_name),
            email,
            tenant: non_blank(self.tenant),
            subject_id: self.subject_id,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Bearer credential obtained from the identity provider
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerCredential {
    /// Access token forwarded to backends on principal propagation
    pub access_token: String,

    /// Refresh token, when the provider issued one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Access token expiry, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Scopes granted with the token
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl BearerCredential {
    /// Credential with only an access token
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
        }
    }

    /// Set the granted scopes
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the refresh token
    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(token.into());
        self
    }

    /// Set the access token expiry
    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Whether the access token is past its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp <= now).unwrap_or(false)
    }

    /// Whether the access token expires within `window` of `now`
    pub fn expires_within(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match (self.expires_at, chrono::Duration::from_std(window)) {
            (Some(exp), Ok(window)) => exp <= now + window,
            _ => false,
        }
    }
}

impl fmt::Debug for BearerCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerCredential")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Authenticated identity session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySession {
    /// Session id
    pub id: IdentitySessionId,

    /// Subject the session belongs to
    pub subject: SubjectInfo,

    /// Bearer credential from the identity provider
    pub credential: BearerCredential,

    /// Permissions granted to the subject
    pub granted_permissions: BTreeSet<String>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Last successful lookup or mutation
    pub last_accessed_at: DateTime<Utc>,

    /// Expiry; the session is logically gone from this instant on
    pub expires_at: DateTime<Utc>,
}

impl IdentitySession {
    /// Subject id (shortcut)
    pub fn subject_id(&self) -> &str {
        &self.subject.subject_id
    }

    /// Whether the session is live at `now`
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whether the session has expired
    pub fn is_expired(&self) -> bool {
        !self.is_live_at(Utc::now())
    }
}

/// Field-level update for [`IdentitySessionStore::update`]
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct IdentityUpdate {
    /// New subject attributes; the subject id itself cannot change
    pub subject: Option<SubjectInfo>,

    /// Rotated credential
    pub credential: Option<BearerCredential>,

    /// Replacement permission set
    pub granted_permissions: Option<BTreeSet<String>>,
}

impl IdentityUpdate {
    /// Update only the credential
    pub fn credential(credential: BearerCredential) -> Self {
        Self {
            credential: Some(credential),
            ..Self::default()
        }
    }

    /// Update only the permission set
    pub fn permissions<I, S>(permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            granted_permissions: Some(permissions.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }
}

/// Both indexes, always mutated together
#[derive(Default)]
struct IdentityIndex {
    sessions: HashMap<IdentitySessionId, IdentitySession>,
    by_subject: HashMap<String, HashSet<IdentitySessionId>>,
}

impl IdentityIndex {
    fn insert(&mut self, session: IdentitySession) {
        self.by_subject
            .entry(session.subject.subject_id.clone())
            .or_default()
            .insert(session.id.clone());
        self.sessions.insert(session.id.clone(), session);
    }

    fn remove(&mut self, id: &IdentitySessionId) -> Option<IdentitySession> {
        let session = self.sessions.remove(id)?;
        if let Some(ids) = self.by_subject.get_mut(session.subject_id()) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_subject.remove(session.subject_id());
            }
        }
        Some(session)
    }
}

struct StoreInner {
    index: RwLock<IdentityIndex>,
    locks: KeyedMutex<IdentitySessionId>,
    default_ttl: Duration,
    cleanup_interval: Duration,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

/// Identity session store
///
/// Cheap to clone; clones share the same sessions. Mutations of one session id
/// are serialized through a per-id lock, lookups only take the short index lock.
#[derive(Clone)]
pub struct IdentitySessionStore {
    inner: Arc<StoreInner>,
}

impl IdentitySessionStore {
    /// Create an empty store
    pub fn new(settings: &SessionSettings) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                index: RwLock::new(IdentityIndex::default()),
                locks: KeyedMutex::new(),
                default_ttl: settings.default_ttl,
                cleanup_interval: settings.cleanup_interval.max(MIN_CLEANUP_INTERVAL),
                cleanup_task: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Create a session for a freshly authenticated subject
    ///
    /// Permissions are initialised from the credential's scopes. `ttl` falls back
    /// to the configured default.
    pub async fn create(
        &self,
        subject: SubjectInfo,
        credential: BearerCredential,
        ttl: Option<Duration>,
    ) -> Result<IdentitySession> {
        subject
            .validate()
            .map_err(|e| OdmcpError::InvalidIdentity(format!("Invalid subject: {}", e)))?;
        if credential.access_token.is_empty() {
            return Err(OdmcpError::InvalidIdentity(
                "Credential has an empty access token".to_string(),
            ));
        }

        let ttl = chrono::Duration::from_std(ttl.unwrap_or(self.inner.default_ttl))
            .map_err(|_| OdmcpError::InvalidIdentity("Session TTL out of range".to_string()))?;
        let now = Utc::now();

        let session = {
            let mut index = self.inner.index.write();
            let id = loop {
                let candidate = IdentitySessionId::generate();
                if !index.sessions.contains_key(&candidate) {
                    break candidate;
                }
            };

            let session = IdentitySession {
                id,
                granted_permissions: credential.scopes.iter().cloned().collect(),
                subject,
                credential,
                created_at: now,
                last_accessed_at: now,
                expires_at: now + ttl,
            };
            index.insert(session.clone());
            session
        };

        info!(
            session = %session.id.fingerprint(),
            subject = %session.subject_id(),
            expires_at = %session.expires_at,
            "Identity session created"
        );

        self.ensure_cleanup_task();
        Ok(session)
    }

    /// Look up a live session
    ///
    /// An expired session is invalidated on the way out and reported as absent.
    pub async fn get(&self, id: &IdentitySessionId) -> Option<IdentitySession> {
        let now = Utc::now();
        {
            let mut index = self.inner.index.write();
            match index.sessions.get_mut(id) {
                None => return None,
                Some(session) if session.is_live_at(now) => {
                    session.last_accessed_at = now;
                    return Some(session.clone());
                }
                Some(_) => {}
            }
        }

        self.expire_if_stale(id).await;
        None
    }

    /// Merge `update` into a live session
    pub async fn update(
        &self,
        id: &IdentitySessionId,
        update: IdentityUpdate,
    ) -> Result<IdentitySession> {
        if let Some(subject) = &update.subject {
            subject
                .validate()
                .map_err(|e| OdmcpError::InvalidIdentity(format!("Invalid subject: {}", e)))?;
        }

        let _guard = self.inner.locks.lock(id).await;
        let now = Utc::now();
        let mut index = self.inner.index.write();

        let live = match index.sessions.get(id) {
            Some(session) => session.is_live_at(now),
            None => return Err(OdmcpError::IdentitySessionNotFound),
        };
        if !live {
            index.remove(id);
            return Err(OdmcpError::IdentitySessionNotFound);
        }
        let session = index
            .sessions
            .get_mut(id)
            .ok_or(OdmcpError::IdentitySessionNotFound)?;

        if let Some(subject) = update.subject {
            if subject.subject_id != session.subject.subject_id {
                return Err(OdmcpError::InvalidIdentity(
                    "Subject id of a session cannot change".to_string(),
                ));
            }
            session.subject = subject;
        }
        if let Some(credential) = update.credential {
            session.credential = credential;
        }
        if let Some(permissions) = update.granted_permissions {
            session.granted_permissions = permissions;
        }
        session.last_accessed_at = now;

        debug!(session = %id.fingerprint(), "Identity session updated");
        Ok(session.clone())
    }

    /// Remove a session; returns whether one was removed
    ///
    /// Idempotent: invalidating an absent id is a no-op.
    pub async fn invalidate(&self, id: &IdentitySessionId, reason: Option<&str>) -> bool {
        let guard = self.inner.locks.lock(id).await;
        self.remove_locked(&guard, reason).is_some()
    }

    /// Invalidate every session of a subject; returns how many were removed
    pub async fn invalidate_all_for_subject(&self, subject_id: &str, reason: Option<&str>) -> usize {
        let mut removed = 0;
        for id in self.sessions_for_subject(subject_id) {
            if self.invalidate(&id, reason).await {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(subject = %subject_id, removed, "Invalidated all sessions for subject");
        }
        removed
    }

    /// Push a live session's expiry further out; returns the new expiry
    pub async fn extend(
        &self,
        id: &IdentitySessionId,
        additional: Duration,
    ) -> Result<DateTime<Utc>> {
        let additional = chrono::Duration::from_std(additional)
            .map_err(|_| OdmcpError::InvalidIdentity("Extension out of range".to_string()))?;

        let _guard = self.inner.locks.lock(id).await;
        let now = Utc::now();
        let mut index = self.inner.index.write();

        let live = match index.sessions.get(id) {
            Some(session) => session.is_live_at(now),
            None => return Err(OdmcpError::IdentitySessionNotFound),
        };
        if !live {
            index.remove(id);
            return Err(OdmcpError::IdentitySessionNotFound);
        }

        let session = index
            .sessions
            .get_mut(id)
            .ok_or(OdmcpError::IdentitySessionNotFound)?;
        session.expires_at += additional;
        session.last_accessed_at = now;
        debug!(session = %id.fingerprint(), expires_at = %session.expires_at, "Identity session extended");
        Ok(session.expires_at)
    }

    /// Invalidate every expired session; returns how many were removed
    ///
    /// Takes each session's lock before removing it, so a sweep never races an
    /// explicit update or invalidation of the same id.
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut expired: Vec<IdentitySessionId> = self
            .inner
            .index
            .read()
            .sessions
            .values()
            .filter(|session| !session.is_live_at(now))
            .map(|session| session.id.clone())
            .collect();
        expired.sort();

        let mut removed = 0;
        for id in &expired {
            if self.expire_if_stale(id).await {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Expired identity sessions cleaned up");
        }
        removed
    }

    /// Ids of a subject's sessions, sorted
    pub fn sessions_for_subject(&self, subject_id: &str) -> Vec<IdentitySessionId> {
        let mut ids: Vec<IdentitySessionId> = self
            .inner
            .index
            .read()
            .by_subject
            .get(subject_id)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Number of stored sessions, including expired ones not yet cleaned up
    pub fn len(&self) -> usize {
        self.inner.index.read().sessions.len()
    }

    /// Whether the store holds no sessions
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the cleanup timer and run a final sweep
    ///
    /// Waits at most `deadline` for the timer task; after that it is abandoned.
    pub async fn shutdown(&self, deadline: Duration) {
        self.inner.shutdown.cancel();

        let handle = self.inner.cleanup_task.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("Identity cleanup task did not stop before the deadline, abandoning it");
                abort.abort();
            }
        }

        self.cleanup().await;
    }

    /// Acquire the per-id lock (used by the channel bridge for cascades)
    pub(crate) async fn lock(&self, id: &IdentitySessionId) -> KeyedGuard<IdentitySessionId> {
        self.inner.locks.lock(id).await
    }

    /// Live session without side effects; safe to call while holding the id's lock
    pub(crate) fn peek_live(&self, id: &IdentitySessionId) -> Option<IdentitySession> {
        let now = Utc::now();
        self.inner
            .index
            .read()
            .sessions
            .get(id)
            .filter(|session| session.is_live_at(now))
            .cloned()
    }

    /// Remove the session whose lock `guard` holds
    pub(crate) fn remove_locked(
        &self,
        guard: &KeyedGuard<IdentitySessionId>,
        reason: Option<&str>,
    ) -> Option<IdentitySession> {
        let id = guard.key();
        let removed = self.inner.index.write().remove(id);
        if let Some(session) = &removed {
            info!(
                session = %id.fingerprint(),
                subject = %session.subject_id(),
                reason = reason.unwrap_or("unspecified"),
                "Identity session invalidated"
            );
        }
        removed
    }

    async fn expire_if_stale(&self, id: &IdentitySessionId) -> bool {
        let guard = self.inner.locks.lock(id).await;
        let still_expired = self
            .inner
            .index
            .read()
            .sessions
            .get(id)
            .map(|session| session.is_expired())
            .unwrap_or(false);

        still_expired && self.remove_locked(&guard, Some("expired")).is_some()
    }

    fn ensure_cleanup_task(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let mut slot = self.inner.cleanup_task.lock();
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.clone();
        let period = self.inner.cleanup_interval;
        *slot = Some(tokio::spawn(run_cleanup_loop(weak, token, period)));
        debug!(interval = ?period, "Identity cleanup timer started");
    }
}

async fn run_cleanup_loop(store: Weak<StoreInner>, shutdown: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // interval fires immediately on the first tick
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = store.upgrade() else { break };
                IdentitySessionStore { inner }.cleanup().await;
            }
        }
    }

    debug!("Identity cleanup timer stopped");
}
