//! Channel Session Bridge
//!
//! Tool-protocol channels are short-lived and anonymous on their own. The
//! bridge attaches each channel to at most one identity session and keeps the
//! reverse index (identity -> channels) so logout can cascade.
//!
//! Identity data is never cached here: a channel only holds the identity
//! session id and every lookup goes back through the store.
//!
//! Lock order is identity-session lock first, then channel locks in
//! ascending channel id.

use super::identity::{IdentitySession, IdentitySessionId, IdentitySessionStore};
use super::lock::KeyedMutex;
use crate::error::{OdmcpError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel session id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Generate a new random channel id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a channel came to be associated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationKind {
    /// Named channel, via [`ChannelSessionBridge::associate`]
    Explicit,
    /// Guessed by [`ChannelSessionBridge::auto_associate`]; never enough for
    /// operational calls
    Auto,
}

/// One connected tool-calling client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSession {
    /// Channel id
    pub id: ChannelId,

    /// When the channel was opened
    pub created_at: DateTime<Utc>,

    /// Identity session this channel acts as, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_identity: Option<IdentitySessionId>,

    /// How the association was made; set whenever `associated_identity` is
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub associated_via: Option<AssociationKind>,

    /// Caller-supplied metadata, opaque to the bridge
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Result of [`ChannelSessionBridge::associate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationOutcome {
    /// The channel is now associated with the identity session
    Associated,
    /// The channel was already associated with this identity session
    AlreadyAssociated,
    /// The channel keeps its live association with a different identity session
    Kept {
        /// Identity session the channel stays with
        existing: IdentitySessionId,
    },
}

/// Detailed result of [`ChannelSessionBridge::lookup`]
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelLookup {
    /// No such channel
    UnknownChannel,
    /// Channel exists but has no association
    Unassociated,
    /// Channel was explicitly associated with a live identity session
    Resolved(IdentitySession),
    /// Channel was auto-associated with a live identity session
    AutoAssociated(IdentitySession),
    /// Channel pointed at an identity session that no longer resolves;
    /// the association has been dropped
    AssociationExpired,
}

struct ChannelEntry {
    session: ChannelSession,
    opened_seq: u64,
}

/// Forward and reverse associations
///
/// Only `link`, `unlink` and `remove` touch associations, and each updates
/// both directions.
#[derive(Default)]
struct ChannelIndex {
    channels: HashMap<ChannelId, ChannelEntry>,
    by_identity: HashMap<IdentitySessionId, BTreeSet<ChannelId>>,
    next_seq: u64,
}

impl ChannelIndex {
    fn insert(&mut self, session: ChannelSession) {
        let opened_seq = self.next_seq;
        self.next_seq += 1;
        self.channels
            .insert(session.id.clone(), ChannelEntry { session, opened_seq });
    }

    fn association(&self, channel: &ChannelId) -> Option<Option<IdentitySessionId>> {
        self.channels
            .get(channel)
            .map(|entry| entry.session.associated_identity.clone())
    }

    fn link_of(
        &self,
        channel: &ChannelId,
    ) -> Option<Option<(IdentitySessionId, AssociationKind)>> {
        self.channels.get(channel).map(|entry| {
            let session = &entry.session;
            session.associated_identity.clone().zip(session.associated_via)
        })
    }

    fn link(
        &mut self,
        channel: &ChannelId,
        identity: &IdentitySessionId,
        kind: AssociationKind,
    ) -> bool {
        self.unlink(channel);
        let Some(entry) = self.channels.get_mut(channel) else {
            return false;
        };
        entry.session.associated_identity = Some(identity.clone());
        entry.session.associated_via = Some(kind);
        self.by_identity
            .entry(identity.clone())
            .or_default()
            .insert(channel.clone());
        true
    }

    fn unlink(&mut self, channel: &ChannelId) -> Option<IdentitySessionId> {
        let session = &mut self.channels.get_mut(channel)?.session;
        session.associated_via = None;
        let identity = session.associated_identity.take()?;

        if let Some(channels) = self.by_identity.get_mut(&identity) {
            channels.remove(channel);
            if channels.is_empty() {
                self.by_identity.remove(&identity);
            }
        }
        Some(identity)
    }

    fn remove(&mut self, channel: &ChannelId) -> Option<ChannelSession> {
        self.unlink(channel);
        self.channels.remove(channel).map(|entry| entry.session)
    }

    fn newest_unassociated(&self) -> Option<ChannelId> {
        self.channels
            .values()
            .filter(|entry| entry.session.associated_identity.is_none())
            .max_by_key(|entry| entry.opened_seq)
            .map(|entry| entry.session.id.clone())
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let forward_ok = self.channels.values().all(|entry| {
            let session = &entry.session;
            if session.associated_identity.is_some() != session.associated_via.is_some() {
                return false;
            }
            match &entry.session.associated_identity {
                Some(identity) => self
                    .by_identity
                    .get(identity)
                    .map(|set| set.contains(&entry.session.id))
                    .unwrap_or(false),
                None => true,
            }
        });
        let reverse_ok = self.by_identity.iter().all(|(identity, channels)| {
            !channels.is_empty()
                && channels.iter().all(|channel| {
                    self.channels
                        .get(channel)
                        .and_then(|entry| entry.session.associated_identity.as_ref())
                        == Some(identity)
                })
        });
        forward_ok && reverse_ok
    }
}

struct BridgeInner {
    index: RwLock<ChannelIndex>,
    locks: KeyedMutex<ChannelId>,
    store: IdentitySessionStore,
}

/// Channel session bridge
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ChannelSessionBridge {
    inner: Arc<BridgeInner>,
}

impl ChannelSessionBridge {
    /// Create a bridge resolving identities through `store`
    pub fn new(store: IdentitySessionStore) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                index: RwLock::new(ChannelIndex::default()),
                locks: KeyedMutex::new(),
                store,
            }),
        }
    }

    /// Identity store behind this bridge
    pub fn store(&self) -> &IdentitySessionStore {
        &self.inner.store
    }

    /// Open a channel with a generated id
    pub fn open_channel(&self, metadata: Option<serde_json::Value>) -> ChannelId {
        let id = ChannelId::generate();
        self.insert_channel(id.clone(), metadata);
        id
    }

    /// Open a channel under an id chosen by the transport
    ///
    /// Returns `false` when the channel already exists; its state is left alone.
    pub fn register_channel(&self, id: ChannelId, metadata: Option<serde_json::Value>) -> bool {
        if self.inner.index.read().channels.contains_key(&id) {
            return false;
        }
        self.insert_channel(id, metadata)
    }

    fn insert_channel(&self, id: ChannelId, metadata: Option<serde_json::Value>) -> bool {
        let mut index = self.inner.index.write();
        if index.channels.contains_key(&id) {
            return false;
        }

        index.insert(ChannelSession {
            id: id.clone(),
            created_at: Utc::now(),
            associated_identity: None,
            associated_via: None,
            metadata: metadata.unwrap_or(serde_json::Value::Null),
        });
        debug!(channel = %id, "Channel opened");
        true
    }

    /// Associate a channel with an identity session
    ///
    /// A channel with a live explicit association keeps it; the second caller
    /// gets [`AssociationOutcome::Kept`] and a warning is logged. An automatic
    /// association gives way to an explicit one.
    pub async fn associate(
        &self,
        channel: &ChannelId,
        identity: &IdentitySessionId,
    ) -> Result<AssociationOutcome> {
        let _identity_guard = self.inner.store.lock(identity).await;
        let _channel_guard = self.inner.locks.lock(channel).await;

        if self.inner.store.peek_live(identity).is_none() {
            return Err(OdmcpError::IdentitySessionNotFound);
        }

        let current = self
            .inner
            .index
            .read()
            .link_of(channel)
            .ok_or(OdmcpError::ChannelNotFound)?;

        match current {
            Some((existing, AssociationKind::Explicit)) if &existing == identity => {
                return Ok(AssociationOutcome::AlreadyAssociated);
            }
            Some((existing, AssociationKind::Auto)) if &existing == identity => {
                debug!(
                    channel = %channel,
                    session = %identity.fingerprint(),
                    "Confirming automatic association"
                );
            }
            Some((existing, AssociationKind::Auto))
                if self.inner.store.peek_live(&existing).is_some() =>
            {
                info!(
                    channel = %channel,
                    replaced = %existing.fingerprint(),
                    session = %identity.fingerprint(),
                    "Explicit association replaces an automatic one"
                );
            }
            Some((existing, AssociationKind::Explicit))
                if self.inner.store.peek_live(&existing).is_some() =>
            {
                warn!(
                    channel = %channel,
                    existing = %existing.fingerprint(),
                    rejected = %identity.fingerprint(),
                    "Channel already associated with another identity session, keeping the first association"
                );
                return Ok(AssociationOutcome::Kept { existing });
            }
            Some((stale, _)) => {
                debug!(
                    channel = %channel,
                    stale = %stale.fingerprint(),
                    "Replacing association to an identity session that no longer resolves"
                );
            }
            None => {}
        }

        if !self
            .inner
            .index
            .write()
            .link(channel, identity, AssociationKind::Explicit)
        {
            return Err(OdmcpError::ChannelNotFound);
        }

        info!(channel = %channel, session = %identity.fingerprint(), "Channel associated");
        Ok(AssociationOutcome::Associated)
    }

    /// Identity session a channel resolves to, if any
    pub async fn resolve_identity_for(&self, channel: &ChannelId) -> Option<IdentitySession> {
        match self.lookup(channel).await {
            ChannelLookup::Resolved(session) | ChannelLookup::AutoAssociated(session) => {
                Some(session)
            }
            _ => None,
        }
    }

    /// Resolve a channel, distinguishing why it did not yield an identity
    ///
    /// An association whose identity session is gone is dropped here.
    pub async fn lookup(&self, channel: &ChannelId) -> ChannelLookup {
        let association = self.inner.index.read().link_of(channel);
        let (identity, kind) = match association {
            None => return ChannelLookup::UnknownChannel,
            Some(None) => return ChannelLookup::Unassociated,
            Some(Some(link)) => link,
        };

        match self.inner.store.get(&identity).await {
            Some(session) => match kind {
                AssociationKind::Explicit => ChannelLookup::Resolved(session),
                AssociationKind::Auto => ChannelLookup::AutoAssociated(session),
            },
            None => {
                self.prune_stale(channel, &identity).await;
                ChannelLookup::AssociationExpired
            }
        }
    }

    async fn prune_stale(&self, channel: &ChannelId, identity: &IdentitySessionId) {
        let _guard = self.inner.locks.lock(channel).await;
        if self.inner.store.peek_live(identity).is_some() {
            return;
        }

        let mut index = self.inner.index.write();
        if index.association(channel) == Some(Some(identity.clone())) {
            index.unlink(channel);
            debug!(
                channel = %channel,
                session = %identity.fingerprint(),
                "Dropped association to expired identity session"
            );
        }
    }

    /// Attach an identity to the most recently opened unassociated channel
    ///
    /// Best effort, for identities obtained out-of-band. Returns whether an
    /// association was made.
    pub async fn auto_associate(&self, identity: &IdentitySessionId) -> bool {
        let _identity_guard = self.inner.store.lock(identity).await;
        if self.inner.store.peek_live(identity).is_none() {
            return false;
        }

        loop {
            let Some(candidate) = self.inner.index.read().newest_unassociated() else {
                debug!(session = %identity.fingerprint(), "No unassociated channel for auto-association");
                return false;
            };

            let _channel_guard = self.inner.locks.lock(&candidate).await;
            let mut index = self.inner.index.write();
            // another caller may have taken or closed it while we waited
            if index.association(&candidate) != Some(None) {
                continue;
            }

            index.link(&candidate, identity, AssociationKind::Auto);
            info!(
                channel = %candidate,
                session = %identity.fingerprint(),
                "Channel auto-associated"
            );
            return true;
        }
    }

    /// Close a channel; returns whether it existed
    pub async fn close_channel(&self, channel: &ChannelId) -> bool {
        let _guard = self.inner.locks.lock(channel).await;
        let removed = self.inner.index.write().remove(channel);
        if removed.is_some() {
            debug!(channel = %channel, "Channel closed");
        }
        removed.is_some()
    }

    /// Close every channel of an identity session, then invalidate the session
    ///
    /// Returns the number of channels closed.
    pub async fn invalidate_for_identity(
        &self,
        identity: &IdentitySessionId,
        reason: Option<&str>,
    ) -> usize {
        let identity_guard = self.inner.store.lock(identity).await;

        let channels = self.channels_for_identity(identity);
        let guards = self.inner.locks.lock_many(channels).await;

        let mut closed = 0;
        {
            let mut index = self.inner.index.write();
            for guard in &guards {
                let channel = guard.key();
                if index.association(channel) == Some(Some(identity.clone())) {
                    index.remove(channel);
                    closed += 1;
                }
            }
        }
        drop(guards);

        self.inner.store.remove_locked(&identity_guard, reason);
        info!(
            session = %identity.fingerprint(),
            channels = closed,
            "Identity session and its channels invalidated"
        );
        closed
    }

    /// Close channels older than `max_age`, associated or not
    pub async fn cleanup(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;

        let mut stale: Vec<ChannelId> = self
            .inner
            .index
            .read()
            .channels
            .values()
            .filter(|entry| entry.session.created_at <= cutoff)
            .map(|entry| entry.session.id.clone())
            .collect();
        stale.sort();

        let mut closed = 0;
        for channel in &stale {
            if self.close_channel(channel).await {
                closed += 1;
            }
        }

        if closed > 0 {
            info!(closed, "Aged-out channels closed");
        }
        closed
    }

    /// Channels currently associated with an identity session, sorted
    pub fn channels_for_identity(&self, identity: &IdentitySessionId) -> Vec<ChannelId> {
        self.inner
            .index
            .read()
            .by_identity
            .get(identity)
            .map(|channels| channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of one channel
    pub fn channel(&self, channel: &ChannelId) -> Option<ChannelSession> {
        self.inner
            .index
            .read()
            .channels
            .get(channel)
            .map(|entry| entry.session.clone())
    }

    /// Number of open channels
    pub fn len(&self) -> usize {
        self.inner.index.read().channels.len()
    }

    /// Whether no channel is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn index_is_consistent(&self) -> bool {
        self.inner.index.read().is_consistent()
    }
}
