//! Identity sessions, channel sessions and the locks that serialize them

pub mod channel;
pub mod identity;
pub mod lock;

pub use channel::{
    AssociationKind, AssociationOutcome, ChannelId, ChannelLookup, ChannelSession,
    ChannelSessionBridge,
};
pub use identity::{
    BearerCredential, IdentitySession, IdentitySessionId, IdentitySessionStore, IdentityUpdate,
    SubjectInfo,
};
pub use lock::{KeyedGuard, KeyedMutex};
