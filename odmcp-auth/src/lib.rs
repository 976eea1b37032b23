//! # odmcp-auth: identity bridging and credential routing for an OData tool gateway
//!
//! Every tool call that reaches the gateway is mapped to an identity and to one
//! of two backend credential contexts before anything touches a remote
//! service.
//!
//! ## Components
//!
//! - **IdentitySessionStore**: authenticated identity sessions with TTL, per-subject index and background expiry
//! - **ChannelSessionBridge**: protocol channels and their association to one identity session
//! - **AuthenticationResolver**: strict / permissive / authenticated strategy chains
//! - **AuthorizationEngine**: permission hierarchy with namespaced-name normalization
//! - **CredentialRouter**: discovery vs operational backend contexts, caller propagation with technical fallback
//!
//! ## Flow
//!
//! ```text
//!   tool call (operation, mode, session_id?, channel?)
//!                       ↓
//!         ┌─────────────────────────────┐
//!         │   OperationCatalog          │
//!         │   class + policy + perm     │
//!         └─────────────────────────────┘
//!                       ↓
//!         ┌─────────────────────────────┐
//!         │   AuthenticationResolver    │
//!         │   explicit → channel → ...  │
//!         └─────────────────────────────┘
//!                       ↓
//!         ┌─────────────────────────────┐
//!         │   AuthorizationEngine       │
//!         │   admin ⊇ delete ⊇ write ⊇ read │
//!         └─────────────────────────────┘
//!                       ↓
//!         ┌─────────────────────────────┐
//!         │   CredentialRouter          │
//!         │   destination + credential  │
//!         └─────────────────────────────┘
//! ```
//!
//! [`SessionContext`] wires all of it together and is the only type most
//! callers need.

#![warn(missing_docs)]

pub mod authorization;
pub mod config;
pub mod context;
pub mod error;
pub mod operations;
pub mod provider;
pub mod resolver;
pub mod routing;
pub mod session;

// Re-exports for convenience
pub use authorization::{AuthorizationDecision, AuthorizationEngine, Permission};
pub use config::{GatewayConfig, ProviderKind, SessionSettings};
pub use context::{Authorization, AuthorizeParams, LoginOutcome, LoginStart, SessionContext};
pub use error::{AccessError, ErrorCode, OdmcpError, Remediation, Result};
pub use operations::{OperationCatalog, OperationProfile};
pub use provider::{IdentityProvider, OidcProviderClient, ProviderGrant, StaticIdentityProvider};
pub use resolver::{AuthenticationResolver, ResolutionPolicy, ResolutionSource, ResolvedIdentity};
pub use routing::{
    AuthenticationMode, BackendBinding, CredentialContext, CredentialRouter, EffectiveCredential,
    OperationClass,
};
pub use session::{
    AssociationKind, AssociationOutcome, BearerCredential, ChannelId, ChannelLookup, ChannelSession,
    ChannelSessionBridge, IdentitySession, IdentitySessionId, IdentitySessionStore,
    IdentityUpdate, SubjectInfo,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default identity session TTL (1 hour)
pub const DEFAULT_SESSION_TTL_SECS: u64 = 60 * 60;

/// Default expiry sweep interval (5 minutes)
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 5 * 60;
