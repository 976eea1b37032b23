//! Credential Router
//!
//! Discovery calls always use the technical credential. Operational calls
//! forward the caller's own token and fall back to the technical credential
//! when none is usable.

use crate::config::DestinationConfig;
use crate::operations::OperationCatalog;
use crate::session::BearerCredential;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Backend context class of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    /// Catalog and metadata exploration
    Discovery,
    /// Reads and writes of business data
    Operational,
}

/// How a backend context authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthenticationMode {
    /// Shared technical credential
    TechnicalCredential,
    /// Caller's credential, technical credential when absent
    PropagateWithTechnicalFallback,
}

/// Named backend destination plus its authentication mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialContext {
    /// Class this context serves
    pub class: OperationClass,
    /// Destination name understood by the backend layer
    pub destination_name: String,
    /// Authentication mode
    pub mode: AuthenticationMode,
}

/// Credential actually used for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectiveCredential {
    /// Technical credential, as configured
    Technical,
    /// Caller's own token is forwarded
    CallerPropagated,
    /// Technical credential because no caller token was usable
    TechnicalFallback,
}

/// What the backend layer needs to issue a call
///
/// `credential` holds a bearer token, so this is not `Serialize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendBinding {
    /// Selected context
    pub context: CredentialContext,
    /// Caller credential to forward, when propagating
    pub credential: Option<BearerCredential>,
    /// Which credential the call ends up with
    pub effective: EffectiveCredential,
}

/// Chooses the backend credential context for each call
#[derive(Debug, Clone)]
pub struct CredentialRouter {
    catalog: Arc<OperationCatalog>,
    discovery_destination: String,
    operational_destination: String,
    single_destination: bool,
}

impl CredentialRouter {
    /// Create a router from destination settings
    pub fn new(destinations: &DestinationConfig, catalog: Arc<OperationCatalog>) -> Self {
        Self {
            catalog,
            discovery_destination: destinations.discovery.clone(),
            operational_destination: destinations.operational.clone(),
            single_destination: destinations.single_destination,
        }
    }

    /// Class of an operation
    pub fn classify(&self, operation: &str, variant: Option<&str>) -> OperationClass {
        self.catalog.profile(operation, variant).class
    }

    /// Context for a class
    pub fn context_for(&self, class: OperationClass) -> CredentialContext {
        match class {
            OperationClass::Discovery => CredentialContext {
                class,
                destination_name: self.discovery_destination.clone(),
                mode: AuthenticationMode::TechnicalCredential,
            },
            OperationClass::Operational => CredentialContext {
                class,
                destination_name: if self.single_destination {
                    self.discovery_destination.clone()
                } else {
                    self.operational_destination.clone()
                },
                mode: AuthenticationMode::PropagateWithTechnicalFallback,
            },
        }
    }

    /// Context for a class plus the credential to use with it
    ///
    /// An expired caller credential counts as absent.
    pub fn bind(&self, class: OperationClass, caller: Option<&BearerCredential>) -> BackendBinding {
        let context = self.context_for(class);

        match context.mode {
            AuthenticationMode::TechnicalCredential => BackendBinding {
                context,
                credential: None,
                effective: EffectiveCredential::Technical,
            },
            AuthenticationMode::PropagateWithTechnicalFallback => {
                let usable = caller.filter(|credential| {
                    !credential.access_token.is_empty() && !credential.is_expired_at(Utc::now())
                });

                match usable {
                    Some(credential) => {
                        debug!(destination = %context.destination_name, "Propagating caller credential");
                        BackendBinding {
                            context,
                            credential: Some(credential.clone()),
                            effective: EffectiveCredential::CallerPropagated,
                        }
                    }
                    None => {
                        warn!(
                            destination = %context.destination_name,
                            "No caller credential available, falling back to technical credential"
                        );
                        BackendBinding {
                            context,
                            credential: None,
                            effective: EffectiveCredential::TechnicalFallback,
                        }
                    }
                }
            }
        }
    }
}
