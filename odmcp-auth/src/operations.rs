//! Per-tool classification
//!
//! One table answers three questions for every tool call: which backend
//! context it uses, how strictly its identity is resolved and which
//! permission it needs.

use crate::authorization::{permission_for_variant, permission_for_verb, Permission};
use crate::config::OperationSettings;
use crate::resolver::ResolutionPolicy;
use crate::routing::OperationClass;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

/// Everything the gateway needs to know about one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationProfile {
    /// Backend context class
    pub class: OperationClass,
    /// Identity resolution policy
    pub policy: ResolutionPolicy,
    /// Permission required, if any
    pub required: Option<Permission>,
}

/// Tool name -> profile
#[derive(Debug, Clone)]
pub struct OperationCatalog {
    discovery: HashSet<String>,
    convenience: HashSet<String>,
    execute: HashSet<String>,
}

impl OperationCatalog {
    /// Build from configuration
    pub fn new(settings: &OperationSettings) -> Self {
        Self {
            discovery: settings.discovery_tools.iter().cloned().collect(),
            convenience: settings.convenience_tools.iter().cloned().collect(),
            execute: settings.execute_tools.iter().cloned().collect(),
        }
    }

    /// Profile for `operation` invoked with an optional `mode` variant
    ///
    /// Unknown tools are treated as operational and resolved strictly.
    pub fn profile(&self, operation: &str, variant: Option<&str>) -> OperationProfile {
        if self.discovery.contains(operation) {
            return OperationProfile {
                class: OperationClass::Discovery,
                policy: ResolutionPolicy::Permissive,
                required: None,
            };
        }

        if self.convenience.contains(operation) {
            return OperationProfile {
                class: OperationClass::Discovery,
                policy: ResolutionPolicy::Authenticated,
                required: Some(Permission::Discover),
            };
        }

        let required = if self.execute.contains(operation) {
            match variant.and_then(permission_for_variant) {
                Some(permission) => permission,
                None => {
                    warn!(
                        operation,
                        variant = variant.unwrap_or("<none>"),
                        "Unknown operation variant, requiring admin"
                    );
                    Permission::Admin
                }
            }
        } else {
            permission_for_verb(operation)
        };

        OperationProfile {
            class: OperationClass::Operational,
            policy: ResolutionPolicy::Strict,
            required: Some(required),
        }
    }
}
