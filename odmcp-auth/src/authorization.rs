//! Authorization Engine
//!
//! Permission names from the identity provider come in several shapes
//! (`app!t12.Write`, `tenant:read`, `Delete`). They are normalized to the
//! suffix after the last separator before the hierarchy is applied:
//!
//! ```text
//! admin ⊇ delete ⊇ write ⊇ read        discover (independent)
//! ```
//!
//! Everything here is a pure function of its inputs.

use crate::operations::OperationCatalog;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Permission level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Read business data
    Read,
    /// Create or update business data
    Write,
    /// Delete business data
    Delete,
    /// Everything in the hierarchy
    Admin,
    /// Personalised catalog exploration; outside the hierarchy
    Discover,
}

impl Permission {
    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Delete => "delete",
            Permission::Admin => "admin",
            Permission::Discover => "discover",
        }
    }

    fn rank(&self) -> Option<u8> {
        match self {
            Permission::Read => Some(1),
            Permission::Write => Some(2),
            Permission::Delete => Some(3),
            Permission::Admin => Some(4),
            Permission::Discover => None,
        }
    }

    /// Whether holding `self` satisfies a requirement of `required`
    pub fn implies(&self, required: Permission) -> bool {
        match (self.rank(), required.rank()) {
            (Some(held), Some(needed)) => held >= needed,
            _ => *self == required,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match normalize_permission(raw).as_str() {
            "read" => Ok(Permission::Read),
            "write" => Ok(Permission::Write),
            "delete" => Ok(Permission::Delete),
            "admin" => Ok(Permission::Admin),
            "discover" => Ok(Permission::Discover),
            other => Err(format!("Unknown permission: {}", other)),
        }
    }
}

/// Strip namespace segments and lowercase: `App!t1.Write` -> `write`
pub fn normalize_permission(raw: &str) -> String {
    let raw = raw.trim();
    let suffix = raw
        .rfind(&['.', ':', '/'][..])
        .map(|pos| &raw[pos + 1..])
        .unwrap_or(raw);
    suffix.to_ascii_lowercase()
}

/// Permission needed by a parameterized operation's `mode` argument
///
/// `None` for variants outside `read|create|update|delete`.
pub fn permission_for_variant(variant: &str) -> Option<Permission> {
    match variant.trim().to_ascii_lowercase().as_str() {
        "read" => Some(Permission::Read),
        "create" | "update" => Some(Permission::Write),
        "delete" => Some(Permission::Delete),
        _ => None,
    }
}

/// Permission implied by the verbs in an operation name; `Admin` when none match
pub fn permission_for_verb(operation: &str) -> Permission {
    let lowered = operation.to_ascii_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect();
    let has = |verbs: &[&str]| tokens.iter().any(|token| verbs.contains(token));

    if has(&["delete", "remove", "drop"]) {
        Permission::Delete
    } else if has(&["create", "update", "patch", "insert", "upsert", "write"]) {
        Permission::Write
    } else if has(&["read", "get", "query", "list", "fetch", "search"]) {
        Permission::Read
    } else {
        Permission::Admin
    }
}

/// Granted permission names after normalization and hierarchy expansion
///
/// Unrecognised names are ignored.
pub fn effective_permissions<I, S>(granted: I) -> BTreeSet<Permission>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    const ALL: [Permission; 5] = [
        Permission::Read,
        Permission::Write,
        Permission::Delete,
        Permission::Admin,
        Permission::Discover,
    ];

    let held: Vec<Permission> = granted
        .into_iter()
        .filter_map(|name| name.as_ref().parse().ok())
        .collect();

    ALL.into_iter()
        .filter(|candidate| held.iter().any(|p| p.implies(*candidate)))
        .collect()
}

/// Whether `granted` satisfies `required`
pub fn is_satisfied<I, S>(granted: I, required: Permission) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    granted
        .into_iter()
        .filter_map(|name| name.as_ref().parse::<Permission>().ok())
        .any(|held| held.implies(required))
}

/// Outcome of a permission check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationDecision {
    /// Permission the operation needs, if any
    pub required_permission: Option<Permission>,
    /// Whether the check passed
    pub granted: bool,
    /// Granted permissions after hierarchy expansion
    pub effective_permissions: BTreeSet<Permission>,
}

/// Decide whether `granted` covers `required`; no requirement always passes
pub fn decide<I, S>(granted: I, required: Option<Permission>) -> AuthorizationDecision
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let effective = effective_permissions(granted);
    AuthorizationDecision {
        required_permission: required,
        granted: required.map(|p| effective.contains(&p)).unwrap_or(true),
        effective_permissions: effective,
    }
}

/// Looks up per-operation requirements and applies the pure checks above
#[derive(Clone)]
pub struct AuthorizationEngine {
    catalog: Arc<OperationCatalog>,
}

impl AuthorizationEngine {
    /// Create an engine over `catalog`
    pub fn new(catalog: Arc<OperationCatalog>) -> Self {
        Self { catalog }
    }

    /// Permission needed to run `operation` with the given `mode` variant
    pub fn required_permission(&self, operation: &str, variant: Option<&str>) -> Option<Permission> {
        self.catalog.profile(operation, variant).required
    }

    /// Check `granted` against the requirement for `operation`
    pub fn decide_for<I, S>(
        &self,
        operation: &str,
        variant: Option<&str>,
        granted: I,
    ) -> AuthorizationDecision
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        decide(granted, self.required_permission(operation, variant))
    }
}
