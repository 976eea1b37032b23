//! Common test utilities shared across integration tests

use odmcp_auth::{
    BearerCredential, GatewayConfig, IdentitySession, SessionContext, SubjectInfo,
};
use std::time::Duration;

/// Static-provider configuration with one reader, one writer and one admin
pub const STATIC_CONFIG: &str = r#"
    [sessions]
    default_ttl = "1h"
    cleanup_interval = "1m"

    [provider]
    kind = "static"

    [[provider.static_tokens]]
    token = "reader-token"
    subject_id = "rita"
    display_name = "Rita Reader"
    permissions = ["app.Read", "discover"]

    [[provider.static_tokens]]
    token = "writer-token"
    subject_id = "walt"
    permissions = ["app.Write", "discover"]

    [[provider.static_tokens]]
    token = "admin-token"
    subject_id = "adam"
    permissions = ["app.Admin"]

    [destinations]
    discovery = "catalog-technical"
    operational = "erp-principal"

    [auth]
    login_url = "https://gw.example/auth/login"
    allow_environment_fallback = true
"#;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Parsed [`STATIC_CONFIG`]
pub fn static_config() -> GatewayConfig {
    GatewayConfig::from_toml_str(STATIC_CONFIG).expect("static test config parses")
}

/// Context backed by the static provider
pub fn context() -> SessionContext {
    SessionContext::from_config(&static_config()).expect("static test context builds")
}

/// Create a session directly in the store, bypassing the provider
pub async fn direct_session(
    ctx: &SessionContext,
    subject: &str,
    scopes: &[&str],
    ttl: Option<Duration>,
) -> IdentitySession {
    let credential =
        BearerCredential::new(format!("{}-access", subject)).with_scopes(scopes.iter().copied());
    ctx.store()
        .create(SubjectInfo::new(subject), credential, ttl)
        .await
        .expect("session is created")
}
