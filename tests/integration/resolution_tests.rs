//! Integration tests for identity resolution, authorization and routing
//!
//! These tests verify that:
//! - Strict resolution never degrades past a bad explicit session id
//! - Channel associations that lost their session are reported as such
//! - The authenticated tier may use the process-wide fallback identity
//! - Operational calls propagate the caller credential or fall back loudly

use odmcp_auth::{
    AuthorizeParams, EffectiveCredential, ErrorCode, IdentityUpdate, OperationClass, Permission,
    ResolutionSource,
};
use odmcp_tests::common::{context, direct_session};
use tracing_test::traced_test;

#[tokio::test]
async fn test_strict_resolution_does_not_fall_through_bad_explicit_id() {
    let ctx = context();
    let channel = ctx.open_channel(None);
    let login = ctx
        .login_with_token("admin-token", Some(&channel))
        .await
        .unwrap();
    ctx.set_fallback_identity(Some(login.session.id.clone()));

    let err = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("delete")
                .with_session_id("no-such-session")
                .with_channel(channel.clone()),
        )
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::SessionExpired);
    assert!(!err.message.contains("no-such-session"));
    let remediation = err.remediation.unwrap();
    assert_eq!(remediation.parameter_name.as_deref(), Some("session_id"));
}

#[tokio::test]
async fn test_strict_resolution_uses_channel_without_explicit_id() {
    let ctx = context();
    let channel = ctx.open_channel(None);
    ctx.login_with_token("writer-token", Some(&channel))
        .await
        .unwrap();

    let auth = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("create")
                .with_channel(channel),
        )
        .await
        .unwrap();

    let session = auth.identity.session().unwrap();
    assert_eq!(session.subject_id(), "walt");
    assert_eq!(auth.decision.required_permission, Some(Permission::Write));
    assert!(auth.decision.effective_permissions.contains(&Permission::Read));
}

#[tokio::test]
async fn test_automatic_association_does_not_authorize_operations() {
    let ctx = context();
    let channel = ctx.open_channel(None);
    let login = ctx.login_with_token("writer-token", None).await.unwrap();
    assert!(login.associated);

    // discovery through the guessed channel still works
    let auth = ctx
        .authorize(&AuthorizeParams::new("whoami").with_channel(channel.clone()))
        .await
        .unwrap();
    assert_eq!(auth.identity.session().unwrap().subject_id(), "walt");

    let err = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("create")
                .with_channel(channel.clone()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SessionRequired);
    assert!(err.remediation.is_some());

    // an explicit association makes the channel usable for operations
    ctx.associate(&channel, &login.session.id).await.unwrap();
    let auth = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("create")
                .with_channel(channel),
        )
        .await
        .unwrap();
    assert_eq!(auth.identity.session().unwrap().subject_id(), "walt");
}

#[tokio::test]
async fn test_channel_with_vanished_session_reports_associated_expiry() {
    let ctx = context();
    let channel = ctx.open_channel(None);
    let login = ctx
        .login_with_token("writer-token", Some(&channel))
        .await
        .unwrap();
    ctx.store().invalidate(&login.session.id, None).await;

    let err = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("read")
                .with_channel(channel.clone()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AssociatedSessionExpired);

    // the channel lost its association, so the next call just needs a session
    let err = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("read")
                .with_channel(channel),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::SessionRequired);
}

#[tokio::test]
async fn test_strict_resolution_ignores_fallback_identity() {
    let ctx = context();
    let admin = direct_session(&ctx, "adam", &["admin"], None).await;
    ctx.set_fallback_identity(Some(admin.id.clone()));

    let err = ctx
        .authorize(&AuthorizeParams::new("execute-entity-operation").with_variant("read"))
        .await
        .unwrap_err();

    assert_eq!(err.code, ErrorCode::SessionRequired);
}

#[tokio::test]
async fn test_authenticated_tier_uses_fallback_identity() {
    let ctx = context();
    let reader = direct_session(&ctx, "rita", &["discover"], None).await;

    let err = ctx
        .authorize(&AuthorizeParams::new("whoami"))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AuthenticationRequired);

    ctx.set_fallback_identity(Some(reader.id.clone()));
    let auth = ctx
        .authorize(&AuthorizeParams::new("whoami"))
        .await
        .unwrap();

    assert!(matches!(
        auth.identity,
        odmcp_auth::ResolvedIdentity::Authenticated {
            source: ResolutionSource::Fallback,
            ..
        }
    ));
    assert_eq!(auth.backend.context.class, OperationClass::Discovery);
    assert_eq!(auth.backend.effective, EffectiveCredential::Technical);
}

#[tokio::test]
async fn test_namespaced_permissions_are_normalized() {
    let ctx = context();
    let session = direct_session(&ctx, "nina", &["com.acme.sales:Delete"], None).await;

    let auth = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("update")
                .with_session_id(session.id.to_string()),
        )
        .await
        .unwrap();
    assert!(auth.decision.granted);

    let err = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("bulk-import")
                .with_session_id(session.id.to_string()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InsufficientPermissions);
    assert_eq!(err.required_permission.as_deref(), Some("admin"));
}

#[tokio::test]
async fn test_permission_changes_apply_to_next_call() {
    let ctx = context();
    let session = direct_session(&ctx, "pat", &["read"], None).await;
    let params = AuthorizeParams::new("execute-entity-operation")
        .with_variant("update")
        .with_session_id(session.id.to_string());

    assert!(ctx.authorize(&params).await.is_err());

    ctx.store()
        .update(&session.id, IdentityUpdate::permissions(["write"]))
        .await
        .unwrap();

    assert!(ctx.authorize(&params).await.is_ok());
}

#[tokio::test]
async fn test_operational_call_propagates_caller_credential() {
    let ctx = context();
    let session = direct_session(&ctx, "walt", &["write"], None).await;

    let auth = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("update")
                .with_session_id(session.id.to_string()),
        )
        .await
        .unwrap();

    assert_eq!(auth.backend.context.destination_name, "erp-principal");
    assert_eq!(auth.backend.effective, EffectiveCredential::CallerPropagated);
    assert_eq!(
        auth.backend.credential.map(|c| c.access_token),
        Some("walt-access".to_string())
    );
}

#[tokio::test]
#[traced_test]
async fn test_unusable_caller_credential_falls_back_with_warning() {
    let ctx = context();
    let session = direct_session(&ctx, "walt", &["write"], None).await;
    let expired = odmcp_auth::BearerCredential::new("stale")
        .with_expires_at(chrono::Utc::now() - chrono::Duration::minutes(5));
    ctx.store()
        .update(&session.id, IdentityUpdate::credential(expired))
        .await
        .unwrap();

    let auth = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("update")
                .with_session_id(session.id.to_string()),
        )
        .await
        .unwrap();

    assert_eq!(auth.backend.effective, EffectiveCredential::TechnicalFallback);
    assert!(auth.backend.credential.is_none());
    assert!(logs_contain("falling back to technical credential"));
}
