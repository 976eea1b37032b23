//! Integration tests for identity session and channel lifecycles
//!
//! These tests verify that:
//! - Logging out cascades to every associated channel
//! - Expired sessions never resolve, directly or through a channel
//! - Subject-wide invalidation leaves other subjects alone
//! - Shutdown stops background work within its deadline
//! - Blank provider attributes never block a login

use odmcp_auth::config::StaticTokenConfig;
use odmcp_auth::{ChannelLookup, IdentityUpdate, SessionContext};
use odmcp_tests::common::{context, direct_session, setup_test_logging, static_config};
use std::time::Duration;

#[tokio::test]
async fn test_logout_cascades_to_all_channels() {
    setup_test_logging();
    let ctx = context();

    let channels: Vec<_> = (0..3).map(|_| ctx.open_channel(None)).collect();
    let bystander = ctx.open_channel(None);

    let login = ctx
        .login_with_token("writer-token", Some(&channels[0]))
        .await
        .unwrap();
    for channel in &channels[1..] {
        ctx.associate(channel, &login.session.id).await.unwrap();
    }

    let closed = ctx.logout(&login.session.id).await;

    assert_eq!(closed, 3);
    assert!(ctx.store().get(&login.session.id).await.is_none());
    for channel in &channels {
        assert!(ctx.bridge().channel(channel).is_none());
    }
    assert!(ctx.bridge().channel(&bystander).is_some());
    assert!(ctx
        .bridge()
        .channels_for_identity(&login.session.id)
        .is_empty());
}

#[tokio::test]
async fn test_expired_session_never_resolves() {
    let ctx = context();
    let channel = ctx.open_channel(None);
    let session = direct_session(&ctx, "eve", &["read"], Some(Duration::from_millis(50))).await;
    ctx.associate(&channel, &session.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(ctx.store().get(&session.id).await.is_none());
    assert!(matches!(
        ctx.bridge().lookup(&channel).await,
        ChannelLookup::AssociationExpired
    ));
    // the stale association was dropped on the way
    assert!(matches!(
        ctx.bridge().lookup(&channel).await,
        ChannelLookup::Unassociated
    ));
    assert!(ctx
        .store()
        .extend(&session.id, Duration::from_secs(60))
        .await
        .is_err());
    assert!(ctx
        .store()
        .update(&session.id, IdentityUpdate::permissions(["write"]))
        .await
        .is_err());
}

#[tokio::test]
async fn test_extend_keeps_session_alive() {
    let ctx = context();
    let session = direct_session(&ctx, "erin", &["read"], Some(Duration::from_millis(80))).await;

    let expires_at = ctx
        .store()
        .extend(&session.id, Duration::from_secs(60))
        .await
        .unwrap();
    assert!(expires_at > session.expires_at);

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(ctx.store().get(&session.id).await.is_some());
}

#[tokio::test]
async fn test_invalidate_all_for_subject_is_scoped() {
    let ctx = context();
    let first = direct_session(&ctx, "sam", &["read"], None).await;
    let second = direct_session(&ctx, "sam", &["write"], None).await;
    let other = direct_session(&ctx, "tia", &["read"], None).await;

    assert_eq!(ctx.store().sessions_for_subject("sam").len(), 2);

    let removed = ctx
        .store()
        .invalidate_all_for_subject("sam", Some("password changed"))
        .await;

    assert_eq!(removed, 2);
    assert!(ctx.store().get(&first.id).await.is_none());
    assert!(ctx.store().get(&second.id).await.is_none());
    assert!(ctx.store().get(&other.id).await.is_some());
    assert!(ctx.store().sessions_for_subject("sam").is_empty());
}

#[tokio::test]
async fn test_shutdown_completes_within_deadline() {
    let ctx = context();
    ctx.start_maintenance();
    direct_session(&ctx, "ivy", &["read"], None).await;

    let started = std::time::Instant::now();
    ctx.shutdown(Duration::from_secs(2)).await;

    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_login_survives_blank_provider_attributes() {
    let mut config = static_config();
    config.provider.static_tokens.push(StaticTokenConfig {
        token: "sparse-token".to_string(),
        subject_id: "sam".to_string(),
        display_name: Some(" ".to_string()),
        email: Some(String::new()),
        tenant: Some(String::new()),
        permissions: vec!["app.Read".to_string()],
    });
    let ctx = SessionContext::from_config(&config).unwrap();

    let login = ctx.login_with_token("sparse-token", None).await.unwrap();

    let subject = &login.session.subject;
    assert_eq!(subject.subject_id, "sam");
    assert_eq!(subject.display_name, None);
    assert_eq!(subject.email, None);
    assert_eq!(subject.tenant, None);
}
