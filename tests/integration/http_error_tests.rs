//! Structured errors rendered as HTTP responses
//!
//! Resolution failures produced by the auth core must reach the dispatcher
//! with their code, remediation and status intact.

use actix_web::body::to_bytes;
use actix_web::http::StatusCode;
use actix_web::ResponseError;
use odmcp_auth::AuthorizeParams;
use odmcp_common::GatewayError;
use odmcp_tests::common::{context, direct_session};

async fn render(err: GatewayError) -> (StatusCode, serde_json::Value) {
    let status = err.status_code();
    let body = to_bytes(err.error_response().into_body()).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[actix_web::test]
async fn test_session_required_renders_remediation() {
    let ctx = context();
    let err = ctx
        .authorize(&AuthorizeParams::new("execute-entity-operation").with_variant("create"))
        .await
        .unwrap_err();

    let (status, body) = render(err.into()).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "SessionRequired");
    assert_eq!(body["remediation"]["entryUrl"], "https://gw.example/auth/login");
    assert_eq!(body["remediation"]["parameterName"], "session_id");
    assert!(body["remediation"]["steps"].as_array().unwrap().len() >= 2);
}

#[actix_web::test]
async fn test_session_expired_does_not_echo_the_id() {
    let ctx = context();
    let err = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("read")
                .with_session_id("deadbeef-secret-id"),
        )
        .await
        .unwrap_err();

    let (status, body) = render(err.into()).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "SessionExpired");
    assert!(!body.to_string().contains("deadbeef-secret-id"));
}

#[actix_web::test]
async fn test_insufficient_permissions_lists_both_sides() {
    let ctx = context();
    let session = direct_session(&ctx, "rita", &["app.Read"], None).await;
    let err = ctx
        .authorize(
            &AuthorizeParams::new("execute-entity-operation")
                .with_variant("delete")
                .with_session_id(session.id.to_string()),
        )
        .await
        .unwrap_err();

    let (status, body) = render(err.into()).await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "InsufficientPermissions");
    assert_eq!(body["requiredPermission"], "delete");
    assert_eq!(body["grantedPermissions"], serde_json::json!(["app.Read"]));
}

#[actix_web::test]
async fn test_store_not_found_is_translated() {
    let ctx = context();
    let channel = ctx.open_channel(None);
    let err = ctx
        .associate(&channel, &"ghost-7f3a".into())
        .await
        .unwrap_err();

    let (status, body) = render(err.into()).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "SessionRequired");
    assert!(!body.to_string().contains("ghost-7f3a"));
}
