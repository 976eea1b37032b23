//! Tool-call authorization endpoint
//!
//! POST /v1/authorize
//! Resolves the caller's identity, checks the operation's permission and
//! returns the backend destination and credential the call must use.

use crate::AppState;
use actix_web::{post, web, HttpResponse, Responder};
use odmcp_auth::{AuthorizeParams, ChannelId};
use odmcp_common::types::{AuthorizeRequest, AuthorizeResponse};
use odmcp_common::Result;
use validator::Validate;

#[post("/authorize")]
pub async fn authorize(
    state: web::Data<AppState>,
    body: web::Json<AuthorizeRequest>,
) -> Result<impl Responder> {
    body.validate()?;
    let request = body.into_inner();

    let params = AuthorizeParams {
        operation: request.operation,
        variant: request.variant,
        session_id: request.session_id,
        channel_id: request.channel_id.map(ChannelId::from),
    };

    let authorization = state.context.authorize(&params).await?;
    Ok(HttpResponse::Ok().json(AuthorizeResponse::from(&authorization)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::testing;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use odmcp_auth::EffectiveCredential;

    #[actix_web::test]
    async fn test_discovery_call_is_anonymous() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(testing::state()))
                .service(authorize),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/authorize")
            .set_json(serde_json::json!({ "operation": "discover-services" }))
            .to_request();
        let body: AuthorizeResponse = test::call_and_read_body_json(&app, req).await;

        assert!(body.subject.is_none());
        assert_eq!(body.destination, "odata-technical");
        assert_eq!(body.effective_credential, EffectiveCredential::Technical);
        assert!(body.caller_token.is_none());
    }

    #[actix_web::test]
    async fn test_operational_call_without_session_is_unauthorized() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(testing::state()))
                .service(authorize),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/authorize")
            .set_json(serde_json::json!({
                "operation": "execute-entity-operation",
                "variant": "update",
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "SessionRequired");
        assert_eq!(body["remediation"]["entryUrl"], "https://gw.example/auth/login");
        assert_eq!(body["remediation"]["parameterName"], "session_id");
    }

    #[actix_web::test]
    async fn test_insufficient_permissions_is_forbidden() {
        let state = testing::state();
        let login = state
            .context
            .login_with_token("reader-token", None)
            .await
            .unwrap();
        let app = test::init_service(
            App::new().app_data(web::Data::new(state)).service(authorize),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/authorize")
            .set_json(serde_json::json!({
                "operation": "execute-entity-operation",
                "variant": "delete",
                "session_id": login.session.id.to_string(),
            }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], "InsufficientPermissions");
        assert_eq!(body["requiredPermission"], "delete");
    }

    #[actix_web::test]
    async fn test_empty_operation_is_bad_request() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(testing::state()))
                .service(authorize),
        )
        .await;

        let req = test::TestRequest::post()
            .uri("/authorize")
            .set_json(serde_json::json!({ "operation": "" }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
