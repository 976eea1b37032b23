//! Login and logout endpoints
//!
//! GET  /auth/login           redirect the browser to the identity provider
//! GET  /auth/login/url       same, as JSON for non-browser clients
//! GET  /auth/callback        provider redirect with `code` and `state`
//! POST /auth/token           log in with an existing bearer token
//! POST /auth/logout          invalidate a session and close its channels

use crate::AppState;
use actix_web::http::header;
use actix_web::{get, post, web, HttpResponse, Responder};
use odmcp_auth::{ChannelId, IdentitySessionId};
use odmcp_common::types::{
    CallbackQuery, LoginQuery, LoginResponse, LoginStartResponse, LogoutRequest, LogoutResponse,
    TokenLoginRequest,
};
use odmcp_common::{GatewayError, Result};
use tracing::warn;
use validator::Validate;

fn channel_from(raw: Option<String>) -> Option<ChannelId> {
    raw.filter(|id| !id.trim().is_empty()).map(ChannelId::from)
}

#[get("/login")]
pub async fn login_redirect(
    state: web::Data<AppState>,
    query: web::Query<LoginQuery>,
) -> Result<impl Responder> {
    let start = state
        .context
        .login_url(channel_from(query.into_inner().channel_id))?;

    Ok(HttpResponse::Found()
        .insert_header((header::LOCATION, start.url))
        .finish())
}

#[get("/login/url")]
pub async fn login_start(
    state: web::Data<AppState>,
    query: web::Query<LoginQuery>,
) -> Result<impl Responder> {
    let start = state
        .context
        .login_url(channel_from(query.into_inner().channel_id))?;

    Ok(HttpResponse::Ok().json(LoginStartResponse {
        authorization_url: start.url,
        state: start.state,
    }))
}

#[get("/callback")]
pub async fn login_callback(
    state: web::Data<AppState>,
    query: web::Query<CallbackQuery>,
) -> Result<impl Responder> {
    let query = query.into_inner();

    let channel = match query.state.as_deref() {
        Some(login_state) => state
            .context
            .take_login_state(login_state)
            .ok_or_else(|| {
                warn!("Login callback with an unknown or expired state");
                GatewayError::BadRequest("Unknown or expired login state".to_string())
            })?,
        None => None,
    };

    let outcome = state
        .context
        .complete_login(&query.code, channel.as_ref())
        .await?;
    Ok(HttpResponse::Ok().json(LoginResponse::from(&outcome)))
}

#[post("/token")]
pub async fn token_login(
    state: web::Data<AppState>,
    body: web::Json<TokenLoginRequest>,
) -> Result<impl Responder> {
    body.validate()?;
    let request = body.into_inner();
    let channel = channel_from(request.channel_id);

    let outcome = state
        .context
        .login_with_token(&request.token, channel.as_ref())
        .await?;
    Ok(HttpResponse::Ok().json(LoginResponse::from(&outcome)))
}

#[post("/logout")]
pub async fn logout(
    state: web::Data<AppState>,
    body: web::Json<LogoutRequest>,
) -> Result<impl Responder> {
    body.validate()?;
    let identity = IdentitySessionId::from(body.into_inner().session_id);

    let channels_closed = state.context.logout(&identity).await;
    Ok(HttpResponse::Ok().json(LogoutResponse { channels_closed }))
}
