//! Channel lifecycle endpoints
//!
//! Called by the tool transport when channels open and close, and when a
//! channel should be attached to an identity session.

use crate::AppState;
use actix_web::{delete, post, web, HttpResponse, Responder};
use odmcp_auth::{ChannelId, IdentitySessionId};
use odmcp_common::types::{
    AssociateRequest, AssociateResponse, AssociationStatus, AutoAssociateRequest,
    AutoAssociateResponse, ChannelResponse, OpenChannelRequest,
};
use odmcp_common::{GatewayError, Result};
use validator::Validate;

/// Open a channel, or register one the transport already named
#[post("/channels")]
pub async fn open_channel(
    state: web::Data<AppState>,
    body: Option<web::Json<OpenChannelRequest>>,
) -> Result<impl Responder> {
    let request = body.map(web::Json::into_inner).unwrap_or_default();

    let response = match request.channel_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => {
            let id = ChannelId::from(id);
            let created = state.context.register_channel(id.clone(), request.metadata);
            ChannelResponse {
                channel_id: id.to_string(),
                created,
            }
        }
        None => ChannelResponse {
            channel_id: state.context.open_channel(request.metadata).to_string(),
            created: true,
        },
    };

    let status = if response.created {
        actix_web::http::StatusCode::CREATED
    } else {
        actix_web::http::StatusCode::OK
    };
    Ok(HttpResponse::build(status).json(response))
}

#[delete("/channels/{channel_id}")]
pub async fn close_channel(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<impl Responder> {
    let channel = ChannelId::from(path.into_inner());
    if !state.context.close_channel(&channel).await {
        return Err(GatewayError::NotFound("Channel not found".to_string()));
    }
    Ok(HttpResponse::NoContent().finish())
}

#[post("/channels/{channel_id}/associate")]
pub async fn associate_channel(
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<AssociateRequest>,
) -> Result<impl Responder> {
    body.validate()?;
    let channel = ChannelId::from(path.into_inner());
    let identity = IdentitySessionId::from(body.into_inner().session_id);

    let outcome = state.context.associate(&channel, &identity).await?;
    Ok(HttpResponse::Ok().json(AssociateResponse {
        status: AssociationStatus::from(&outcome),
    }))
}

/// Attach an identity session to the newest unassociated channel
#[post("/channels/auto-associate")]
pub async fn auto_associate(
    state: web::Data<AppState>,
    body: web::Json<AutoAssociateRequest>,
) -> Result<impl Responder> {
    body.validate()?;
    let identity = IdentitySessionId::from(body.into_inner().session_id);

    let associated = state.context.auto_associate(&identity).await;
    Ok(HttpResponse::Ok().json(AutoAssociateResponse { associated }))
}
