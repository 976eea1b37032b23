//! Health check endpoint

use crate::AppState;
use actix_web::{get, web, HttpResponse, Responder};
use odmcp_common::types::HealthResponse;

#[get("/health")]
pub async fn health_check(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "healthy".to_string(),
        version: odmcp_auth::VERSION.to_string(),
        sessions: state.context.store().len(),
        channels: state.context.bridge().len(),
    })
}
