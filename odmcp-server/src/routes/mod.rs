//! HTTP routes

use actix_web::web;

pub mod authorize;
pub mod channels;
pub mod health;
pub mod login;

/// Register every route of the gateway
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1")
            .service(authorize::authorize)
            .service(channels::auto_associate)
            .service(channels::open_channel)
            .service(channels::close_channel)
            .service(channels::associate_channel),
    )
    .service(
        web::scope("/auth")
            .service(login::login_redirect)
            .service(login::login_start)
            .service(login::login_callback)
            .service(login::token_login)
            .service(login::logout),
    )
    .service(health::health_check);
}
