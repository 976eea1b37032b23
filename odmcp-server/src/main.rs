//! odmcp Gateway Server
//!
//! Exposes identity bridging and credential routing to the tool dispatcher
//! and the channel lifecycle manager over HTTP, plus the browser and token
//! login endpoints users are pointed at by remediation hints.

mod routes;

use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use odmcp_auth::{GatewayConfig, SessionContext};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub context: Arc<SessionContext>,
}

#[derive(Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub config_path: String,
    pub shutdown_deadline: Option<Duration>,
    pub fallback_token: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            server_host: env::var("ODMCP_SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env::var("ODMCP_SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid ODMCP_SERVER_PORT")?,
            config_path: env::var("ODMCP_CONFIG").unwrap_or_else(|_| "odmcp.toml".to_string()),
            shutdown_deadline: env::var("ODMCP_SHUTDOWN_DEADLINE")
                .ok()
                .map(|raw| humantime::parse_duration(&raw))
                .transpose()
                .context("Invalid ODMCP_SHUTDOWN_DEADLINE")?,
            fallback_token: env::var("ODMCP_FALLBACK_TOKEN")
                .ok()
                .filter(|token| !token.trim().is_empty()),
        })
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting odmcp Gateway Server...");

    let config = Config::from_env()?;
    let gateway = GatewayConfig::load(&config.config_path)
        .with_context(|| format!("Failed to load {}", config.config_path))?;
    info!(path = %config.config_path, "Configuration loaded");

    let context = Arc::new(SessionContext::from_config(&gateway)?);
    context.start_maintenance();

    if let Some(token) = &config.fallback_token {
        match context.login_with_token(token, None).await {
            Ok(outcome) => {
                context.set_fallback_identity(Some(outcome.session.id.clone()));
                info!(subject = %outcome.session.subject_id(), "Fallback identity established");
            }
            Err(err) => warn!(error = %err, "Could not establish fallback identity"),
        }
    }

    let app_state = AppState {
        context: Arc::clone(&context),
    };

    let bind_addr = format!("{}:{}", config.server_host, config.server_port);
    info!("Starting server on {}", bind_addr);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(routes::configure)
    })
    .bind(&bind_addr)?
    .run()
    .await?;

    let deadline = config
        .shutdown_deadline
        .unwrap_or(gateway.sessions.shutdown_deadline);
    context.shutdown(deadline).await;
    info!("Server stopped");

    Ok(())
}
