//! Error types for the odmcp gateway

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use odmcp_auth::{AccessError, ErrorCode, OdmcpError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0}")]
    Access(#[from] AccessError),

    #[error("{0}")]
    Odmcp(#[from] OdmcpError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for GatewayError {
    fn from(err: validator::ValidationErrors) -> Self {
        GatewayError::BadRequest(err.to_string())
    }
}

/// HTTP status for a structured access error code
pub fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::SessionRequired
        | ErrorCode::SessionExpired
        | ErrorCode::AuthenticationRequired
        | ErrorCode::AssociatedSessionExpired => StatusCode::UNAUTHORIZED,
        ErrorCode::InsufficientPermissions => StatusCode::FORBIDDEN,
        ErrorCode::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl actix_web::error::ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Access(err) => status_for(err.code),
            Self::Odmcp(OdmcpError::ChannelNotFound) => StatusCode::NOT_FOUND,
            Self::Odmcp(err) => status_for(AccessError::from(err).code),
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        match self {
            Self::Access(err) => HttpResponse::build(status).json(err),
            Self::Odmcp(OdmcpError::ChannelNotFound) => {
                HttpResponse::build(status).json(serde_json::json!({
                    "code": "ChannelNotFound",
                    "message": "Channel not found",
                }))
            }
            Self::Odmcp(err) => HttpResponse::build(status).json(AccessError::from(err)),
            Self::BadRequest(msg) => HttpResponse::build(status).json(serde_json::json!({
                "code": "BadRequest",
                "message": msg,
            })),
            Self::NotFound(msg) => HttpResponse::build(status).json(serde_json::json!({
                "code": "NotFound",
                "message": msg,
            })),
            Self::InternalError(_) => HttpResponse::build(status).json(serde_json::json!({
                "code": "InternalError",
                "message": "Internal gateway error",
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::to_bytes;
    use actix_web::ResponseError;

    #[actix_web::test]
    async fn test_access_error_keeps_contract_shape() {
        let err = GatewayError::from(AccessError::insufficient_permissions(
            "write",
            vec!["read".to_string()],
        ));
        assert_eq!(err.status_code(), StatusCode::FORBIDDEN);

        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["code"], "InsufficientPermissions");
        assert_eq!(value["requiredPermission"], "write");
        assert_eq!(value["grantedPermissions"][0], "read");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(ErrorCode::SessionExpired), StatusCode::UNAUTHORIZED);
        assert_eq!(
            status_for(ErrorCode::ProviderUnavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::from(OdmcpError::InvalidToken("bad".into())).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::from(OdmcpError::ChannelNotFound).status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[actix_web::test]
    async fn test_internal_errors_are_not_echoed() {
        let err = GatewayError::InternalError("db password is hunter2".to_string());
        let body = to_bytes(err.error_response().into_body()).await.unwrap();
        assert!(!String::from_utf8_lossy(&body).contains("hunter2"));
    }
}
