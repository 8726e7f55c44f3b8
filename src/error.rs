//! HTTP-facing error taxonomy. Everywhere else in the crate, `anyhow::Result`
//! with `.context(...)` is the idiom — these types exist only where a caller
//! needs to match on the error kind or where it crosses the HTTP boundary.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("insufficient funds: need {needed} {asset}, have {available}")]
    InsufficientFunds {
        asset: String,
        needed: f64,
        available: f64,
    },
    #[error("bot {0} not found")]
    BotNotFound(i64),
    #[error("exchange rejected order: {0}")]
    ExchangeHardReject(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::InsufficientFunds { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::BotNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::ExchangeHardReject(_) => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Distinguishes retryable exchange failures from hard rejects so retry
/// loops can match on variant instead of string-sniffing error messages.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("exchange rejected request: {0}")]
    Rejected(String),
    #[error("timestamp outside recv window (-1021)")]
    TimestampSkew,
    #[error("order expired in match")]
    ExpiredInMatch,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_not_found_maps_to_404() {
        let resp = EngineError::BotNotFound(7).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn validation_maps_to_400() {
        let resp = EngineError::Validation("bad symbol".into()).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
