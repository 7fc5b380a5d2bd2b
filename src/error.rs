/*
 * Responsibility
 * - HTTP boundary error (AppError) and its JSON body
 * - Mapping domain errors to a generic response, logging the specific kind once
 */
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::dwt::ClaimError;
use crate::services::exchange::ExchangeError;
use crate::services::token::TokenError;
use crate::services::webauthn::BridgeError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid grant")]
    InvalidGrant,

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict")]
    Conflict,

    #[error("internal server error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorResponseBody {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::InvalidGrant => (StatusCode::BAD_REQUEST, "INVALID_GRANT"),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::Conflict => (StatusCode::CONFLICT, "CONFLICT"),
            AppError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        };

        let body = ErrorResponseBody {
            error: ErrorBody {
                code,
                message: self.to_string(),
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<ClaimError> for AppError {
    fn from(e: ClaimError) -> Self {
        warn!(kind = ?e, "claim rejected");
        match e {
            ClaimError::Malformed(what) => AppError::InvalidRequest(what.to_string()),
            ClaimError::Codec(_) => AppError::InvalidRequest("malformed encoding".into()),
            ClaimError::Entropy => AppError::Internal,
            _ => AppError::Unauthorized,
        }
    }
}

impl From<BridgeError> for AppError {
    fn from(e: BridgeError) -> Self {
        match e {
            BridgeError::Storage(e) => {
                error!(error = %e, "ceremony storage failure");
                AppError::Internal
            }
            BridgeError::Timeout => {
                error!("ceremony collaborator timed out");
                AppError::Internal
            }
            BridgeError::Claim(e) => e.into(),
            BridgeError::InvalidOrigin(origin) => {
                warn!(%origin, "ceremony for invalid origin");
                AppError::InvalidRequest("invalid origin".into())
            }
            BridgeError::DuplicateCredential => {
                warn!("credential already registered");
                AppError::Conflict
            }
            other => {
                warn!(kind = ?other, "ceremony rejected");
                AppError::Unauthorized
            }
        }
    }
}

impl From<ExchangeError> for AppError {
    fn from(e: ExchangeError) -> Self {
        match e {
            ExchangeError::CodeNotFound
            | ExchangeError::CodeAlreadyConsumed
            | ExchangeError::StateMismatch
            | ExchangeError::PkceMismatch => {
                warn!(kind = ?e, "code exchange rejected");
                AppError::InvalidGrant
            }
            ExchangeError::Claim(e) => e.into(),
            other => {
                error!(error = %other, "code exchange failure");
                AppError::Internal
            }
        }
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Key(_) => {
                error!(error = %e, "bearer token key failure");
                AppError::Internal
            }
            other => {
                warn!(kind = ?other, "bearer token rejected");
                AppError::Unauthorized
            }
        }
    }
}
