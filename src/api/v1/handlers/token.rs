use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;

use crate::api::v1::dto::token_request::{TokenRequest, VerifyTokenRequest};
use crate::api::v1::dto::token_response::{TokenResponse, VerifyTokenResponse};
use crate::api::v1::handlers::unix_now;
use crate::error::AppError;
use crate::state::AppState;

pub async fn token(
    State(state): State<AppState>,
    Json(req): Json<TokenRequest>,
) -> Result<(StatusCode, Json<TokenResponse>), AppError> {
    if req.grant_type != "authorization_code" {
        return Err(AppError::InvalidRequest("unsupported grant_type".into()));
    }

    let claim = state
        .exchange
        .redeem_code(&req.code, &req.state, &req.code_verifier, Utc::now())
        .await?;

    let now = unix_now();
    let access_token = state.tokens.mint(&claim, now)?;

    Ok((
        StatusCode::OK,
        Json(TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: claim.expiration.saturating_sub(now),
            dwt: claim.to_transport()?,
        }),
    ))
}

/// Answers validity; an invalid token is a normal answer, not an error.
pub async fn verify_token(
    State(state): State<AppState>,
    Json(req): Json<VerifyTokenRequest>,
) -> Json<VerifyTokenResponse> {
    match state.tokens.verify(&req.token, unix_now()) {
        Ok(claim) => Json(VerifyTokenResponse {
            valid: true,
            subject: Some(claim.subject),
            expiration: Some(claim.expiration),
        }),
        Err(e) => {
            tracing::debug!(kind = ?e, "bearer token invalid");
            Json(VerifyTokenResponse {
                valid: false,
                subject: None,
                expiration: None,
            })
        }
    }
}
