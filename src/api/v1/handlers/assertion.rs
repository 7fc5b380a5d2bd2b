use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;

use crate::api::v1::dto::ceremony_request::{AssertionRequest, CeremonyOptionsRequest};
use crate::api::v1::dto::ceremony_response::{AssertionCodeResponse, CeremonyOptionsResponse};
use crate::api::v1::handlers::{
    request_origin, require_subject, session_public_key, session_signature,
};
use crate::error::AppError;
use crate::state::AppState;

pub async fn assertion_options(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CeremonyOptionsRequest>,
) -> Result<(StatusCode, Json<CeremonyOptionsResponse>), AppError> {
    let origin = request_origin(&headers)?;
    let subject = require_subject(&req.subject)?;
    let spk = session_public_key(&req.session_public_key)?;

    let started = state.bridge.begin_assertion(subject, spk, origin).await?;

    Ok((
        StatusCode::OK,
        Json(CeremonyOptionsResponse {
            options: started.options,
            claim: started.claim,
        }),
    ))
}

/// Completes the assertion and hands out a single-use authorization code for
/// the bound claim.
pub async fn complete_assertion(
    State(state): State<AppState>,
    Json(req): Json<AssertionRequest>,
) -> Result<(StatusCode, Json<AssertionCodeResponse>), AppError> {
    let subject = require_subject(&req.subject)?;
    let signature = session_signature(&req.session_signature)?;
    if req.code_challenge.is_empty() {
        return Err(AppError::InvalidRequest("code_challenge is required".into()));
    }

    let claim = state
        .bridge
        .complete_assertion(subject, &req.response, signature)
        .await?;
    let code = state
        .exchange
        .issue_code(&claim, &req.state, &req.code_challenge, Utc::now())
        .await?;

    Ok((
        StatusCode::OK,
        Json(AssertionCodeResponse {
            code,
            state: req.state,
        }),
    ))
}
