use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use base64::Engine;

use crate::api::v1::dto::ceremony_request::{CeremonyOptionsRequest, RegistrationRequest};
use crate::api::v1::dto::ceremony_response::{CeremonyOptionsResponse, RegistrationResponse};
use crate::api::v1::handlers::{
    request_origin, require_subject, session_public_key, session_signature,
};
use crate::codec::BASE64URL_LENIENT;
use crate::error::AppError;
use crate::state::AppState;

pub async fn registration_options(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CeremonyOptionsRequest>,
) -> Result<(StatusCode, Json<CeremonyOptionsResponse>), AppError> {
    let origin = request_origin(&headers)?;
    let subject = require_subject(&req.subject)?;
    let spk = session_public_key(&req.session_public_key)?;

    let started = state.bridge.begin_registration(subject, spk, origin).await?;

    Ok((
        StatusCode::OK,
        Json(CeremonyOptionsResponse {
            options: started.options,
            claim: started.claim,
        }),
    ))
}

pub async fn complete_registration(
    State(state): State<AppState>,
    Json(req): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<RegistrationResponse>), AppError> {
    let subject = require_subject(&req.subject)?;
    let signature = session_signature(&req.session_signature)?;

    let registered = state
        .bridge
        .complete_registration(subject, &req.response, signature)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegistrationResponse {
            credential_id: BASE64URL_LENIENT.encode(&registered.credential_id),
            claim: registered.claim,
        }),
    ))
}
