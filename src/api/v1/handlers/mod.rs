pub mod assertion;
pub mod health;
pub mod registration;
pub mod token;

use axum::http::{HeaderMap, header};
use chrono::Utc;

use crate::codec;
use crate::error::AppError;

/// The browser-set Origin header; ceremonies are bound to it.
pub(crate) fn request_origin(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::InvalidRequest("missing Origin header".into()))
}

pub(crate) fn require_subject(subject: &str) -> Result<&str, AppError> {
    if subject.is_empty() {
        return Err(AppError::InvalidRequest("subject is required".into()));
    }
    Ok(subject)
}

pub(crate) fn session_public_key(value: &str) -> Result<[u8; 32], AppError> {
    codec::decode_b64(value)
        .ok()
        .and_then(|raw| codec::fixed::<32>(&raw).ok())
        .ok_or_else(|| AppError::InvalidRequest("session_public_key".into()))
}

pub(crate) fn session_signature(value: &str) -> Result<Vec<u8>, AppError> {
    codec::decode_b64(value).map_err(|_| AppError::InvalidRequest("session_signature".into()))
}

pub(crate) fn unix_now() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or(0)
}
