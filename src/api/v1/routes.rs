/*
 * Responsibility
 * - v1 の URL 構造を定義
 * - ceremonies: /registration, /assertion (+ /options)
 * - code exchange and token check: /token, /token/verify
 */
use axum::{Router, routing::post};

use crate::api::v1::handlers::{
    assertion::{assertion_options, complete_assertion},
    registration::{complete_registration, registration_options},
    token::{token, verify_token},
};
use crate::state::AppState;

pub fn routes(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/registration/options", post(registration_options))
        .route("/registration", post(complete_registration))
        .route("/assertion/options", post(assertion_options))
        .route("/assertion", post(complete_assertion))
        .route("/token", post(token))
        .route("/token/verify", post(verify_token))
        .with_state(state)
}
