/*
 * Responsibility
 * - Router に紐づける共有コンテキスト (AppState)
 * - Clone 前提で持つ (内部は Arc/Clone cheap)
 */
use std::sync::Arc;

use crate::services::exchange::AuthCodeExchange;
use crate::services::token::BearerTokens;
use crate::services::webauthn::WebAuthnBridge;

#[derive(Clone, Debug)]
pub struct AppState {
    pub bridge: Arc<WebAuthnBridge>,
    pub exchange: Arc<AuthCodeExchange>,
    pub tokens: Arc<BearerTokens>,
}

impl AppState {
    pub fn new(
        bridge: Arc<WebAuthnBridge>,
        exchange: Arc<AuthCodeExchange>,
        tokens: Arc<BearerTokens>,
    ) -> Self {
        Self {
            bridge,
            exchange,
            tokens,
        }
    }
}
