/*
 * Responsibility
 * - Config読み込み → 依存生成 → Router 組み立て
 * - Middleware の適用 (HTTP/CORS/security headers)
 * - axum::serve() で起動
 */
use axum::{Router, routing::get};
use sqlx::postgres::PgPoolOptions;
use std::{panic, process, sync::Arc, time::Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api;
use crate::api::v1::handlers::health::health;
use crate::config::Config;
use crate::dwt::IssuerKey;
use crate::error::AppError;
use crate::middleware;
use crate::repos::auth_code_repo::PgAuthCodeRepo;
use crate::repos::credential_repo::PgCredentialRepo;
use crate::repos::pending_claim_repo::CachePendingClaimStore;
use crate::services::exchange::AuthCodeExchange;
use crate::services::token::BearerTokens;
use crate::services::webauthn::bridge::BridgeSettings;
use crate::services::webauthn::{Es256Ceremonies, RelyingPartyCache, WebAuthnBridge};
use crate::state::AppState;

fn init_tracing() {
    // Prefer RUST_LOG if set; otherwise use a sensible default.
    // Ex:
    // RUST_LOG=info,keychain_auth=debug,tower_http=debug cargo run
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn init_panic_hook(abort_on_panic: bool) {
    let default_hook = panic::take_hook();

    panic::set_hook(Box::new(move |info| {
        tracing::error!(?info, "panic");

        // Fail fast in development; keep serving in production.
        if abort_on_panic {
            process::abort();
        } else {
            default_hook(info);
        }
    }))
}

pub async fn run() -> Result<(), AppError> {
    init_tracing();
    let config = Config::from_env()?;

    let abort_on_panic = !config.app_env.is_production();
    init_panic_hook(abort_on_panic);

    tracing::info!(
        "starting auth server in {:?} mode on {}",
        config.app_env,
        config.addr
    );

    let state = build_state(&config).await?;
    let app = build_router(state, &config);
    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, addr = %config.addr, "failed to bind listener");
            AppError::Internal
        })?;
    axum::serve(listener, app).await.map_err(|e| {
        tracing::error!(error = %e, "server error");
        AppError::Internal
    })?;

    Ok(())
}

async fn build_state(config: &Config) -> Result<AppState, AppError> {
    let timeout = Duration::from_millis(config.collaborator_timeout_ms);

    let db = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(timeout)
        .connect(&config.database_url)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to connect to postgres");
            AppError::Internal
        })?;

    let pending = CachePendingClaimStore::new(&config.valkey_url)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to connect to valkey");
            AppError::Internal
        })?;

    // One Ed25519 key signs claim hashes and bearer tokens.
    let issuer = IssuerKey::from_pkcs8_pem(&config.issuer_private_key_pem).map_err(|e| {
        tracing::error!(error = %e, "invalid ISSUER_PRIVATE_KEY_PEM");
        AppError::Internal
    })?;
    let tokens = BearerTokens::new(
        &config.issuer_private_key_pem,
        config.issuer.clone(),
        config.audience.clone(),
        config.dwt_lifetime_seconds,
    )
    .map_err(|e| {
        tracing::error!(error = %e, "failed to build bearer token keys");
        AppError::Internal
    })?;

    let bridge = WebAuthnBridge::new(
        Arc::new(Es256Ceremonies::new()),
        Arc::new(PgCredentialRepo::new(db.clone())),
        Arc::new(pending),
        RelyingPartyCache::new(config.rp_name.clone()),
        Arc::new(issuer),
        BridgeSettings {
            lifetime_seconds: config.dwt_lifetime_seconds,
            pending_ttl: Duration::from_secs(config.pending_ceremony_ttl_seconds),
            timeout,
        },
    );

    let exchange = AuthCodeExchange::new(
        Arc::new(PgAuthCodeRepo::new(db)),
        Duration::from_secs(config.auth_code_ttl_seconds),
        timeout,
    );

    Ok(AppState::new(
        Arc::new(bridge),
        Arc::new(exchange),
        Arc::new(tokens),
    ))
}

pub fn build_router(state: AppState, config: &Config) -> Router {
    let router = Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api::v1::routes(state.clone()))
        .with_state(state);

    let router = middleware::security_headers::apply(router);
    let router = middleware::cors::apply(router, config);
    middleware::http::apply(router, Duration::from_millis(config.collaborator_timeout_ms))
}
