/*
 * Responsibility
 * - Environment / .env loading and validation (fail start-up on missing values)
 */
use std::net::SocketAddr;
use std::str::FromStr;
use std::{env, fmt};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn from_env() -> Self {
        match std::env::var("APP_ENV")
            .unwrap_or_else(|_| "development".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "production" | "prod" => Self::Production,
            _ => Self::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Self::Production)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "missing configuration: {}", key),
            ConfigError::Invalid(key) => write!(f, "invalid configuration: {}", key),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub app_env: AppEnv,
    pub database_url: String,
    pub valkey_url: String,
    pub issuer: String,
    pub audience: String,
    // Signs claim hashes and bearer tokens
    pub issuer_private_key_pem: String,
    pub dwt_lifetime_seconds: u64,
    pub pending_ceremony_ttl_seconds: u64,
    pub auth_code_ttl_seconds: u64,
    pub collaborator_timeout_ms: u64,
    pub rp_name: String,
    pub cors_allowed_origins: Vec<String>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Do not print key material or credentials in URLs
        f.debug_struct("Config")
            .field("addr", &self.addr)
            .field("app_env", &self.app_env)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("dwt_lifetime_seconds", &self.dwt_lifetime_seconds)
            .finish_non_exhaustive()
    }
}

fn parsed_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid(key)),
        Err(_) => Ok(default),
    }
}

fn required(key: &'static str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing(key))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let port: u16 = parsed_or("AUTH_PORT", 4000)?;
        let addr: SocketAddr = SocketAddr::from_str(&format!("0.0.0.0:{}", port))
            .map_err(|_| ConfigError::Invalid("AUTH_PORT"))?;

        let app_env = AppEnv::from_env();

        let database_url = required("DATABASE_URL")?;
        let valkey_url = required("VALKEY_URL")?;
        let issuer = required("AUTH_ISSUER")?;
        let audience = required("AUTH_AUDIENCE")?;
        let issuer_private_key_pem = required("ISSUER_PRIVATE_KEY_PEM")?.replace("\\n", "\n");

        let dwt_lifetime_seconds = parsed_or("DWT_LIFETIME_SECONDS", 43_200)?; // 12 h
        if dwt_lifetime_seconds == 0 {
            return Err(ConfigError::Invalid("DWT_LIFETIME_SECONDS"));
        }
        let pending_ceremony_ttl_seconds = parsed_or("PENDING_CEREMONY_TTL_SECONDS", 300)?;
        let auth_code_ttl_seconds = parsed_or("AUTH_CODE_TTL_SECONDS", 300)?;
        let collaborator_timeout_ms = parsed_or("COLLABORATOR_TIMEOUT_MS", 5_000)?;
        let rp_name = env::var("RP_NAME").unwrap_or_else(|_| "Keychain".to_string());

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        Ok(Config {
            addr,
            app_env,
            database_url,
            valkey_url,
            issuer,
            audience,
            issuer_private_key_pem,
            dwt_lifetime_seconds,
            pending_ceremony_ttl_seconds,
            auth_code_ttl_seconds,
            collaborator_timeout_ms,
            rp_name,
            cors_allowed_origins,
        })
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        tracing::error!(error = %e, "configuration error");
        AppError::Internal
    }
}
