use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use url::Url;

use crate::services::webauthn::BridgeError;

/// Distinct origins kept before new ones are served uncached.
pub const MAX_CACHED_ORIGINS: usize = 1024;

/// Per-origin ceremony configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelyingPartyConfig {
    /// ASCII serialization of the origin: lowercase scheme and host, default port elided.
    pub origin: String,
    /// Host of the origin.
    pub rp_id: String,
    pub rp_name: String,
}

fn parse_origin(origin: &str) -> Result<Url, BridgeError> {
    let url = Url::parse(origin).map_err(|_| BridgeError::InvalidOrigin(origin.to_string()))?;
    if url.host_str().is_none_or(str::is_empty) {
        return Err(BridgeError::InvalidOrigin(origin.to_string()));
    }
    Ok(url)
}

impl RelyingPartyConfig {
    pub fn for_origin(origin: &str, rp_name: &str) -> Result<Self, BridgeError> {
        let url = parse_origin(origin)?;
        Ok(Self::from_url(&url, rp_name))
    }

    fn from_url(url: &Url, rp_name: &str) -> Self {
        Self {
            origin: url.origin().ascii_serialization(),
            rp_id: url.host_str().unwrap_or_default().to_string(),
            rp_name: rp_name.to_string(),
        }
    }
}

/// Read-mostly map from normalized origin to its configuration.
///
/// Concurrent first requests for one origin may each build a value; they are
/// equal, so whichever insert lands last is kept.
#[derive(Debug, Clone)]
pub struct RelyingPartyCache {
    rp_name: String,
    entries: Arc<RwLock<HashMap<String, Arc<RelyingPartyConfig>>>>,
}

impl RelyingPartyCache {
    pub fn new(rp_name: impl Into<String>) -> Self {
        Self {
            rp_name: rp_name.into(),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn get_or_insert(&self, origin: &str) -> Result<Arc<RelyingPartyConfig>, BridgeError> {
        let url = parse_origin(origin)?;
        let key = url.origin().ascii_serialization();
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(config) = entries.get(&key) {
                return Ok(Arc::clone(config));
            }
        }

        let config = Arc::new(RelyingPartyConfig::from_url(&url, &self.rp_name));

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        if entries.len() >= MAX_CACHED_ORIGINS && !entries.contains_key(&key) {
            tracing::warn!(origin = %key, "relying party cache full; serving uncached");
            return Ok(config);
        }
        tracing::debug!(origin = %key, rp_id = %config.rp_id, "relying party configured");
        entries.insert(key, Arc::clone(&config));
        Ok(config)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
