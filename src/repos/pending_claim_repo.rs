use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use crate::repos::error::RepoError;
use crate::services::cache::{CacheClient, ValkeyClient};

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, RepoError>> + Send + 'a>>;

/// One not-yet-completed ceremony per subject, stored as an opaque JSON blob.
///
/// A backend error is returned as `Err`; callers must fail the ceremony.
pub trait PendingClaimStore: Send + Sync {
    // Store (or replace) the pending ceremony for `subject`.
    fn put<'a>(&'a self, subject: &'a str, blob: &'a str, ttl: Duration) -> StoreFuture<'a, ()>;

    fn get<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, Option<String>>;

    // Remove the pending ceremony only while it is still exactly `blob`.
    //
    // Returns:
    // - Ok(true)  => this caller owns the completion
    // - Ok(false) => replaced, expired or already completed
    fn remove_if_equals<'a>(&'a self, subject: &'a str, blob: &'a str) -> StoreFuture<'a, bool>;
}

/// Cache-backed pending claims (Valkey in production).
#[derive(Clone)]
pub struct CachePendingClaimStore<C: CacheClient> {
    cache: Arc<C>,
    // Key prefix to avoid collisions across environments
    prefix: String,
}

impl CachePendingClaimStore<ValkeyClient> {
    pub async fn new(redis_url: &str) -> Result<Self, RepoError> {
        let client = ValkeyClient::new(redis_url).await?;
        Ok(Self::new_with_cache(Arc::new(client), "dwt:pending"))
    }
}

impl<C: CacheClient> CachePendingClaimStore<C> {
    pub fn new_with_cache(cache: Arc<C>, prefix: impl Into<String>) -> Self {
        Self {
            cache,
            prefix: prefix.into(),
        }
    }

    pub fn key(&self, subject: &str) -> String {
        format!("{}:{}", self.prefix, subject)
    }
}

impl<C: CacheClient> PendingClaimStore for CachePendingClaimStore<C> {
    fn put<'a>(&'a self, subject: &'a str, blob: &'a str, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.cache.set_with_ttl(&self.key(subject), blob, ttl).await?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, subject: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.cache.get_string(&self.key(subject)).await?) })
    }

    fn remove_if_equals<'a>(&'a self, subject: &'a str, blob: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .cache
                .delete_if_equals(&self.key(subject), blob)
                .await?)
        })
    }
}
