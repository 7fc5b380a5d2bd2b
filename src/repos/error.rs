use thiserror::Error;

use crate::services::cache::CacheError;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("db error")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

pub type RepoResult<T> = Result<T, RepoError>;
