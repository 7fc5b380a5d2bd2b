use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::repos::error::{RepoError, RepoResult};

#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct UserRecord {
    pub id: Uuid,
    pub name: String,
}

impl UserRecord {
    /// WebAuthn user handle.
    pub fn user_handle(&self) -> Vec<u8> {
        self.id.as_bytes().to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub id: Vec<u8>,
    pub user_id: Uuid,
    /// Compressed SEC1 P-256 point.
    pub public_key: Vec<u8>,
    pub sign_count: u32,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CredentialRow {
    id: Vec<u8>,
    user_id: Uuid,
    public_key: Vec<u8>,
    sign_count: i64,
}

impl TryFrom<CredentialRow> for CredentialRecord {
    type Error = RepoError;

    fn try_from(row: CredentialRow) -> Result<Self, Self::Error> {
        let sign_count = u32::try_from(row.sign_count)
            .map_err(|_| RepoError::Corrupt(format!("sign_count {}", row.sign_count)))?;
        Ok(Self {
            id: row.id,
            user_id: row.user_id,
            public_key: row.public_key,
            sign_count,
        })
    }
}

/// Users and their registered credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_or_create_user(&self, name: &str) -> RepoResult<UserRecord>;

    async fn find_user(&self, name: &str) -> RepoResult<Option<UserRecord>>;

    async fn credentials_for_user(&self, user_id: Uuid) -> RepoResult<Vec<CredentialRecord>>;

    async fn credential_by_id(&self, id: &[u8]) -> RepoResult<Option<CredentialRecord>>;

    /// Returns `false` if a credential with this id already exists.
    async fn insert_credential(&self, credential: CredentialRecord) -> RepoResult<bool>;

    /// Returns number of rows updated.
    async fn update_counter(&self, id: &[u8], sign_count: u32) -> RepoResult<u64>;
}

/// Columns:
/// - users.id (uuid), users.name (text, unique)
/// - credentials.id (bytea, primary key), credentials.user_id (uuid)
/// - credentials.public_key (bytea), credentials.sign_count (bigint)
#[derive(Clone, Debug)]
pub struct PgCredentialRepo {
    pool: PgPool,
}

impl PgCredentialRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialRepo {
    async fn get_or_create_user(&self, name: &str) -> RepoResult<UserRecord> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let user = sqlx::query_as::<_, UserRecord>(
            r#"
            INSERT INTO users (id, name)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name
            RETURNING id, name
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_user(&self, name: &str) -> RepoResult<Option<UserRecord>> {
        let user = sqlx::query_as::<_, UserRecord>(
            r#"
            SELECT id, name
            FROM users
            WHERE name = $1
            LIMIT 1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn credentials_for_user(&self, user_id: Uuid) -> RepoResult<Vec<CredentialRecord>> {
        let rows = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT id, user_id, public_key, sign_count
            FROM credentials
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CredentialRecord::try_from).collect()
    }

    async fn credential_by_id(&self, id: &[u8]) -> RepoResult<Option<CredentialRecord>> {
        let row = sqlx::query_as::<_, CredentialRow>(
            r#"
            SELECT id, user_id, public_key, sign_count
            FROM credentials
            WHERE id = $1
            LIMIT 1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CredentialRecord::try_from).transpose()
    }

    async fn insert_credential(&self, credential: CredentialRecord) -> RepoResult<bool> {
        let done = sqlx::query(
            r#"
            INSERT INTO credentials (id, user_id, public_key, sign_count)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(credential.id)
        .bind(credential.user_id)
        .bind(credential.public_key)
        .bind(i64::from(credential.sign_count))
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected() == 1)
    }

    async fn update_counter(&self, id: &[u8], sign_count: u32) -> RepoResult<u64> {
        let done = sqlx::query(
            r#"
            UPDATE credentials
            SET sign_count = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(i64::from(sign_count))
        .execute(&self.pool)
        .await?;

        Ok(done.rows_affected())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    users: HashMap<String, UserRecord>,
    credentials: Vec<CredentialRecord>,
}

/// In-process store with the same semantics, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    state: Mutex<MemoryState>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get_or_create_user(&self, name: &str) -> RepoResult<UserRecord> {
        let mut state = self.lock();
        let user = state
            .users
            .entry(name.to_string())
            .or_insert_with(|| UserRecord {
                id: Uuid::new_v4(),
                name: name.to_string(),
            });
        Ok(user.clone())
    }

    async fn find_user(&self, name: &str) -> RepoResult<Option<UserRecord>> {
        Ok(self.lock().users.get(name).cloned())
    }

    async fn credentials_for_user(&self, user_id: Uuid) -> RepoResult<Vec<CredentialRecord>> {
        Ok(self
            .lock()
            .credentials
            .iter()
            .filter(|c| c.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn credential_by_id(&self, id: &[u8]) -> RepoResult<Option<CredentialRecord>> {
        Ok(self.lock().credentials.iter().find(|c| c.id == id).cloned())
    }

    async fn insert_credential(&self, credential: CredentialRecord) -> RepoResult<bool> {
        let mut state = self.lock();
        if state.credentials.iter().any(|c| c.id == credential.id) {
            return Ok(false);
        }
        state.credentials.push(credential);
        Ok(true)
    }

    async fn update_counter(&self, id: &[u8], sign_count: u32) -> RepoResult<u64> {
        let mut state = self.lock();
        Ok(match state.credentials.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                c.sign_count = sign_count;
                1
            }
            None => 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_creation_is_idempotent() {
        let store = MemoryCredentialStore::new();
        let a = store.get_or_create_user("alice").await.unwrap();
        let b = store.get_or_create_user("alice").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.find_user("bob").await.unwrap(), None);
    }

    #[tokio::test]
    async fn credential_ids_are_unique() {
        let store = MemoryCredentialStore::new();
        let user = store.get_or_create_user("alice").await.unwrap();
        let cred = CredentialRecord {
            id: vec![1, 2, 3],
            user_id: user.id,
            public_key: vec![2; 33],
            sign_count: 0,
        };

        assert!(store.insert_credential(cred.clone()).await.unwrap());
        assert!(!store.insert_credential(cred).await.unwrap());
        assert_eq!(store.update_counter(&[1, 2, 3], 7).await.unwrap(), 1);
        assert_eq!(
            store.credential_by_id(&[1, 2, 3]).await.unwrap().unwrap().sign_count,
            7
        );
        assert_eq!(store.credentials_for_user(user.id).await.unwrap().len(), 1);
    }
}
