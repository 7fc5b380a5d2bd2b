use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::repos::error::RepoResult;

/// A freshly issued authorization code, stored by the hash of the code.
#[derive(Debug, Clone)]
pub struct NewAuthCode {
    pub code_hash: String,
    pub subject: String,
    /// DWT claim set as JSON.
    pub claims: String,
    pub state: String,
    pub code_challenge: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a redemption attempt. Only `Consumed` changes the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed { subject: String, claims: String },
    NotFound,
    AlreadyConsumed,
    StateMismatch,
    PkceMismatch,
}

#[async_trait]
pub trait AuthCodeStore: Send + Sync {
    async fn insert(&self, code: NewAuthCode) -> RepoResult<()>;

    /// Atomically mark the code consumed iff it exists, is unexpired, is not
    /// yet consumed and both `state` and `code_challenge` match. Otherwise
    /// report why, leaving the record untouched. A `None` challenge never
    /// matches.
    async fn consume(
        &self,
        code_hash: &str,
        state: &str,
        code_challenge: Option<&str>,
        now: DateTime<Utc>,
    ) -> RepoResult<ConsumeOutcome>;
}

/// Columns:
/// - auth_codes.code_hash (text, primary key)
/// - auth_codes.subject (text)
/// - auth_codes.claims (text)
/// - auth_codes.state (text)
/// - auth_codes.code_challenge (text)
/// - auth_codes.expires_at (timestamptz)
/// - auth_codes.consumed_at (timestamptz, nullable)
#[derive(Clone, Debug)]
pub struct PgAuthCodeRepo {
    pool: PgPool,
}

impl PgAuthCodeRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AuthCodeRow {
    state: String,
    code_challenge: String,
    expires_at: DateTime<Utc>,
    consumed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ConsumedRow {
    subject: String,
    claims: String,
}

#[async_trait]
impl AuthCodeStore for PgAuthCodeRepo {
    async fn insert(&self, code: NewAuthCode) -> RepoResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_codes (code_hash, subject, claims, state, code_challenge, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(code.code_hash)
        .bind(code.subject)
        .bind(code.claims)
        .bind(code.state)
        .bind(code.code_challenge)
        .bind(code.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn consume(
        &self,
        code_hash: &str,
        state: &str,
        code_challenge: Option<&str>,
        now: DateTime<Utc>,
    ) -> RepoResult<ConsumeOutcome> {
        // Single conditional update: two concurrent redemptions cannot both match.
        let consumed = sqlx::query_as::<_, ConsumedRow>(
            r#"
            UPDATE auth_codes
            SET consumed_at = $4
            WHERE code_hash = $1
                AND state = $2
                AND code_challenge = $3
                AND consumed_at IS NULL
                AND expires_at > $4
            RETURNING subject, claims
            "#,
        )
        .bind(code_hash)
        .bind(state)
        .bind(code_challenge)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = consumed {
            return Ok(ConsumeOutcome::Consumed {
                subject: row.subject,
                claims: row.claims,
            });
        }

        let row = sqlx::query_as::<_, AuthCodeRow>(
            r#"
            SELECT state, code_challenge, expires_at, consumed_at
            FROM auth_codes
            WHERE code_hash = $1
            LIMIT 1
            "#,
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(classify(row.as_ref(), state, code_challenge, now))
    }
}

fn classify(
    row: Option<&AuthCodeRow>,
    state: &str,
    code_challenge: Option<&str>,
    now: DateTime<Utc>,
) -> ConsumeOutcome {
    match row {
        None => ConsumeOutcome::NotFound,
        Some(r) if r.consumed_at.is_some() => ConsumeOutcome::AlreadyConsumed,
        Some(r) if r.expires_at <= now => ConsumeOutcome::NotFound,
        Some(r) if r.state != state => ConsumeOutcome::StateMismatch,
        Some(r) if code_challenge != Some(r.code_challenge.as_str()) => {
            ConsumeOutcome::PkceMismatch
        }
        // Matched but lost the update to a concurrent redemption.
        Some(_) => ConsumeOutcome::AlreadyConsumed,
    }
}

/// In-process store with the same semantics, for tests and local runs.
#[derive(Debug, Default)]
pub struct MemoryAuthCodeStore {
    codes: Mutex<HashMap<String, (NewAuthCode, Option<DateTime<Utc>>)>>,
}

impl MemoryAuthCodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthCodeStore for MemoryAuthCodeStore {
    async fn insert(&self, code: NewAuthCode) -> RepoResult<()> {
        let mut codes = self.codes.lock().unwrap_or_else(|e| e.into_inner());
        codes.insert(code.code_hash.clone(), (code, None));
        Ok(())
    }

    async fn consume(
        &self,
        code_hash: &str,
        state: &str,
        code_challenge: Option<&str>,
        now: DateTime<Utc>,
    ) -> RepoResult<ConsumeOutcome> {
        let mut codes = self.codes.lock().unwrap_or_else(|e| e.into_inner());
        let Some((code, consumed_at)) = codes.get_mut(code_hash) else {
            return Ok(ConsumeOutcome::NotFound);
        };

        let row = AuthCodeRow {
            state: code.state.clone(),
            code_challenge: code.code_challenge.clone(),
            expires_at: code.expires_at,
            consumed_at: *consumed_at,
        };
        let matches = row.consumed_at.is_none()
            && row.expires_at > now
            && row.state == state
            && code_challenge == Some(row.code_challenge.as_str());
        if !matches {
            return Ok(classify(Some(&row), state, code_challenge, now));
        }

        *consumed_at = Some(now);
        Ok(ConsumeOutcome::Consumed {
            subject: code.subject.clone(),
            claims: code.claims.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn code(now: DateTime<Utc>) -> NewAuthCode {
        NewAuthCode {
            code_hash: "h".into(),
            subject: "alice".into(),
            claims: "{}".into(),
            state: "s".into(),
            code_challenge: "c".into(),
            expires_at: now + Duration::minutes(5),
        }
    }

    #[tokio::test]
    async fn consumes_once() {
        let store = MemoryAuthCodeStore::new();
        let now = Utc::now();
        store.insert(code(now)).await.unwrap();

        assert!(matches!(
            store.consume("h", "s", Some("c"), now).await.unwrap(),
            ConsumeOutcome::Consumed { .. }
        ));
        assert_eq!(
            store.consume("h", "s", Some("c"), now).await.unwrap(),
            ConsumeOutcome::AlreadyConsumed
        );
    }

    #[tokio::test]
    async fn mismatches_do_not_burn_the_code() {
        let store = MemoryAuthCodeStore::new();
        let now = Utc::now();
        store.insert(code(now)).await.unwrap();

        assert_eq!(
            store.consume("h", "wrong", Some("c"), now).await.unwrap(),
            ConsumeOutcome::StateMismatch
        );
        assert_eq!(
            store.consume("h", "s", Some("wrong"), now).await.unwrap(),
            ConsumeOutcome::PkceMismatch
        );
        assert_eq!(
            store.consume("h", "s", None, now).await.unwrap(),
            ConsumeOutcome::PkceMismatch
        );
        assert!(matches!(
            store.consume("h", "s", Some("c"), now).await.unwrap(),
            ConsumeOutcome::Consumed { .. }
        ));
    }

    #[tokio::test]
    async fn expired_and_unknown_codes_are_not_found() {
        let store = MemoryAuthCodeStore::new();
        let now = Utc::now();
        store.insert(code(now)).await.unwrap();

        assert_eq!(
            store
                .consume("h", "s", Some("c"), now + Duration::minutes(10))
                .await
                .unwrap(),
            ConsumeOutcome::NotFound
        );
        assert_eq!(
            store.consume("other", "s", Some("c"), now).await.unwrap(),
            ConsumeOutcome::NotFound
        );
    }
}
