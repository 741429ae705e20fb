//! Durable session store.
//!
//! A SQLite file owns the session rows; the repository opens it, applies
//! the embedded migrations, and exposes the typed query surface the
//! engine needs. Nothing else in the process touches the pool.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::time::Duration;

use super::models::SessionRecord;

/// All session columns for SELECT queries.
const SESSION_COLUMNS: &str = r#"
    id, user_id, container_id, container_ip, host_ssh_port,
    gpu_uuid, mig_profile, ttl_minutes, created_at, expires_at, metadata
"#;

/// Repository for session persistence.
#[derive(Debug, Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    /// Open (or create) the session store at the given path and bring its
    /// schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("creating session store directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("opening session store {}", path.display()))?;

        Self::migrate(pool).await
    }

    /// Session store backed by a throwaway in-memory database (tests).
    pub async fn in_memory() -> Result<Self> {
        // A :memory: database lives and dies with its connection, so the
        // pool is pinned to exactly one.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await
            .context("opening in-memory session store")?;

        Self::migrate(pool).await
    }

    async fn migrate(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("applying session store migrations")?;
        Ok(Self { pool })
    }

    /// Persist a new session record.
    ///
    /// The unique index on `user_id` enforces one active session per user;
    /// a violation surfaces as a deterministic "already exists" error.
    pub async fn create(&self, record: &SessionRecord) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO sessions (
                id, user_id, container_id, container_ip, host_ssh_port,
                gpu_uuid, mig_profile, ttl_minutes, created_at, expires_at, metadata
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.container_id)
        .bind(&record.container_ip)
        .bind(record.host_ssh_port)
        .bind(&record.gpu_uuid)
        .bind(&record.mig_profile)
        .bind(record.ttl_minutes)
        .bind(record.created_at)
        .bind(record.expires_at)
        .bind(&record.metadata)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err))
                if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                anyhow::bail!(
                    "a session for user {} already exists",
                    record.user_id
                );
            }
            Err(err) => Err(err).context("inserting session record"),
        }
    }

    /// Get a session by ID.
    pub async fn get(&self, id: &str) -> Result<Option<SessionRecord>> {
        let query = format!("SELECT {} FROM sessions WHERE id = ?", SESSION_COLUMNS);
        let record = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session")?;

        Ok(record)
    }

    /// Get the active session for a user, if any.
    pub async fn get_by_user(&self, user_id: &str) -> Result<Option<SessionRecord>> {
        let query = format!("SELECT {} FROM sessions WHERE user_id = ?", SESSION_COLUMNS);
        let record = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching session by user")?;

        Ok(record)
    }

    /// List all sessions, newest first.
    pub async fn list(&self) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM sessions ORDER BY created_at DESC",
            SESSION_COLUMNS
        );
        let records = sqlx::query_as::<_, SessionRecord>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing sessions")?;

        Ok(records)
    }

    /// List sessions whose TTL has elapsed.
    pub async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<SessionRecord>> {
        let query = format!(
            "SELECT {} FROM sessions WHERE expires_at < ? ORDER BY expires_at ASC",
            SESSION_COLUMNS
        );
        let records = sqlx::query_as::<_, SessionRecord>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .context("listing expired sessions")?;

        Ok(records)
    }

    /// Delete a session record. Idempotent; returns whether a row was
    /// actually removed, which linearizes concurrent teardowns.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting session")?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::types::Json;
    use std::collections::HashMap;

    fn record(id: &str, user_id: &str, ttl_minutes: i64) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: id.to_string(),
            user_id: user_id.to_string(),
            container_id: format!("container-{id}"),
            container_ip: "10.100.0.100".to_string(),
            host_ssh_port: 10000,
            gpu_uuid: format!("MIG-{id}"),
            mig_profile: "3g.20gb".to_string(),
            ttl_minutes,
            created_at: now,
            expires_at: now + Duration::minutes(ttl_minutes),
            metadata: Json(HashMap::new()),
        }
    }

    async fn repo() -> SessionRepository {
        SessionRepository::in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn create_get_delete_roundtrip() {
        let repo = repo().await;
        repo.create(&record("s1", "u1", 60)).await.unwrap();

        let fetched = repo.get("s1").await.unwrap().unwrap();
        assert_eq!(fetched.user_id, "u1");
        assert_eq!(fetched.mig_profile, "3g.20gb");

        let by_user = repo.get_by_user("u1").await.unwrap().unwrap();
        assert_eq!(by_user.id, "s1");

        assert!(repo.delete("s1").await.unwrap());
        assert!(!repo.delete("s1").await.unwrap());
        assert!(repo.get("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_user_is_rejected() {
        let repo = repo().await;
        repo.create(&record("s1", "u1", 60)).await.unwrap();

        let err = repo.create(&record("s2", "u1", 60)).await.unwrap_err();
        assert!(err.to_string().contains("already exists"), "{err}");

        // The failed insert leaves a single row.
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let repo = repo().await;
        let mut older = record("s1", "u1", 60);
        older.created_at = Utc::now() - Duration::minutes(10);
        repo.create(&older).await.unwrap();
        repo.create(&record("s2", "u2", 60)).await.unwrap();

        let all = repo.list().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "s2");
        assert_eq!(all[1].id, "s1");
    }

    #[tokio::test]
    async fn list_expired_scans_by_deadline() {
        let repo = repo().await;
        let mut expired = record("s1", "u1", 5);
        expired.created_at = Utc::now() - Duration::minutes(10);
        expired.expires_at = expired.created_at + Duration::minutes(5);
        repo.create(&expired).await.unwrap();
        repo.create(&record("s2", "u2", 60)).await.unwrap();

        let hits = repo.list_expired(Utc::now()).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "s1");

        // Nothing is expired when asking about the past.
        let none = repo
            .list_expired(Utc::now() - Duration::minutes(20))
            .await
            .unwrap();
        assert!(none.is_empty());
    }
}
