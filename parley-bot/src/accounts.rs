//! SQLite account store.
//!
//! Tracks registered users, request and token counters, subscriptions, and
//! recorded errors. Implements both [`AccountStore`] and [`QuotaGate`].

use async_trait::async_trait;
use chrono::{DateTime, Months, TimeZone, Utc};
use parley_common::QuotaConfig;
use parley_session::{AccountError, AccountStore, QuotaGate, UserId, UserProfile};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

fn db_err(err: rusqlite::Error) -> AccountError {
    AccountError::Database(err.to_string())
}

/// Counters stored for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserStats {
    pub user_id: UserId,
    pub num_requests: u64,
    pub num_input_tokens: u64,
    pub num_output_tokens: u64,
    pub sub_expires_at: Option<DateTime<Utc>>,
}

/// Account store backed by a single SQLite database file.
pub struct SqliteAccountStore {
    conn: Arc<Mutex<Connection>>,
    quota: QuotaConfig,
}

impl SqliteAccountStore {
    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path, quota: QuotaConfig) -> Result<Self, AccountError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AccountError::Database(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(db_path).map_err(db_err)?;

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS users (
                user_id INTEGER PRIMARY KEY,
                first_name TEXT NOT NULL DEFAULT '',
                username TEXT,
                language_code TEXT,
                registered_at TEXT NOT NULL,
                num_requests INTEGER NOT NULL DEFAULT 0,
                num_input_tokens INTEGER NOT NULL DEFAULT 0,
                num_output_tokens INTEGER NOT NULL DEFAULT 0,
                sub_expires_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_errors_user ON errors(user_id);
            ",
        )
        .map_err(db_err)?;

        tracing::debug!(path = %db_path.display(), "Account database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            quota,
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, AccountError> {
        self.conn
            .lock()
            .map_err(|e| AccountError::Database(e.to_string()))
    }

    /// Counters for `user`, or `None` if the user never registered.
    pub fn stats(&self, user: UserId) -> Result<Option<UserStats>, AccountError> {
        let conn = self.conn()?;
        conn.query_row(
            r"
            SELECT num_requests, num_input_tokens, num_output_tokens, sub_expires_at
            FROM users WHERE user_id = ?1
            ",
            params![user.0],
            |row| {
                let expires: Option<i64> = row.get(3)?;
                Ok(UserStats {
                    user_id: user,
                    num_requests: row.get::<_, i64>(0)?.max(0) as u64,
                    num_input_tokens: row.get::<_, i64>(1)?.max(0) as u64,
                    num_output_tokens: row.get::<_, i64>(2)?.max(0) as u64,
                    sub_expires_at: expires.and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
                })
            },
        )
        .optional()
        .map_err(db_err)
    }

    /// Extend the user's subscription by `months`, starting from the later of
    /// now and the current expiry. Returns the new expiry.
    pub fn extend_subscription(
        &self,
        user: UserId,
        months: u32,
    ) -> Result<DateTime<Utc>, AccountError> {
        let current = self
            .stats(user)?
            .ok_or(AccountError::NotFound(user.0))?
            .sub_expires_at;

        let now = Utc::now();
        let start = current.filter(|t| *t > now).unwrap_or(now);
        let expires = start
            .checked_add_months(Months::new(months))
            .ok_or_else(|| AccountError::Database(format!("expiry overflow for {months} months")))?;

        let conn = self.conn()?;
        conn.execute(
            "UPDATE users SET sub_expires_at = ?2 WHERE user_id = ?1",
            params![user.0, expires.timestamp()],
        )
        .map_err(db_err)?;

        tracing::info!(user_id = %user, expires_at = %expires, "Subscription extended");
        Ok(expires)
    }

    /// Recorded errors for `user`, oldest first, as `(kind, message)` pairs.
    pub fn errors(&self, user: UserId) -> Result<Vec<(String, String)>, AccountError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT kind, message FROM errors WHERE user_id = ?1 ORDER BY id")
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![user.0], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(db_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(db_err)
    }
}

#[async_trait]
impl AccountStore for SqliteAccountStore {
    async fn user_exists(&self, user: UserId) -> Result<bool, AccountError> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT user_id FROM users WHERE user_id = ?1",
                params![user.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn register_user(&self, profile: &UserProfile) -> Result<(), AccountError> {
        let conn = self.conn()?;
        conn.execute(
            r"
            INSERT INTO users (user_id, first_name, username, language_code, registered_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(user_id) DO UPDATE SET
                first_name = ?2,
                username = ?3,
                language_code = ?4
            ",
            params![
                profile.id.0,
                profile.first_name,
                profile.username,
                profile.language_code,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    async fn record_exchange_tokens(
        &self,
        user: UserId,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), AccountError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                r"
                UPDATE users SET
                    num_input_tokens = num_input_tokens + ?2,
                    num_output_tokens = num_output_tokens + ?3
                WHERE user_id = ?1
                ",
                params![user.0, input_tokens as i64, output_tokens as i64],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(AccountError::NotFound(user.0));
        }
        Ok(())
    }

    async fn increment_request_count(&self, user: UserId) -> Result<(), AccountError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE users SET num_requests = num_requests + 1 WHERE user_id = ?1",
                params![user.0],
            )
            .map_err(db_err)?;
        if updated == 0 {
            return Err(AccountError::NotFound(user.0));
        }
        Ok(())
    }

    async fn record_error(&self, user: UserId, kind: &str, message: &str) -> Result<(), AccountError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO errors (user_id, kind, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user.0, kind, message, Utc::now().to_rfc3339()],
        )
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl QuotaGate for SqliteAccountStore {
    async fn is_subscription_active(&self, user: UserId) -> Result<bool, AccountError> {
        let now = Utc::now();
        Ok(self
            .stats(user)?
            .and_then(|s| s.sub_expires_at)
            .is_some_and(|expires| expires > now))
    }

    async fn is_in_trial(&self, user: UserId) -> Result<bool, AccountError> {
        let used = self.stats(user)?.map_or(0, |s| s.num_requests);
        Ok(used < self.quota.trial_requests)
    }

    async fn is_unlimited(&self, user: UserId) -> Result<bool, AccountError> {
        Ok(self.quota.unlimited_users.contains(&user.0))
    }
}
