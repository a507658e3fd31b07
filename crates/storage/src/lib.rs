use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::domain::{AttachmentId, ConversationId, MessageId, UserId, UserProfile};

mod conversations;
mod messages;
pub mod objects;
pub mod participant_set;

pub use objects::{DatabaseObjectStore, ObjectStore, StoredObject};
pub use participant_set::{participant_set_key, ParticipantSet};

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// A conversation as seen by one of its participants.
#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub pinned: bool,
    pub last_read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct StoredParticipant {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
    pub is_pinned: bool,
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub is_read: bool,
    pub metadata: serde_json::Value,
    pub attachments: Vec<StoredAttachment>,
}

#[derive(Debug, Clone)]
pub struct StoredAttachment {
    pub attachment_id: AttachmentId,
    pub message_id: MessageId,
    pub storage_path: String,
    pub url: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
}

/// An attachment that has already been written to object storage.
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub storage_path: String,
    pub url: String,
    pub filename: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateConversationOutcome {
    Created(ConversationId),
    /// Another writer committed the same participant set first.
    Conflict,
}

#[derive(Debug, Clone)]
pub struct ReadReceipt {
    pub message_ids: Vec<MessageId>,
    pub last_read_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir(database_url)?;

        let in_memory = database_url.starts_with("sqlite::memory:");
        let mut connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `sqlite::memory:` is a separate database, so pin exactly one.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open database '{database_url}'"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    pub async fn create_user(&self, username: &str) -> Result<UserId> {
        let rec = sqlx::query(
            "INSERT INTO users (username) VALUES (?)
             ON CONFLICT(username) DO UPDATE SET username=excluded.username
             RETURNING id",
        )
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(UserId(rec.get::<i64, _>(0)))
    }

    pub async fn update_profile(
        &self,
        user_id: UserId,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<bool> {
        let updated = sqlx::query("UPDATE users SET display_name = ?, avatar_url = ? WHERE id = ?")
            .bind(display_name)
            .bind(avatar_url)
            .bind(user_id.0)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(updated > 0)
    }

    pub async fn user_id_for_username(&self, username: &str) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT id FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| UserId(r.get::<i64, _>(0))))
    }

    /// Returns the subset of `user_ids` that exist.
    pub async fn existing_users(&self, user_ids: &[UserId]) -> Result<Vec<UserId>> {
        Ok(self
            .profiles_for_users(user_ids)
            .await?
            .into_keys()
            .collect())
    }

    pub async fn profiles_for_users(
        &self,
        user_ids: &[UserId],
    ) -> Result<HashMap<UserId, UserProfile>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut query = sqlx::QueryBuilder::<Sqlite>::new(
            "SELECT id, username, display_name, avatar_url FROM users WHERE id IN (",
        );
        let mut ids = query.separated(", ");
        for user_id in user_ids {
            ids.push_bind(user_id.0);
        }
        ids.push_unseparated(")");

        let rows = query.build().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let profile = profile_from_row(&r, 0);
                (profile.user_id, profile)
            })
            .collect())
    }
}

fn profile_from_row(r: &sqlx::sqlite::SqliteRow, offset: usize) -> UserProfile {
    UserProfile {
        user_id: UserId(r.get::<i64, _>(offset)),
        username: r.get::<String, _>(offset + 1),
        display_name: r.get::<Option<String>, _>(offset + 2),
        avatar_url: r.get::<Option<String>, _>(offset + 3),
    }
}

/// Whether a storage failure is worth retrying: lock contention, pool exhaustion or I/O.
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| match cause.downcast_ref::<sqlx::Error>() {
            Some(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) => true,
            Some(sqlx::Error::Database(db)) => {
                let message = db.message().to_ascii_lowercase();
                message.contains("database is locked") || message.contains("database is busy")
            }
            _ => false,
        })
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Creates the directory a file-backed SQLite URL points into. Other URLs are ignored.
pub fn ensure_sqlite_parent_dir(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
