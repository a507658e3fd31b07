//! Object storage for message attachments.
//!
//! Uploads return a durable URL; private retrieval goes through a short-lived signed
//! variant of that URL.

use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::Storage;

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub path: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores `bytes` under `path` and returns the durable URL of the object.
    async fn put_object(&self, path: &str, content_type: &str, bytes: &[u8]) -> Result<String>;
    async fn get_object(&self, path: &str) -> Result<Option<StoredObject>>;
    /// Time-limited URL for a private object.
    fn signed_url(&self, path: &str, ttl: Duration) -> Result<String>;
    fn verify_signature(&self, path: &str, token: &str) -> bool;
}

#[derive(Debug, Serialize, Deserialize)]
struct ObjectClaims {
    sub: String,
    exp: i64,
    iat: i64,
}

/// Keeps object bytes in the `objects` table of the same SQLite database.
#[derive(Clone)]
pub struct DatabaseObjectStore {
    storage: Storage,
    public_base_url: String,
    signing_secret: Vec<u8>,
}

impl DatabaseObjectStore {
    pub fn new(
        storage: Storage,
        public_base_url: impl Into<String>,
        signing_secret: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            storage,
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            signing_secret: signing_secret.as_ref().to_vec(),
        }
    }

    pub fn object_url(&self, path: &str) -> String {
        format!("{}/objects/{path}", self.public_base_url)
    }
}

#[async_trait]
impl ObjectStore for DatabaseObjectStore {
    async fn put_object(&self, path: &str, content_type: &str, bytes: &[u8]) -> Result<String> {
        if path.is_empty() || path.starts_with('/') || path.split('/').any(|s| s == "..") {
            return Err(anyhow!("invalid object path '{path}'"));
        }
        sqlx::query(
            "INSERT INTO objects (path, content_type, bytes, size_bytes, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(path)
        .bind(content_type)
        .bind(bytes)
        .bind(i64::try_from(bytes.len()).unwrap_or(i64::MAX))
        .bind(Utc::now())
        .execute(self.storage.pool())
        .await?;
        Ok(self.object_url(path))
    }

    async fn get_object(&self, path: &str) -> Result<Option<StoredObject>> {
        let row = sqlx::query("SELECT path, content_type, bytes FROM objects WHERE path = ?")
            .bind(path)
            .fetch_optional(self.storage.pool())
            .await?;
        Ok(row.map(|r| StoredObject {
            path: r.get::<String, _>(0),
            content_type: r.get::<String, _>(1),
            bytes: r.get::<Vec<u8>, _>(2),
        }))
    }

    fn signed_url(&self, path: &str, ttl: Duration) -> Result<String> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)?;
        let claims = ObjectClaims {
            sub: path.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.signing_secret),
        )?;
        Ok(format!("{}?token={token}", self.object_url(path)))
    }

    fn verify_signature(&self, path: &str, token: &str) -> bool {
        decode::<ObjectClaims>(
            token,
            &DecodingKey::from_secret(&self.signing_secret),
            &Validation::new(Algorithm::HS256),
        )
        .map(|data| data.claims.sub == path)
        .unwrap_or(false)
    }
}
