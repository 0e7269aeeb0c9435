use crate::db::Database;
use crate::error::Result;
use chrono::Utc;
use rusqlite::params;
use std::time::Duration;

/// Idempotency marker kinds, each namespaced by a key prefix.
///
/// - `Sending`: adapter-side dedup, short TTL.
/// - `Processing`: exclusive claim while a worker handles a message.
/// - `Processed`: permanent-skip record for completed messages.
/// - `Notified`: confirmation already sent for an order (crash recovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Sending,
    Processing,
    Processed,
    Notified,
}

impl MarkerKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Notified => "notified",
        }
    }
}

#[derive(Clone)]
pub struct MarkerStore {
    db: Database,
}

impl MarkerStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn key(kind: MarkerKind, key: &str) -> String {
        format!("{}:{key}", kind.prefix())
    }

    /// Set-if-absent claim. Returns `true` when this caller won the marker,
    /// `false` when a live marker already exists. Expired markers are
    /// reaped inside the same statement batch, so a stale claim never
    /// blocks a new one.
    pub async fn acquire(&self, kind: MarkerKind, key: &str, ttl: Duration) -> Result<bool> {
        let full_key = Self::key(kind, key);
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM markers WHERE key = ?1 AND expires_at <= ?2",
                    params![full_key, Utc::now().timestamp()],
                )?;
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO markers (key, value, expires_at) VALUES (?1, '1', ?2)",
                    params![full_key, expires_at],
                )?;
                tx.commit()?;
                Ok(inserted == 1)
            })
            .await
    }

    /// Unconditionally set (or refresh) a marker.
    pub async fn set(&self, kind: MarkerKind, key: &str, ttl: Duration) -> Result<()> {
        let full_key = Self::key(kind, key);
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO markers (key, value, expires_at) VALUES (?1, '1', ?2)
                     ON CONFLICT(key) DO UPDATE SET expires_at = excluded.expires_at",
                    params![full_key, expires_at],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn exists(&self, kind: MarkerKind, key: &str) -> Result<bool> {
        let full_key = Self::key(kind, key);
        self.db
            .call(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM markers WHERE key = ?1 AND expires_at > ?2",
                    params![full_key, Utc::now().timestamp()],
                    |row| row.get(0),
                )?;
                Ok(n > 0)
            })
            .await
    }

    pub async fn clear(&self, kind: MarkerKind, key: &str) -> Result<()> {
        let full_key = Self::key(kind, key);
        self.db
            .call(move |conn| {
                conn.execute("DELETE FROM markers WHERE key = ?1", params![full_key])?;
                Ok(())
            })
            .await
    }
}
