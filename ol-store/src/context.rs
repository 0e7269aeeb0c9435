use crate::db::Database;
use crate::error::Result;
use chrono::Utc;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A customer field the parser could not establish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingField {
    Name,
    Phone,
    Address,
}

impl fmt::Display for MissingField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Name => "name",
            Self::Phone => "phone",
            Self::Address => "address",
        };
        f.write_str(label)
    }
}

/// Product snapshot carried across clarification rounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextProduct {
    pub code: String,
    pub name: String,
    pub quantity: u32,
}

/// Dialog state for one identity awaiting a clarification reply.
///
/// Holds only the current products and the latest missing-data set, not the
/// accumulated conversation; multi-round dialogs replace the context on each
/// round so the parser never sees stale history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationContext {
    pub order_id: Option<Uuid>,
    pub order_number: Option<String>,
    pub products: Vec<ContextProduct>,
    pub missing_data: Vec<MissingField>,
    pub known_name: Option<String>,
    pub known_phone: Option<String>,
    pub known_address: Option<String>,
}

/// TTL-bound side channel keyed by channel identity. At most one active
/// context per identity; `take` consumes atomically so two workers can
/// never both interpret the same dialog.
#[derive(Clone)]
pub struct ContextStore {
    db: Database,
}

impl ContextStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write (or replace) the context for an identity.
    pub async fn put(
        &self,
        identity: &str,
        context: &ClarificationContext,
        ttl: Duration,
    ) -> Result<()> {
        let identity = identity.to_string();
        let context_json = serde_json::to_string(context)?;
        let expires_at = Utc::now().timestamp() + ttl.as_secs() as i64;
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO contexts (identity, context_json, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(identity) DO UPDATE
                     SET context_json = excluded.context_json,
                         expires_at = excluded.expires_at",
                    params![identity, context_json, expires_at],
                )?;
                Ok(())
            })
            .await
    }

    /// Atomically remove and return the live context for an identity, if any.
    /// Expired contexts are dropped and reported as absent.
    pub async fn take(&self, identity: &str) -> Result<Option<ClarificationContext>> {
        let identity = identity.to_string();
        let json = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let row = tx
                    .query_row(
                        "SELECT context_json, expires_at FROM contexts WHERE identity = ?1",
                        params![identity],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?;
                let Some((context_json, expires_at)) = row else {
                    tx.commit()?;
                    return Ok(None);
                };
                tx.execute("DELETE FROM contexts WHERE identity = ?1", params![identity])?;
                tx.commit()?;
                if expires_at <= Utc::now().timestamp() {
                    return Ok(None);
                }
                Ok(Some(context_json))
            })
            .await?;
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::temp_database;

    fn sample_context() -> ClarificationContext {
        ClarificationContext {
            order_id: Some(Uuid::new_v4()),
            order_number: Some("ORD-2026-0001".to_string()),
            products: vec![ContextProduct {
                code: "WX-1001".to_string(),
                name: "Widget".to_string(),
                quantity: 2,
            }],
            missing_data: vec![MissingField::Phone],
            known_name: Some("Jane Doe".to_string()),
            known_phone: None,
            known_address: None,
        }
    }

    #[tokio::test]
    async fn take_consumes_the_context() {
        let (db, _dir) = temp_database().await;
        let contexts = ContextStore::new(db);
        let ctx = sample_context();

        contexts
            .put("chat:42", &ctx, Duration::from_secs(3600))
            .await
            .expect("put");

        let taken = contexts.take("chat:42").await.expect("take");
        let taken = taken.expect("context present");
        assert_eq!(taken.order_number, ctx.order_number);
        assert_eq!(taken.products, ctx.products);
        assert_eq!(taken.missing_data, vec![MissingField::Phone]);

        let again = contexts.take("chat:42").await.expect("take again");
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn put_replaces_existing_context() {
        let (db, _dir) = temp_database().await;
        let contexts = ContextStore::new(db);

        let mut ctx = sample_context();
        contexts
            .put("email:a@b.test", &ctx, Duration::from_secs(3600))
            .await
            .expect("put");
        ctx.missing_data = vec![MissingField::Address];
        contexts
            .put("email:a@b.test", &ctx, Duration::from_secs(3600))
            .await
            .expect("replace");

        let taken = contexts
            .take("email:a@b.test")
            .await
            .expect("take")
            .expect("context present");
        assert_eq!(taken.missing_data, vec![MissingField::Address]);
    }

    #[tokio::test]
    async fn expired_context_is_absent() {
        let (db, _dir) = temp_database().await;
        let contexts = ContextStore::new(db);

        contexts
            .put("chat:7", &sample_context(), Duration::from_secs(0))
            .await
            .expect("put");
        tokio::time::sleep(Duration::from_millis(1100)).await;

        let taken = contexts.take("chat:7").await.expect("take");
        assert!(taken.is_none());
    }

    #[tokio::test]
    async fn missing_identity_is_absent() {
        let (db, _dir) = temp_database().await;
        let contexts = ContextStore::new(db);
        assert!(contexts.take("chat:none").await.expect("take").is_none());
    }
}
