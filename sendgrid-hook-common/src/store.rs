//! # EventStore
//!
//! Persistence of SendGrid events in a PostgreSQL table, one row per `sg_event_id`.
use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, Postgres};

use crate::error::DatabaseError;
use crate::event::{NewWebhookEvent, WebhookEvent};

pub type StoreResult<T> = std::result::Result<T, DatabaseError>;

/// The table of processed events.
/// Reads and writes that take part in deduplication go through an `EventTransaction`.
#[derive(Clone)]
pub struct EventStore {
    /// A connection pool used to connect to the PostgreSQL database.
    pool: PgPool,
}

impl EventStore {
    /// Initialize a new EventStore by intializing a lazy connection pool to the database in `url`.
    ///
    /// # Arguments
    ///
    /// * `url`: A URL pointing to where the PostgreSQL database is hosted.
    /// * `max_connections`: Upper bound on the pool size.
    /// * `app_name`: Reported to PostgreSQL as `application_name`.
    pub fn new(url: &str, max_connections: u32, app_name: &'static str) -> StoreResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| DatabaseError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    /// Initialize a new EventStore from a provided connection pool.
    pub fn new_from_pool(pool: PgPool) -> EventStore {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open the unit of work for a single event.
    pub async fn begin(&self) -> StoreResult<EventTransaction<'static>> {
        let txn = self
            .pool
            .begin()
            .await
            .map_err(|error| DatabaseError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        Ok(EventTransaction { txn })
    }

    /// Fetch a stored event by its SendGrid id, outside of any transaction.
    pub async fn get(&self, sg_event_id: &str) -> StoreResult<Option<WebhookEvent>> {
        let base_query = r#"
SELECT
    *
FROM
    sendgrid_webhook_events
WHERE
    sg_event_id = $1
        "#;

        sqlx::query_as(base_query)
            .bind(sg_event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }

    /// Count all stored events.
    pub async fn count(&self) -> StoreResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM sendgrid_webhook_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })
    }
}

/// An open transaction on the `EventStore`.
/// Dropping it without calling `commit` rolls back anything written through it.
pub struct EventTransaction<'c> {
    txn: sqlx::Transaction<'c, Postgres>,
}

impl EventTransaction<'_> {
    /// Check whether an event was already stored.
    ///
    /// The row is read `FOR SHARE`: a transaction that inserted the same `sg_event_id` and has not
    /// finished yet makes this transaction's own INSERT wait and then fail with a unique violation,
    /// so two transactions can never both store the same event.
    pub async fn exists(&mut self, sg_event_id: &str) -> StoreResult<bool> {
        let base_query = r#"
SELECT
    id
FROM
    sendgrid_webhook_events
WHERE
    sg_event_id = $1
FOR SHARE
        "#;

        let id: Option<i64> = sqlx::query_scalar(base_query)
            .bind(sg_event_id)
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(id.is_some())
    }

    /// Insert a new event, returning its id.
    /// Fails with a unique violation if `sg_event_id` is already stored.
    pub async fn insert(&mut self, event: &NewWebhookEvent) -> StoreResult<i64> {
        let base_query = r#"
INSERT INTO sendgrid_webhook_events
    (created_at, updated_at, "timestamp", email, event, sg_event_id, sg_message_id, payload, categories)
VALUES
    (NOW(), NOW(), $1, $2, $3, $4, $5, $6, $7)
RETURNING
    id
        "#;

        sqlx::query_scalar(base_query)
            .bind(event.timestamp)
            .bind(&event.email)
            .bind(&event.event)
            .bind(&event.sg_event_id)
            .bind(&event.sg_message_id)
            .bind(&event.payload)
            .bind(&event.categories)
            .fetch_one(&mut *self.txn)
            .await
            .map_err(|error| DatabaseError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })
    }

    pub async fn commit(self) -> StoreResult<()> {
        self.txn
            .commit()
            .await
            .map_err(|error| DatabaseError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_event(sg_event_id: &str) -> NewWebhookEvent {
        NewWebhookEvent {
            timestamp: chrono::DateTime::from_timestamp(1690000000, 0),
            email: "a@b.com".to_owned(),
            event: "delivered".to_owned(),
            sg_event_id: sg_event_id.to_owned(),
            sg_message_id: None,
            payload: sqlx::types::Json(json!({"sg_event_id": sg_event_id, "event": "delivered"})),
            categories: Some(sqlx::types::Json(vec!["b".to_owned(), "a".to_owned()])),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_exists_after_insert(db: PgPool) {
        let store = EventStore::new_from_pool(db);

        let mut txn = store.begin().await.expect("failed to begin transaction");
        assert!(!txn.exists("evt-1").await.expect("failed to check event"));
        txn.insert(&new_event("evt-1"))
            .await
            .expect("failed to insert event");
        assert!(txn.exists("evt-1").await.expect("failed to check event"));
        txn.commit().await.expect("failed to commit transaction");

        let mut txn = store.begin().await.expect("failed to begin transaction");
        assert!(txn.exists("evt-1").await.expect("failed to check event"));
        assert!(!txn.exists("evt-2").await.expect("failed to check event"));
        txn.commit().await.expect("failed to commit transaction");
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_stored_event_round_trips(db: PgPool) {
        let store = EventStore::new_from_pool(db);
        let event = new_event("evt-1");

        let mut txn = store.begin().await.expect("failed to begin transaction");
        let id = txn.insert(&event).await.expect("failed to insert event");
        txn.commit().await.expect("failed to commit transaction");

        let stored = store
            .get("evt-1")
            .await
            .expect("failed to fetch event")
            .expect("event not found");

        assert_eq!(stored.id, id);
        assert_eq!(stored.email, "a@b.com");
        assert_eq!(stored.event, "delivered");
        assert_eq!(stored.sg_message_id, None);
        assert_eq!(stored.timestamp, event.timestamp);
        assert_eq!(stored.payload.0, event.payload.0);
        assert_eq!(
            stored.categories.map(|c| c.0),
            Some(vec!["b".to_owned(), "a".to_owned()])
        );
        assert_eq!(stored.created_at, stored.updated_at);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_duplicate_insert_is_a_unique_violation(db: PgPool) {
        let store = EventStore::new_from_pool(db);

        let mut txn = store.begin().await.expect("failed to begin transaction");
        txn.insert(&new_event("evt-1"))
            .await
            .expect("failed to insert event");
        txn.commit().await.expect("failed to commit transaction");

        let mut txn = store.begin().await.expect("failed to begin transaction");
        let error = txn
            .insert(&new_event("evt-1"))
            .await
            .expect_err("duplicate insert should fail");

        assert!(error.is_unique_violation());
        assert!(error.is_retryable());
        assert_eq!(store.count().await.expect("failed to count events"), 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_dropped_transaction_is_rolled_back(db: PgPool) {
        let store = EventStore::new_from_pool(db);

        let mut txn = store.begin().await.expect("failed to begin transaction");
        txn.insert(&new_event("evt-1"))
            .await
            .expect("failed to insert event");
        drop(txn);

        assert_eq!(store.count().await.expect("failed to count events"), 0);
        assert!(store
            .get("evt-1")
            .await
            .expect("failed to fetch event")
            .is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_categories_support_containment_queries(db: PgPool) {
        let store = EventStore::new_from_pool(db.clone());

        let mut txn = store.begin().await.expect("failed to begin transaction");
        txn.insert(&new_event("evt-1"))
            .await
            .expect("failed to insert event");
        let mut uncategorized = new_event("evt-2");
        uncategorized.categories = None;
        txn.insert(&uncategorized)
            .await
            .expect("failed to insert event");
        txn.commit().await.expect("failed to commit transaction");

        let matching: Vec<String> = sqlx::query_scalar(
            r#"SELECT sg_event_id FROM sendgrid_webhook_events WHERE categories @> '["a"]'::jsonb"#,
        )
        .fetch_all(&db)
        .await
        .expect("failed to query categories");

        assert_eq!(matching, vec!["evt-1".to_owned()]);
    }
}
