//! SQLite-backed failed-request store
//!
//! Failed requests survive restarts so an offline device can resubmit once
//! connectivity returns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::failed_requests::{FailedRequest, FailedRequestStore};
use crate::cancellation;
use crate::error::{Error, Result};
use crate::processing::DocumentRequest;
use crate::resilience::FailureType;

/// SQLite failed-request store
pub struct SqliteFailedRequestStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteFailedRequestStore {
    /// Create or open the database at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| Error::storage(format!("Failed to open database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.migrate()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::storage(format!("Failed to open in-memory database: {}", e)))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
        "#,
        )
        .map_err(|e| Error::storage(format!("Failed to set pragmas: {}", e)))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS failed_requests (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                data BLOB NOT NULL,
                document_type TEXT NOT NULL,
                failure_type TEXT NOT NULL,
                failed_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                last_attempt_at TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_failed_requests_retry_count
                ON failed_requests(retry_count);
        "#,
        )
        .map_err(|e| Error::storage(format!("Failed to run migrations: {}", e)))?;

        Ok(())
    }

    fn row_to_request(row: &Row<'_>) -> rusqlite::Result<FailedRequest> {
        let failure_type: String = row.get("failure_type")?;
        let retry_count: i64 = row.get("retry_count")?;
        Ok(FailedRequest {
            id: row.get("id")?,
            request: DocumentRequest::new(row.get("data")?, row.get::<_, String>("document_type")?),
            failure_type: FailureType::parse(&failure_type),
            failed_at: row.get::<_, DateTime<Utc>>("failed_at")?,
            retry_count: retry_count.max(0) as u32,
            last_error: row.get("last_error")?,
            last_attempt_at: row.get::<_, Option<DateTime<Utc>>>("last_attempt_at")?,
        })
    }

    /// Fetch one stored request
    pub fn get(&self, id: &str) -> Result<Option<FailedRequest>> {
        let conn = self.conn.lock();
        let request = conn
            .query_row(
                "SELECT * FROM failed_requests WHERE id = ?1",
                params![id],
                Self::row_to_request,
            )
            .optional()?;
        Ok(request)
    }
}

#[async_trait]
impl FailedRequestStore for SqliteFailedRequestStore {
    async fn store_failed(&self, request: FailedRequest) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR REPLACE INTO failed_requests
                (id, data, document_type, failure_type, failed_at, retry_count, last_error, last_attempt_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                request.id,
                request.request.data,
                request.request.document_type,
                request.failure_type.as_str(),
                request.failed_at,
                request.retry_count as i64,
                request.last_error,
                request.last_attempt_at,
            ],
        )?;
        tracing::debug!("Stored failed request {}", request.id);
        Ok(())
    }

    async fn get_retryable(
        &self,
        max_batch: usize,
        max_retries: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<FailedRequest>> {
        cancellation::check(cancel)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM failed_requests WHERE retry_count < ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![max_retries as i64, max_batch.min(i64::MAX as usize) as i64],
            Self::row_to_request,
        )?;
        let requests = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(requests)
    }

    async fn update_retry_status(
        &self,
        id: &str,
        success: bool,
        message: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        cancellation::check(cancel)?;
        let conn = self.conn.lock();
        let now = Utc::now();
        let updated = if success {
            conn.execute(
                "UPDATE failed_requests SET last_error = NULL, last_attempt_at = ?2 WHERE id = ?1",
                params![id, now],
            )?
        } else {
            conn.execute(
                r#"
                UPDATE failed_requests
                SET retry_count = retry_count + 1, last_error = ?2, last_attempt_at = ?3
                WHERE id = ?1
                "#,
                params![id, message, now],
            )?
        };
        Ok(updated > 0)
    }

    async fn remove_request(&self, id: &str, cancel: &CancellationToken) -> Result<bool> {
        cancellation::check(cancel)?;
        let conn = self.conn.lock();
        let deleted = conn.execute("DELETE FROM failed_requests WHERE id = ?1", params![id])?;
        Ok(deleted > 0)
    }

    async fn remove_exhausted(&self, max_retries: u32, cancel: &CancellationToken) -> Result<usize> {
        cancellation::check(cancel)?;
        let conn = self.conn.lock();
        let deleted = conn.execute(
            "DELETE FROM failed_requests WHERE retry_count >= ?1",
            params![max_retries as i64],
        )?;
        if deleted > 0 {
            tracing::info!("Purged {} exhausted failed requests", deleted);
        }
        Ok(deleted)
    }

    async fn pending_count(&self, cancel: &CancellationToken) -> Result<usize> {
        cancellation::check(cancel)?;
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM failed_requests", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(tag: &str) -> FailedRequest {
        FailedRequest::new(
            DocumentRequest::new(tag.as_bytes().to_vec(), "invoice"),
            FailureType::Unknown,
            "connection reset",
        )
    }

    #[tokio::test]
    async fn test_store_and_fetch_round_trip() {
        let token = CancellationToken::new();
        let store = SqliteFailedRequestStore::in_memory().unwrap();
        let request = failed("page");
        let id = request.id.clone();
        store.store_failed(request.clone()).await.unwrap();

        let loaded = store.get(&id).unwrap().unwrap();
        assert_eq!(loaded.request, request.request);
        assert_eq!(loaded.failure_type, FailureType::Unknown);
        assert_eq!(loaded.last_error.as_deref(), Some("connection reset"));
        assert_eq!(store.pending_count(&token).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_lifecycle() {
        let token = CancellationToken::new();
        let store = SqliteFailedRequestStore::in_memory().unwrap();
        let first = failed("first");
        let second = failed("second");
        let (first_id, second_id) = (first.id.clone(), second.id.clone());
        store.store_failed(first).await.unwrap();
        store.store_failed(second).await.unwrap();

        let batch = store.get_retryable(1, 3, &token).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, first_id);

        for _ in 0..3 {
            assert!(store.update_retry_status(&first_id, false, Some("503"), &token).await.unwrap());
        }
        let batch = store.get_retryable(10, 3, &token).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, second_id);

        assert_eq!(store.remove_exhausted(3, &token).await.unwrap(), 1);
        assert!(store.remove_request(&second_id, &token).await.unwrap());
        assert_eq!(store.pending_count(&token).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("retry.db");

        let request = failed("durable");
        let id = request.id.clone();
        {
            let store = SqliteFailedRequestStore::new(&path).unwrap();
            store.store_failed(request).await.unwrap();
        }

        let reopened = SqliteFailedRequestStore::new(&path).unwrap();
        assert!(reopened.get(&id).unwrap().is_some());
    }
}
