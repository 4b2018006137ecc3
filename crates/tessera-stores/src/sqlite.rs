//! SQLite backend.
//!
//! `created_at` is stored as integer milliseconds since the epoch, which is
//! also why the unique `(id, created_at)` constraint can trip when two
//! writes land in the same millisecond; the create path restamps and
//! retries. Latest-version selection uses the same `ROW_NUMBER()` window as
//! the MySQL backend; credentials are a JSON array matched via `json_each`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use tessera_core::{
    Auth, Envelope, Payload, QueryTemplate, Repository, Searcher, TesseraError, TesseraResult,
};

const CREATE_RETRIES: usize = 5;

const COLUMNS: &str = "id, payload, created_at, deleted, authorized_tokens";

/// Credential clause; binds one JSON-encoded token array.
const TOKEN_CLAUSE: &str = "(json_array_length(authorized_tokens) = 0 OR EXISTS \
     (SELECT 1 FROM json_each(authorized_tokens) WHERE json_each.value IN \
      (SELECT value FROM json_each(?))))";

/// SQLite-backed envelope repository.
pub struct SqliteRepository {
    pool: SqlitePool,
    table: String,
}

impl SqliteRepository {
    /// Create a repository over an existing pool.
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Create the table if it does not exist.
    pub async fn initialize(&self) -> TesseraResult<()> {
        let table = &self.table;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                authorized_tokens TEXT NOT NULL DEFAULT '[]',
                UNIQUE (id, created_at)
            )
            "#
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| TesseraError::store_with_source("Failed to create table", e))?;
        Ok(())
    }

    fn latest_sql(&self, extra_where: &str, with_tokens: bool) -> String {
        let mut inner = format!(
            "SELECT t.*, ROW_NUMBER() OVER (PARTITION BY id ORDER BY created_at DESC, seq DESC) AS rn \
             FROM {} t WHERE deleted = 0 AND created_at <= ?",
            self.table
        );
        if !extra_where.is_empty() {
            inner.push_str(" AND ");
            inner.push_str(extra_where);
        }
        if with_tokens {
            inner.push_str(" AND ");
            inner.push_str(TOKEN_CLAUSE);
        }
        format!("SELECT {COLUMNS} FROM ({inner}) ranked WHERE rn = 1")
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.message().contains("UNIQUE constraint failed")
    )
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn tokens_json(tokens: &[String]) -> String {
    serde_json::to_string(tokens).unwrap_or_else(|_| "[]".to_string())
}

fn millis_to_datetime(millis: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
}

fn row_to_envelope(row: &SqliteRow) -> TesseraResult<Envelope> {
    let payload_text: String = row
        .try_get("payload")
        .map_err(|e| TesseraError::store_with_source("Bad payload column", e))?;
    let payload = serde_json::from_str::<serde_json::Value>(&payload_text)
        .ok()
        .and_then(|v| match v {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default();

    let created_at: i64 = row
        .try_get("created_at")
        .map_err(|e| TesseraError::store_with_source("Bad created_at column", e))?;

    let authorized_tokens = row
        .try_get::<String, _>("authorized_tokens")
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default();

    Ok(Envelope {
        id: Some(
            row.try_get("id")
                .map_err(|e| TesseraError::store_with_source("Bad id column", e))?,
        ),
        payload,
        created_at: millis_to_datetime(created_at),
        deleted: row.try_get::<i64, _>("deleted").unwrap_or(0) != 0,
        authorized_tokens,
    })
}

#[async_trait]
impl Repository for SqliteRepository {
    async fn create(&self, envelope: Envelope, tokens: &[String]) -> TesseraResult<Envelope> {
        let id = envelope.id_or_generate();
        let payload_text = serde_json::to_string(&envelope.payload)?;
        let sql = format!(
            "INSERT INTO {} (id, payload, created_at, deleted, authorized_tokens) \
             VALUES (?, ?, ?, 0, ?)",
            self.table
        );

        for attempt in 0.. {
            let created_at = Utc::now();
            match sqlx::query(&sql)
                .bind(&id)
                .bind(&payload_text)
                .bind(created_at.timestamp_millis())
                .bind(tokens_json(tokens))
                .execute(&self.pool)
                .await
            {
                Ok(_) => {
                    let mut stored = envelope.clone();
                    stored.id = Some(id);
                    // Round to the stored granularity so reads compare equal.
                    stored.created_at = millis_to_datetime(created_at.timestamp_millis());
                    stored.deleted = false;
                    stored.authorized_tokens = tokens.to_vec();
                    return Ok(stored);
                }
                Err(e) if is_unique_violation(&e) && attempt < CREATE_RETRIES => {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Err(e) => return Err(TesseraError::store_with_source("Insert failed", e)),
            }
        }
        unreachable!("create retry loop always returns")
    }

    async fn create_many(
        &self,
        envelopes: Vec<Envelope>,
        tokens: &[String],
    ) -> TesseraResult<Vec<Envelope>> {
        let total = envelopes.len();
        let mut created = Vec::with_capacity(total);
        for envelope in envelopes {
            match self.create(envelope, tokens).await {
                Ok(stored) => created.push(stored),
                Err(e) => {
                    return Err(TesseraError::BulkWrite {
                        created: created.len(),
                        total,
                        message: e.to_string(),
                    })
                }
            }
        }
        Ok(created)
    }

    async fn read(
        &self,
        id: &str,
        tokens: &[String],
        at: Option<DateTime<Utc>>,
    ) -> TesseraResult<Option<Envelope>> {
        let at = at.unwrap_or_else(Utc::now);
        let mut sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE id = ? AND deleted = 0 AND created_at <= ?",
            self.table
        );
        if !tokens.is_empty() {
            sql.push_str(" AND ");
            sql.push_str(TOKEN_CLAUSE);
        }
        sql.push_str(" ORDER BY created_at DESC, seq DESC LIMIT 1");

        let mut query = sqlx::query(&sql).bind(id).bind(at.timestamp_millis());
        if !tokens.is_empty() {
            query = query.bind(tokens_json(tokens));
        }

        match query.fetch_optional(&self.pool).await {
            Ok(Some(row)) => Ok(Some(row_to_envelope(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, id, "read degraded to absent");
                Ok(None)
            }
        }
    }

    async fn read_many(&self, ids: &[String], tokens: &[String]) -> TesseraResult<Vec<Envelope>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let id_filter = format!("id IN ({})", placeholders(ids.len()));
        let sql = self.latest_sql(&id_filter, !tokens.is_empty());

        let mut query = sqlx::query(&sql).bind(Utc::now().timestamp_millis());
        for id in ids {
            query = query.bind(id);
        }
        if !tokens.is_empty() {
            query = query.bind(tokens_json(tokens));
        }

        match query.fetch_all(&self.pool).await {
            Ok(rows) => rows.iter().map(row_to_envelope).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "read_many degraded to empty");
                Ok(Vec::new())
            }
        }
    }

    async fn remove(&self, id: &str, tokens: &[String]) -> TesseraResult<bool> {
        // Authorize against any version of the chain, then tombstone the
        // whole chain so no version stays visible under other credentials.
        let mut auth_sql = format!("SELECT 1 FROM {} WHERE id = ?", self.table);
        if !tokens.is_empty() {
            auth_sql.push_str(" AND ");
            auth_sql.push_str(TOKEN_CLAUSE);
        }
        auth_sql.push_str(" LIMIT 1");

        let mut query = sqlx::query(&auth_sql).bind(id);
        if !tokens.is_empty() {
            query = query.bind(tokens_json(tokens));
        }
        let authorized = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TesseraError::store_with_source("Tombstone failed", e))?
            .is_some();
        if !authorized {
            return Ok(false);
        }

        let sql = format!("UPDATE {} SET deleted = 1 WHERE id = ?", self.table);
        sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| TesseraError::store_with_source("Tombstone failed", e))?;
        Ok(true)
    }

    async fn remove_many(
        &self,
        ids: &[String],
        tokens: &[String],
    ) -> TesseraResult<HashMap<String, bool>> {
        let mut outcome = HashMap::with_capacity(ids.len());
        for id in ids {
            outcome.insert(id.clone(), self.remove(id, tokens).await?);
        }
        Ok(outcome)
    }

    async fn list(&self, tokens: &[String]) -> TesseraResult<Vec<Envelope>> {
        let sql = self.latest_sql("", !tokens.is_empty());

        let mut query = sqlx::query(&sql).bind(Utc::now().timestamp_millis());
        if !tokens.is_empty() {
            query = query.bind(tokens_json(tokens));
        }

        match query.fetch_all(&self.pool).await {
            Ok(rows) => rows.iter().map(row_to_envelope).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "list degraded to empty");
                Ok(Vec::new())
            }
        }
    }

    async fn ready(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

/// SQLite-backed envelope searcher.
pub struct SqliteSearcher {
    pool: SqlitePool,
    table: String,
    authorizer: Arc<dyn Auth>,
}

impl SqliteSearcher {
    /// Create a searcher over an existing pool.
    pub fn new(pool: SqlitePool, table: impl Into<String>, authorizer: Arc<dyn Auth>) -> Self {
        Self {
            pool,
            table: table.into(),
            authorizer,
        }
    }

    fn render_fragment(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        at: DateTime<Utc>,
    ) -> TesseraResult<String> {
        let mut args = args.clone();
        args.insert(
            "_name".to_string(),
            serde_json::Value::String(self.table.clone()),
        );
        args.insert(
            "_created_at".to_string(),
            serde_json::Value::Number(at.timestamp_millis().into()),
        );
        template.render(&args)
    }
}

#[async_trait]
impl Searcher for SqliteSearcher {
    async fn find(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        creds: &[String],
        at: DateTime<Utc>,
    ) -> TesseraResult<Payload> {
        let fragment = self.render_fragment(template, args, at)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE ({fragment}) AND deleted = 0 \
             AND created_at <= ? ORDER BY created_at DESC, seq DESC LIMIT 1",
            self.table
        );

        let row = match sqlx::query(&sql)
            .bind(at.timestamp_millis())
            .fetch_optional(&self.pool)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(error = %e, "find degraded to empty");
                None
            }
        };

        if let Some(row) = row {
            let envelope = row_to_envelope(&row)?;
            if self.authorizer.is_authorized(creds, &envelope).await {
                return Ok(envelope.payload_with_id());
            }
        }
        Ok(Payload::new())
    }

    async fn find_all(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        creds: &[String],
        at: DateTime<Utc>,
    ) -> TesseraResult<Vec<Payload>> {
        let fragment = self.render_fragment(template, args, at)?;
        let inner = format!(
            "SELECT t.*, ROW_NUMBER() OVER (PARTITION BY id ORDER BY created_at DESC, seq DESC) AS rn \
             FROM {} t WHERE ({fragment}) AND deleted = 0 AND created_at <= ?",
            self.table
        );
        let sql = format!("SELECT {COLUMNS} FROM ({inner}) ranked WHERE rn = 1");

        let rows = match sqlx::query(&sql)
            .bind(at.timestamp_millis())
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "find_all degraded to empty");
                return Ok(Vec::new());
            }
        };

        let mut payloads = Vec::with_capacity(rows.len());
        for row in &rows {
            let envelope = row_to_envelope(row)?;
            if self.authorizer.is_authorized(creds, &envelope).await {
                payloads.push(envelope.payload_with_id());
            }
        }
        Ok(payloads)
    }

    async fn ready(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::NoopAuth;

    async fn repo() -> SqliteRepository {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let repo = SqliteRepository::new(pool, "envelopes");
        repo.initialize().await.unwrap();
        repo
    }

    #[tokio::test]
    async fn create_and_read_round_trip() {
        let repo = repo().await;
        let created = repo
            .create(Envelope::new(json!({"name": "red"})), &[])
            .await
            .unwrap();
        let id = created.id.clone().unwrap();

        let read = repo.read(&id, &[], None).await.unwrap().unwrap();
        assert_eq!(read.payload["name"], json!("red"));
        assert_eq!(read.created_at, created.created_at);
    }

    #[tokio::test]
    async fn rapid_versions_survive_the_unique_constraint() {
        let repo = repo().await;
        let first = repo
            .create(Envelope::new(json!({"v": 1})), &[])
            .await
            .unwrap();
        let id = first.id.clone().unwrap();

        // Back-to-back writes can land in the same millisecond; the retry
        // restamps until (id, created_at) is free.
        let second = repo
            .create(Envelope::with_id(&id, json!({"v": 2})), &[])
            .await
            .unwrap();
        assert_eq!(second.id.as_deref(), Some(id.as_str()));

        let read = repo.read(&id, &[], None).await.unwrap().unwrap();
        assert_eq!(read.payload["v"], json!(2));
    }

    #[tokio::test]
    async fn remove_tombstones_the_chain() {
        let repo = repo().await;
        let created = repo
            .create(Envelope::new(json!({"name": "red"})), &[])
            .await
            .unwrap();
        let id = created.id.clone().unwrap();
        repo.create(Envelope::with_id(&id, json!({"name": "purple"})), &[])
            .await
            .unwrap();

        assert!(repo.remove(&id, &[]).await.unwrap());
        assert!(repo.read(&id, &[], None).await.unwrap().is_none());
        assert!(repo
            .read(&id, &[], created.created_at)
            .await
            .unwrap()
            .is_none());
        assert!(repo.list(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_hides_versions_under_other_tokens() {
        let repo = repo().await;
        let created = repo
            .create(Envelope::new(json!({"v": 1})), &["alpha".to_string()])
            .await
            .unwrap();
        let id = created.id.clone().unwrap();
        repo.create(
            Envelope::with_id(&id, json!({"v": 2})),
            &["beta".to_string()],
        )
        .await
        .unwrap();

        // Holding alpha is enough to tombstone the chain, including the
        // version only beta can read.
        assert!(repo.remove(&id, &["alpha".to_string()]).await.unwrap());
        assert!(repo
            .read(&id, &["beta".to_string()], None)
            .await
            .unwrap()
            .is_none());
        assert!(repo.read(&id, &[], None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_reports_authorization_not_row_changes() {
        let repo = repo().await;
        let created = repo
            .create(Envelope::new(json!({"v": 1})), &["alpha".to_string()])
            .await
            .unwrap();
        let id = created.id.clone().unwrap();

        assert!(!repo.remove(&id, &["beta".to_string()]).await.unwrap());
        assert!(repo
            .read(&id, &["alpha".to_string()], None)
            .await
            .unwrap()
            .is_some());

        // Repeating an authorized remove stays true even though no row
        // changes the second time.
        assert!(repo.remove(&id, &["alpha".to_string()]).await.unwrap());
        assert!(repo.remove(&id, &["alpha".to_string()]).await.unwrap());
        assert!(!repo.remove("missing", &[]).await.unwrap());
    }

    #[tokio::test]
    async fn token_scoped_reads() {
        let repo = repo().await;
        let created = repo
            .create(Envelope::new(json!({"secret": 1})), &["alpha".to_string()])
            .await
            .unwrap();
        let id = created.id.clone().unwrap();

        assert!(repo
            .read(&id, &["beta".to_string()], None)
            .await
            .unwrap()
            .is_none());
        assert!(repo
            .read(&id, &["alpha".to_string()], None)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn searcher_fragment_query() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let repo = SqliteRepository::new(pool.clone(), "envelopes");
        repo.initialize().await.unwrap();
        let searcher = SqliteSearcher::new(pool, "envelopes", Arc::new(NoopAuth));

        let created = repo
            .create(Envelope::new(json!({"name": "duck"})), &[])
            .await
            .unwrap();

        let template = QueryTemplate::compile("id = '{{id}}'").unwrap();
        let args = json!({"id": created.id.clone().unwrap()})
            .as_object()
            .unwrap()
            .clone();
        let found = searcher
            .find(&template, &args, &[], Utc::now())
            .await
            .unwrap();
        assert_eq!(found["name"], json!("duck"));
        assert_eq!(found["id"], json!(created.id.unwrap()));
    }

    #[tokio::test]
    async fn find_all_one_row_per_id() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let repo = SqliteRepository::new(pool.clone(), "envelopes");
        repo.initialize().await.unwrap();
        let searcher = SqliteSearcher::new(pool, "envelopes", Arc::new(NoopAuth));

        let created = repo
            .create(Envelope::new(json!({"farm": "f1", "name": "red"})), &[])
            .await
            .unwrap();
        let id = created.id.clone().unwrap();
        repo.create(
            Envelope::with_id(&id, json!({"farm": "f1", "name": "purple"})),
            &[],
        )
        .await
        .unwrap();

        let template =
            QueryTemplate::compile("json_extract(payload, '$.farm') = '{{farm}}'").unwrap();
        let args = json!({"farm": "f1"}).as_object().unwrap().clone();
        let all = searcher
            .find_all(&template, &args, &[], Utc::now())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["name"], json!("purple"));
    }
}
