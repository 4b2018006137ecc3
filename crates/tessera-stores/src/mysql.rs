//! MySQL backend.
//!
//! MySQL has no `DISTINCT ON`, so the latest version per id comes from a
//! `ROW_NUMBER() OVER (PARTITION BY id ORDER BY created_at DESC, seq DESC)`
//! window, keeping the tie-break identical to the other SQL backends.
//! Credentials are stored as a JSON array and matched with `JSON_OVERLAPS`.
//!
//! `created_at` is a DATETIME(6) holding UTC; values are bound and decoded
//! as naive timestamps and reattached to UTC in process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use sqlx::{mysql::MySqlRow, MySqlPool, Row};

use tessera_core::{
    Auth, Envelope, Payload, QueryTemplate, Repository, Searcher, TesseraError, TesseraResult,
};

const CREATE_RETRIES: usize = 5;

const COLUMNS: &str = "id, payload, created_at, deleted, authorized_tokens";

/// Credential clause; binds one JSON-encoded token array.
const TOKEN_CLAUSE: &str =
    "(JSON_LENGTH(authorized_tokens) = 0 OR JSON_OVERLAPS(authorized_tokens, CAST(? AS JSON)))";

/// MySQL-backed envelope repository.
pub struct MysqlRepository {
    pool: MySqlPool,
    table: String,
}

impl MysqlRepository {
    /// Create a repository over an existing pool.
    pub fn new(pool: MySqlPool, table: impl Into<String>) -> Self {
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
                seq BIGINT AUTO_INCREMENT PRIMARY KEY,
                id VARCHAR(64) NOT NULL,
                payload JSON NOT NULL,
                created_at DATETIME(6) NOT NULL,
                deleted BOOLEAN NOT NULL DEFAULT FALSE,
                authorized_tokens JSON NOT NULL,
                UNIQUE KEY {table}_id_created_at_uniq (id, created_at),
                KEY idx_{table}_id (id)
            )
            "#
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| TesseraError::store_with_source("Failed to create table", e))?;
        Ok(())
    }

    /// Window query selecting the latest visible version per id.
    fn latest_sql(&self, extra_where: &str, with_tokens: bool) -> String {
        let mut inner = format!(
            "SELECT t.*, ROW_NUMBER() OVER (PARTITION BY id ORDER BY created_at DESC, seq DESC) AS rn \
             FROM {} t WHERE deleted = FALSE AND created_at <= ?",
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
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23000")
    )
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn tokens_json(tokens: &[String]) -> String {
    serde_json::to_string(tokens).unwrap_or_else(|_| "[]".to_string())
}

fn row_to_envelope(row: &MySqlRow) -> TesseraResult<Envelope> {
    let payload: serde_json::Value = row
        .try_get("payload")
        .map_err(|e| TesseraError::store_with_source("Bad payload column", e))?;
    let payload = match payload {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    };

    let created_at: NaiveDateTime = row
        .try_get("created_at")
        .map_err(|e| TesseraError::store_with_source("Bad created_at column", e))?;

    let authorized_tokens = row
        .try_get::<serde_json::Value, _>("authorized_tokens")
        .ok()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();

    Ok(Envelope {
        id: Some(
            row.try_get("id")
                .map_err(|e| TesseraError::store_with_source("Bad id column", e))?,
        ),
        payload,
        created_at: Some(DateTime::from_naive_utc_and_offset(created_at, Utc)),
        deleted: row.try_get("deleted").unwrap_or(false),
        authorized_tokens,
    })
}

#[async_trait]
impl Repository for MysqlRepository {
    async fn create(&self, envelope: Envelope, tokens: &[String]) -> TesseraResult<Envelope> {
        let id = envelope.id_or_generate();
        let payload = serde_json::Value::Object(envelope.payload.clone());
        let sql = format!(
            "INSERT INTO {} (id, payload, created_at, deleted, authorized_tokens) \
             VALUES (?, ?, ?, FALSE, CAST(? AS JSON))",
            self.table
        );

        for attempt in 0.. {
            // DATETIME(6) granularity, so reads hand back the same instant.
            let created_at = Utc::now().trunc_subsecs(6);
            match sqlx::query(&sql)
                .bind(&id)
                .bind(&payload)
                .bind(created_at.naive_utc())
                .bind(tokens_json(tokens))
                .execute(&self.pool)
                .await
            {
                Ok(_) => {
                    let mut stored = envelope.clone();
                    stored.id = Some(id);
                    stored.created_at = Some(created_at);
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
            "SELECT {COLUMNS} FROM {} WHERE id = ? AND deleted = FALSE AND created_at <= ?",
            self.table
        );
        if !tokens.is_empty() {
            sql.push_str(" AND ");
            sql.push_str(TOKEN_CLAUSE);
        }
        sql.push_str(" ORDER BY created_at DESC, seq DESC LIMIT 1");

        let mut query = sqlx::query(&sql).bind(id).bind(at.naive_utc());
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

        let mut query = sqlx::query(&sql).bind(Utc::now().naive_utc());
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
        // The outcome reports authorization, never changed-row counts, so
        // repeating a remove stays true.
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

        let sql = format!("UPDATE {} SET deleted = TRUE WHERE id = ?", self.table);
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

        let mut query = sqlx::query(&sql).bind(Utc::now().naive_utc());
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

/// MySQL-backed envelope searcher.
pub struct MysqlSearcher {
    pool: MySqlPool,
    table: String,
    authorizer: Arc<dyn Auth>,
}

impl MysqlSearcher {
    /// Create a searcher over an existing pool.
    pub fn new(pool: MySqlPool, table: impl Into<String>, authorizer: Arc<dyn Auth>) -> Self {
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
            serde_json::Value::String(at.to_rfc3339()),
        );
        template.render(&args)
    }
}

#[async_trait]
impl Searcher for MysqlSearcher {
    async fn find(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        creds: &[String],
        at: DateTime<Utc>,
    ) -> TesseraResult<Payload> {
        let fragment = self.render_fragment(template, args, at)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE ({fragment}) AND deleted = FALSE \
             AND created_at <= ? ORDER BY created_at DESC, seq DESC LIMIT 1",
            self.table
        );

        let row = match sqlx::query(&sql)
            .bind(at.naive_utc())
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
             FROM {} t WHERE ({fragment}) AND deleted = FALSE AND created_at <= ?",
            self.table
        );
        let sql = format!("SELECT {COLUMNS} FROM ({inner}) ranked WHERE rn = 1");

        let rows = match sqlx::query(&sql)
            .bind(at.naive_utc())
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
