//! PostgreSQL backend.
//!
//! Versions append to a table with a `UNIQUE (id, created_at)` constraint
//! and a `seq` bigserial; the latest version per id is selected with
//! `DISTINCT ON (id) ... ORDER BY id, created_at DESC, seq DESC`, so a
//! timestamp tie resolves to the later insert. A 23505 on create means two
//! writes landed in the same microsecond; the write restamps and retries.
//!
//! Table names come from trusted static configuration and are spliced; all
//! runtime values (timestamps, credentials, ids) are driver-bound.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use tessera_core::{
    Auth, Envelope, Payload, QueryTemplate, Repository, Searcher, TesseraError, TesseraResult,
};

const CREATE_RETRIES: usize = 5;

const COLUMNS: &str = "id, payload, created_at, deleted, authorized_tokens";

/// PostgreSQL-backed envelope repository.
pub struct PostgresRepository {
    pool: PgPool,
    table: String,
}

impl PostgresRepository {
    /// Create a repository over an existing pool.
    pub fn new(pool: PgPool, table: impl Into<String>) -> Self {
        Self {
            pool,
            table: table.into(),
        }
    }

    /// Create the table and indexes if they do not exist.
    pub async fn initialize(&self) -> TesseraResult<()> {
        let table = &self.table;
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                seq BIGSERIAL PRIMARY KEY,
                id TEXT NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                deleted BOOLEAN NOT NULL DEFAULT FALSE,
                authorized_tokens TEXT[] NOT NULL DEFAULT '{{}}',
                CONSTRAINT {table}_id_created_at_uniq UNIQUE (id, created_at)
            )
            "#
        );
        sqlx::query(&ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| TesseraError::store_with_source("Failed to create table", e))?;

        for index in [
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_id ON {table} (id)"),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_created_at ON {table} (created_at)"),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_tokens ON {table} USING GIN (authorized_tokens)"
            ),
        ] {
            sqlx::query(&index)
                .execute(&self.pool)
                .await
                .map_err(|e| TesseraError::store_with_source("Failed to create index", e))?;
        }
        Ok(())
    }
}

/// Credential clause: world-readable rows pass, otherwise the token arrays
/// must overlap. `$n` is the bind position of the credential array.
fn token_clause(position: usize) -> String {
    format!("(cardinality(authorized_tokens) = 0 OR authorized_tokens && ${position})")
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

fn row_to_envelope(row: &PgRow) -> TesseraResult<Envelope> {
    let payload: serde_json::Value = row
        .try_get("payload")
        .map_err(|e| TesseraError::store_with_source("Bad payload column", e))?;
    let payload = match payload {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    };

    Ok(Envelope {
        id: Some(
            row.try_get("id")
                .map_err(|e| TesseraError::store_with_source("Bad id column", e))?,
        ),
        payload,
        created_at: Some(
            row.try_get("created_at")
                .map_err(|e| TesseraError::store_with_source("Bad created_at column", e))?,
        ),
        deleted: row.try_get("deleted").unwrap_or(false),
        authorized_tokens: row.try_get("authorized_tokens").unwrap_or_default(),
    })
}

#[async_trait]
impl Repository for PostgresRepository {
    async fn create(&self, envelope: Envelope, tokens: &[String]) -> TesseraResult<Envelope> {
        let id = envelope.id_or_generate();
        let payload = serde_json::Value::Object(envelope.payload.clone());
        let sql = format!(
            "INSERT INTO {} (id, payload, created_at, deleted, authorized_tokens) \
             VALUES ($1, $2, now(), FALSE, $3) RETURNING {COLUMNS}",
            self.table
        );

        for attempt in 0.. {
            match sqlx::query(&sql)
                .bind(&id)
                .bind(&payload)
                .bind(tokens)
                .fetch_one(&self.pool)
                .await
            {
                Ok(row) => return row_to_envelope(&row),
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
            "SELECT {COLUMNS} FROM {} WHERE id = $1 AND deleted IS FALSE AND created_at <= $2",
            self.table
        );
        if !tokens.is_empty() {
            sql.push_str(&format!(" AND {}", token_clause(3)));
        }
        sql.push_str(" ORDER BY created_at DESC, seq DESC LIMIT 1");

        let mut query = sqlx::query(&sql).bind(id).bind(at);
        if !tokens.is_empty() {
            query = query.bind(tokens);
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
        let mut sql = format!(
            "SELECT DISTINCT ON (id) {COLUMNS} FROM {} \
             WHERE id = ANY($1) AND deleted IS FALSE AND created_at <= $2",
            self.table
        );
        if !tokens.is_empty() {
            sql.push_str(&format!(" AND {}", token_clause(3)));
        }
        sql.push_str(" ORDER BY id, created_at DESC, seq DESC");

        let mut query = sqlx::query(&sql).bind(ids).bind(Utc::now());
        if !tokens.is_empty() {
            query = query.bind(tokens);
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
        let mut auth_sql = format!("SELECT 1 FROM {} WHERE id = $1", self.table);
        if !tokens.is_empty() {
            auth_sql.push_str(&format!(" AND {}", token_clause(2)));
        }
        auth_sql.push_str(" LIMIT 1");

        let mut query = sqlx::query(&auth_sql).bind(id);
        if !tokens.is_empty() {
            query = query.bind(tokens);
        }
        let authorized = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TesseraError::store_with_source("Tombstone failed", e))?
            .is_some();
        if !authorized {
            return Ok(false);
        }

        let sql = format!("UPDATE {} SET deleted = TRUE WHERE id = $1", self.table);
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
        let mut sql = format!(
            "SELECT DISTINCT ON (id) {COLUMNS} FROM {} \
             WHERE deleted IS FALSE AND created_at <= $1",
            self.table
        );
        if !tokens.is_empty() {
            sql.push_str(&format!(" AND {}", token_clause(2)));
        }
        sql.push_str(" ORDER BY id, created_at DESC, seq DESC");

        let mut query = sqlx::query(&sql).bind(Utc::now());
        if !tokens.is_empty() {
            query = query.bind(tokens);
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

/// PostgreSQL-backed envelope searcher. Templates render to a WHERE
/// fragment; the temporal bound is driver-bound, never spliced.
pub struct PostgresSearcher {
    pool: PgPool,
    table: String,
    authorizer: Arc<dyn Auth>,
}

impl PostgresSearcher {
    /// Create a searcher over an existing pool.
    pub fn new(pool: PgPool, table: impl Into<String>, authorizer: Arc<dyn Auth>) -> Self {
        Self {
            pool,
            table: table.into(),
            authorizer,
        }
    }

    /// Render the configured fragment with `_name` and `_created_at`
    /// available as built-in arguments.
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
impl Searcher for PostgresSearcher {
    async fn find(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        creds: &[String],
        at: DateTime<Utc>,
    ) -> TesseraResult<Payload> {
        let fragment = self.render_fragment(template, args, at)?;
        let sql = format!(
            "SELECT {COLUMNS} FROM {} WHERE ({fragment}) AND deleted IS FALSE \
             AND created_at <= $1 ORDER BY created_at DESC, seq DESC LIMIT 1",
            self.table
        );

        let row = match sqlx::query(&sql).bind(at).fetch_optional(&self.pool).await {
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
        let sql = format!(
            "SELECT DISTINCT ON (id) {COLUMNS} FROM {} WHERE ({fragment}) \
             AND deleted IS FALSE AND created_at <= $1 ORDER BY id, created_at DESC, seq DESC",
            self.table
        );

        let rows = match sqlx::query(&sql).bind(at).fetch_all(&self.pool).await {
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

    #[test]
    fn token_clause_allows_world_readable_rows() {
        let clause = token_clause(3);
        assert!(clause.contains("cardinality(authorized_tokens) = 0"));
        assert!(clause.contains("&& $3"));
    }
}
