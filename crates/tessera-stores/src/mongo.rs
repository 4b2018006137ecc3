//! MongoDB backend.
//!
//! The latest version per id is selected with an aggregation pipeline:
//! `$match` on the filter, `$sort {created_at: -1, _id: -1}`, then
//! `$group {$first: "$$ROOT"}` per id. The `_id` sort key is the tie-break
//! when two versions share an exact `created_at` (later insert wins).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::TryStreamExt;

use mongodb::{
    bson::{doc, Bson, Document},
    options::{FindOptions, IndexOptions},
    Client, Collection, IndexModel,
};

use tessera_core::{
    Auth, Envelope, Payload, QueryTemplate, Repository, Searcher, TesseraError, TesseraResult,
};

const CREATE_RETRIES: usize = 5;

/// MongoDB-backed envelope repository.
pub struct MongoRepository {
    collection: Collection<Document>,
}

impl MongoRepository {
    /// Create a repository over an existing collection handle.
    pub fn new(client: &Client, database: &str, collection: &str) -> Self {
        Self {
            collection: client.database(database).collection(collection),
        }
    }

    /// Create the unique `(id, created_at)` index the collision retry relies
    /// on, plus the read-path indexes.
    pub async fn initialize(&self) -> TesseraResult<()> {
        let unique = IndexModel::builder()
            .keys(doc! { "id": 1, "created_at": 1 })
            .options(IndexOptions::builder().unique(true).build())
            .build();
        let by_created = IndexModel::builder().keys(doc! { "created_at": 1 }).build();

        self.collection
            .create_indexes(vec![unique, by_created], None)
            .await
            .map_err(|e| TesseraError::store_with_source("Failed to create indexes", e))?;
        Ok(())
    }

    fn latest_pipeline(match_doc: Document) -> Vec<Document> {
        vec![
            doc! { "$match": match_doc },
            doc! { "$sort": { "created_at": -1, "_id": -1 } },
            doc! { "$group": { "_id": "$id", "doc": { "$first": "$$ROOT" } } },
            doc! { "$replaceRoot": { "newRoot": "$doc" } },
        ]
    }

    async fn aggregate_latest(&self, match_doc: Document) -> TesseraResult<Vec<Envelope>> {
        let mut cursor = self
            .collection
            .aggregate(Self::latest_pipeline(match_doc), None)
            .await
            .map_err(|e| TesseraError::store_with_source("Aggregation failed", e))?;

        let mut envelopes = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| TesseraError::store_with_source("Cursor error", e))?
        {
            envelopes.push(document_to_envelope(&document)?);
        }
        Ok(envelopes)
    }
}

/// Base filter for visible rows at `at`, with the credential clause appended
/// when the caller supplied tokens.
fn visibility_filter(tokens: &[String], at: DateTime<Utc>) -> Document {
    let mut filter = doc! {
        "deleted": false,
        "created_at": { "$lte": Bson::DateTime(at.into()) },
    };
    if !tokens.is_empty() {
        filter.insert(
            "$or",
            vec![
                doc! { "authorized_tokens": { "$size": 0 } },
                doc! { "authorized_tokens": { "$in": tokens } },
            ],
        );
    }
    filter
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    err.to_string().contains("E11000")
}

#[async_trait]
impl Repository for MongoRepository {
    async fn create(&self, envelope: Envelope, tokens: &[String]) -> TesseraResult<Envelope> {
        let id = envelope.id_or_generate();

        for attempt in 0.. {
            let mut stored = envelope.clone();
            stored.id = Some(id.clone());
            // BSON datetime granularity, so reads hand back the same instant.
            stored.created_at = Some(Utc::now().trunc_subsecs(3));
            stored.deleted = false;
            stored.authorized_tokens = tokens.to_vec();

            let document = envelope_to_document(&stored)?;
            match self.collection.insert_one(document, None).await {
                Ok(_) => return Ok(stored),
                // Timestamp-granularity clash on (id, created_at): wait out
                // the millisecond and restamp.
                Err(e) if is_duplicate_key(&e) && attempt < CREATE_RETRIES => {
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
        let mut filter = visibility_filter(tokens, at.unwrap_or_else(Utc::now));
        filter.insert("id", id);

        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1, "_id": -1 })
            .limit(1)
            .build();

        let mut cursor = match self.collection.find(filter, options).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(error = %e, id, "read degraded to absent");
                return Ok(None);
            }
        };

        match cursor.try_next().await {
            Ok(Some(document)) => Ok(Some(document_to_envelope(&document)?)),
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!(error = %e, id, "read degraded to absent");
                Ok(None)
            }
        }
    }

    async fn read_many(&self, ids: &[String], tokens: &[String]) -> TesseraResult<Vec<Envelope>> {
        let mut filter = visibility_filter(tokens, Utc::now());
        filter.insert("id", doc! { "$in": ids });

        match self.aggregate_latest(filter).await {
            Ok(envelopes) => Ok(envelopes),
            Err(e) => {
                tracing::warn!(error = %e, "read_many degraded to empty");
                Ok(Vec::new())
            }
        }
    }

    async fn remove(&self, id: &str, tokens: &[String]) -> TesseraResult<bool> {
        // Authorize against any version of the chain, then tombstone the
        // whole chain so no version stays visible under other credentials.
        // The outcome reports authorization, never modified counts, so
        // repeating a remove stays true.
        let mut auth_filter = doc! { "id": id };
        if !tokens.is_empty() {
            auth_filter.insert(
                "$or",
                vec![
                    doc! { "authorized_tokens": { "$size": 0 } },
                    doc! { "authorized_tokens": { "$in": tokens } },
                ],
            );
        }
        let authorized = self
            .collection
            .find_one(auth_filter, None)
            .await
            .map_err(|e| TesseraError::store_with_source("Tombstone failed", e))?
            .is_some();
        if !authorized {
            return Ok(false);
        }

        self.collection
            .update_many(doc! { "id": id }, doc! { "$set": { "deleted": true } }, None)
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
        match self.aggregate_latest(visibility_filter(tokens, Utc::now())).await {
            Ok(envelopes) => Ok(envelopes),
            Err(e) => {
                tracing::warn!(error = %e, "list degraded to empty");
                Ok(Vec::new())
            }
        }
    }

    async fn ready(&self) -> bool {
        self.collection
            .count_documents(doc! {}, None)
            .await
            .is_ok()
    }
}

/// MongoDB-backed envelope searcher. Templates render to a JSON filter
/// document merged into the implicit visibility filter.
pub struct MongoSearcher {
    client: Client,
    collection: Collection<Document>,
    authorizer: Arc<dyn Auth>,
}

impl MongoSearcher {
    /// Create a searcher over an existing collection handle.
    pub fn new(client: &Client, database: &str, collection: &str, authorizer: Arc<dyn Auth>) -> Self {
        Self {
            client: client.clone(),
            collection: client.database(database).collection(collection),
            authorizer,
        }
    }

    fn build_query(
        template: &QueryTemplate,
        args: &Payload,
        at: DateTime<Utc>,
    ) -> TesseraResult<Document> {
        let rendered = template.render(args)?;
        let filter: serde_json::Value = serde_json::from_str(&rendered).map_err(|e| {
            TesseraError::template(format!("template did not render to JSON: {rendered}: {e}"))
        })?;
        let mut query = match json_to_bson(filter) {
            Bson::Document(document) => document,
            other => {
                return Err(TesseraError::template(format!(
                    "filter must be a JSON object, got: {other}"
                )))
            }
        };
        query.insert("deleted", false);
        query.insert("created_at", doc! { "$lte": Bson::DateTime(at.into()) });
        Ok(query)
    }
}

#[async_trait]
impl Searcher for MongoSearcher {
    async fn find(
        &self,
        template: &QueryTemplate,
        args: &Payload,
        creds: &[String],
        at: DateTime<Utc>,
    ) -> TesseraResult<Payload> {
        let query = Self::build_query(template, args, at)?;

        let options = FindOptions::builder()
            .sort(doc! { "created_at": -1, "_id": -1 })
            .limit(1)
            .build();

        let document = match self.collection.find(query, options).await {
            Ok(mut cursor) => match cursor.try_next().await {
                Ok(document) => document,
                Err(e) => {
                    tracing::warn!(error = %e, "find degraded to empty");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "find degraded to empty");
                None
            }
        };

        if let Some(document) = document {
            let envelope = document_to_envelope(&document)?;
            if self.authorizer.is_authorized(creds, &envelope).await {
                return Ok(envelope.payload_with_id());
            }
            tracing::trace!("not authorized");
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
        let query = Self::build_query(template, args, at)?;

        let pipeline = vec![
            doc! { "$match": query },
            doc! { "$sort": { "created_at": -1, "_id": -1 } },
            doc! { "$group": { "_id": "$id", "doc": { "$first": "$$ROOT" } } },
            doc! { "$replaceRoot": { "newRoot": "$doc" } },
        ];

        let mut cursor = match self.collection.aggregate(pipeline, None).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::warn!(error = %e, "find_all degraded to empty");
                return Ok(Vec::new());
            }
        };

        let mut payloads = Vec::new();
        loop {
            match cursor.try_next().await {
                Ok(Some(document)) => {
                    let envelope = document_to_envelope(&document)?;
                    if self.authorizer.is_authorized(creds, &envelope).await {
                        payloads.push(envelope.payload_with_id());
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "find_all degraded to empty");
                    return Ok(Vec::new());
                }
            }
        }
        Ok(payloads)
    }

    async fn ready(&self) -> bool {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .is_ok()
    }
}

fn envelope_to_document(envelope: &Envelope) -> TesseraResult<Document> {
    let payload = match json_to_bson(serde_json::Value::Object(envelope.payload.clone())) {
        Bson::Document(document) => document,
        _ => unreachable!("object maps to document"),
    };
    let created_at = envelope
        .created_at
        .ok_or_else(|| TesseraError::Internal("envelope missing created_at".to_string()))?;

    Ok(doc! {
        "id": envelope.id.clone().unwrap_or_default(),
        "payload": payload,
        "created_at": Bson::DateTime(created_at.into()),
        "deleted": envelope.deleted,
        "authorized_tokens": envelope.authorized_tokens.clone(),
    })
}

fn document_to_envelope(document: &Document) -> TesseraResult<Envelope> {
    let id = document
        .get_str("id")
        .map_err(|_| TesseraError::store("document missing id"))?
        .to_string();
    let payload = match document.get_document("payload") {
        Ok(payload) => match bson_to_json(Bson::Document(payload.clone())) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!("document maps to object"),
        },
        Err(_) => Payload::new(),
    };
    let created_at = document
        .get_datetime("created_at")
        .map(|dt| dt.to_chrono())
        .ok();
    let authorized_tokens = document
        .get_array("authorized_tokens")
        .map(|tokens| {
            tokens
                .iter()
                .filter_map(|t| t.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    Ok(Envelope {
        id: Some(id),
        payload,
        created_at,
        deleted: document.get_bool("deleted").unwrap_or(false),
        authorized_tokens,
    })
}

fn json_to_bson(value: serde_json::Value) -> Bson {
    match value {
        serde_json::Value::Null => Bson::Null,
        serde_json::Value::Bool(b) => Bson::Boolean(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else if let Some(f) = n.as_f64() {
                Bson::Double(f)
            } else {
                Bson::Null
            }
        }
        serde_json::Value::String(s) => Bson::String(s),
        serde_json::Value::Array(arr) => Bson::Array(arr.into_iter().map(json_to_bson).collect()),
        serde_json::Value::Object(obj) => {
            let document: Document = obj.into_iter().map(|(k, v)| (k, json_to_bson(v))).collect();
            Bson::Document(document)
        }
    }
}

fn bson_to_json(value: Bson) -> serde_json::Value {
    match value {
        Bson::Null => serde_json::Value::Null,
        Bson::Boolean(b) => serde_json::Value::Bool(b),
        Bson::Int32(i) => serde_json::Value::Number(i.into()),
        Bson::Int64(i) => serde_json::Value::Number(i.into()),
        Bson::Double(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Bson::String(s) => serde_json::Value::String(s),
        Bson::Array(arr) => serde_json::Value::Array(arr.into_iter().map(bson_to_json).collect()),
        Bson::Document(document) => serde_json::Value::Object(
            document
                .into_iter()
                .map(|(k, v)| (k, bson_to_json(v)))
                .collect(),
        ),
        other => serde_json::Value::String(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn visibility_filter_without_tokens_has_no_credential_clause() {
        let filter = visibility_filter(&[], Utc::now());
        assert!(filter.get("$or").is_none());
        assert_eq!(filter.get_bool("deleted").unwrap(), false);
    }

    #[test]
    fn visibility_filter_with_tokens_allows_world_readable() {
        let filter = visibility_filter(&["alpha".to_string()], Utc::now());
        let clauses = filter.get_array("$or").unwrap();
        assert_eq!(clauses.len(), 2);
    }

    #[test]
    fn envelope_document_round_trip() {
        let mut envelope = Envelope::with_id("x", json!({"name": "red", "count": 3}));
        envelope.created_at = Some(Utc::now());
        envelope.authorized_tokens = vec!["alpha".to_string()];

        let document = envelope_to_document(&envelope).unwrap();
        let back = document_to_envelope(&document).unwrap();

        assert_eq!(back.id.as_deref(), Some("x"));
        assert_eq!(back.payload["name"], json!("red"));
        assert_eq!(back.payload["count"], json!(3));
        assert_eq!(back.authorized_tokens, vec!["alpha".to_string()]);
        assert!(!back.deleted);
    }

    #[test]
    fn searcher_query_adds_implicit_bounds() {
        let template = QueryTemplate::compile(r#"{"farm": "{{farm}}"}"#).unwrap();
        let args = json!({"farm": "f1"}).as_object().unwrap().clone();
        let query = MongoSearcher::build_query(&template, &args, Utc::now()).unwrap();

        assert_eq!(query.get_str("farm").unwrap(), "f1");
        assert_eq!(query.get_bool("deleted").unwrap(), false);
        assert!(query.get_document("created_at").unwrap().contains_key("$lte"));
    }

    #[test]
    fn searcher_rejects_non_object_filter() {
        let template = QueryTemplate::compile(r#"["not", "a", "filter"]"#).unwrap();
        let err = MongoSearcher::build_query(&template, &Payload::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, TesseraError::MalformedTemplate(_)));
    }
}
