//! Behavioral suite exercised through the factory.
//!
//! Runs against the in-memory backend, which defines the reference
//! semantics every other backend mirrors: append-only version chains,
//! timestamp-scoped reads, whole-chain tombstones, and token-scoped
//! visibility.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use tessera_stores::{
    Backend, Envelope, NoopAuth, Payload, QueryTemplate, StorageConfig, StoreFactory,
};

async fn backend() -> Backend {
    StoreFactory::new()
        .create(&StorageConfig::memory("farms"), Arc::new(NoopAuth))
        .await
        .expect("memory backend")
}

fn args(value: serde_json::Value) -> Payload {
    value.as_object().expect("object").clone()
}

#[tokio::test]
async fn update_then_read_sees_latest_version() {
    let backend = backend().await;
    let v1 = backend
        .repository
        .create(Envelope::new(json!({"name": "red"})), &[])
        .await
        .unwrap();
    let id = v1.id.clone().unwrap();

    backend
        .repository
        .create(Envelope::with_id(&id, json!({"name": "purple"})), &[])
        .await
        .unwrap();

    let read = backend.repository.read(&id, &[], None).await.unwrap().unwrap();
    assert_eq!(read.payload["name"], json!("purple"));
}

#[tokio::test]
async fn read_at_old_instant_sees_old_version() {
    let backend = backend().await;
    let v1 = backend
        .repository
        .create(Envelope::new(json!({"name": "red"})), &[])
        .await
        .unwrap();
    let id = v1.id.clone().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    backend
        .repository
        .create(Envelope::with_id(&id, json!({"name": "purple"})), &[])
        .await
        .unwrap();

    let then = backend
        .repository
        .read(&id, &[], v1.created_at)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(then.payload["name"], json!("red"));
}

#[tokio::test]
async fn list_returns_one_entry_per_logical_id() {
    let backend = backend().await;
    let v1 = backend
        .repository
        .create(Envelope::new(json!({"name": "red"})), &[])
        .await
        .unwrap();
    let id = v1.id.clone().unwrap();
    backend
        .repository
        .create(Envelope::with_id(&id, json!({"name": "purple"})), &[])
        .await
        .unwrap();
    backend
        .repository
        .create(Envelope::new(json!({"name": "green"})), &[])
        .await
        .unwrap();

    let all = backend.repository.list(&[]).await.unwrap();
    assert_eq!(all.len(), 2);
    let latest = all
        .iter()
        .find(|e| e.id.as_deref() == Some(id.as_str()))
        .unwrap();
    assert_eq!(latest.payload["name"], json!("purple"));
}

#[tokio::test]
async fn remove_hides_every_version_at_every_instant() {
    let backend = backend().await;
    let v1 = backend
        .repository
        .create(Envelope::new(json!({"name": "red"})), &[])
        .await
        .unwrap();
    let id = v1.id.clone().unwrap();
    backend
        .repository
        .create(Envelope::with_id(&id, json!({"name": "purple"})), &[])
        .await
        .unwrap();

    assert!(backend.repository.remove(&id, &[]).await.unwrap());
    assert!(backend.repository.read(&id, &[], None).await.unwrap().is_none());
    assert!(backend
        .repository
        .read(&id, &[], v1.created_at)
        .await
        .unwrap()
        .is_none());
    assert!(backend.repository.list(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn bulk_operations_round_trip() {
    let backend = backend().await;
    let created = backend
        .repository
        .create_many(
            vec![
                Envelope::new(json!({"name": "a"})),
                Envelope::new(json!({"name": "b"})),
                Envelope::new(json!({"name": "c"})),
            ],
            &[],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 3);

    let ids: Vec<String> = created.iter().filter_map(|e| e.id.clone()).collect();
    let read = backend.repository.read_many(&ids, &[]).await.unwrap();
    assert_eq!(read.len(), 3);

    let outcome = backend
        .repository
        .remove_many(&ids[..2], &[])
        .await
        .unwrap();
    assert!(outcome.values().all(|&removed| removed));
    assert_eq!(backend.repository.list(&[]).await.unwrap().len(), 1);
}

#[tokio::test]
async fn token_scoping_hides_without_revealing_existence() {
    let backend = backend().await;
    let secret = backend
        .repository
        .create(Envelope::new(json!({"name": "vault"})), &["alpha".to_string()])
        .await
        .unwrap();
    let id = secret.id.clone().unwrap();

    // Disjoint credentials: absent, exactly like a missing id.
    assert!(backend
        .repository
        .read(&id, &["beta".to_string()], None)
        .await
        .unwrap()
        .is_none());
    assert!(backend
        .repository
        .read("no-such-id", &["beta".to_string()], None)
        .await
        .unwrap()
        .is_none());

    // Overlapping credentials see it.
    assert!(backend
        .repository
        .read(&id, &["alpha".to_string(), "beta".to_string()], None)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn world_readable_envelopes_pass_any_credentials() {
    let backend = backend().await;
    let open = backend
        .repository
        .create(Envelope::new(json!({"name": "public"})), &[])
        .await
        .unwrap();

    let read = backend
        .repository
        .read(open.id.as_deref().unwrap(), &["whoever".to_string()], None)
        .await
        .unwrap();
    assert!(read.is_some());
}

#[tokio::test]
async fn find_and_find_all_scope_to_instant() {
    let backend = backend().await;
    let v1 = backend
        .repository
        .create(Envelope::new(json!({"farm": "f1", "name": "red"})), &[])
        .await
        .unwrap();
    let id = v1.id.clone().unwrap();
    let before_update = Utc::now();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    backend
        .repository
        .create(
            Envelope::with_id(&id, json!({"farm": "f1", "name": "purple"})),
            &[],
        )
        .await
        .unwrap();

    let template = QueryTemplate::compile(r#"{"farm": "{{farm}}"}"#).unwrap();
    let query_args = args(json!({"farm": "f1"}));

    let now = backend
        .searcher
        .find(&template, &query_args, &[], Utc::now())
        .await
        .unwrap();
    assert_eq!(now["name"], json!("purple"));

    let then = backend
        .searcher
        .find(&template, &query_args, &[], before_update)
        .await
        .unwrap();
    assert_eq!(then["name"], json!("red"));

    let all = backend
        .searcher
        .find_all(&template, &query_args, &[], Utc::now())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn remove_needs_any_version_not_every_version() {
    let backend = backend().await;
    let v1 = backend
        .repository
        .create(Envelope::new(json!({"v": 1})), &["alpha".to_string()])
        .await
        .unwrap();
    let id = v1.id.clone().unwrap();
    backend
        .repository
        .create(Envelope::with_id(&id, json!({"v": 2})), &["beta".to_string()])
        .await
        .unwrap();

    // Disjoint credentials cannot tombstone.
    assert!(!backend
        .repository
        .remove(&id, &["gamma".to_string()])
        .await
        .unwrap());

    // A credential matching any version tombstones the whole chain, so the
    // other token's version disappears too.
    assert!(backend
        .repository
        .remove(&id, &["alpha".to_string()])
        .await
        .unwrap());
    assert!(backend
        .repository
        .read(&id, &["beta".to_string()], None)
        .await
        .unwrap()
        .is_none());

    // Repeating the remove stays true while the chain exists.
    assert!(backend
        .repository
        .remove(&id, &["alpha".to_string()])
        .await
        .unwrap());
}

#[tokio::test]
async fn search_matches_superseded_versions() {
    let backend = backend().await;
    let v1 = backend
        .repository
        .create(Envelope::new(json!({"flag": "old"})), &[])
        .await
        .unwrap();
    let id = v1.id.clone().unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    backend
        .repository
        .create(Envelope::with_id(&id, json!({"flag": "new"})), &[])
        .await
        .unwrap();

    let template = QueryTemplate::compile(r#"{"flag": "{{flag}}"}"#).unwrap();

    // The filter runs over every visible version before grouping, so the
    // superseded version is still found by its own field values.
    let old = backend
        .searcher
        .find_all(&template, &args(json!({"flag": "old"})), &[], Utc::now())
        .await
        .unwrap();
    assert_eq!(old.len(), 1);
    assert_eq!(old[0]["flag"], json!("old"));

    let new = backend
        .searcher
        .find_all(&template, &args(json!({"flag": "new"})), &[], Utc::now())
        .await
        .unwrap();
    assert_eq!(new.len(), 1);
    assert_eq!(new[0]["flag"], json!("new"));
}

#[tokio::test]
async fn find_miss_is_empty_payload() {
    let backend = backend().await;
    let template = QueryTemplate::compile(r#"{"farm": "{{farm}}"}"#).unwrap();
    let found = backend
        .searcher
        .find(&template, &args(json!({"farm": "nowhere"})), &[], Utc::now())
        .await
        .unwrap();
    assert!(found.is_empty());
}
