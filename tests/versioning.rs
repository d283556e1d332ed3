//! Versioned entities: immutable rows, releases and to-many links.

#[macro_use]
mod common;

use common::{id_of, obj};
use entity_store::{AppError, ErrorKind};
use serde_json::json;

#[tokio::test]
async fn release_stores_the_next_version() {
    let store = store_or_skip!("release_stores_the_next_version");
    let state = &store.state;
    let sample = state.service("Sample").unwrap();

    let created = sample
        .create(
            state,
            &json!({"name": "s", "size": 1, "tags": [{"name": "t"}], "notes": [{"body": "n"}]}),
            None,
            None,
        )
        .await
        .unwrap();
    assert_eq!(created["version"], 1);
    let id = id_of(&created);
    let v1 = vec![id.clone(), "1".to_string()];
    let v2 = vec![id.clone(), "2".to_string()];

    let released = sample
        .release(state, &v1, &obj(json!({"name": "s2", "id": 999, "version": 7})), None, None)
        .await
        .unwrap();
    assert_eq!(released["id"], created["id"]);
    assert_eq!(released["version"], 2);
    assert_eq!(released["name"], "s2");
    assert_eq!(released["size"], 1);
    assert_eq!(store.count("sample").await, 2);
    assert_eq!(sample.read(state, &v1, None, None).await.unwrap()["name"], "s");

    // links are shared, children follow the latest version
    let tags = sample.read_nested(state, &v2, "tags", None, None).await.unwrap();
    assert_eq!(tags.as_array().map(Vec::len), Some(1));
    assert_eq!(store.count("asso_sample_tag").await, 2);
    let notes = sample.read_nested(state, &v2, "notes", None, None).await.unwrap();
    assert_eq!(notes.as_array().map(Vec::len), Some(1));
    assert_eq!(notes[0]["id_sample_version"], 2);
    let notes = sample.read_nested(state, &v1, "notes", None, None).await.unwrap();
    assert_eq!(notes.as_array().map(Vec::len), Some(0));

    store.cleanup().await;
}

#[tokio::test]
async fn only_the_latest_version_is_released() {
    let store = store_or_skip!("only_the_latest_version_is_released");
    let state = &store.state;
    let sample = state.service("Sample").unwrap();

    let created = sample.create(state, &json!({"name": "s"}), None, None).await.unwrap();
    let id = id_of(&created);
    let v1 = vec![id.clone(), "1".to_string()];
    sample.release(state, &v1, &obj(json!({})), None, None).await.unwrap();

    let err = sample.release(state, &v1, &obj(json!({"name": "late"})), None, None).await.unwrap_err();
    assert!(matches!(err, AppError::ReleaseVersion(_)), "{}", err);
    assert_eq!(err.kind(), ErrorKind::Structural);
    assert_eq!(store.count("sample").await, 2);

    let err = sample
        .release(state, &[id, "5".into()], &obj(json!({})), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let b = state.service("B").unwrap();
    let row = b.create(state, &json!({"name": "plain"}), None, None).await.unwrap();
    let err = b.release(state, &[id_of(&row)], &obj(json!({})), None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);

    store.cleanup().await;
}

#[tokio::test]
async fn stored_versions_refuse_changes() {
    let store = store_or_skip!("stored_versions_refuse_changes");
    let state = &store.state;
    let sample = state.service("Sample").unwrap();

    let created = sample.create(state, &json!({"name": "s", "size": 1}), None, None).await.unwrap();
    let id = id_of(&created);
    let v1 = vec![id.clone(), "1".to_string()];

    let err = sample.update(state, &v1, &obj(json!({"name": "x"})), None, None).await.unwrap_err();
    assert!(matches!(err, AppError::UpdateVersioned(_)), "{}", err);
    assert_eq!(err.kind(), ErrorKind::Input);

    let err = sample
        .create(state, &json!({"id": created["id"], "version": 1, "name": "y"}), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UpdateVersioned(_)), "{}", err);

    let err = sample
        .create_or_update(state, &v1, &obj(json!({"size": 3})), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::UpdateVersioned(_)), "{}", err);

    // a bare key refers to the stored version
    let same = sample
        .create(state, &json!({"id": created["id"], "version": 1}), None, None)
        .await
        .unwrap();
    assert_eq!(same["name"], "s");
    assert_eq!(same["size"], 1);
    assert_eq!(store.count("sample").await, 1);

    store.cleanup().await;
}
