//! Filter queries compiled and run against PostgreSQL.

#[macro_use]
mod common;

use common::{params, TestStore};
use entity_store::ErrorKind;
use serde_json::json;

async fn seed(store: &TestStore) {
    let state = &store.state;
    let a = state.service("A").unwrap();
    a.create(
        state,
        &json!([
            {"x": 1, "y": 10, "bs": [{"name": "bip"}, {"name": "zip"}]},
            {"x": 2, "y": 20, "bs": [{"name": "bap"}]},
            {"x": 3, "y": 30, "bs": [{"name": "bip"}, {"name": "bop"}]},
            {"x": 4, "y": 40}
        ]),
        None,
        None,
    )
    .await
    .unwrap();
}

fn xs(rows: &[serde_json::Map<String, serde_json::Value>]) -> Vec<i64> {
    rows.iter().filter_map(|r| r["x"].as_i64()).collect()
}

#[tokio::test]
async fn any_of_and_comparisons() {
    let store = store_or_skip!("any_of_and_comparisons");
    seed(&store).await;
    let state = &store.state;
    let b = state.service("B").unwrap();
    let a = state.service("A").unwrap();

    let rows = b.filter(state, &params(&[("name", "bip,bap")]), None, None).await.unwrap();
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r["name"] == "bip" || r["name"] == "bap"));

    let rows = a.filter(state, &params(&[("x.gt(2)", "")]), None, None).await.unwrap();
    assert_eq!(xs(&rows), vec![3, 4]);
    let rows = a
        .filter(state, &params(&[("x.ge(2)", ""), ("y.lt(40)", "")]), None, None)
        .await
        .unwrap();
    assert_eq!(xs(&rows), vec![2, 3]);

    let rows = a.filter(state, &params(&[("x.max()", "")]), None, None).await.unwrap();
    assert_eq!(xs(&rows), vec![4]);

    store.cleanup().await;
}

#[tokio::test]
async fn wildcards_match_text_only() {
    let store = store_or_skip!("wildcards_match_text_only");
    seed(&store).await;
    let state = &store.state;
    let b = state.service("B").unwrap();

    let rows = b.filter(state, &params(&[("name", "b*p")]), None, None).await.unwrap();
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r["name"] != "zip"));

    // a lone wildcard is no condition at all
    assert_eq!(b.count(state, &params(&[("name", "*")]), None, None).await.unwrap(), 5);

    let a = state.service("A").unwrap();
    let err = a.filter(state, &params(&[("x", "1*")]), None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    let err = a.filter(state, &params(&[("x", "abc")]), None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);

    store.cleanup().await;
}

#[tokio::test]
async fn dotted_paths_follow_relationships() {
    let store = store_or_skip!("dotted_paths_follow_relationships");
    seed(&store).await;
    let state = &store.state;
    let a = state.service("A").unwrap();

    let rows = a.filter(state, &params(&[("bs.name", "bip")]), None, None).await.unwrap();
    assert_eq!(xs(&rows), vec![1, 3]);

    // two matching children, one root row
    let rows = a.filter(state, &params(&[("bs.name", "bip,bop")]), None, None).await.unwrap();
    assert_eq!(xs(&rows), vec![1, 3]);
    assert_eq!(a.count(state, &params(&[("bs.name", "bip,bop")]), None, None).await.unwrap(), 2);

    let err = a.filter(state, &params(&[("bs.nope", "1")]), None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);
    let err = a.filter(state, &params(&[("zz.name", "1")]), None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);

    store.cleanup().await;
}

#[tokio::test]
async fn paging_and_count() {
    let store = store_or_skip!("paging_and_count");
    seed(&store).await;
    let state = &store.state;
    let a = state.service("A").unwrap();

    let rows = a.filter(state, &params(&[("start", "1"), ("end", "2")]), None, None).await.unwrap();
    assert_eq!(xs(&rows), vec![2, 3]);
    assert_eq!(a.count(state, &params(&[("start", "1"), ("end", "2")]), None, None).await.unwrap(), 4);
    assert_eq!(a.count(state, &params(&[("x.le(2)", "")]), None, None).await.unwrap(), 2);

    let err = a.filter(state, &params(&[("start", "-1")]), None, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Input);

    store.cleanup().await;
}
