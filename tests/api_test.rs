mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use common::{engine, fast_config, ScriptedStore};
use lot_sniper::api::{router, ScheduleReply};
use lot_sniper::purchase::PurchaseEngine;

async fn start_api() -> (SocketAddr, Arc<PurchaseEngine>, Arc<ScriptedStore>) {
    let store = Arc::new(ScriptedStore::new());
    let engine = engine(store.clone(), fast_config());
    let app = router(Arc::clone(&engine));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, engine, store)
}

#[tokio::test]
async fn test_schedule_then_poll_status() {
    let (addr, _engine, store) = start_api().await;
    let http = reqwest::Client::new();
    let fire_at = (Utc::now() + chrono::Duration::milliseconds(200)).to_rfc3339();

    let resp = http
        .post(format!("http://{}/schedule-purchases", addr))
        .json(&json!({ "lots": [101, "102"], "purchase_time": fire_at }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let reply: ScheduleReply = resp.json().await.unwrap();
    assert_eq!(reply.status, "success");

    let url = format!("http://{}/purchase-status/{}", addr, reply.request_id);
    let status = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let v: Value = http.get(&url).send().await.unwrap().json().await.unwrap();
            if v["state"] == "completed" {
                return v;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("batch did not complete");

    assert_eq!(status["kind"], "batch");
    assert_eq!(status["counts"]["succeeded"], 2);
    assert_eq!(status["attempts"].as_array().unwrap().len(), 2);
    assert_eq!(store.calls("101"), 1);
    assert_eq!(store.calls("102"), 1);
}

#[tokio::test]
async fn test_bad_submissions_are_400() {
    let (addr, _engine, _store) = start_api().await;
    let http = reqwest::Client::new();
    let url = format!("http://{}/schedule-purchases", addr);

    for body in [
        json!({ "items": [], "fire_at": "2030-01-01T00:00:00Z" }),
        json!({ "items": ["1"], "fire_at": "whenever" }),
        json!({ "items": ["1"] }),
    ] {
        let resp = http.post(&url).json(&body).send().await.unwrap();
        assert_eq!(resp.status(), 400, "{}", body);
    }
}

#[tokio::test]
async fn test_unknown_id_is_404() {
    let (addr, _engine, _store) = start_api().await;
    let resp = reqwest::get(format!("http://{}/purchase-status/unknown-id", addr))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let v: Value = resp.json().await.unwrap();
    assert_eq!(v["status"], "not_found");
}

#[tokio::test]
async fn test_delete_cancels_pending_batch() {
    let (addr, engine, store) = start_api().await;
    let http = reqwest::Client::new();

    let reply: ScheduleReply = http
        .post(format!("http://{}/schedule-purchases", addr))
        .json(&json!({ "items": ["9"], "fire_at": "2099-01-01T00:00:00Z" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let url = format!("http://{}/purchase-status/{}", addr, reply.request_id);
    assert_eq!(http.delete(&url).send().await.unwrap().status(), 200);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let v: Value = http.get(&url).send().await.unwrap().json().await.unwrap();
    assert_eq!(v["state"], "completed");
    assert_eq!(v["counts"]["cancelled"], 1);
    assert_eq!(store.total_calls(), 0);
    engine.shutdown();
}

#[tokio::test]
async fn test_health_and_stats() {
    let (addr, _engine, _store) = start_api().await;
    let body = reqwest::get(format!("http://{}/health", addr)).await.unwrap().text().await.unwrap();
    assert_eq!(body, "ok");

    let resp = reqwest::get(format!("http://{}/stats", addr)).await.unwrap();
    assert_eq!(resp.status(), 200);
}
