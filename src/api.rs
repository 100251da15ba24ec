//! HTTP surface over the purchase engine.
//!
//!   POST   /schedule-purchases      submit a batch, 202 + request id
//!   GET    /purchase-status/:id     batch or attempt status
//!   DELETE /purchase-status/:id     cancel a batch
//!   GET    /stats                   engine counters
//!   GET    /health

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::EngineError;
use crate::purchase::stats::StatsSnapshot;
use crate::purchase::types::{BatchId, ItemRef, StatusRecord};
use crate::purchase::PurchaseEngine;

// ─────────────────────────────────────────────────────────
// Request / response bodies
// ─────────────────────────────────────────────────────────

/// Lot numbers arrive as either JSON numbers or strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ItemInput {
    Number(u64),
    Text(String),
}

impl From<ItemInput> for ItemRef {
    fn from(v: ItemInput) -> Self {
        match v {
            ItemInput::Number(n) => ItemRef::from(n),
            ItemInput::Text(s) => ItemRef(s.trim().to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ScheduleBody {
    #[serde(alias = "lots")]
    pub items: Vec<ItemInput>,
    #[serde(alias = "purchase_time")]
    pub fire_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScheduleReply {
    pub status: String,
    pub request_id: String,
    pub message: String,
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, status) = match &self.0 {
            EngineError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid"),
            EngineError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "error"),
        };
        let body = json!({ "status": status, "message": self.0.to_string() });
        (code, Json(body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────

pub fn router(engine: Arc<PurchaseEngine>) -> Router {
    Router::new()
        .route("/schedule-purchases", post(schedule_purchases))
        .route("/purchase-status/:id", get(purchase_status).delete(cancel_purchase))
        .route("/stats", get(stats))
        .route("/health", get(|| async { "ok" }))
        .with_state(engine)
}

/// Serve the API on `addr` until `shutdown` fires.
pub async fn serve(engine: Arc<PurchaseEngine>, addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;
    info!("🌐 API listening on {}", listener.local_addr().unwrap_or(addr));
    axum::serve(listener, router(engine))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("api server")
}

async fn schedule_purchases(
    State(engine): State<Arc<PurchaseEngine>>,
    body: Result<Json<ScheduleBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ScheduleReply>), ApiError> {
    let Json(body) = body.map_err(|e| EngineError::Validation(e.body_text()))?;
    let items: Vec<ItemRef> = body.items.into_iter().map(ItemRef::from).collect();
    let count = items.len();
    let id = engine.submit(items, &body.fire_at).map_err(|e| {
        warn!("rejected submission: {}", e);
        ApiError::from(e)
    })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(ScheduleReply {
            status: "success".into(),
            request_id: id.to_string(),
            message: format!("{} purchase(s) scheduled for {}", count, body.fire_at.trim()),
        }),
    ))
}

async fn purchase_status(
    State(engine): State<Arc<PurchaseEngine>>,
    Path(id): Path<String>,
) -> Result<Json<StatusRecord>, ApiError> {
    Ok(Json(engine.lookup(&id)?))
}

async fn cancel_purchase(
    State(engine): State<Arc<PurchaseEngine>>,
    Path(id): Path<String>,
) -> Result<Json<StatusRecord>, ApiError> {
    let id: BatchId = id.parse()?;
    Ok(Json(StatusRecord::Batch(engine.cancel(id)?)))
}

async fn stats(State(engine): State<Arc<PurchaseEngine>>) -> Json<StatsSnapshot> {
    Json(engine.stats())
}
