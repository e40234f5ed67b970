//! Public HTTP surface
//!
//! Read-only endpoints for third-party verification of ledger records and
//! certificates.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::get,
    Router,
};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::anchor::{AnchorService, AnchorStore};
use crate::certificates::CertificateIssuer;
use crate::error::LedgerError;
use crate::ledger::{EntityType, RecordLedger};
use crate::verification::VerificationEngine;

#[derive(Clone)]
pub struct AppState {
    pub ledger: RecordLedger,
    pub anchors: AnchorStore,
    pub anchor_service: Arc<AnchorService>,
    pub verifier: VerificationEngine,
    pub certificates: CertificateIssuer,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/verify/:hash", get(verify_hash))
        .route("/verify/:hash/details", get(verification_details))
        .route("/records/:entity_type/:entity_id", get(entity_records))
        .route("/certificates/:hash", get(certificate_by_hash))
        .route("/ledger/stats", get(ledger_stats))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(state)
}

fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
        LedgerError::ValidationError(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(context: &str, err: LedgerError) -> StatusCode {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("{}: {}", context, err);
    }
    status
}

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let chains = state.anchor_service.health().await;
    let status = if chains.iter().all(|c| c.healthy) {
        "healthy"
    } else {
        "degraded"
    };

    Json(json!({
        "status": status,
        "service": "transparency-ledger",
        "timestamp": chrono::Utc::now(),
        "chains": chains,
    }))
}

pub async fn verify_hash(
    Path(hash): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, StatusCode> {
    let result = state
        .verifier
        .verify(&hash)
        .await
        .map_err(|e| failure("Failed to verify record", e))?;

    Ok(Json(json!({
        "status": "success",
        "data": result,
    })))
}

pub async fn verification_details(
    Path(hash): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, StatusCode> {
    let details = state
        .verifier
        .get_verification_details(&hash)
        .await
        .map_err(|e| failure("Failed to load verification details", e))?;

    Ok(Json(json!({
        "status": "success",
        "data": details,
    })))
}

pub async fn entity_records(
    Path((entity_type, entity_id)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<Json<Value>, StatusCode> {
    let entity_type: EntityType = entity_type
        .parse()
        .map_err(|e| failure("Invalid entity type", e))?;

    let records = state
        .ledger
        .get_for_entity(entity_type, &entity_id)
        .await
        .map_err(|e| failure("Failed to list records", e))?;

    Ok(Json(json!({
        "status": "success",
        "data": {
            "entity_type": entity_type,
            "entity_id": entity_id,
            "count": records.len(),
            "records": records,
        }
    })))
}

pub async fn certificate_by_hash(
    Path(hash): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<Value>, StatusCode> {
    let certificate = state
        .certificates
        .get_by_hash(&hash)
        .await
        .map_err(|e| failure("Failed to load certificate", e))?;

    Ok(Json(json!({
        "status": "success",
        "data": certificate,
    })))
}

pub async fn ledger_stats(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    let ledger = state
        .ledger
        .stats()
        .await
        .map_err(|e| failure("Failed to compute ledger stats", e))?;
    let anchors = state
        .anchors
        .count_anchors()
        .await
        .map_err(|e| failure("Failed to count anchors", e))?;

    Ok(Json(json!({
        "status": "success",
        "data": {
            "ledger": ledger,
            "anchors": anchors,
        }
    })))
}
