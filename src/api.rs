// src/api.rs
//! Read-only operational endpoints: `/health`, `/metrics`, `/status`.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::export::{ExportReport, TieredExporter, WarmInventory};
use crate::hot_store::HotStore;
use crate::quota::{LedgerHandle, QuotaPeriod};
use crate::record::SourceKind;
use crate::scheduler::{SourceStatus, StatusBoard};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<HotStore>,
    pub ledger: Arc<LedgerHandle>,
    pub board: StatusBoard,
    pub exporter: Option<Arc<TieredExporter>>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/metrics", get(metrics_text))
        .route("/status", get(status))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HotStoreView {
    pub len: usize,
    pub bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct QuotaView {
    pub source: SourceKind,
    pub capacity: Option<u64>,
    pub period: QuotaPeriod,
    pub units_per_fetch: u64,
    pub consumed_units: u64,
    pub remaining: Option<u64>,
    pub overage: u64,
    pub last_reset_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct StatusResp {
    pub hot_store: HotStoreView,
    pub sources: Vec<SourceStatus>,
    pub quotas: Vec<QuotaView>,
    pub warm: Option<WarmInventory>,
    pub last_export: Option<ExportReport>,
}

async fn status(State(state): State<AppState>) -> Json<StatusResp> {
    let quotas = state
        .ledger
        .states()
        .into_iter()
        .map(|(source, q)| QuotaView {
            source,
            capacity: q.capacity,
            period: q.period,
            units_per_fetch: q.units_per_fetch,
            consumed_units: q.consumed_units,
            remaining: q.remaining(),
            overage: q.overage(),
            last_reset_at: q.last_reset_at,
        })
        .collect();

    let (warm, last_export) = match &state.exporter {
        Some(ex) => {
            let inv = match ex.inventory() {
                Ok(inv) => Some(inv),
                Err(e) => {
                    warn!(error = ?e, "status: warm inventory unavailable");
                    None
                }
            };
            (inv, ex.last_report())
        }
        None => (None, None),
    };

    Json(StatusResp {
        hot_store: HotStoreView {
            len: state.store.length(),
            bytes: state.store.approx_memory_bytes(),
        },
        sources: state.board.statuses(),
        quotas,
        warm,
        last_export,
    })
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(h) => h.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
