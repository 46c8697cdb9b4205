// Admin HTTP routes
//
// Read-only views over the coordination store plus the local relay counters.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use browserfleet_coordination::{
    CoordinationStore, SelectionLimits, StoreError, WorkerFilter, WorkerSnapshot, WorkerStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::relay::{RelayStats, RelayStatsSnapshot};

/// App state for admin routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CoordinationStore>,
    pub limits: SelectionLimits,
    pub relay: Vec<(String, Arc<RelayStats>)>,
}

/// Standard error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn store_error(e: StoreError) -> ApiError {
    match e {
        StoreError::InvalidKey(reason) => (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: reason })),
        other => {
            error!(error = %other, "Coordination store unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: other.to_string(),
                }),
            )
        }
    }
}

/// Response wrapper for list endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerView {
    pub capability: String,
    pub id: String,
    pub endpoint: String,
    pub status: WorkerStatus,
    pub active: u32,
    pub lifetime: u32,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl From<WorkerSnapshot> for WorkerView {
    fn from(snapshot: WorkerSnapshot) -> Self {
        let record = snapshot.record;
        Self {
            capability: record.key.capability().to_string(),
            id: record.key.id().to_string(),
            endpoint: record.endpoint,
            status: record.status,
            active: snapshot.active,
            lifetime: snapshot.lifetime,
            last_heartbeat: record.last_heartbeat,
            registered_at: record.registered_at,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapabilityStats {
    pub workers: usize,
    pub available: usize,
    pub draining: usize,
    pub active_sessions: u64,
    /// Workers at their lifetime limit, waiting to retire
    pub exhausted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsResponse {
    /// Cluster-wide active sessions, all capabilities
    pub active_sessions: u64,
    pub workers: usize,
    pub capabilities: BTreeMap<String, CapabilityStats>,
    pub limits: SelectionLimits,
    /// Counters of this broker's listeners
    pub relay: BTreeMap<String, RelayStatsSnapshot>,
}

#[derive(Debug, Deserialize)]
pub struct WorkersQuery {
    pub capability: Option<String>,
}

/// Create admin routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/stats", get(stats))
        .route("/v1/workers", get(list_workers))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /v1/stats - Aggregate fleet counters
async fn stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let active_sessions = state.store.total_active().await.map_err(store_error)?;
    let workers = state
        .store
        .list_workers(WorkerFilter::all())
        .await
        .map_err(store_error)?;

    let mut capabilities: BTreeMap<String, CapabilityStats> = BTreeMap::new();
    for worker in &workers {
        let entry = capabilities
            .entry(worker.record.key.capability().to_string())
            .or_default();
        entry.workers += 1;
        match worker.record.status {
            WorkerStatus::Available => entry.available += 1,
            WorkerStatus::Draining => entry.draining += 1,
        }
        entry.active_sessions += u64::from(worker.active);
        if worker.lifetime >= state.limits.max_lifetime {
            entry.exhausted += 1;
        }
    }

    let relay = state
        .relay
        .iter()
        .map(|(capability, stats)| (capability.clone(), stats.snapshot()))
        .collect();

    Ok(Json(StatsResponse {
        active_sessions,
        workers: workers.len(),
        capabilities,
        limits: state.limits,
        relay,
    }))
}

/// GET /v1/workers?capability= - Worker records with their counters
async fn list_workers(
    State(state): State<AppState>,
    Query(query): Query<WorkersQuery>,
) -> Result<Json<ListResponse<WorkerView>>, ApiError> {
    let filter = match query.capability {
        Some(capability) => WorkerFilter::capability(capability),
        None => WorkerFilter::all(),
    };
    let workers = state.store.list_workers(filter).await.map_err(store_error)?;

    Ok(Json(ListResponse {
        data: workers.into_iter().map(WorkerView::from).collect(),
    }))
}
