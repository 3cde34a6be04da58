use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::engine::{RouteOptions, RouteResult, SafetyEngine};
use crate::error::QueryError;
use crate::incident::{Incident, IncidentReport};
use crate::model::{CategoryId, Location, Region, Timestamp};
use crate::safety::RiskCell;

// Shared State for concurrency
pub struct AppState {
    pub engine: SafetyEngine,
}

pub fn router(state: Arc<AppState>) -> Router {
    // Allows a locally served front end to talk to this API
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/categories", get(list_categories))
        .route("/route", post(calculate_route))
        .route("/heatmap", post(heatmap))
        .route("/cells/:cell", get(cell_detail))
        .route("/incidents", post(ingest_incidents))
        .route("/incidents/search", post(search_incidents))
        .route("/incidents/purge", post(purge_incidents))
        .layer(cors)
        .with_state(state)
}

// --- API DTOs ---

#[derive(Debug, Deserialize)]
pub struct RouteRequest {
    pub origin: Location,
    pub destination: Location,
    /// Enabled layers; all configured categories when absent.
    pub categories: Option<Vec<CategoryId>>,
    pub as_of: Option<Timestamp>,
    /// Overrides the configured λ.
    pub risk_aversion: Option<f64>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RouteResponse {
    pub geometry: GeoJsonLineString,
    pub total_distance: f64,
    pub total_duration: f64,
    pub total_risk: f64,
    pub risk_density: f64,
    pub safety_rating: String,
    pub summary: String,
    pub edges: Vec<u64>,
}

#[derive(Debug, Serialize)]
pub struct GeoJsonLineString {
    pub r#type: String,
    pub coordinates: Vec<[f64; 2]>, // [lng, lat] standard for GeoJSON
}

impl From<RouteResult> for RouteResponse {
    fn from(route: RouteResult) -> Self {
        Self {
            geometry: GeoJsonLineString {
                r#type: "LineString".to_string(),
                coordinates: route.geometry.iter().map(|l| [l.lng, l.lat]).collect(),
            },
            total_distance: route.total_distance_m,
            total_duration: route.total_duration_s,
            total_risk: route.total_risk,
            risk_density: route.risk_density,
            safety_rating: route.safety_rating.to_string(),
            summary: route.summary,
            edges: route.legs.iter().map(|l| l.edge_id).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RegionRequest {
    pub region: Region,
    pub categories: Option<Vec<CategoryId>>,
    pub as_of: Option<Timestamp>,
}

#[derive(Debug, Serialize)]
pub struct HeatmapPoint {
    pub cell: String,
    pub lat: f64,
    pub lng: f64,
    pub risk: f64,
}

#[derive(Debug, Deserialize)]
pub struct CellQuery {
    /// Comma separated category ids.
    pub categories: Option<String>,
    pub as_of: Option<Timestamp>,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: Vec<u64>,
    pub rejected: Vec<RejectedRecord>,
}

#[derive(Debug, Serialize)]
pub struct RejectedRecord {
    pub index: usize,
    pub error: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct PurgeRequest {
    pub now: Option<Timestamp>,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub purged: usize,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn internal(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: err.to_string(),
        }
    }

    fn bad_request(err: impl std::fmt::Display) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        let status = match err {
            QueryError::NoRoute => StatusCode::NOT_FOUND,
            QueryError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            QueryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

fn requested_categories(engine: &SafetyEngine, categories: Option<Vec<CategoryId>>) -> Vec<CategoryId> {
    categories.unwrap_or_else(|| engine.categories().cloned().collect())
}

// --- Handlers ---

async fn list_categories(State(state): State<Arc<AppState>>) -> Json<Vec<CategoryId>> {
    Json(state.engine.categories().cloned().collect())
}

async fn calculate_route(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RouteRequest>,
) -> Result<Json<RouteResponse>, AppError> {
    // Route search is CPU bound; keep it off the async workers.
    let route = tokio::task::spawn_blocking(move || {
        let engine = &state.engine;
        let categories = requested_categories(engine, payload.categories);
        let options = RouteOptions {
            risk_aversion: payload.risk_aversion,
            timeout: payload.timeout_ms.map(Duration::from_millis),
            cancel: None,
        };
        engine.plan_route_with(
            payload.origin,
            payload.destination,
            &categories,
            payload.as_of.unwrap_or_else(Utc::now),
            &options,
        )
    })
    .await
    .map_err(AppError::internal)??;

    Ok(Json(route.into()))
}

async fn heatmap(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegionRequest>,
) -> Result<Json<Vec<HeatmapPoint>>, AppError> {
    let engine = &state.engine;
    let categories = requested_categories(engine, payload.categories);
    let points = engine
        .heatmap(&payload.region, &categories, payload.as_of.unwrap_or_else(Utc::now))?
        .map(|c| HeatmapPoint {
            cell: c.cell.to_string(),
            lat: c.center.lat,
            lng: c.center.lng,
            risk: c.risk,
        })
        .collect();
    Ok(Json(points))
}

async fn cell_detail(
    State(state): State<Arc<AppState>>,
    Path(cell): Path<String>,
    Query(query): Query<CellQuery>,
) -> Result<Json<RiskCell>, AppError> {
    let cell: h3o::CellIndex = cell.parse().map_err(AppError::bad_request)?;
    let engine = &state.engine;
    let categories = requested_categories(
        engine,
        query
            .categories
            .map(|raw| raw.split(',').map(|id| CategoryId::new(id.trim())).collect()),
    );
    Ok(Json(engine.cell_detail(cell, &categories, query.as_of.unwrap_or_else(Utc::now))))
}

async fn ingest_incidents(
    State(state): State<Arc<AppState>>,
    Json(reports): Json<Vec<IncidentReport>>,
) -> Json<IngestResponse> {
    let outcome = state.engine.ingest_batch(reports);
    Json(IngestResponse {
        accepted: outcome.accepted,
        rejected: outcome
            .rejected
            .into_iter()
            .map(|(index, e)| RejectedRecord {
                index,
                error: e.to_string(),
            })
            .collect(),
    })
}

async fn search_incidents(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegionRequest>,
) -> Result<Json<Vec<Incident>>, AppError> {
    let engine = &state.engine;
    let categories = requested_categories(engine, payload.categories);
    let query = engine.incidents(&payload.region, &categories, payload.as_of.unwrap_or_else(Utc::now))?;
    Ok(Json(query.iter().collect()))
}

async fn purge_incidents(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<PurgeRequest>>,
) -> Json<PurgeResponse> {
    let now = payload.and_then(|Json(p)| p.now).unwrap_or_else(Utc::now);
    Json(PurgeResponse {
        purged: state.engine.purge(now),
    })
}
