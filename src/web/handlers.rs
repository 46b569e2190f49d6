//! HTTP request handlers.

use super::AppState;
use crate::classify::{ClassificationRecord, MetricScope};
use crate::db::{deserialize_tdigest, get_tdigest_stats, DbError, HistoryRecord};
use crate::query::{Page, QueryError, QueryParams, QueryRequest, Row, Summary};
use crate::scheduler::RetentionPolicy;
use crate::surveillance::{Applied, Level, SurveillanceError, WatchEntry};
use crate::telemetry::{
    EntityInfo, EntityKey, EntityKind, Horizon, OpticalMetrics, PingMetrics, Sample, SampleError,
    UsageMetrics, WindowError,
};
use crate::trend::{Spark, TrendMetric};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Internal(e) => {
                tracing::error!("Request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<SampleError> for ApiError {
    fn from(e: SampleError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<WindowError> for ApiError {
    fn from(e: WindowError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::UnknownCollection(_) => ApiError::NotFound(e.to_string()),
            _ => ApiError::BadRequest(e.to_string()),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound => ApiError::NotFound(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<SurveillanceError> for ApiError {
    fn from(e: SurveillanceError) -> Self {
        match e {
            SurveillanceError::FixReasonRequired => ApiError::BadRequest(e.to_string()),
            SurveillanceError::NotWatched => ApiError::NotFound(e.to_string()),
            SurveillanceError::Store(db) => db.into(),
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_key(raw: &str) -> Result<EntityKey, ApiError> {
    Ok(EntityKey::new(raw)?)
}

fn parse_window(raw: Option<&str>) -> Result<Horizon, ApiError> {
    match raw.map(str::trim).filter(|w| !w.is_empty()) {
        Some(w) => Ok(w.parse()?),
        None => Ok(Horizon::default()),
    }
}

// ============================================================================
// API: Ingest
// ============================================================================

/// One sample as sent by a probe producer. `at` defaults to arrival time.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestSample {
    pub key: String,
    #[serde(default)]
    pub at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ping: Option<PingMetrics>,
    #[serde(default)]
    pub optical: Option<OpticalMetrics>,
    #[serde(default)]
    pub usage: Option<UsageMetrics>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IngestBody {
    Batch(Vec<IngestSample>),
    One(IngestSample),
}

#[derive(Debug, Serialize)]
pub struct Rejected {
    pub index: usize,
    pub key: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub accepted: usize,
    pub rejected: Vec<Rejected>,
}

async fn ingest_one(state: &AppState, input: IngestSample) -> Result<(), SampleError> {
    let key = EntityKey::new(input.key)?;
    let sample = Sample {
        at: input.at.unwrap_or_else(Utc::now),
        ping: input.ping,
        optical: input.optical,
        usage: input.usage,
    };
    state.scheduler.submit(&key, sample).await?;
    Ok(())
}

pub async fn handle_ingest(
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> ApiResult<IngestResponse> {
    let (inputs, single) = match body {
        IngestBody::Batch(inputs) => (inputs, false),
        IngestBody::One(input) => (vec![input], true),
    };

    let mut accepted = 0;
    let mut rejected = Vec::new();
    for (index, input) in inputs.into_iter().enumerate() {
        let key = input.key.clone();
        match ingest_one(&state, input).await {
            Ok(()) => accepted += 1,
            Err(e) => {
                tracing::warn!("Rejected sample for {:?}: {}", key, e);
                if single {
                    return Err(e.into());
                }
                rejected.push(Rejected {
                    index,
                    key,
                    error: e.to_string(),
                });
            }
        }
    }

    Ok(Json(IngestResponse { accepted, rejected }))
}

#[derive(Debug, Deserialize)]
pub struct RegisterEntityRequest {
    pub key: String,
    pub kind: EntityKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub device_class: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterEntityResponse {
    pub entity: EntityInfo,
    pub changed: bool,
}

pub async fn handle_register_entity(
    State(state): State<AppState>,
    Json(req): Json<RegisterEntityRequest>,
) -> ApiResult<RegisterEntityResponse> {
    let mut info = EntityInfo::new(parse_key(&req.key)?, req.kind);
    if let Some(name) = req.name.filter(|n| !n.trim().is_empty()) {
        info.name = name;
    }
    info.ip = req.ip;
    info.device_class = req.device_class;

    let changed = state.scheduler.register(info.clone())?;
    Ok(Json(RegisterEntityResponse {
        entity: info,
        changed,
    }))
}

// ============================================================================
// API: Queries
// ============================================================================

pub async fn handle_collection(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<QueryParams>,
) -> ApiResult<Page<Row>> {
    let req = QueryRequest::parse(&collection, &params)?;
    Ok(Json(state.query.query(&req)))
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    #[serde(default)]
    pub window: Option<String>,
}

pub async fn handle_summary(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<Summary> {
    let window = parse_window(query.window.as_deref())?;
    Ok(Json(state.query.summary(window)))
}

#[derive(Debug, Serialize)]
pub struct EntityDetail {
    pub key: EntityKey,
    pub info: Option<EntityInfo>,
    pub window: Horizon,
    pub classification: ClassificationRecord,
    pub watch: Option<WatchEntry>,
}

pub async fn handle_entity(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<WindowQuery>,
) -> ApiResult<EntityDetail> {
    let key = parse_key(&key)?;
    let window = parse_window(query.window.as_deref())?;
    let classification = state
        .classifier
        .classify_at(&key, window, MetricScope::All, Utc::now());

    Ok(Json(EntityDetail {
        info: state.registry.get(&key),
        watch: state.surveillance.entry(&key),
        key,
        window,
        classification,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SparkQuery {
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub metric: Option<String>,
    #[serde(default)]
    pub points: Option<usize>,
}

pub async fn handle_spark(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SparkQuery>,
) -> ApiResult<Spark> {
    let key = parse_key(&key)?;
    let window = parse_window(query.window.as_deref())?;
    let metric = match query.metric.as_deref() {
        Some(m) => m.parse::<TrendMetric>().map_err(ApiError::BadRequest)?,
        None => state.trend.metric_for(&key),
    };
    Ok(Json(state.trend.spark(&key, window, metric, query.points)))
}

// ============================================================================
// API: Rollups
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RollupsQuery {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub window_seconds: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct ApiBucket {
    pub time: DateTime<Utc>,
    pub window_seconds: i32,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub p99: f64,
    pub loss_avg: Option<f64>,
    pub timeout_count: i64,
    pub sample_count: i64,
}

#[derive(Debug, Serialize)]
pub struct RollupsResponse {
    pub key: EntityKey,
    pub window_seconds: i32,
    pub buckets: Vec<ApiBucket>,
}

fn parse_rfc3339(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| ApiError::BadRequest(format!("invalid time {:?}: {}", s, e)))
    })
    .transpose()
}

pub async fn handle_rollups(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<RollupsQuery>,
) -> ApiResult<RollupsResponse> {
    let key = parse_key(&key)?;
    let end = parse_rfc3339(query.end.as_deref())?.unwrap_or_else(Utc::now);
    let start = parse_rfc3339(query.start.as_deref())?.unwrap_or_else(|| end - ChronoDuration::hours(24));
    if start >= end {
        return Err(ApiError::BadRequest("start must be before end".to_string()));
    }

    let window_seconds = match query.window_seconds {
        Some(w) if state.retention.iter().any(|p| p.window == w && w > 0) => w,
        Some(w) => return Err(ApiError::BadRequest(format!("no rollup window of {}s", w))),
        None => select_window(&state.retention, (end - start).num_seconds()),
    };

    let buckets = state
        .store
        .get_rollups(&key, window_seconds, start, end)?
        .into_iter()
        .map(|b| {
            let digest = deserialize_tdigest(&b.tdigest_data);
            let (min, max, sum, count) = digest.as_ref().map(get_tdigest_stats).unwrap_or_default();
            let q = |p: f64| digest.as_ref().map(|td| sanitize_float(td.estimate_quantile(p))).unwrap_or(0.0);
            ApiBucket {
                time: b.time,
                window_seconds: b.window_seconds,
                min_ms: sanitize_float(min),
                max_ms: sanitize_float(max),
                avg_ms: if count > 0.0 { sanitize_float(sum / count) } else { 0.0 },
                p25: q(0.25),
                p50: q(0.50),
                p75: q(0.75),
                p95: q(0.95),
                p99: q(0.99),
                loss_avg: b.loss_avg,
                timeout_count: b.timeout_count,
                sample_count: b.sample_count,
            }
        })
        .collect();

    Ok(Json(RollupsResponse {
        key,
        window_seconds,
        buckets,
    }))
}

/// Largest configured window that still yields about 200 buckets over the range.
fn select_window(policies: &[RetentionPolicy], duration_secs: i64) -> i32 {
    let target_window = duration_secs / 200;

    let mut sorted: Vec<_> = policies.iter().filter(|p| p.window > 0).collect();
    sorted.sort_by_key(|p| p.window);

    for p in sorted.iter().rev() {
        if i64::from(p.window) <= target_window {
            return p.window;
        }
    }

    // Default to smallest non-zero window
    sorted.first().map(|p| p.window).unwrap_or(60)
}

fn sanitize_float(f: f64) -> f64 {
    if f.is_finite() {
        f
    } else {
        0.0
    }
}

// ============================================================================
// API: Surveillance
// ============================================================================

pub async fn handle_watch_list(State(state): State<AppState>) -> ApiResult<Vec<WatchEntry>> {
    Ok(Json(state.surveillance.entries()))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn handle_watch_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<HistoryRecord>> {
    let key = query.key.as_deref().map(parse_key).transpose()?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    Ok(Json(state.surveillance.history(key.as_ref(), limit)?))
}

#[derive(Debug, Serialize)]
pub struct WatchResponse {
    pub changed: bool,
    pub entry: Option<WatchEntry>,
}

impl From<Applied> for WatchResponse {
    fn from(applied: Applied) -> Self {
        Self {
            changed: !applied.transition.is_noop(),
            entry: applied.entry,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddParams {
    #[serde(default)]
    pub level: Option<Level>,
}

pub async fn handle_watch_add(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<AddParams>,
) -> ApiResult<WatchResponse> {
    let key = parse_key(&key)?;
    let applied = state.surveillance.add_manual(&key, params.level, Utc::now())?;
    Ok(Json(applied.into()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RemoveRequest {
    pub note: Option<String>,
}

pub async fn handle_watch_remove(
    State(state): State<AppState>,
    Path(key): Path<String>,
    body: Option<Json<RemoveRequest>>,
) -> ApiResult<WatchResponse> {
    let key = parse_key(&key)?;
    let note = body.and_then(|Json(req)| req.note);
    let applied = state.surveillance.remove(&key, note, Utc::now())?;
    Ok(Json(applied.into()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FixRequest {
    pub reason: String,
}

pub async fn handle_watch_fix(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(req): Json<FixRequest>,
) -> ApiResult<WatchResponse> {
    let key = parse_key(&key)?;
    let applied = state.surveillance.fix(&key, &req.reason, Utc::now())?;
    Ok(Json(applied.into()))
}
