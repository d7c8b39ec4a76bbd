use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tandem_core::db::{Database, LibSqlRecordRepository, RecordRepository};
use tandem_core::models::{DeviceSyncStatus, SyncMetric};
use tandem_core::protocol::{ApiEnvelope, SyncRequest};
use tandem_core::util::unix_millis_now;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, AuthenticatedUser, JwtVerifier};
use crate::config::AppConfig;
use crate::coordinator::{CoordinatorSettings, SyncCoordinator, SyncOutcome};
use crate::error::AppError;
use crate::rate_limit::{user_fingerprint, RateLimitMetricsSnapshot, SyncRateLimiter};
use crate::validation::parse_sync_request;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    db: Arc<Database>,
    jwt_verifier: Arc<JwtVerifier>,
    rate_limiter: Arc<SyncRateLimiter>,
    settings: CoordinatorSettings,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, db: Arc<Database>) -> Self {
        Self {
            jwt_verifier: Arc::new(JwtVerifier::from_config(&config)),
            rate_limiter: Arc::new(SyncRateLimiter::from_config(&config)),
            settings: CoordinatorSettings::from_config(&config),
            db,
            config,
        }
    }

    fn coordinator(&self) -> SyncCoordinator<LibSqlRecordRepository<'_>> {
        SyncCoordinator::new(
            LibSqlRecordRepository::new(self.db.connection()),
            self.settings,
        )
    }
}

pub fn app_router(state: AppState) -> Router {
    let auth = middleware::from_fn_with_state(state.clone(), require_auth);

    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/v1/sync",
            post(sync)
                .route_layer(auth.clone())
                .fallback(method_not_allowed),
        )
        .route("/v1/devices", get(list_devices).route_layer(auth))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    rate_limit: RateLimitMetricsSnapshot,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        rate_limit: state.rate_limiter.metrics_snapshot(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let user = state.jwt_verifier.verify_access_token(token)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

async fn sync(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ApiEnvelope<SyncOutcome>>, AppError> {
    let Json(body) = body.map_err(|rejection| {
        AppError::bad_request(format!("Invalid JSON body: {}", rejection.body_text()))
    })?;
    let request = parse_sync_request(&body)?;

    if request.user_id != user.user_id {
        return Err(AppError::unauthorized("User ID does not match token"));
    }

    state
        .rate_limiter
        .check(request.operation, &user.user_id)
        .await?;

    let started = Instant::now();
    let now = unix_millis_now();
    let repository = LibSqlRecordRepository::new(state.db.connection());
    let outcome = state.coordinator().handle(&request, now).await;
    record_usage(&repository, &request, outcome.as_ref().ok(), started, now).await;

    let outcome = outcome?;
    tracing::info!(
        operation = request.operation.as_str(),
        user = user_fingerprint(&user.user_id),
        session = user.session_id.as_deref().unwrap_or("none"),
        platform = request.platform.as_str(),
        changes = outcome.changes_count(),
        conflicts = outcome.conflicts_count(),
        duration_ms = started.elapsed().as_millis(),
        "Handled sync request"
    );
    Ok(Json(ApiEnvelope::success(outcome)))
}

/// Device bookkeeping and metrics never fail the request
async fn record_usage(
    repository: &LibSqlRecordRepository<'_>,
    request: &SyncRequest,
    outcome: Option<&SyncOutcome>,
    started: Instant,
    now: i64,
) {
    if outcome.is_some() {
        if let Err(error) = repository
            .touch_device(&request.user_id, &request.device_id, request.platform, now)
            .await
        {
            tracing::warn!(error = %error, "Failed to update device sync status");
        }
    }

    let metric = SyncMetric {
        user_id: request.user_id.clone(),
        platform: request.platform,
        device_id: request.device_id.clone(),
        operation: request.operation.as_str().to_string(),
        success: outcome.is_some(),
        changes_count: outcome.map_or(0, |outcome| outcome.changes_count() as u64),
        conflicts_count: outcome.map_or(0, |outcome| outcome.conflicts_count() as u64),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        timestamp: now,
    };
    if let Err(error) = repository.record_metric(&metric).await {
        tracing::warn!(error = %error, "Failed to record sync metric");
    }
}

async fn list_devices(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<ApiEnvelope<Vec<DeviceSyncStatus>>>, AppError> {
    let devices = LibSqlRecordRepository::new(state.db.connection())
        .list_devices(&user.user_id)
        .await?;
    tracing::debug!(
        user = user_fingerprint(&user.user_id),
        devices = devices.len(),
        "Listed devices"
    );
    Ok(Json(ApiEnvelope::success(devices)))
}
