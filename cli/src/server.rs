use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;

use nestling_core::db::Database;
use nestling_core::endpoint::MutationEndpoint;
use nestling_core::growth::{CurvePoint, GrowthMetric, Sex, build_who_curve_data};
use nestling_core::models::{
    Caller, EntityType, LogEntry, MutationResponse, QueuedMutation, RateLimitStatus, RejectReason,
};
use nestling_core::queue::MAX_PAYLOAD_BYTES;
use nestling_core::rate_limit::RateLimitConfig;
use nestling_core::units::UnitSystem;

const BODY_LIMIT: usize = 1024 * 1024; // 1 MB
const _: () = assert!(MAX_PAYLOAD_BYTES < BODY_LIMIT);
const DEFAULT_ENTRY_LIMIT: usize = 50;
const MAX_ENTRY_LIMIT: usize = 500;
const DEFAULT_CURVE_MONTHS: u32 = 24;

/// Selects which baby a request acts on when the caller has several.
pub(crate) const BABY_HEADER: &str = "x-baby-id";

#[derive(Clone)]
pub(crate) struct AppState {
    db: Arc<Mutex<Database>>,
    rate_limit: RateLimitConfig,
}

impl AppState {
    pub(crate) fn new(db: Database, rate_limit: RateLimitConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            rate_limit,
        }
    }

    fn db(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Request / Response types ---

#[derive(Deserialize)]
struct EntriesQuery {
    entity: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct CurveQuery {
    months: Option<u32>,
    units: Option<String>,
}

#[derive(Serialize)]
struct CurveResponse {
    metric: GrowthMetric,
    sex: Sex,
    units: UnitSystem,
    points: Vec<CurvePoint>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

enum ApiError {
    BadRequest(String),
    /// An endpoint refusal, rendered as the same body the mutation route returns.
    Rejected(MutationResponse),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Rejected(rejection) => return mutation_response(&rejection),
            Self::Internal(err) => {
                tracing::error!("internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

fn status_for(response: &MutationResponse) -> StatusCode {
    match response {
        MutationResponse::Accepted { .. } => StatusCode::OK,
        MutationResponse::Rejected { reason, .. } => match reason {
            RejectReason::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            RejectReason::Scope | RejectReason::Authorization => StatusCode::FORBIDDEN,
            RejectReason::Unauthenticated => StatusCode::UNAUTHORIZED,
            RejectReason::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        },
    }
}

fn insert_rate_limit_headers(headers: &mut HeaderMap, status: &RateLimitStatus) {
    headers.insert("x-ratelimit-limit", HeaderValue::from(status.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(status.remaining));
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from(status.reset_at.timestamp()),
    );
}

fn mutation_response(response: &MutationResponse) -> Response {
    let mut resp = (status_for(response), Json(response)).into_response();
    if let Some(status) = response.rate_limit() {
        insert_rate_limit_headers(resp.headers_mut(), status);
    }
    resp
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn requested_baby(headers: &HeaderMap) -> Option<&str> {
    headers.get(BABY_HEADER).and_then(|v| v.to_str().ok())
}

// --- Middleware ---

async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let authenticated = {
        let db = state.db();
        MutationEndpoint::new(&db, state.rate_limit).authenticate(bearer_token(request.headers()))
    };
    match authenticated {
        Ok(Ok(caller)) => {
            request.extensions_mut().insert(caller);
            next.run(request).await
        }
        Ok(Err(rejection)) => mutation_response(&rejection),
        Err(err) => ApiError::Internal(err).into_response(),
    }
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Handlers ---

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn submit_mutation(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    body: Result<Json<QueuedMutation>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(mutation) = body.map_err(|rejection| {
        ApiError::Rejected(MutationResponse::rejected(
            RejectReason::Validation,
            rejection.body_text(),
        ))
    })?;

    let response = {
        let db = state.db();
        MutationEndpoint::new(&db, state.rate_limit).submit_as(
            caller,
            requested_baby(&headers),
            &mutation,
            Utc::now(),
        )?
    };

    match &response {
        MutationResponse::Accepted { duplicate, .. } => {
            tracing::info!(mutation_id = %mutation.id, duplicate, "mutation accepted");
        }
        MutationResponse::Rejected { reason, message, .. } => {
            tracing::info!(
                mutation_id = %mutation.id,
                %reason,
                message = message.as_str(),
                "mutation rejected"
            );
        }
    }
    Ok(mutation_response(&response))
}

async fn get_rate_limit(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let status = {
        let db = state.db();
        MutationEndpoint::new(&db, state.rate_limit).rate_limit_status_as(
            caller,
            requested_baby(&headers),
            Utc::now(),
        )?
    }
    .map_err(ApiError::Rejected)?;

    let mut resp = Json(status).into_response();
    insert_rate_limit_headers(resp.headers_mut(), &status);
    Ok(resp)
}

async fn list_entries(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    headers: HeaderMap,
    Query(query): Query<EntriesQuery>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let entity = query
        .entity
        .as_deref()
        .map(str::parse::<EntityType>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ENTRY_LIMIT)
        .clamp(1, MAX_ENTRY_LIMIT);

    let db = state.db();
    let scope = MutationEndpoint::new(&db, state.rate_limit)
        .resolve_scope(caller, requested_baby(&headers))?
        .map_err(ApiError::Rejected)?;
    let entries = db.list_entries(&scope.baby_id, entity, limit)?;
    Ok(Json(entries))
}

async fn get_growth_curve(
    Path((metric, sex)): Path<(String, String)>,
    Query(query): Query<CurveQuery>,
) -> Result<Json<CurveResponse>, ApiError> {
    let metric: GrowthMetric = metric
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    let sex: Sex = sex
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    let units: UnitSystem = query
        .units
        .as_deref()
        .map(str::parse::<UnitSystem>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?
        .unwrap_or_default();
    let months = query.months.unwrap_or(DEFAULT_CURVE_MONTHS);

    Ok(Json(CurveResponse {
        metric,
        sex,
        units,
        points: build_who_curve_data(metric, sex, months, units),
    }))
}

pub(crate) fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/mutations", post(submit_mutation))
        .route("/api/rate-limit", get(get_rate_limit))
        .route("/api/entries", get(list_entries))
        .route("/api/growth/{metric}/{sex}", get(get_growth_curve))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/health", get(health))
        .merge(protected)
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .with_state(state)
}

// --- Server startup ---

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

pub async fn start_server(
    db: Database,
    port: u16,
    bind: &str,
    rate_limit: RateLimitConfig,
) -> anyhow::Result<()> {
    let callers = db.list_callers()?.len();
    if callers == 0 {
        eprintln!("Warning: no callers registered. Add one with `nestling admin add-caller <name>`.");
    }

    let app = build_router(AppState::new(db, rate_limit));

    let listener = tokio::net::TcpListener::bind(format!("{bind}:{port}")).await?;
    eprintln!("Listening on http://{bind}:{port}");
    tracing::info!(
        callers,
        limit = rate_limit.limit,
        window_minutes = rate_limit.window_minutes,
        "server started"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
