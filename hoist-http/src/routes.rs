//! The `/api/v1` surface.
//!
//! Middleware composition is fixed at startup: request-id assignment, then
//! bearer authentication (everything except `/api/v1/health`), then the
//! handler. Authorization is checked per handler against the role and scope
//! grants; destructive operations additionally require the typed
//! confirmation phrase and a reason in the body, and always write an audit
//! record.

use axum::extract::{Path, Query, Request, State};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use hoist_admission::BackpressureDecision;
use hoist_backend::{JobSource, QueueScope, QuotaKind};
use hoist_core::{
    ChaosPoint, ChaosRule, ChaosScope, EnqueueOptions, JobId, Lane, Priority, QueueError,
    QuotaPeriod, TenantCtx, TenantId, TenantRecord, WorkerId,
};
use hoist_exactly_once::IdempotencyScope;
use hoist_ops::{
    ControlAction, LaneMetrics, PlanConstraints, RemediationRule, RoutingStrategy,
};

use crate::auth::{AuthContext, Permission};
use crate::error::ApiError;
use crate::hooks::HookSubscription;
use crate::pagination::{Cursor, PageParams};
use crate::state::AppState;

type ApiResult<T> = Result<T, ApiError>;

/// Build the admin router with the fixed middleware chain
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/stats", get(stats))
        .route("/api/v1/queues/{queue}/peek", get(peek_queue))
        .route("/api/v1/queues/{queue}", delete(purge_queue))
        .route("/api/v1/queues/{queue}/jobs", post(enqueue_job))
        .route("/api/v1/queues/{queue}/jobs/{id}", get(get_job))
        .route("/api/v1/queues/{queue}/jobs/{id}/cancel", post(cancel_job))
        .route("/api/v1/bench", post(bench))
        .route("/api/v1/tenants", get(list_tenants).post(create_tenant))
        .route(
            "/api/v1/tenants/{id}",
            get(get_tenant).delete(delete_tenant),
        )
        .route("/api/v1/workers", get(list_workers).post(register_worker))
        .route("/api/v1/workers/{id}/heartbeat", post(worker_heartbeat))
        .route(
            "/api/v1/workers/actions/{action}",
            post(worker_action),
        )
        .route(
            "/api/v1/workers/actions/rolling-restart",
            post(rolling_restart),
        )
        .route("/api/v1/workers/audit", get(worker_audit))
        .route(
            "/api/v1/canary/deployments",
            get(list_canaries).post(create_canary),
        )
        .route("/api/v1/canary/deployments/{id}", get(get_canary))
        .route(
            "/api/v1/canary/deployments/{id}/evaluate",
            post(evaluate_canary),
        )
        .route(
            "/api/v1/canary/deployments/{id}/promote",
            post(promote_canary),
        )
        .route(
            "/api/v1/canary/deployments/{id}/rollback",
            post(rollback_canary),
        )
        .route("/api/v1/anomaly-radar/status", get(radar_status))
        .route("/api/v1/capacity/plan", post(capacity_plan))
        .route("/api/v1/dlq/entries", get(dlq_entries))
        .route(
            "/api/v1/dlq-remediation/rules",
            get(list_rules).post(create_rule),
        )
        .route("/api/v1/dlq-remediation/rules/{id}", delete(delete_rule))
        .route("/api/v1/dlq-remediation/run", post(run_remediation))
        .route("/api/v1/dlq-remediation/audit", get(remediation_audit))
        .route(
            "/api/v1/event-hooks",
            get(list_hooks).post(create_hook),
        )
        .route("/api/v1/event-hooks/{id}", delete(delete_hook))
        .route("/api/v1/event-hooks/dead", get(dead_hooks))
        .route(
            "/api/v1/event-hooks/dead/{id}/replay",
            post(replay_dead_hook),
        )
        .route("/api/v1/exactly-once/outbox/dead", get(dead_outbox_events))
        .route(
            "/api/v1/exactly-once/outbox/dead/{id}/replay",
            post(replay_outbox_event),
        )
        .route("/api/v1/chaos", get(chaos_status).post(configure_chaos))
        .route_layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .route("/api/v1/health", get(health))
        .layer(middleware::from_fn(assign_request_id))
        .with_state(state)
}

/// Assign or echo `X-Request-ID`
async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get("X-Request-ID")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    response
}

#[derive(Clone)]
struct RequestId(String);

/// Bearer authentication for everything under the guard
async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let request_id = request
        .extensions()
        .get::<RequestId>()
        .map(|r| r.0.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let header = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok());
    let claims = state
        .authority
        .authenticate_header(header)
        .map_err(|e| ApiError::new(e, request_id.clone()))?;

    request.extensions_mut().insert(AuthContext {
        claims,
        request_id,
    });
    Ok(next.run(request).await)
}

fn tenant_from_headers(headers: &axum::http::HeaderMap) -> Result<TenantId, QueueError> {
    let raw = headers
        .get("X-Tenant-ID")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("default");
    raw.parse()
}

fn api_err(auth: &AuthContext) -> impl Fn(QueueError) -> ApiError + '_ {
    move |e| ApiError::new(e, auth.request_id.clone())
}

/// Body contract for destructive operations
#[derive(Debug, Deserialize)]
struct DestructiveBody {
    #[serde(default)]
    confirmation: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

impl DestructiveBody {
    fn check(&self, expected: &str) -> Result<&str, QueueError> {
        match (&self.confirmation, &self.reason) {
            (Some(confirmation), Some(reason))
                if confirmation == expected && !reason.trim().is_empty() =>
            {
                Ok(reason)
            }
            _ => Err(QueueError::ConfirmationRequired {
                expected: expected.to_string(),
            }),
        }
    }
}

// ---- health ----

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

// ---- stats ----

#[derive(Deserialize)]
struct StatsQuery {
    queue: String,
}

async fn stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, &format!("queues/{}", query.queue))
        .map_err(api_err(&auth))?;
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let ctx = TenantCtx::new(tenant.clone()).with_request_id(auth.request_id.clone());

    let stats = state
        .broker
        .stats(&ctx, &query.queue)
        .await
        .map_err(api_err(&auth))?;
    let usage = json!({
        "jobs_hour": state.tenants.usage(&tenant, QuotaKind::Jobs, QuotaPeriod::Hour).await.map_err(api_err(&auth))?,
        "jobs_day": state.tenants.usage(&tenant, QuotaKind::Jobs, QuotaPeriod::Day).await.map_err(api_err(&auth))?,
    });
    Ok(Json(json!({ "queue": stats, "quota_usage": usage })))
}

// ---- queue operations ----

#[derive(Deserialize)]
struct PeekQuery {
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    page: usize,
    #[serde(default = "default_peek_page_size")]
    page_size: usize,
}

fn default_peek_page_size() -> usize {
    50
}

async fn peek_queue(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Path(queue): Path<String>,
    Query(query): Query<PeekQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, &format!("queues/{}", queue))
        .map_err(api_err(&auth))?;
    let page = PageParams {
        page: query.page,
        page_size: query.page_size,
    };
    page.validate().map_err(api_err(&auth))?;
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let ctx = TenantCtx::new(tenant);

    let source = match query.source.as_deref() {
        None | Some("pending") => JobSource::Pending,
        Some("reserved") => JobSource::Reserved,
        Some("dead_letter") => JobSource::DeadLetter,
        Some(other) => {
            return Err(api_err(&auth)(QueueError::Validation(format!(
                "unknown source '{}'",
                other
            ))))
        }
    };
    let jobs = state
        .broker
        .peek(&ctx, &queue, source, page.offset(), page.page_size)
        .await
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "jobs": jobs, "page": page.page })))
}

async fn purge_queue(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Path(queue): Path<String>,
    Json(body): Json<DestructiveBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::PurgeAll, &format!("queues/{}", queue))
        .map_err(api_err(&auth))?;
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let resource = format!("queues/{}", queue);

    let reason = match body.check(&state.config.rbac.confirmation_phrase) {
        Ok(reason) => reason.to_string(),
        Err(e) => {
            state.audit.record(
                &auth.request_id,
                &auth.claims.subject,
                "purge_queue",
                &resource,
                body.reason.as_deref().unwrap_or(""),
                "denied: confirmation missing",
            );
            return Err(api_err(&auth)(e));
        }
    };

    let ctx = TenantCtx::new(tenant);
    let result = state.broker.purge_queue(&ctx, &queue).await;
    let outcome = match &result {
        Ok(removed) => format!("purged {} jobs", removed),
        Err(e) => format!("failed: {}", e.code()),
    };
    state.audit.record(
        &auth.request_id,
        &auth.claims.subject,
        "purge_queue",
        &resource,
        &reason,
        &outcome,
    );
    let removed = result.map_err(api_err(&auth))?;
    Ok(Json(json!({ "removed": removed })))
}

#[derive(Deserialize)]
struct EnqueueBody {
    payload: serde_json::Value,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    max_attempts: Option<u32>,
    #[serde(default)]
    run_at: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    idempotency_key: Option<String>,
}

async fn enqueue_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Path(queue): Path<String>,
    Json(body): Json<EnqueueBody>,
) -> ApiResult<Response> {
    auth.authorize(Permission::Enqueue, &format!("queues/{}", queue))
        .map_err(api_err(&auth))?;
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let priority = body.priority.unwrap_or_default();

    // Admission: rate limit, then backpressure, then the broker
    let outcome = state
        .limiter
        .consume(tenant.as_str(), "enqueue", 1, priority);
    if !outcome.allowed {
        return Err(api_err(&auth)(QueueError::RateLimited {
            retry_after: outcome.retry_after.unwrap_or(Duration::from_secs(1)),
        }));
    }

    let scope = QueueScope::new(tenant.clone(), queue.clone());
    let decision = state
        .backpressure
        .decide(&scope, priority)
        .map_err(api_err(&auth))?;
    if let BackpressureDecision::Throttle(delay) = decision {
        tokio::time::sleep(delay).await;
    }

    let ctx = TenantCtx::new(tenant.clone()).with_request_id(auth.request_id.clone());
    let mut opts = EnqueueOptions::new().with_priority(priority);
    if let Some(max_attempts) = body.max_attempts {
        opts.max_attempts = max_attempts;
    }
    opts.run_at = body.run_at;

    let payload = serde_json::to_vec(&body.payload).map_err(|e| {
        api_err(&auth)(QueueError::Validation(format!("payload: {}", e)))
    })?;

    // The idempotency envelope makes duplicate submissions resolve to the
    // same logical job
    let job_id = if let Some(key) = body.idempotency_key.clone() {
        let scope = IdempotencyScope::new(tenant.as_str(), queue.as_str());
        let fingerprint = payload_fingerprint(&payload);
        let broker = state.broker.clone();
        let ctx_inner = ctx.clone();
        let queue_inner = queue.clone();
        opts.idempotency_key = Some(key.clone());
        let result = state
            .idempotency
            .process(&scope, &key, &fingerprint, move || async move {
                let id = broker
                    .enqueue(&ctx_inner, &queue_inner, payload, opts)
                    .await?;
                Ok(Some(json!({ "job_id": id })))
            })
            .await
            .map_err(api_err(&auth))?;
        result
            .and_then(|v| v.get("job_id").and_then(|j| j.as_str()).map(JobId::from))
            .ok_or_else(|| api_err(&auth)(QueueError::Internal("missing job id".to_string())))?
    } else {
        state
            .broker
            .enqueue(&ctx, &queue, payload, opts)
            .await
            .map_err(api_err(&auth))?
    };

    state.backpressure.record_outcome(&scope, true);

    let mut response = (
        axum::http::StatusCode::ACCEPTED,
        Json(json!({ "job_id": job_id })),
    )
        .into_response();
    let limit = state.limiter.config().default_tenant_burst;
    for (name, value) in [
        ("X-RateLimit-Limit", limit.to_string()),
        ("X-RateLimit-Remaining", format!("{:.0}", outcome.remaining)),
        (
            "X-RateLimit-Reset",
            (Utc::now().timestamp() + 1).to_string(),
        ),
    ] {
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

/// Content fingerprint for enqueue dedup
fn payload_fingerprint(payload: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(payload);
    format!("{:x}", hasher.finalize())
}

async fn get_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Path((queue, id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, &format!("queues/{}", queue))
        .map_err(api_err(&auth))?;
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let ctx = TenantCtx::new(tenant);
    let job = state
        .broker
        .get_job(&ctx, &queue, &JobId::from(id.as_str()))
        .await
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "job": job })))
}

async fn cancel_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Path((queue, id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, &format!("queues/{}", queue))
        .map_err(api_err(&auth))?;
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let ctx = TenantCtx::new(tenant);
    let cancelled = state
        .broker
        .cancel(&ctx, &queue, &JobId::from(id.as_str()))
        .await
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "cancelled": cancelled })))
}

// ---- bench ----

#[derive(Deserialize)]
struct BenchBody {
    queue: String,
    count: u32,
    #[serde(default)]
    payload_size: Option<usize>,
}

async fn bench(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(body): Json<BenchBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Bench, &format!("queues/{}", body.queue))
        .map_err(api_err(&auth))?;
    if body.count == 0 || body.count > 100_000 {
        return Err(api_err(&auth)(QueueError::Validation(
            "count must be 1-100000".to_string(),
        )));
    }
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let ctx = TenantCtx::new(tenant);

    let payload = vec![b'x'; body.payload_size.unwrap_or(64).min(1 << 16)];
    let started = std::time::Instant::now();
    let mut enqueued = 0u32;
    for _ in 0..body.count {
        match state
            .broker
            .enqueue(&ctx, &body.queue, payload.clone(), EnqueueOptions::new())
            .await
        {
            Ok(_) => enqueued += 1,
            Err(e) => return Err(api_err(&auth)(e)),
        }
    }
    let elapsed = started.elapsed();
    Ok(Json(json!({
        "enqueued": enqueued,
        "elapsed_ms": elapsed.as_millis() as u64,
        "jobs_per_second": enqueued as f64 / elapsed.as_secs_f64().max(0.001),
    })))
}

// ---- tenants ----

async fn list_tenants(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "tenants").map_err(api_err(&auth))?;
    let tenants = state.tenants.list().await.map_err(api_err(&auth))?;
    Ok(Json(json!({ "tenants": tenants })))
}

#[derive(Deserialize)]
struct CreateTenantBody {
    id: String,
    #[serde(default)]
    rate_limit_rps: Option<f64>,
    #[serde(default)]
    jobs_per_hour: Option<u64>,
}

async fn create_tenant(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateTenantBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "tenants").map_err(api_err(&auth))?;
    let id: TenantId = body.id.parse().map_err(api_err(&auth))?;
    let mut record = TenantRecord::new(id);
    record.encryption_enabled = state.config.tenancy.encryption_default;
    if let Some(rps) = body.rate_limit_rps {
        record.rate_limit_rps = rps;
    }
    if let Some(jobs) = body.jobs_per_hour {
        record.quotas.jobs_per_hour = jobs.clamp(
            state.config.tenancy.min_jobs_per_hour,
            state.config.tenancy.max_jobs_per_hour,
        );
    }
    state.tenants.create(record.clone()).await.map_err(api_err(&auth))?;
    Ok(Json(json!({ "tenant": record })))
}

async fn get_tenant(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "tenants").map_err(api_err(&auth))?;
    let id: TenantId = id.parse().map_err(api_err(&auth))?;
    let tenant = state.tenants.get(&id).await.map_err(api_err(&auth))?;
    Ok(Json(json!({ "tenant": tenant })))
}

async fn delete_tenant(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<DestructiveBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "tenants").map_err(api_err(&auth))?;
    let resource = format!("tenants/{}", id);

    let reason = match body.check(&state.config.rbac.confirmation_phrase) {
        Ok(reason) => reason.to_string(),
        Err(e) => {
            state.audit.record(
                &auth.request_id,
                &auth.claims.subject,
                "delete_tenant",
                &resource,
                body.reason.as_deref().unwrap_or(""),
                "denied: confirmation missing",
            );
            return Err(api_err(&auth)(e));
        }
    };

    let tenant_id: TenantId = id.parse().map_err(api_err(&auth))?;
    let result = state.tenants.delete(&tenant_id).await;
    let outcome = match &result {
        Ok(()) => "deleted".to_string(),
        Err(e) => format!("failed: {}", e.code()),
    };
    state.audit.record(
        &auth.request_id,
        &auth.claims.subject,
        "delete_tenant",
        &resource,
        &reason,
        &outcome,
    );
    result.map_err(api_err(&auth))?;
    Ok(Json(json!({ "deleted": true })))
}

// ---- workers ----

#[derive(Deserialize)]
struct RegisterWorkerBody {
    id: String,
    version: String,
    #[serde(default)]
    lane: Option<Lane>,
    queues: Vec<String>,
}

async fn register_worker(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RegisterWorkerBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "workers").map_err(api_err(&auth))?;
    let (heartbeat_interval, shutdown_timeout) = state.fleet.register(
        WorkerId::from(body.id.as_str()),
        body.version,
        body.lane.unwrap_or(Lane::Stable),
        body.queues,
    );
    Ok(Json(json!({
        "heartbeat_interval_secs": heartbeat_interval.as_secs(),
        "graceful_shutdown_secs": shutdown_timeout.as_secs(),
    })))
}

#[derive(Deserialize)]
struct HeartbeatBody {
    state: hoist_core::WorkerState,
    #[serde(default)]
    current_job: Option<String>,
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<HeartbeatBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "workers").map_err(api_err(&auth))?;
    let known = state.fleet.heartbeat(
        &WorkerId::from(id.as_str()),
        body.state,
        body.current_job.map(|j| JobId::from(j.as_str())),
    );
    if !known {
        return Err(api_err(&auth)(QueueError::JobNotFound(format!(
            "worker {}",
            id
        ))));
    }
    Ok(Json(json!({ "acknowledged": true })))
}

async fn list_workers(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "workers").map_err(api_err(&auth))?;
    state.fleet.sweep_offline();
    Ok(Json(json!({ "workers": state.fleet.list() })))
}

#[derive(Deserialize)]
struct WorkerActionBody {
    workers: Vec<String>,
    #[serde(default)]
    confirmed: bool,
    #[serde(default)]
    reason: Option<String>,
}

async fn worker_action(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(action): Path<String>,
    Json(body): Json<WorkerActionBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "workers").map_err(api_err(&auth))?;
    let action = match action.as_str() {
        "pause" => ControlAction::Pause,
        "resume" => ControlAction::Resume,
        "drain" => ControlAction::Drain,
        "stop" => ControlAction::Stop,
        "restart" => ControlAction::Restart,
        other => {
            return Err(api_err(&auth)(QueueError::Validation(format!(
                "unknown action '{}'",
                other
            ))))
        }
    };
    let reason = body.reason.unwrap_or_else(|| "unspecified".to_string());
    let targets: Vec<WorkerId> = body
        .workers
        .iter()
        .map(|w| WorkerId::from(w.as_str()))
        .collect();
    let outcomes = state
        .fleet
        .apply(&auth.claims.subject, &reason, action, &targets, body.confirmed)
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "outcomes": outcomes })))
}

#[derive(Deserialize)]
struct RollingRestartBody {
    #[serde(default)]
    lane: Option<Lane>,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    #[serde(default = "default_drain_secs")]
    drain_timeout_secs: u64,
    #[serde(default)]
    reason: Option<String>,
}

fn default_concurrency() -> usize {
    1
}

fn default_drain_secs() -> u64 {
    60
}

async fn rolling_restart(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<RollingRestartBody>,
) -> ApiResult<(axum::http::StatusCode, Json<serde_json::Value>)> {
    auth.authorize(Permission::Mutate, "workers").map_err(api_err(&auth))?;
    let reason = body.reason.unwrap_or_else(|| "rolling restart".to_string());
    let plan = state.fleet.plan_rolling_restart(
        body.lane,
        body.concurrency,
        Duration::from_secs(body.drain_timeout_secs),
    );

    let fleet = state.fleet.clone();
    let actor = auth.claims.subject.clone();
    let phases = plan.phases.len();
    tokio::spawn(async move {
        if let Err(e) = fleet.rolling_restart(&actor, &reason, &plan).await {
            tracing::warn!(error = %e, "rolling restart failed");
        }
    });

    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(json!({ "phases": phases })),
    ))
}

async fn worker_audit(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "workers").map_err(api_err(&auth))?;
    Ok(Json(json!({ "audit": state.fleet.audit_log(100) })))
}

// ---- canary ----

#[derive(Deserialize)]
struct CreateCanaryBody {
    queue: String,
    stable_version: String,
    canary_version: String,
    #[serde(default)]
    strategy: Option<RoutingStrategy>,
    #[serde(default = "default_canary_percent")]
    percent: u8,
    #[serde(default)]
    auto_promote: bool,
}

fn default_canary_percent() -> u8 {
    5
}

async fn create_canary(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CreateCanaryBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "canary").map_err(api_err(&auth))?;
    let deployment = state
        .canary
        .create(
            body.queue,
            body.stable_version,
            body.canary_version,
            body.strategy.unwrap_or(RoutingStrategy::SplitQueue),
            body.percent,
            body.auto_promote,
        )
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "deployment": deployment })))
}

async fn list_canaries(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "canary").map_err(api_err(&auth))?;
    Ok(Json(json!({ "deployments": state.canary.list() })))
}

async fn get_canary(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "canary").map_err(api_err(&auth))?;
    let deployment = state.canary.get(&id).map_err(api_err(&auth))?;
    Ok(Json(json!({ "deployment": deployment })))
}

#[derive(Deserialize)]
struct EvaluateCanaryBody {
    stable: LaneMetrics,
    canary: LaneMetrics,
}

async fn evaluate_canary(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<EvaluateCanaryBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "canary").map_err(api_err(&auth))?;
    let deployment = state
        .canary
        .tick(&id, &body.stable, &body.canary)
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "deployment": deployment })))
}

async fn promote_canary(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "canary").map_err(api_err(&auth))?;
    let deployment = state.canary.promote_step(&id).map_err(api_err(&auth))?;
    Ok(Json(json!({ "deployment": deployment })))
}

#[derive(Deserialize)]
struct RollbackBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn rollback_canary(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(body): Json<RollbackBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "canary").map_err(api_err(&auth))?;
    let reason = body.reason.unwrap_or_else(|| "operator rollback".to_string());
    let deployment = state.canary.rollback(&id, reason).map_err(api_err(&auth))?;
    Ok(Json(json!({ "deployment": deployment })))
}

// ---- anomaly radar ----

async fn radar_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "anomaly-radar").map_err(api_err(&auth))?;
    let now = Utc::now();
    let alerts = state.radar.tick(now);
    let budget = state.radar.budget(now);
    Ok(Json(json!({ "alerts": alerts, "budget": budget })))
}

// ---- capacity ----

#[derive(Deserialize)]
struct CapacityBody {
    /// Arrival rates per interval, oldest first
    series: Vec<f64>,
    /// Completions per second per worker
    service_rate: f64,
    current_workers: u32,
    #[serde(default)]
    constraints: Option<PlanConstraints>,
}

async fn capacity_plan(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<CapacityBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "capacity").map_err(api_err(&auth))?;
    let constraints = body.constraints.unwrap_or_default();
    let plan = state
        .planner
        .plan(&body.series, body.service_rate, body.current_workers, &constraints)
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "plan": plan })))
}

// ---- DLQ ----

#[derive(Deserialize)]
struct DlqQuery {
    queue: String,
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default = "default_dlq_limit")]
    limit: usize,
}

fn default_dlq_limit() -> usize {
    50
}

async fn dlq_entries(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Query(query): Query<DlqQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, &format!("queues/{}", query.queue))
        .map_err(api_err(&auth))?;
    if query.limit == 0 || query.limit > 1000 {
        return Err(api_err(&auth)(QueueError::Validation(
            "limit must be 1-1000".to_string(),
        )));
    }
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let ctx = TenantCtx::new(tenant);

    let cursor = query
        .cursor
        .as_deref()
        .map(Cursor::decode)
        .transpose()
        .map_err(api_err(&auth))?;

    // Read a window past the cursor, ordered by (failed_at, id)
    let window = state
        .broker
        .peek(&ctx, &query.queue, JobSource::DeadLetter, 0, 1000)
        .await
        .map_err(api_err(&auth))?;
    let mut entries: Vec<_> = window
        .into_iter()
        .filter_map(|job| match &job.state {
            hoist_core::JobState::DeadLettered { at, .. } => Some((*at, job)),
            _ => None,
        })
        .filter(|(at, job)| {
            cursor
                .as_ref()
                .map(|c| c.precedes(*at, job.id.as_str()))
                .unwrap_or(true)
        })
        .collect();
    entries.sort_by(|a, b| (a.0, a.1.id.as_str()).cmp(&(b.0, b.1.id.as_str())));
    entries.truncate(query.limit);

    let next_cursor = entries.last().map(|(at, job)| {
        Cursor {
            ts: *at,
            id: job.id.to_string(),
        }
        .encode()
    });
    let jobs: Vec<_> = entries.into_iter().map(|(_, job)| job).collect();
    Ok(Json(json!({ "entries": jobs, "next_cursor": next_cursor })))
}

// ---- DLQ remediation ----

async fn create_rule(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(rule): Json<RemediationRule>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "dlq-remediation").map_err(api_err(&auth))?;
    let id = rule.id.clone();
    state.remediation.add_rule(rule).map_err(api_err(&auth))?;
    Ok(Json(json!({ "rule_id": id })))
}

async fn list_rules(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "dlq-remediation").map_err(api_err(&auth))?;
    Ok(Json(json!({ "rules": state.remediation.list_rules() })))
}

async fn delete_rule(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "dlq-remediation").map_err(api_err(&auth))?;
    if !state.remediation.remove_rule(&id) {
        return Err(api_err(&auth)(QueueError::JobNotFound(format!(
            "rule {}",
            id
        ))));
    }
    Ok(Json(json!({ "deleted": true })))
}

#[derive(Deserialize)]
struct RunRemediationBody {
    queue: String,
    #[serde(default = "default_remediation_batch")]
    batch: usize,
    #[serde(default)]
    dry_run: bool,
}

fn default_remediation_batch() -> usize {
    100
}

async fn run_remediation(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Json(body): Json<RunRemediationBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "dlq-remediation").map_err(api_err(&auth))?;
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok());

    let report = state
        .remediation
        .run(&tenant, &body.queue, body.batch, body.dry_run, idempotency_key)
        .await
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "report": report })))
}

async fn remediation_audit(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "dlq-remediation").map_err(api_err(&auth))?;
    Ok(Json(json!({ "audit": state.remediation.audit_log(200) })))
}

// ---- event hooks ----

async fn create_hook(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(subscription): Json<HookSubscription>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "event-hooks").map_err(api_err(&auth))?;
    let id = state.hooks.subscribe(subscription).map_err(api_err(&auth))?;
    Ok(Json(json!({ "subscription_id": id })))
}

async fn list_hooks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "event-hooks").map_err(api_err(&auth))?;
    // Secrets never leave the process
    let subscriptions: Vec<serde_json::Value> = state
        .hooks
        .subscriptions()
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "url": s.url,
                "events": s.events,
                "queues": s.queues,
                "min_priority": s.min_priority,
                "enabled": s.enabled,
            })
        })
        .collect();
    Ok(Json(json!({ "subscriptions": subscriptions })))
}

async fn delete_hook(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "event-hooks").map_err(api_err(&auth))?;
    if !state.hooks.unsubscribe(&id) {
        return Err(api_err(&auth)(QueueError::JobNotFound(format!(
            "subscription {}",
            id
        ))));
    }
    Ok(Json(json!({ "deleted": true })))
}

async fn dead_hooks(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "event-hooks").map_err(api_err(&auth))?;
    Ok(Json(json!({ "dead": state.hooks.dead_deliveries(100) })))
}

async fn replay_dead_hook(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "event-hooks").map_err(api_err(&auth))?;
    state.hooks.replay_dead(&id).await.map_err(api_err(&auth))?;
    Ok(Json(json!({ "replayed": true })))
}

// ---- exactly-once ----

async fn dead_outbox_events(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "exactly-once").map_err(api_err(&auth))?;
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    let events = state
        .outbox
        .dead_events(tenant.as_str(), 100)
        .await
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "events": events })))
}

async fn replay_outbox_event(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    headers: axum::http::HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Mutate, "exactly-once").map_err(api_err(&auth))?;
    let tenant = tenant_from_headers(&headers).map_err(api_err(&auth))?;
    state
        .outbox
        .replay_dead(tenant.as_str(), &id)
        .await
        .map_err(api_err(&auth))?;
    Ok(Json(json!({ "replayed": true })))
}

// ---- chaos ----

async fn chaos_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::Read, "chaos").map_err(api_err(&auth))?;
    Ok(Json(json!({
        "enabled": state.chaos.is_enabled(),
        "rules": state.chaos.rules(),
    })))
}

#[derive(Deserialize)]
struct ChaosBody {
    #[serde(default)]
    confirmation: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    enabled: bool,
    #[serde(default)]
    rules: Vec<ChaosRuleBody>,
}

#[derive(Deserialize)]
struct ChaosRuleBody {
    point: ChaosPoint,
    scope: ChaosScope,
    #[serde(default)]
    failure_rate: f64,
    #[serde(default)]
    latency_rate: f64,
    #[serde(default)]
    min_latency_ms: u64,
    #[serde(default)]
    max_latency_ms: u64,
}

async fn configure_chaos(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<ChaosBody>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.authorize(Permission::PurgeAll, "chaos").map_err(api_err(&auth))?;

    // Enabling fault injection is destructive by contract
    let destructive = DestructiveBody {
        confirmation: body.confirmation.clone(),
        reason: body.reason.clone(),
    };
    let reason = match destructive.check(&state.config.rbac.confirmation_phrase) {
        Ok(reason) => reason.to_string(),
        Err(e) => {
            state.audit.record(
                &auth.request_id,
                &auth.claims.subject,
                "configure_chaos",
                "chaos",
                body.reason.as_deref().unwrap_or(""),
                "denied: confirmation missing",
            );
            return Err(api_err(&auth)(e));
        }
    };

    for rule in body.rules {
        state.chaos.upsert_rule(ChaosRule {
            point: rule.point,
            scope: rule.scope,
            failure_rate: rule.failure_rate.clamp(0.0, 1.0),
            latency_rate: rule.latency_rate.clamp(0.0, 1.0),
            min_latency: Duration::from_millis(rule.min_latency_ms),
            max_latency: Duration::from_millis(rule.max_latency_ms.max(rule.min_latency_ms)),
        });
    }
    if body.enabled {
        state.chaos.enable();
    } else {
        state.chaos.disable();
    }
    state.audit.record(
        &auth.request_id,
        &auth.claims.subject,
        "configure_chaos",
        "chaos",
        &reason,
        if body.enabled { "enabled" } else { "disabled" },
    );
    Ok(Json(json!({ "enabled": state.chaos.is_enabled() })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destructive_body_contract() {
        let ok = DestructiveBody {
            confirmation: Some("CONFIRM_DELETE".to_string()),
            reason: Some("cleanup".to_string()),
        };
        assert!(ok.check("CONFIRM_DELETE").is_ok());

        for body in [
            DestructiveBody {
                confirmation: None,
                reason: Some("x".to_string()),
            },
            DestructiveBody {
                confirmation: Some("WRONG".to_string()),
                reason: Some("x".to_string()),
            },
            DestructiveBody {
                confirmation: Some("CONFIRM_DELETE".to_string()),
                reason: Some("   ".to_string()),
            },
            DestructiveBody {
                confirmation: Some("CONFIRM_DELETE".to_string()),
                reason: None,
            },
        ] {
            assert!(matches!(
                body.check("CONFIRM_DELETE"),
                Err(QueueError::ConfirmationRequired { .. })
            ));
        }
    }

    #[test]
    fn payload_fingerprint_is_stable() {
        let a = payload_fingerprint(b"hello");
        let b = payload_fingerprint(b"hello");
        let c = payload_fingerprint(b"other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
