//! Axum router and all HTTP handlers for qh-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers.  All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.
//!
//! Domain refusals map to 4xx/503 with the tagged `QuotaError` in the body;
//! per-item failures of batch operations come back 200 with a `rejected`
//! list, matching the store semantics.

use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::error;

use qh_audit::VerifyResult;
use qh_schemas::{EntityName, QuotaError};

use crate::{
    api_types::*,
    state::{uptime_secs, AppState, BusMsg},
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/status", get(status_handler))
        .route("/v1/stream", get(stream))
        .route("/v1/entities", post(entities_create))
        .route("/v1/entities/release", post(entities_release))
        .route("/v1/entities/key", post(entities_set_key))
        .route("/v1/limits", post(limits_set))
        .route("/v1/limits/query", post(limits_get))
        .route("/v1/holdings/query", post(holdings_get))
        .route("/v1/holdings/release", post(holdings_release))
        .route("/v1/commissions", post(commission_issue))
        .route("/v1/commissions/pending", get(commissions_pending))
        .route("/v1/commissions/resolve", post(commissions_resolve))
        .route("/v1/commissions/:serial", get(commission_get))
        .route("/v1/commissions/:serial/accept", post(commission_accept))
        .route("/v1/commissions/:serial/reject", post(commission_reject))
        .route("/v1/timeline", get(timeline_get))
        .route("/v1/timeline/verify", get(timeline_verify))
        .route("/v1/reconcile", post(reconcile_now))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn error_status(e: &QuotaError) -> StatusCode {
    match e.kind() {
        "invalid_data" | "no_capacity" | "no_quantity" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::FORBIDDEN,
        "no_entity" | "no_commission" | "no_holding" | "no_policy" => StatusCode::NOT_FOUND,
        "duplicate_entity" | "corrupted" => StatusCode::CONFLICT,
        "service_unavailable" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Map a store failure to a response: domain errors become structured 4xx/503
/// bodies, anything else is a logged 500.
fn fail(err: anyhow::Error) -> Response {
    if let Some(qe) = qh_db::as_quota_error(&err) {
        return (
            error_status(qe),
            Json(ApiErrorBody { error: qe.clone() }),
        )
            .into_response();
    }
    error!(error = %format!("{err:#}"), "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal error" })),
    )
        .into_response()
}

fn bad_name(raw: &str, err: QuotaError) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiErrorBody {
            error: QuotaError::InvalidData {
                reason: format!("invalid entity name {raw:?}: {err}"),
            },
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// GET /v1/health  GET /v1/status
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
        }),
    )
}

pub(crate) async fn status_handler(State(st): State<Arc<AppState>>) -> Response {
    match qh_db::status(&st.pool).await {
        Ok(db) => (
            StatusCode::OK,
            Json(StatusResponse {
                ok: db.ok && db.has_entities_table,
                uptime_secs: uptime_secs(),
                db_ok: db.ok,
                has_schema: db.has_entities_table,
                pending_commissions: db.pending_commissions,
                config_hash: st.config_hash.clone(),
            }),
        )
            .into_response(),
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

pub(crate) async fn entities_create(
    State(st): State<Arc<AppState>>,
    Json(body): Json<CreateEntitiesBody>,
) -> Response {
    match qh_db::create_entities(&st.pool, &body.entities).await {
        Ok(rejected) => (StatusCode::OK, Json(CreateEntitiesResponse { rejected })).into_response(),
        Err(e) => fail(e),
    }
}

pub(crate) async fn entities_release(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ReleaseEntitiesBody>,
) -> Response {
    match qh_db::release_entities(&st.pool, &body.entities).await {
        Ok(rejected) => {
            (StatusCode::OK, Json(ReleaseEntitiesResponse { rejected })).into_response()
        }
        Err(e) => fail(e),
    }
}

pub(crate) async fn entities_set_key(
    State(st): State<Arc<AppState>>,
    Json(body): Json<SetEntityKeyBody>,
) -> Response {
    match qh_db::set_entity_key(&st.pool, &body.entity, &body.old_key, &body.new_key).await {
        Ok(()) => (StatusCode::OK, Json(OkResponse { ok: true })).into_response(),
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

pub(crate) async fn limits_set(
    State(st): State<Arc<AppState>>,
    Json(body): Json<SetLimitsBody>,
) -> Response {
    match qh_db::set_limits(&st.pool, &body.limits).await {
        Ok(rejected) => (StatusCode::OK, Json(SetLimitsResponse { rejected })).into_response(),
        Err(e) => fail(e),
    }
}

pub(crate) async fn limits_get(
    State(st): State<Arc<AppState>>,
    Json(body): Json<GetLimitsBody>,
) -> Response {
    match qh_db::get_limits(&st.pool, &body.policies).await {
        Ok((policies, rejected)) => (
            StatusCode::OK,
            Json(GetLimitsResponse { policies, rejected }),
        )
            .into_response(),
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------------------
// Holdings
// ---------------------------------------------------------------------------

pub(crate) async fn holdings_get(
    State(st): State<Arc<AppState>>,
    Json(body): Json<GetHoldingsBody>,
) -> Response {
    match qh_db::get_holdings(&st.pool, &body.holdings).await {
        Ok((holdings, rejected)) => (
            StatusCode::OK,
            Json(GetHoldingsResponse { holdings, rejected }),
        )
            .into_response(),
        Err(e) => fail(e),
    }
}

pub(crate) async fn holdings_release(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ReleaseHoldingsBody>,
) -> Response {
    match qh_db::release_holdings(&st.pool, &body.holdings).await {
        Ok(rejected) => {
            (StatusCode::OK, Json(ReleaseHoldingsResponse { rejected })).into_response()
        }
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------------------
// Commissions
// ---------------------------------------------------------------------------

pub(crate) async fn commission_issue(
    State(st): State<Arc<AppState>>,
    Json(body): Json<IssueCommissionBody>,
) -> Response {
    match qh_db::issue_commission(
        &st.pool,
        st.tx_options(),
        &body.caller_id,
        &body.client_key,
        &body.provisions,
    )
    .await
    {
        Ok(outcome) => {
            if let Some(serial) = outcome.serial() {
                let _ = st.bus.send(BusMsg::Commission {
                    serial,
                    event: "issued".to_string(),
                });
            }
            (StatusCode::OK, Json(outcome)).into_response()
        }
        Err(e) => fail(e),
    }
}

pub(crate) async fn commission_get(
    State(st): State<Arc<AppState>>,
    Path(serial): Path<i64>,
) -> Response {
    match qh_db::fetch_commission(&st.pool, serial).await {
        Ok(Some(c)) => (
            StatusCode::OK,
            Json(CommissionResponse {
                serial: c.serial,
                caller_id: c.caller_id,
                client_key: c.client_key,
                state: c.state,
                quarantined: c.quarantined,
                created_at: c.created_at,
                resolved_at: c.resolved_at,
                provisions: c.provisions,
            }),
        )
            .into_response(),
        Ok(None) => fail(QuotaError::NoCommission { serial }.into()),
        Err(e) => fail(e),
    }
}

pub(crate) async fn commission_accept(
    State(st): State<Arc<AppState>>,
    Path(serial): Path<i64>,
) -> Response {
    match qh_db::accept_commission(&st.pool, st.tx_options(), serial).await {
        Ok(state) => {
            let _ = st.bus.send(BusMsg::Commission {
                serial,
                event: "accepted".to_string(),
            });
            (StatusCode::OK, Json(ResolutionResponse { serial, state })).into_response()
        }
        Err(e) => fail(e),
    }
}

pub(crate) async fn commission_reject(
    State(st): State<Arc<AppState>>,
    Path(serial): Path<i64>,
) -> Response {
    match qh_db::reject_commission(&st.pool, st.tx_options(), serial).await {
        Ok(state) => {
            let _ = st.bus.send(BusMsg::Commission {
                serial,
                event: "rejected".to_string(),
            });
            (StatusCode::OK, Json(ResolutionResponse { serial, state })).into_response()
        }
        Err(e) => fail(e),
    }
}

pub(crate) async fn commissions_pending(
    State(st): State<Arc<AppState>>,
    Query(q): Query<PendingQuery>,
) -> Response {
    let scope = match q.entity.as_deref() {
        None => None,
        Some(raw) => match EntityName::parse(raw) {
            Ok(name) => Some(name),
            Err(e) => return bad_name(raw, e),
        },
    };
    match qh_db::get_pending_commissions(&st.pool, scope.as_ref()).await {
        Ok(serials) => (StatusCode::OK, Json(PendingResponse { serials })).into_response(),
        Err(e) => fail(e),
    }
}

pub(crate) async fn commissions_resolve(
    State(st): State<Arc<AppState>>,
    Json(body): Json<ResolveBatchBody>,
) -> Response {
    let items: Vec<(i64, qh_engine::Resolution)> = body
        .resolutions
        .iter()
        .map(|r| {
            let res = match r.action {
                ResolveVerb::Accept => qh_engine::Resolution::Accept,
                ResolveVerb::Reject => qh_engine::Resolution::Reject,
            };
            (r.serial, res)
        })
        .collect();

    match qh_db::resolve_pending_commissions(&st.pool, st.tx_options(), &items).await {
        Ok(results) => (StatusCode::OK, Json(ResolveBatchResponse { results })).into_response(),
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

pub(crate) async fn timeline_get(
    State(st): State<Arc<AppState>>,
    Query(q): Query<TimelineQuery>,
) -> Response {
    let entity = match EntityName::parse(&q.entity) {
        Ok(n) => n,
        Err(e) => return bad_name(&q.entity, e),
    };
    match qh_db::get_timeline(&st.pool, &entity, &q.resource, q.after, q.before).await {
        Ok(entries) => (StatusCode::OK, Json(TimelineResponse { entries })).into_response(),
        Err(e) => fail(e),
    }
}

pub(crate) async fn timeline_verify(
    State(st): State<Arc<AppState>>,
    Query(q): Query<VerifyQuery>,
) -> Response {
    let entity = match EntityName::parse(&q.entity) {
        Ok(n) => n,
        Err(e) => return bad_name(&q.entity, e),
    };
    match qh_db::verify_timeline(&st.pool, &entity, &q.resource).await {
        Ok(VerifyResult::Valid { entries }) => (
            StatusCode::OK,
            Json(VerifyResponse {
                valid: true,
                entries: Some(entries),
                broken_id: None,
                reason: None,
            }),
        )
            .into_response(),
        Ok(VerifyResult::Broken { id, reason }) => (
            StatusCode::OK,
            Json(VerifyResponse {
                valid: false,
                entries: None,
                broken_id: Some(id),
                reason: Some(reason),
            }),
        )
            .into_response(),
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------------------
// POST /v1/reconcile
// ---------------------------------------------------------------------------

pub(crate) async fn reconcile_now(State(st): State<Arc<AppState>>) -> Response {
    match crate::state::run_reconcile_pass(&st).await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => fail(e),
    }
}

// ---------------------------------------------------------------------------
// GET /v1/stream  (SSE)
// ---------------------------------------------------------------------------

pub(crate) async fn stream(State(st): State<Arc<AppState>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert("Cache-Control", HeaderValue::from_static("no-cache"));
    headers.insert("Connection", HeaderValue::from_static("keep-alive"));

    let rx = st.bus.subscribe();
    let events = broadcast_to_sse(rx);

    (headers, Sse::new(events).keep_alive(KeepAlive::new())).into_response()
}

fn broadcast_to_sse(
    rx: broadcast::Receiver<BusMsg>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(m) => {
                let event_name = match &m {
                    BusMsg::Heartbeat { .. } => "heartbeat",
                    BusMsg::Commission { .. } => "commission",
                    BusMsg::Reconcile(_) => "reconcile",
                    BusMsg::LogLine { .. } => "log",
                };
                let data = serde_json::to_string(&m).ok()?;
                Some(Ok(Event::default().event(event_name).data(data)))
            }
            Err(_) => None, // lagged / closed
        }
    })
}
