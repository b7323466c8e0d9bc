//! Shared runtime state for qh-daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum. The state owns the
//! database pool, the SSE broadcast bus and the reconciliation probe; the
//! background tasks at the bottom of this module are spawned by `main.rs`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::{info, warn};

use qh_config::ServiceConfig;
use qh_engine::Resolution;
use qh_reconcile::{CallerProbe, PendingCommission, ReconcileAction, ReconcileReport};

// ---------------------------------------------------------------------------
// BusMsg — SSE event bus payload
// ---------------------------------------------------------------------------

/// Messages broadcast over the internal event bus and surfaced as SSE events.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMsg {
    Heartbeat { ts_millis: i64 },
    /// A commission changed state: event is "issued" | "accepted" | "rejected".
    Commission { serial: i64, event: String },
    Reconcile(ReconcileReport),
    LogLine { level: String, msg: String },
}

// ---------------------------------------------------------------------------
// BuildInfo
// ---------------------------------------------------------------------------

/// Static build metadata included in health / status responses.
#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// AppState
// ---------------------------------------------------------------------------

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub pool: PgPool,
    /// Broadcast bus for SSE.
    pub bus: broadcast::Sender<BusMsg>,
    /// Static build metadata.
    pub build: BuildInfo,
    pub settings: ServiceConfig,
    /// Hash of the loaded configuration, if one was loaded.
    pub config_hash: Option<String>,
    /// System-of-record probe consulted for overdue commissions. Defaults to
    /// [`qh_reconcile::NeverConfirm`]: report, never auto-resolve.
    pub probe: Arc<dyn CallerProbe + Send + Sync>,
}

impl AppState {
    pub fn new(pool: PgPool, settings: ServiceConfig, config_hash: Option<String>) -> Self {
        let (bus, _rx) = broadcast::channel::<BusMsg>(1024);
        Self {
            pool,
            bus,
            build: BuildInfo {
                service: "qh-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
            settings,
            config_hash,
            probe: Arc::new(qh_reconcile::NeverConfirm),
        }
    }

    /// Transaction knobs derived from the service configuration.
    pub fn tx_options(&self) -> qh_db::TxOptions {
        qh_db::TxOptions {
            lock_timeout_ms: self.settings.lock_timeout_ms,
            retry_limit: self.settings.issue_retry_limit,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monotonically increasing uptime since first call (process lifetime).
pub fn uptime_secs() -> u64 {
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    START
        .get_or_init(std::time::Instant::now)
        .elapsed()
        .as_secs()
}

/// Spawn a background task that emits a heartbeat SSE every `interval`.
pub fn spawn_heartbeat(bus: broadcast::Sender<BusMsg>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let ts = chrono::Utc::now().timestamp_millis();
            let _ = bus.send(BusMsg::Heartbeat { ts_millis: ts });
        }
    });
}

/// Spawn a background task that runs one reconcile pass every `interval`.
///
/// Failures are logged and the loop keeps ticking; a broken tick must never
/// take the daemon down.
pub fn spawn_reconcile_tick(state: Arc<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = run_reconcile_pass(&state).await {
                warn!(error = %format!("{e:#}"), "reconcile tick failed");
            }
        }
    });
}

/// One reconcile pass: scan pending commissions, plan against the probe,
/// execute confirmed resolutions, broadcast the report.
///
/// The scan is read-only and the probe runs with no row lock held; each
/// confirmed resolution opens its own short transaction.
pub async fn run_reconcile_pass(state: &AppState) -> Result<ReconcileReport> {
    let rows = qh_db::pending_rows(&state.pool).await?;
    let pending: Vec<PendingCommission> = rows
        .into_iter()
        .map(|r| PendingCommission {
            serial: r.serial,
            caller_id: r.caller_id,
            client_key: r.client_key,
            created_at: r.created_at,
            quarantined: r.quarantined,
        })
        .collect();

    let threshold = chrono::Duration::seconds(state.settings.pending_age_threshold_secs);
    let report = qh_reconcile::plan(&pending, chrono::Utc::now(), threshold, state.probe.as_ref());

    if !report.actions.is_empty() {
        let items: Vec<(i64, Resolution)> = report
            .actions
            .iter()
            .map(|a| match a {
                ReconcileAction::Accept { serial } => (*serial, Resolution::Accept),
                ReconcileAction::Reject { serial } => (*serial, Resolution::Reject),
            })
            .collect();
        let results =
            qh_db::resolve_pending_commissions(&state.pool, state.tx_options(), &items).await?;
        for r in &results {
            let _ = state.bus.send(BusMsg::Commission {
                serial: r.serial,
                event: "reconciled".to_string(),
            });
        }
    }

    info!(
        run_id = %report.run_id,
        scanned = report.scanned,
        overdue = report.overdue.len(),
        actions = report.actions.len(),
        unconfirmed = report.unconfirmed.len(),
        quarantined = report.quarantined.len(),
        "reconcile pass complete"
    );
    let _ = state.bus.send(BusMsg::Reconcile(report.clone()));
    Ok(report)
}
