//! qh-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads configuration,
//! connects the pool, runs migrations, wires middleware, and starts the HTTP
//! server.  All route handlers live in `routes.rs`; all shared state types
//! live in `state.rs`.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use qh_daemon::{routes, state};
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let (settings, config_hash) = match std::env::var("QH_CONFIG") {
        Ok(paths) => {
            let parts: Vec<&str> = paths.split(':').filter(|p| !p.is_empty()).collect();
            let loaded = qh_config::load_layered_yaml(&parts)
                .context("failed to load QH_CONFIG yaml layers")?;
            info!(config_hash = %loaded.config_hash, "configuration loaded");
            (loaded.settings, Some(loaded.config_hash))
        }
        Err(_) => (qh_config::ServiceConfig::default(), None),
    };

    let pool = qh_db::connect_from_env().await?;
    qh_db::migrate(&pool).await?;

    let shared = Arc::new(state::AppState::new(pool, settings, config_hash));

    state::spawn_heartbeat(shared.bus.clone(), Duration::from_secs(1));
    state::spawn_reconcile_tick(
        Arc::clone(&shared),
        Duration::from_secs(shared.settings.reconcile_interval_secs),
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_localhost_only());

    let addr = bind_addr(&shared).unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8877)));
    info!("qh-daemon listening on http://{}", addr);

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// QH_DAEMON_ADDR wins over the configured bind address.
fn bind_addr(st: &state::AppState) -> Option<SocketAddr> {
    if let Ok(raw) = std::env::var("QH_DAEMON_ADDR") {
        return raw.parse().ok();
    }
    st.settings.bind_addr.as_deref()?.parse().ok()
}

/// CORS: allow only localhost origins.
fn cors_localhost_only() -> CorsLayer {
    let allowed_origins = [
        "http://localhost",
        "http://127.0.0.1",
        "http://localhost:3000",
        "http://127.0.0.1:3000",
        "http://localhost:5173",
        "http://127.0.0.1:5173",
    ];

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
