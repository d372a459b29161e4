//! DexPulse - Realtime backend for the DexPulse trading UI
//! Mission: one resilient upstream connection, any number of client streams
//!
//! The HTTP surface is deliberately small: the SSE stream, its polling
//! fallback, and a health check. Everything stateful lives in the
//! RealtimeHub constructed here and injected into the router.

use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::Path;
use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dexpulse_backend::api;
use dexpulse_backend::realtime::RealtimeHub;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment and logging
    load_env();
    init_tracing();

    info!("🚀 DexPulse realtime backend starting");

    // The broker URL may embed credentials; keep it out of the logs.
    let upstream_url = env::var("UPSTREAM_WS_URL")
        .unwrap_or_else(|_| "ws://127.0.0.1:6001/stream".to_string());

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(3000);

    // The hub owns all realtime state; the upstream connection itself is
    // dialed lazily when the first client stream opens.
    let realtime = RealtimeHub::new(upstream_url);

    let app = api::create_router(Arc::clone(&realtime))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("shutdown signal received, closing upstream connection");
    realtime.shutdown();

    Ok(())
}

/// Resolves on SIGINT or, on unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dexpulse_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also try repo-root .env (common when running with --manifest-path
    // from elsewhere). CARGO_MANIFEST_DIR points at the crate root at
    // compile time.
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));

    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];

    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
