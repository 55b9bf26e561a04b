//! Axum-based WebSocket server.

use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::connection::{handle_ws_connection, WsParams};
use crate::state::GatewayState;

/// Start the gateway WebSocket server.
///
/// With the `tls` feature enabled and certificate paths configured, the
/// listener terminates TLS itself; otherwise it serves plain HTTP.
pub async fn start_gateway(state: Arc<GatewayState>, port: u16) -> anyhow::Result<()> {
    let host = state
        .config
        .gateway
        .as_ref()
        .and_then(|g| g.bind.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());

    let app = router(state.clone());
    let addr = format!("{host}:{port}");

    #[cfg(feature = "tls")]
    if let Some(tls) = state
        .config
        .gateway
        .as_ref()
        .and_then(|g| g.tls.as_ref())
        .cloned()
    {
        return serve_tls(state, app, &addr, tls).await;
    }

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gateway listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

#[cfg(feature = "tls")]
async fn serve_tls(
    state: Arc<GatewayState>,
    app: Router,
    addr: &str,
    tls: cartwheel_core::config::TlsConfig,
) -> anyhow::Result<()> {
    use anyhow::Context;

    let rustls =
        axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
            .await
            .with_context(|| {
                format!("loading TLS material from {} / {}", tls.cert_path, tls.key_path)
            })?;
    let addr: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("TLS listener needs a socket address, got {addr}"))?;

    let handle = axum_server::Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        async move {
            shutdown_signal(state).await;
            handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
        }
    });

    info!("gateway listening on {addr} (tls)");
    axum_server::bind_rustls(addr, rustls)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;
    Ok(())
}

fn router(state: Arc<GatewayState>) -> Router {
    let router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler));

    #[cfg(feature = "metrics")]
    let router = {
        let handle = crate::metrics::install_prometheus_recorder();
        router.route("/metrics", get(move || std::future::ready(handle.render())))
    };

    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<Arc<GatewayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(state, socket, params))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.len(),
    }))
}

/// Resolves on ctrl-c; live sessions are cancelled so their connections
/// drain and the graceful shutdown can complete.
async fn shutdown_signal(state: Arc<GatewayState>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C handler");
    info!("shutdown signal received, winding down sessions");
    state.sessions.cancel_all();
}
