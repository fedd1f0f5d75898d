// rest/mod.rs — Public HTTP API server.
//
// Axum server bridging the rendering front end to the dispatch controller.
//
// Endpoints:
//   POST /api/v1/chat
//   POST /api/v1/reset
//   GET  /api/v1/history/{id}
//   GET  /api/v1/health

pub mod routes;

use anyhow::{Context as _, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::AppContext;

pub async fn start_rest_server(ctx: Arc<AppContext>) -> Result<()> {
    let bind = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address: {bind}"))?;

    let router = build_router(ctx);

    info!("HTTP API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    // ConnectInfo carries the peer address into the identity resolver.
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

pub fn build_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        // Health (no identity, no limiter)
        .route("/api/v1/health", get(routes::health::health))
        // Chat dispatch
        .route("/api/v1/chat", post(routes::chat::chat))
        .route("/api/v1/reset", post(routes::chat::reset))
        .route("/api/v1/history/{id}", get(routes::chat::history))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
