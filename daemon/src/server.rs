use anyhow::Result;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::state::AppState;

/// Full application router with CORS and request tracing
pub fn app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api::routes(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_server(addr: SocketAddr, state: AppState) -> Result<()> {
    let app = app(Arc::new(state));

    tracing::info!("Starting daemon on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
