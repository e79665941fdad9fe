mod base_url;
mod error;
pub mod generate;
pub mod history;

use axum::{routing::get, Router};
use pictor_core::outputs::OUTPUTS_ROUTE;
use tower_http::services::ServeDir;

use crate::state::AppState;
use std::sync::Arc;

pub use base_url::BaseUrl;
pub use error::ApiError;

pub fn routes(state: Arc<AppState>) -> Router {
    let outputs = ServeDir::new(state.store.dir().to_path_buf());

    Router::new()
        .route("/health", get(health))
        .route(
            "/generate",
            get(generate::generate_query).post(generate::generate_json),
        )
        .route("/history", get(history::history))
        .nest_service(OUTPUTS_ROUTE, outputs)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}
