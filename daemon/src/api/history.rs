use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use super::{ApiError, BaseUrl};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HistoryResponse {
    pub history: Vec<String>,
}

/// URLs of every stored image, newest first
pub async fn history(
    State(state): State<Arc<AppState>>,
    base: BaseUrl,
) -> Result<Json<HistoryResponse>, ApiError> {
    let store = state.store.clone();
    let images = tokio::task::spawn_blocking(move || store.list_history())
        .await
        .map_err(|e| ApiError::internal(e.into()))?
        .map_err(ApiError::internal)?;

    Ok(Json(HistoryResponse {
        history: images.iter().map(|image| image.url(base.as_str())).collect(),
    }))
}
