use axum::{
    extract::{Query, State},
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use super::{ApiError, BaseUrl};
use crate::generator::PromptPair;
use crate::state::AppState;

#[derive(Serialize)]
pub struct GenerateResponse {
    pub image: String,
}

pub async fn generate_json(
    State(state): State<Arc<AppState>>,
    base: BaseUrl,
    Json(pair): Json<PromptPair>,
) -> Result<Json<GenerateResponse>, ApiError> {
    generate(&state, &base, pair).await
}

pub async fn generate_query(
    State(state): State<Arc<AppState>>,
    base: BaseUrl,
    Query(pair): Query<PromptPair>,
) -> Result<Json<GenerateResponse>, ApiError> {
    generate(&state, &base, pair).await
}

async fn generate(
    state: &AppState,
    base: &BaseUrl,
    pair: PromptPair,
) -> Result<Json<GenerateResponse>, ApiError> {
    let generation = state.generator.generate(pair).await?;
    Ok(Json(GenerateResponse {
        image: generation.image.url(base.as_str()),
    }))
}
