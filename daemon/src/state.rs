use crate::generator::Generator;
use pictor_core::OutputStore;
use std::sync::Arc;

/// Shared handler state: the configured generator and the store it writes to
pub struct AppState {
    pub generator: Generator,
    pub store: Arc<OutputStore>,
}

impl AppState {
    pub fn new(generator: Generator) -> Self {
        let store = generator.store().clone();
        Self { generator, store }
    }
}
