//! pictor_daemon - HTTP server for image generation
//!
//! This crate provides the daemon server that:
//! - Exposes generation, history and stored image endpoints
//! - Serializes model invocations behind a single admission gate
//! - Bounds every request with a deadline

pub mod api;
pub mod generator;
pub mod server;
pub mod state;

#[cfg(test)]
mod testing;

pub use generator::{Generation, GenerateError, Generator, PromptPair};
pub use server::{app, run_server};
pub use state::AppState;
