//! pictor_core - Core library for the image generation service
//!
//! This crate provides:
//! - Configuration loading and persistence
//! - Weighted prompt parsing
//! - Generated image storage and history

pub mod config;
pub mod outputs;
pub mod prompt;

pub use config::Config;
pub use outputs::{OutputStore, StoredImage};
pub use prompt::{parse_weighted, Fragment};
