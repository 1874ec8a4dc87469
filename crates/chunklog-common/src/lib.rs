//! Chunklog Common - Shared types and utilities
//!
//! This crate provides the log metadata model, chunk addressing, engine
//! configuration and error definitions used across all chunklog components.

pub mod config;
pub mod error;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use types::*;
