//! Core types and utilities for converge
//!
//! # Modules
//!
//! - `config`: Environment and engine configuration
//! - `error`: Error taxonomy and Result alias
//! - `types`: State, field difference and async job types shared by the
//!   engine and its remote collaborators

pub mod config;
pub mod error;
pub mod types;

// Re-exports
pub use config::{ApiConfig, EngineConfig, ReconcileConfig};
pub use error::{Error, Result};
pub use types::*;
