//! Core utilities for the Ember engine.
//!
//! This crate provides the pieces every other Ember crate leans on:
//! - Error types and result aliases
//! - Logging initialization
//! - Frame timing
//! - Engine configuration loaded from TOML

pub mod config;
mod error;
mod logging;
mod timer;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use logging::{DEFAULT_LOG_FILTER, init_logging};
pub use timer::{FrameStats, FrameTimer};
