// src/config/mod.rs

//! Configuration loading and validation for jobtrain.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a config file from disk (`loader.rs`).
//! - Validate it and build typed job specs and steps (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path};
pub use model::{ConfigFile, EngineSettings, JobConfig, JobKindConfig, RawConfigFile, StepConfig};
pub use validate::parse_duration;
