// src/config/mod.rs

//! Configuration loading and validation for chunkdag.
//!
//! - `model.rs`: the TOML-backed data model.
//! - `loader.rs`: reading a config file from disk.
//! - `validate.rs`: turning a raw file into a [`ConfigFile`].

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, parse_str};
pub use model::{ConfigFile, ExecutorSection, NodeConfig, RawConfigFile, ResumeSection, StageConfig};
