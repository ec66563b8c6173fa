//! Configuration system for Harbor services.
//!
//! Provides runtime settings that persist to disk as RON files, CLI overrides
//! via clap, hot-reload detection, and the serializable enums shared by the
//! transport and service crates.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, DriveMode, NetworkConfig, ServiceConfig, ServiceKind};
pub use error::ConfigError;
