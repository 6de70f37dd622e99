//! Configuration module for loopcast
//!
//! Handles loading configuration from TOML files, environment variable overrides
//! and validation of the static settings read at startup.

pub mod config;

pub use config::*;
