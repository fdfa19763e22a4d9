//! Configuration module for HandForge
//!
//! Handles loading the settings snapshot from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
