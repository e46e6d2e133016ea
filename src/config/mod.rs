// src/config/mod.rs
//! Configuration module for the tunnel server.
//!
//! This module manages command line settings, constants, and the server
//! settings loaded from the configuration file.

pub mod constants;
pub mod defaults;
pub mod settings;

pub use settings::{ConfigError, ServerArgs, ServerSettings};
