// src/utils/mod.rs
//! Utility functions and helpers.
//!
//! This module contains general-purpose utilities used across
//! the server.

pub mod logging;

pub use logging::{init_file_logging, init_logging};
