//! Common utilities and types shared across the SFU signaling crates.

#![warn(clippy::pedantic)]

/// Module for common error types
pub mod error;

/// Module for identifier and media types
pub mod types;

/// Module for common configuration
pub mod config;
