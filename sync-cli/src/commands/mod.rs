//! CLI command implementations.

pub mod cache_demo;
pub mod check_config;
pub mod simulate;
