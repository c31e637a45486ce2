//! Shared types, configuration and errors for the Quire client crates.

pub mod config;
pub mod error;
pub mod types;
