//! Hearth - Home Automation Hub
//!
//! This crate provides the hub application around `hearth_runtime`:
//! - Layered configuration (figment)
//! - redb-backed device persistence
//! - The built-in `hub` plugin and its actions
//! - [`Hub`], which assembles and shuts down every engine

// Re-export the runtime
pub use hearth_runtime;

pub mod builtin;
pub mod config;
pub mod hub;
pub mod store;

pub use config::HubConfig;
pub use hub::Hub;
