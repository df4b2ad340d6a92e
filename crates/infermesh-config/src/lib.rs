//! # InferMesh Config
//!
//! Configuration schema for the proxy, plus a JSON file loader with
//! environment overrides. The full configuration is immutable once
//! loaded; admin-applied updates swap a fresh snapshot through
//! [`ConfigHandle`] so readers are never blocked.

pub mod error;
pub mod loader;
pub mod schema;

pub use error::ConfigError;
pub use loader::{load_file, ConfigHandle};
pub use schema::*;
