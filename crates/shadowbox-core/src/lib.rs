//! ShadowBox core primitives and shared types.

#![deny(unsafe_code)]

pub mod config;
pub mod entity;
pub mod error;
pub mod ids;

pub use config::Config;
pub use error::Error;

/// Version of the ShadowBox core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;
