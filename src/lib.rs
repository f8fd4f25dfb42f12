//! Catalog Host Library
//!
//! Lifecycle management for reader catalogs: discovery of installed native
//! and script catalogs, rate-limited installation from remote indexes,
//! progressive background loading and change notification.

pub mod core;
pub mod host;
pub mod plugin;

// Re-export commonly used types
pub use crate::core::{CatalogError, Config};
pub use host::CatalogHost;
pub use plugin::{
    CatalogInstaller, CatalogLoader, CatalogStore, CatalogValidator, InstallationChangeBus, PluginHandle,
    RateLimiter,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias for the binary edge
pub type Result<T> = anyhow::Result<T>;
