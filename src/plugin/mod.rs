//! Catalog plugin system
//!
//! - Rate limiter pacing every remote request per host
//! - Validator for native packages and script catalogs
//! - Installer with staged downloads and atomic placement
//! - Loader producing stubs and hydrated runtime handles
//! - Change bus for install and uninstall notifications
//! - Store holding the live registry of installed catalogs

pub mod events;
pub mod handle;
pub mod installer;
pub mod loader;
pub mod native;
pub mod rate_limit;
pub mod script;
pub mod store;
pub mod transport;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{ChangeNotice, ChangeSubscription, InstallationChangeBus};
pub use handle::{ChapterContent, ChapterRef, NovelDetails, NovelSummary, PluginHandle, SearchPage};
pub use installer::{CatalogInstaller, InstallProgress};
pub use loader::CatalogLoader;
pub use native::NativeHandle;
pub use rate_limit::{Acquire, HostRateState, RateLimiter};
pub use script::ScriptHandle;
pub use store::{CatalogStore, Snapshot};
pub use transport::{HttpTransport, RemoteClient, Transport, TransportResponse};
pub use types::{
    CatalogDescriptor, CatalogKind, CatalogLocal, CatalogMetadata, CatalogOrigin, CatalogRemote, CatalogState,
    ChangeKind, InstallStep, InstallationChangeEvent, PackageId,
};
pub use validator::{CatalogValidator, PackageIntegrityChecker, ValidationOutcome, ZipManifestChecker};
