//! Wiring of the catalog subsystem
//!
//! [`CatalogHost`] builds every component from a [`Config`] and hands out
//! shared references. There is no global instance; whoever needs the store
//! or the installer gets it from the host they were given.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::core::config::Config;
use crate::core::error::{CatalogError, Result};
use crate::plugin::{
    CatalogInstaller, CatalogLoader, CatalogRemote, CatalogStore, CatalogValidator, HttpTransport,
    InstallationChangeBus, RateLimiter, RemoteClient, Transport, ZipManifestChecker,
};

pub struct CatalogHost {
    config: Config,
    client: RemoteClient,
    bus: InstallationChangeBus,
    installer: CatalogInstaller,
    store: CatalogStore,
}

impl CatalogHost {
    /// Build the subsystem talking to the network over HTTP
    pub fn from_config(config: Config) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config.network)?);
        Self::with_transport(config, transport)
    }

    /// Build the subsystem on top of any [`Transport`]
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        let rate_limiter = RateLimiter::new(config.rate_limit.clone());
        let client = RemoteClient::new(
            transport,
            rate_limiter,
            Duration::from_secs(config.network.request_timeout),
        );

        let checker = ZipManifestChecker::new(config.catalogs.min_lib_version, config.catalogs.max_lib_version);
        let validator = CatalogValidator::new(Arc::new(checker));
        let bus = InstallationChangeBus::new();

        let installer = CatalogInstaller::new(
            config.catalogs.extensions_dir.clone(),
            config.staging_dir(),
            client.clone(),
            validator.clone(),
            bus.clone(),
        )?;
        let loader = CatalogLoader::new(
            config.catalogs.extensions_dir.clone(),
            config.catalogs.system_dir.clone(),
            validator,
        );
        let store = CatalogStore::new(
            loader,
            config.catalogs.hydration_workers,
            config.catalogs.pinned.clone(),
        );

        Ok(Self {
            config,
            client,
            bus,
            installer,
            store,
        })
    }

    /// Publish installed catalogs and begin background hydration
    pub async fn start(&self) -> Result<()> {
        info!(
            extensions_dir = ?self.config.catalogs.extensions_dir,
            workers = self.config.catalogs.hydration_workers,
            "Starting catalog host"
        );
        self.store.start(&self.bus).await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn installer(&self) -> &CatalogInstaller {
        &self.installer
    }

    pub fn bus(&self) -> &InstallationChangeBus {
        &self.bus
    }

    pub fn client(&self) -> &RemoteClient {
        &self.client
    }

    /// Fetch the configured remote index
    pub async fn fetch_index(&self) -> Result<Vec<CatalogRemote>> {
        let url = self
            .config
            .network
            .index_url
            .as_deref()
            .ok_or_else(|| CatalogError::Config("no index_url configured".to_string()))?;
        self.client.fetch_index(url).await
    }

    /// Look up one catalog in the remote index
    pub async fn find_remote(&self, package_id: &str) -> Result<CatalogRemote> {
        self.fetch_index()
            .await?
            .into_iter()
            .find(|r| r.package_id == package_id)
            .ok_or_else(|| CatalogError::NotFound(format!("{} is not in the remote index", package_id)))
    }

    pub async fn shutdown(&self) {
        self.store.shutdown().await;
    }
}
