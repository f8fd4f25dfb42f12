//! Catalog Host command line
//!
//! Inspect, install and query reader catalogs from a terminal.

use catalog_host::core::config::{CliArgs, Command, Config};
use catalog_host::core::Logger;
use catalog_host::plugin::{CatalogState, InstallStep};
use catalog_host::CatalogHost;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use futures::StreamExt;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = CliArgs::parse();

    let config = match Config::load(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            // Logging isn't initialized yet
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    let _logger = match Logger::init(&config.logging) {
        Ok(logger) => logger,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return Err(e);
        }
    };

    info!("Starting Catalog Host v{}", catalog_host::VERSION);
    info!(
        extensions_dir = ?config.catalogs.extensions_dir,
        system_dir = ?config.catalogs.system_dir,
        hydration_workers = config.catalogs.hydration_workers,
        "Catalog configuration"
    );

    let host = CatalogHost::from_config(config)?;
    let result = run(&host, cli.command).await;
    host.shutdown().await;
    result
}

async fn run(host: &CatalogHost, command: Command) -> Result<()> {
    match command {
        Command::List => {
            host.start().await?;
            host.store().wait_hydrated().await;
            for catalog in host.store().list() {
                let d = &catalog.descriptor;
                let state = match &catalog.state {
                    CatalogState::Stub => "stub".to_string(),
                    CatalogState::Hydrated { .. } => "ready".to_string(),
                    CatalogState::Failed { reason } => format!("failed: {}", reason),
                };
                let lang = catalog.metadata().and_then(|m| m.lang.as_deref()).unwrap_or("-");
                println!(
                    "{:<24} {:<28} {:<10} {:<6} {:<6} {:<5} {}",
                    d.package_id, d.display_name, d.version, d.kind, d.origin, lang, state
                );
            }
        }
        Command::Index => {
            host.start().await?;
            host.store().wait_hydrated().await;
            let remotes = host.fetch_index().await?;
            for remote in &remotes {
                let marker = if host.store().get(&remote.package_id).is_none() {
                    ""
                } else if host.store().has_update(&remote.package_id, &remotes) {
                    "update"
                } else {
                    "installed"
                };
                println!(
                    "{:<24} {:<28} {:<10} {}",
                    remote.package_id,
                    remote.display_name(),
                    remote.version,
                    marker
                );
            }
        }
        Command::Install { package_id } => {
            let remote = host.find_remote(&package_id).await?;
            let mut progress = host.installer().install(remote);
            let mut failure = None;
            while let Some(step) = progress.next().await {
                info!(package_id = %package_id, step = step.name(), "Install progress");
                if let InstallStep::Error(reason) = &step {
                    failure = Some(reason.clone());
                }
                println!("{}", step.name());
            }
            if let Some(reason) = failure {
                bail!("installing {} failed: {}", package_id, reason);
            }
        }
        Command::Uninstall { package_id } => {
            if !host.installer().uninstall(&package_id).await? {
                warn!(package_id = %package_id, "Catalog was not installed");
                println!("{} was not installed", package_id);
            }
        }
        Command::Reload { package_id } => {
            host.start().await?;
            host.store().wait_hydrated().await;
            match host.store().reload(&package_id).await {
                Some(catalog) if catalog.is_hydrated() => println!("{} reloaded", package_id),
                Some(catalog) => match &catalog.state {
                    CatalogState::Failed { reason } => bail!("{} failed to load: {}", package_id, reason),
                    _ => bail!("{} did not finish loading", package_id),
                },
                None => bail!("{} is not installed", package_id),
            }
        }
        Command::Search { package_id, query, page } => {
            host.start().await?;
            host.store().wait_hydrated().await;
            let catalog = host
                .store()
                .get(&package_id)
                .ok_or_else(|| anyhow!("{} is not installed", package_id))?;
            let handle = catalog
                .handle()
                .ok_or_else(|| anyhow!("{} is not loaded", package_id))?;
            let results = handle.search(&query, page).await?;
            for item in &results.items {
                println!("{:<40} {}", item.title, item.url);
            }
            if results.has_next_page {
                println!("-- more results on page {} --", page + 1);
            }
        }
    }
    Ok(())
}
