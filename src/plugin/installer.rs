//! Catalog installation
//!
//! `install` downloads a remote catalog into a private staging directory,
//! validates it there and renames the whole staging directory into
//! `<extensions_dir>/<id>/`. Progress is reported as a stream of
//! [`InstallStep`]s ending in `Completed` or `Error`.
//!
//! Staging files are removed on every exit path: errors, cancellation,
//! a dropped progress stream and panics all go through [`StagingDir`]'s drop.
//! Installs and uninstalls of the same package id are serialized.

use futures::Stream;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::events::InstallationChangeBus;
use super::transport::RemoteClient;
use super::types::{
    CatalogKind, CatalogMetadata, CatalogRemote, ChangeKind, InstallStep, InstallationChangeEvent,
    PackageId, ICON_EXTENSION, MANIFEST_FILE, REMOTE_MARKER,
};
use super::validator::{sha256_hex, CatalogValidator};
use crate::core::error::{CatalogError, ErrorContext, Result};

/// Downloads, validates and places catalogs; removes them again
#[derive(Clone)]
pub struct CatalogInstaller {
    extensions_dir: PathBuf,
    staging_dir: PathBuf,
    client: RemoteClient,
    validator: CatalogValidator,
    bus: InstallationChangeBus,
    locks: LockMap,
}

type LockMap = Arc<StdMutex<HashMap<PackageId, Arc<Mutex<()>>>>>;

/// Package ids become directory names; keep them to one plain path segment
fn check_package_id(package_id: &str) -> Result<()> {
    let ok = !package_id.is_empty()
        && !package_id.starts_with('.')
        && package_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if ok {
        Ok(())
    } else {
        Err(CatalogError::ValidationFailed(format!("invalid package id {:?}", package_id)))
    }
}

impl CatalogInstaller {
    /// Create an installer; leftovers of interrupted installs are removed
    pub fn new(
        extensions_dir: PathBuf,
        staging_dir: PathBuf,
        client: RemoteClient,
        validator: CatalogValidator,
        bus: InstallationChangeBus,
    ) -> Result<Self> {
        fs::create_dir_all(&extensions_dir).context("creating extensions directory")?;
        if staging_dir.exists() {
            fs::remove_dir_all(&staging_dir).context("clearing staging directory")?;
        }
        fs::create_dir_all(&staging_dir).context("creating staging directory")?;

        Ok(Self {
            extensions_dir,
            staging_dir,
            client,
            validator,
            bus,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        })
    }

    fn lock_for(&self, package_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(locks.entry(package_id.to_string()).or_default())
    }

    async fn acquire(&self, package_id: &str) -> PackageLock {
        let guard = self.lock_for(package_id).lock_owned().await;
        PackageLock {
            package_id: package_id.to_string(),
            locks: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    /// Install `remote`; dropping the returned stream cancels the install
    pub fn install(&self, remote: CatalogRemote) -> InstallProgress {
        let token = CancellationToken::new();
        let guard = token.clone().drop_guard();
        let mut progress = self.install_with_cancel(remote, token);
        progress.guard = Some(guard);
        progress
    }

    /// Install `remote`, cancelled when `token` fires.
    ///
    /// A cancelled install still cleans up and ends with an `Error` step.
    pub fn install_with_cancel(&self, remote: CatalogRemote, token: CancellationToken) -> InstallProgress {
        let (tx, rx) = mpsc::channel(8);
        let installer = self.clone();

        tokio::spawn(async move {
            let package_id = remote.package_id.clone();
            let prepared = tokio::select! {
                biased;
                _ = token.cancelled() => Err(CatalogError::Cancelled(format!("install of {}", package_id))),
                prepared = installer.prepare(&remote, &tx) => prepared,
            };
            // Once staged and validated, the move into place is not interrupted.
            let result = match prepared {
                Ok(prepared) => installer.commit(prepared).await,
                Err(e) => Err(e),
            };

            let step = match result {
                Ok(()) => {
                    info!(package_id = %package_id, version = %remote.version, "Catalog installed");
                    InstallStep::Completed
                }
                Err(e) => {
                    warn!(package_id = %package_id, error_type = e.error_type(), error = %e, "Catalog install failed");
                    InstallStep::Error(e.to_string())
                }
            };
            let _ = tx.send(step).await;
        });

        InstallProgress { rx, guard: None }
    }

    /// Download and validate into staging, holding the package lock
    async fn prepare(&self, remote: &CatalogRemote, steps: &mpsc::Sender<InstallStep>) -> Result<Prepared> {
        let package_id = remote.package_id.as_str();
        check_package_id(package_id)?;

        let lock = self.acquire(package_id).await;
        let _ = steps.send(InstallStep::Downloading).await;

        let staging = StagingDir::create(&self.staging_dir, package_id)?;
        let kind = remote.kind();
        let artifact = staging.path().join(format!("{}.{}", package_id, kind.file_extension()));

        let payload = self.client.fetch(&remote.package_url).await?;
        if let Some(expected) = &remote.checksum {
            let actual = sha256_hex(&payload);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(CatalogError::ValidationFailed(format!(
                    "payload checksum {} does not match index {}",
                    actual, expected
                )));
            }
        }
        tokio::fs::write(&artifact, &payload).await?;
        debug!(package_id = %package_id, bytes = payload.len(), "Package staged");

        if let Some(icon_url) = &remote.icon_url {
            match self.client.fetch(icon_url).await {
                Ok(icon) => {
                    let icon_path = staging.path().join(format!("{}.{}", package_id, ICON_EXTENSION));
                    tokio::fs::write(icon_path, &icon).await?;
                }
                Err(e) => warn!(package_id = %package_id, error = %e, "Icon download failed, continuing"),
            }
        }

        let _ = steps.send(InstallStep::Installing).await;

        if kind == CatalogKind::Script {
            let manifest = CatalogMetadata::new(package_id, remote.display_name(), &remote.version);
            tokio::fs::write(staging.path().join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?).await?;
        }

        let metadata = self.validator.validate(&artifact, kind).await.into_result()?;
        if metadata.id != package_id {
            return Err(CatalogError::ValidationFailed(format!(
                "package declares id {} but index lists {}",
                metadata.id, package_id
            )));
        }
        tokio::fs::write(staging.path().join(REMOTE_MARKER), remote.version.as_bytes()).await?;

        Ok(Prepared {
            package_id: package_id.to_string(),
            staging,
            _lock: lock,
        })
    }

    /// Rename the staged directory into place and announce it
    async fn commit(&self, prepared: Prepared) -> Result<()> {
        let Prepared { package_id, staging, _lock } = prepared;

        let staged = staging.path().to_path_buf();
        let target = self.extensions_dir.join(&package_id);
        let scratch = self.staging_dir.clone();
        tokio::task::spawn_blocking(move || replace_dir(&staged, &target, &scratch))
            .await
            .map_err(|e| CatalogError::FilesystemError(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
        staging.disarm();

        self.bus
            .publish(InstallationChangeEvent::new(package_id, ChangeKind::LocalInstall));
        Ok(())
    }

    /// Remove an installed catalog; `false` if nothing was installed
    pub async fn uninstall(&self, package_id: &str) -> Result<bool> {
        check_package_id(package_id)?;
        let _lock = self.acquire(package_id).await;

        let target = self.extensions_dir.join(package_id);
        match tokio::fs::metadata(&target).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        tokio::fs::remove_dir_all(&target)
            .await
            .with_context(|| format!("removing {}", target.display()))?;
        info!(package_id = %package_id, "Catalog uninstalled");

        self.bus
            .publish(InstallationChangeEvent::new(package_id, ChangeKind::LocalUninstall));
        Ok(true)
    }
}

/// A validated install waiting to be moved into place
struct Prepared {
    package_id: PackageId,
    staging: StagingDir,
    _lock: PackageLock,
}

/// Exclusive hold on one package id. The id leaves the lock map when its
/// last holder or waiter is gone.
struct PackageLock {
    package_id: PackageId,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for PackageLock {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let idle = locks
            .get(&self.package_id)
            .map(|lock| Arc::strong_count(lock) == 1)
            .unwrap_or(false);
        if idle {
            locks.remove(&self.package_id);
        }
    }
}

/// Move `staged` to `target` by rename, swapping out any previous install.
///
/// The previous directory is parked under `scratch` and restored if the
/// rename fails.
fn replace_dir(staged: &Path, target: &Path, scratch: &Path) -> Result<()> {
    let parked = if target.exists() {
        let parked = scratch.join(format!("previous-{}", uuid::Uuid::new_v4()));
        fs::rename(target, &parked).context("parking previous install")?;
        Some(parked)
    } else {
        None
    };

    if let Err(e) = fs::rename(staged, target) {
        if let Some(parked) = &parked {
            if let Err(restore) = fs::rename(parked, target) {
                warn!(path = ?target, error = %restore, "Failed to restore previous install");
            }
        }
        return Err(CatalogError::FilesystemError(e));
    }

    if let Some(parked) = parked {
        if let Err(e) = fs::remove_dir_all(&parked) {
            warn!(path = ?parked, error = %e, "Failed to remove previous install");
        }
    }
    Ok(())
}

/// Per-install staging directory, deleted on drop unless disarmed
struct StagingDir {
    path: PathBuf,
    armed: bool,
}

impl StagingDir {
    fn create(root: &Path, package_id: &str) -> Result<Self> {
        let path = root.join(format!("{}-{}", package_id, uuid::Uuid::new_v4()));
        fs::create_dir_all(&path).context("creating staging directory")?;
        Ok(Self { path, armed: true })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// The directory has been moved into place; nothing to delete
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = ?self.path, error = %e, "Failed to remove staging directory");
                }
            } else {
                debug!(path = ?self.path, "Staging directory removed");
            }
        }
    }
}

/// Stream of install steps; the last item is `Completed` or `Error`
pub struct InstallProgress {
    rx: mpsc::Receiver<InstallStep>,
    guard: Option<DropGuard>,
}

impl InstallProgress {
    /// Drive the install to its end and return every step
    pub async fn finish(mut self) -> Vec<InstallStep> {
        let mut steps = Vec::new();
        while let Some(step) = self.rx.recv().await {
            steps.push(step);
        }
        steps
    }
}

impl Stream for InstallProgress {
    type Item = InstallStep;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<InstallStep>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
