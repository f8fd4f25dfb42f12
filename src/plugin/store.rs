//! The catalog registry
//!
//! [`CatalogStore`] is the one owner of the installed-catalog map. The map is
//! an immutable snapshot behind a `watch` channel: every mutation builds a
//! new snapshot and swaps it in, so readers always see whole entries and
//! subscribers are told about every change.
//!
//! On start the store lists stubs straight from the filesystem, then
//! hydrates them in the background with a bounded number of workers. It
//! follows the [`InstallationChangeBus`] to pick up installs and removals,
//! and rescans everything when the bus reports that events were missed.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{ChangeNotice, ChangeSubscription, InstallationChangeBus};
use super::loader::CatalogLoader;
use super::types::{CatalogLocal, CatalogRemote, ChangeKind, InstallationChangeEvent, PackageId};
use crate::core::error::Result;

/// Immutable view of the registry at one instant
pub type Snapshot = Arc<BTreeMap<PackageId, CatalogLocal>>;

/// Shared handle to the catalog registry
#[derive(Clone)]
pub struct CatalogStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    catalogs: watch::Sender<Snapshot>,
    loader: CatalogLoader,
    loading: StdMutex<HashSet<PackageId>>,
    pinned: StdMutex<BTreeSet<PackageId>>,
    hydration_permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    hydration: StdMutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CatalogStore {
    /// Create an empty store; nothing is scanned until [`CatalogStore::start`]
    pub fn new(loader: CatalogLoader, hydration_workers: usize, pinned: Vec<PackageId>) -> Self {
        let (catalogs, _) = watch::channel(Snapshot::default());
        Self {
            inner: Arc::new(StoreInner {
                catalogs,
                loader,
                loading: StdMutex::new(HashSet::new()),
                pinned: StdMutex::new(pinned.into_iter().collect()),
                hydration_permits: Arc::new(Semaphore::new(hydration_workers.max(1))),
                shutdown: CancellationToken::new(),
                hydration: StdMutex::new(None),
            }),
        }
    }

    /// Publish stubs for everything installed, then hydrate in the background
    /// and follow `bus` for changes. Returns once the stubs are visible.
    pub async fn start(&self, bus: &InstallationChangeBus) -> Result<()> {
        // Subscribe first so nothing published during the scan is missed.
        let subscription = bus.subscribe();
        self.spawn_listener(subscription);

        let stubs = self.inner.loader.scan_stubs().await?;
        self.inner.catalogs.send_modify(|snapshot| {
            let mut next = (**snapshot).clone();
            for descriptor in stubs {
                next.entry(descriptor.package_id.clone())
                    .or_insert_with(|| CatalogLocal::stub(descriptor));
            }
            *snapshot = Arc::new(next);
        });
        info!(count = self.inner.catalogs.borrow().len(), "Catalog stubs published");

        let store = self.clone();
        let handle = tokio::spawn(async move { store.hydrate_stubs().await });
        *lock(&self.inner.hydration) = Some(handle);
        Ok(())
    }

    /// Wait for the startup hydration pass to finish
    pub async fn wait_hydrated(&self) {
        let handle = lock(&self.inner.hydration).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Hydration task ended abnormally");
            }
        }
    }

    fn spawn_listener(&self, mut subscription: ChangeSubscription) {
        let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    notice = subscription.recv() => notice,
                };
                let Some(notice) = notice else { break };
                let Some(inner) = weak.upgrade() else { break };
                let store = CatalogStore { inner };
                match notice {
                    ChangeNotice::Changed(event) => store.apply_event(event).await,
                    ChangeNotice::Missed(skipped) => {
                        info!(skipped, "Installation changes were missed, rescanning catalogs");
                        store.resync().await;
                    }
                }
            }
            debug!("Catalog store stopped following installation changes");
        });
    }

    async fn hydrate_stubs(&self) {
        let pending: Vec<PackageId> = self
            .inner
            .catalogs
            .borrow()
            .values()
            .filter(|c| c.is_stub())
            .map(|c| c.package_id().to_string())
            .collect();

        let mut workers = JoinSet::new();
        for package_id in pending {
            let permit = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                permit = Arc::clone(&self.inner.hydration_permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let store = self.clone();
            workers.spawn(async move {
                let _permit = permit;
                store.hydrate_stub(&package_id).await;
            });
        }
        while workers.join_next().await.is_some() {}

        let snapshot = self.snapshot();
        info!(
            hydrated = snapshot.values().filter(|c| c.is_hydrated()).count(),
            failed = snapshot.values().filter(|c| c.is_failed()).count(),
            "Catalog hydration finished"
        );
    }

    /// Hydrate one entry if it is still a stub
    async fn hydrate_stub(&self, package_id: &str) {
        let Some(stub) = self.get(package_id).filter(|c| c.is_stub()) else {
            return;
        };

        self.mark_loading(package_id, true);
        let hydrated = tokio::select! {
            _ = self.inner.shutdown.cancelled() => None,
            local = self.inner.loader.hydrate(stub.descriptor.clone()) => Some(local),
        };
        self.mark_loading(package_id, false);

        if let Some(local) = hydrated {
            // Only swap if nothing replaced or removed the stub meanwhile
            let stale = local.handle().cloned();
            let swapped = self.inner.catalogs.send_if_modified(|snapshot| match snapshot.get(package_id) {
                Some(current) if current.is_stub() && current.descriptor.artifact == stub.descriptor.artifact => {
                    let mut next = (**snapshot).clone();
                    next.insert(package_id.to_string(), local);
                    *snapshot = Arc::new(next);
                    true
                }
                _ => false,
            });
            if !swapped {
                if let Some(handle) = stale {
                    let _ = handle.shutdown().await;
                }
            }
        }
    }

    fn mark_loading(&self, package_id: &str, loading: bool) {
        let mut set = lock(&self.inner.loading);
        if loading {
            set.insert(package_id.to_string());
        } else {
            set.remove(package_id);
        }
    }

    /// Current snapshot of the registry
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.inner.catalogs.borrow())
    }

    /// All catalogs, pinned ones first, each group ordered by package id
    pub fn list(&self) -> Vec<CatalogLocal> {
        let snapshot = self.snapshot();
        let pinned = lock(&self.inner.pinned).clone();
        let (mut first, rest): (Vec<_>, Vec<_>) = snapshot
            .values()
            .cloned()
            .partition(|c| pinned.contains(c.package_id()));
        first.extend(rest);
        first
    }

    pub fn get(&self, package_id: &str) -> Option<CatalogLocal> {
        self.inner.catalogs.borrow().get(package_id).cloned()
    }

    /// Store `value` under `package_id`, replacing any previous entry
    pub fn replace(&self, package_id: &str, value: CatalogLocal) {
        if value.package_id() != package_id {
            warn!(key = %package_id, package_id = %value.package_id(), "Refusing to store catalog under another id");
            return;
        }
        self.swap(package_id, value);
    }

    /// Insert and hand back whatever was there, in one snapshot update
    fn swap(&self, package_id: &str, value: CatalogLocal) -> Option<CatalogLocal> {
        let mut previous = None;
        self.inner.catalogs.send_modify(|snapshot| {
            let mut next = (**snapshot).clone();
            previous = next.insert(package_id.to_string(), value);
            *snapshot = Arc::new(next);
        });
        previous
    }

    pub fn remove(&self, package_id: &str) -> Option<CatalogLocal> {
        let mut removed = None;
        self.inner.catalogs.send_if_modified(|snapshot| {
            if !snapshot.contains_key(package_id) {
                return false;
            }
            let mut next = (**snapshot).clone();
            removed = next.remove(package_id);
            *snapshot = Arc::new(next);
            true
        });
        removed
    }

    /// Receiver notified with a fresh snapshot after every mutation
    pub fn subscribe_changes(&self) -> watch::Receiver<Snapshot> {
        self.inner.catalogs.subscribe()
    }

    pub fn is_loading(&self, package_id: &str) -> bool {
        lock(&self.inner.loading).contains(package_id)
    }

    pub fn is_stub(&self, package_id: &str) -> bool {
        self.get(package_id).map(|c| c.is_stub()).unwrap_or(false)
    }

    /// Flip the pinned flag of `package_id`; returns the new state
    pub fn toggle_pinned(&self, package_id: &str) -> bool {
        let now_pinned = {
            let mut pinned = lock(&self.inner.pinned);
            if pinned.remove(package_id) {
                false
            } else {
                pinned.insert(package_id.to_string());
                true
            }
        };
        // Ordering in list() changed; tell subscribers.
        self.inner.catalogs.send_modify(|_| {});
        now_pinned
    }

    pub fn pinned(&self) -> Vec<PackageId> {
        lock(&self.inner.pinned).iter().cloned().collect()
    }

    /// Whether `remotes` offers a newer version of an installed catalog
    pub fn has_update(&self, package_id: &str, remotes: &[CatalogRemote]) -> bool {
        let Some(local) = self.get(package_id) else { return false };
        let Some(remote) = remotes.iter().find(|r| r.package_id == package_id) else {
            return false;
        };
        match (
            semver::Version::parse(&local.descriptor.version),
            semver::Version::parse(&remote.version),
        ) {
            (Ok(installed), Ok(offered)) => offered > installed,
            _ => false,
        }
    }

    /// Rescan and re-hydrate one catalog. The previous entry stays visible
    /// until its replacement is ready.
    pub async fn reload(&self, package_id: &str) -> Option<CatalogLocal> {
        let Some(descriptor) = self.inner.loader.scan_one(package_id).await else {
            if let Some(old) = self.remove(package_id) {
                if let Some(handle) = old.handle() {
                    let _ = handle.shutdown().await;
                }
            }
            return None;
        };

        if self.get(package_id).is_none() {
            self.replace(package_id, CatalogLocal::stub(descriptor.clone()));
        }

        self.mark_loading(package_id, true);
        let local = self.inner.loader.hydrate(descriptor).await;
        self.mark_loading(package_id, false);

        let previous = self.swap(package_id, local.clone());
        if let Some(handle) = previous.as_ref().and_then(|p| p.handle()) {
            let _ = handle.shutdown().await;
        }
        Some(local)
    }

    /// Reconcile the registry with the filesystem: entries whose package is
    /// gone are dropped, everything still installed is reloaded.
    async fn resync(&self) {
        let scanned = match self.inner.loader.scan_stubs().await {
            Ok(scanned) => scanned,
            Err(e) => {
                warn!(error = %e, "Catalog rescan failed");
                return;
            }
        };
        let present: BTreeSet<PackageId> = scanned.iter().map(|d| d.package_id.clone()).collect();

        let snapshot = self.snapshot();
        for package_id in snapshot.keys().filter(|id| !present.contains(*id)) {
            if let Some(old) = self.remove(package_id) {
                debug!(package_id = %package_id, "Dropping catalog that is no longer installed");
                if let Some(handle) = old.handle() {
                    let _ = handle.shutdown().await;
                }
            }
        }
        for package_id in &present {
            self.reload(package_id).await;
        }
        info!(count = present.len(), "Catalog registry resynchronized");
    }

    async fn apply_event(&self, event: InstallationChangeEvent) {
        let package_id = event.package_id.as_str();
        debug!(package_id = %package_id, kind = ?event.kind, "Applying installation change");
        let existing = self.get(package_id);

        if event.kind.is_install() {
            // A system install never displaces a user-installed catalog
            let shadowed = event.kind == ChangeKind::SystemInstall
                && existing.map(|c| !c.descriptor.origin.is_system()).unwrap_or(false);
            if shadowed {
                debug!(package_id = %package_id, "Ignoring system install shadowed by local catalog");
                return;
            }
            self.reload(package_id).await;
        } else {
            let matches_origin = existing
                .map(|c| c.descriptor.origin.is_system() == event.kind.is_system())
                .unwrap_or(false);
            if matches_origin {
                // A system catalog may surface again once the local one is gone
                self.reload(package_id).await;
            }
        }
    }

    /// Stop following changes and cancel hydration, then release every
    /// runtime handle. Unfinished entries stay stubs.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.wait_hydrated().await;
        for catalog in self.snapshot().values() {
            if let Some(handle) = catalog.handle() {
                if let Err(e) = handle.shutdown().await {
                    warn!(package_id = %catalog.package_id(), error = %e, "Catalog shutdown failed");
                }
            }
        }
    }
}
