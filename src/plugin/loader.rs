//! Catalog discovery and hydration
//!
//! `scan_stubs` lists installed catalogs from directory entries and file
//! metadata only. `hydrate` validates one of them and builds its runtime
//! handle. Hydration never fails: a broken package becomes a failed entry.
//!
//! Layout, per root directory:
//!
//! ```text
//! <root>/<id>/<id>.cpkg      native package
//! <root>/<id>/<id>.js        script entry (+ manifest.json)
//! <root>/<id>/<id>.png       icon
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::handle::PluginHandle;
use super::native::{NativeHandle, EXTRACT_DIR};
use super::script::ScriptHandle;
use super::types::{
    CatalogDescriptor, CatalogKind, CatalogLocal, CatalogOrigin, CatalogState, ICON_EXTENSION,
    NATIVE_EXTENSION, REMOTE_MARKER, SCRIPT_EXTENSION,
};
use super::validator::{CatalogValidator, ValidationOutcome};
use crate::core::error::Result;

/// Enumerates installed catalogs and turns them into loaded handles
#[derive(Clone)]
pub struct CatalogLoader {
    extensions_dir: PathBuf,
    system_dir: Option<PathBuf>,
    validator: CatalogValidator,
}

/// Size of a file, `None` if it does not exist
async fn file_len(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

impl CatalogLoader {
    pub fn new(extensions_dir: PathBuf, system_dir: Option<PathBuf>, validator: CatalogValidator) -> Self {
        Self {
            extensions_dir,
            system_dir,
            validator,
        }
    }

    /// List every installed catalog without opening any package.
    ///
    /// Catalogs in the extensions directory shadow system catalogs with the
    /// same id. Results are sorted by package id.
    pub async fn scan_stubs(&self) -> Result<Vec<CatalogDescriptor>> {
        let mut found: std::collections::BTreeMap<String, CatalogDescriptor> = Default::default();

        if let Some(system_dir) = &self.system_dir {
            for descriptor in self.scan_root(system_dir, CatalogOrigin::SystemWide).await? {
                found.insert(descriptor.package_id.clone(), descriptor);
            }
        }
        for descriptor in self.scan_root(&self.extensions_dir, CatalogOrigin::SideloadedLocal).await? {
            if found.contains_key(&descriptor.package_id) {
                debug!(package_id = %descriptor.package_id, "Local catalog shadows system catalog");
            }
            found.insert(descriptor.package_id.clone(), descriptor);
        }

        info!(count = found.len(), "Scanned installed catalogs");
        Ok(found.into_values().collect())
    }

    /// Describe a single package id, preferring the extensions directory
    pub async fn scan_one(&self, package_id: &str) -> Option<CatalogDescriptor> {
        if let Some(descriptor) = self
            .describe(&self.extensions_dir.join(package_id), CatalogOrigin::SideloadedLocal)
            .await
        {
            return Some(descriptor);
        }
        match &self.system_dir {
            Some(dir) => self.describe(&dir.join(package_id), CatalogOrigin::SystemWide).await,
            None => None,
        }
    }

    async fn scan_root(&self, root: &Path, origin: CatalogOrigin) -> Result<Vec<CatalogDescriptor>> {
        let mut entries = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut descriptors = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let hidden = name.to_str().map(|n| n.starts_with('.')).unwrap_or(true);
            if hidden || !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(descriptor) = self.describe(&entry.path(), origin).await {
                descriptors.push(descriptor);
            }
        }
        Ok(descriptors)
    }

    /// Build a stub descriptor for one package directory.
    ///
    /// Cleans up on the way when the directory is writable: empty artifacts
    /// are deleted, a native artifact next to a script is deleted (the script
    /// wins), and a directory left with nothing loadable is removed.
    async fn describe(&self, dir: &Path, origin: CatalogOrigin) -> Option<CatalogDescriptor> {
        let package_id = dir.file_name()?.to_str()?.to_string();
        let writable = !origin.is_system();

        let script = dir.join(format!("{}.{}", package_id, SCRIPT_EXTENSION));
        let native = dir.join(format!("{}.{}", package_id, NATIVE_EXTENSION));
        let mut script_len = file_len(&script).await;
        let mut native_len = file_len(&native).await;

        if writable {
            if script_len == Some(0) {
                self.validator.purge(&script, "artifact is empty").await;
                script_len = None;
            }
            if native_len == Some(0) {
                self.validator.purge(&native, "artifact is empty").await;
                native_len = None;
            }
            if script_len.is_some() && native_len.is_some() {
                self.validator.purge(&native, "shadowed by script catalog").await;
                native_len = None;
            }
            if native_len.is_none() {
                let _ = tokio::fs::remove_dir_all(dir.join(EXTRACT_DIR)).await;
            }
        }

        let (kind, artifact) = match (script_len, native_len) {
            (Some(len), _) if len > 0 => (CatalogKind::Script, script),
            (_, Some(len)) if len > 0 => (CatalogKind::Native, native),
            _ => {
                if writable && tokio::fs::remove_dir(dir).await.is_ok() {
                    debug!(path = ?dir, "Removed empty catalog directory");
                }
                return None;
            }
        };

        let icon = dir.join(format!("{}.{}", package_id, ICON_EXTENSION));
        let icon_ref = file_len(&icon).await.map(|_| icon);

        let origin = if writable && file_len(&dir.join(REMOTE_MARKER)).await.is_some() {
            CatalogOrigin::Remote
        } else {
            origin
        };

        Some(CatalogDescriptor {
            display_name: package_id.clone(),
            package_id,
            version: String::new(),
            icon_ref,
            kind,
            origin,
            artifact,
        })
    }

    /// Validate a stub and construct its runtime handle.
    ///
    /// Invalid artifacts in writable directories are deleted; the returned
    /// entry is then a failed-to-load marker.
    pub async fn hydrate(&self, descriptor: CatalogDescriptor) -> CatalogLocal {
        let outcome = if descriptor.origin.is_system() {
            self.validator.validate(&descriptor.artifact, descriptor.kind).await
        } else {
            self.validator
                .validate_installed(&descriptor.artifact, descriptor.kind)
                .await
        };

        let metadata = match outcome {
            ValidationOutcome::Valid(metadata) if metadata.id == descriptor.package_id => metadata,
            ValidationOutcome::Valid(metadata) => {
                let reason = format!("manifest id {} does not match directory", metadata.id);
                warn!(package_id = %descriptor.package_id, reason = %reason, "Catalog failed to load");
                return CatalogLocal::failed(descriptor, reason);
            }
            ValidationOutcome::Invalid(reason) => {
                warn!(package_id = %descriptor.package_id, reason = %reason, "Catalog failed to load");
                return CatalogLocal::failed(descriptor, reason);
            }
        };

        let handle: Arc<dyn PluginHandle> = match descriptor.kind {
            CatalogKind::Native => Arc::new(NativeHandle::new(descriptor.artifact.clone(), metadata.clone())),
            CatalogKind::Script => Arc::new(ScriptHandle::new(
                descriptor.package_id.clone(),
                descriptor.artifact.clone(),
            )),
        };

        let descriptor = CatalogDescriptor {
            display_name: metadata.name.clone(),
            version: metadata.version.clone(),
            ..descriptor
        };
        debug!(package_id = %descriptor.package_id, kind = %descriptor.kind, "Catalog hydrated");
        CatalogLocal {
            descriptor,
            state: CatalogState::Hydrated { metadata, handle },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::{write_native, write_script, NativeSpec};
    use tempfile::TempDir;

    fn loader(root: &Path) -> CatalogLoader {
        CatalogLoader::new(root.to_path_buf(), None, CatalogValidator::default())
    }

    #[tokio::test]
    async fn test_scan_distinguishes_kinds() {
        let dir = TempDir::new().unwrap();
        write_native(dir.path(), &NativeSpec::new("alpha"));
        write_script(dir.path(), "beta");
        std::fs::write(dir.path().join("beta").join("beta.png"), b"png").unwrap();

        let stubs = loader(dir.path()).scan_stubs().await.unwrap();
        assert_eq!(stubs.len(), 2);
        assert_eq!(stubs[0].package_id, "alpha");
        assert_eq!(stubs[0].kind, CatalogKind::Native);
        assert_eq!(stubs[0].icon_ref, None);
        assert_eq!(stubs[1].kind, CatalogKind::Script);
        assert!(stubs[1].icon_ref.is_some());
        assert_eq!(stubs[1].origin, CatalogOrigin::SideloadedLocal);
    }

    #[tokio::test]
    async fn test_script_wins_and_native_is_removed() {
        let dir = TempDir::new().unwrap();
        let native = write_native(dir.path(), &NativeSpec::new("demo"));
        write_script(dir.path(), "demo");

        let stubs = loader(dir.path()).scan_stubs().await.unwrap();
        assert_eq!(stubs.len(), 1);
        assert_eq!(stubs[0].kind, CatalogKind::Script);
        assert!(!native.exists());
    }

    #[tokio::test]
    async fn test_zero_byte_artifact_never_reaches_hydrate() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();
        let path = dir.path().join("empty").join("empty.cpkg");
        std::fs::write(&path, b"").unwrap();

        let stubs = loader(dir.path()).scan_stubs().await.unwrap();
        assert!(stubs.is_empty());
        assert!(!path.exists());
        assert!(!dir.path().join("empty").exists());
    }

    #[tokio::test]
    async fn test_remote_marker_sets_origin() {
        let dir = TempDir::new().unwrap();
        write_script(dir.path(), "demo");
        std::fs::write(dir.path().join("demo").join(REMOTE_MARKER), b"").unwrap();

        let descriptor = loader(dir.path()).scan_one("demo").await.unwrap();
        assert_eq!(descriptor.origin, CatalogOrigin::Remote);
        assert!(loader(dir.path()).scan_one("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_local_shadows_system() {
        let system = TempDir::new().unwrap();
        let local = TempDir::new().unwrap();
        write_script(system.path(), "shared");
        write_script(system.path(), "sys-only");
        write_native(local.path(), &NativeSpec::new("shared"));

        let loader = CatalogLoader::new(
            local.path().to_path_buf(),
            Some(system.path().to_path_buf()),
            CatalogValidator::default(),
        );
        let stubs = loader.scan_stubs().await.unwrap();
        assert_eq!(stubs.len(), 2);
        let shared = stubs.iter().find(|d| d.package_id == "shared").unwrap();
        assert_eq!(shared.origin, CatalogOrigin::SideloadedLocal);
        assert_eq!(shared.kind, CatalogKind::Native);
        let sys = stubs.iter().find(|d| d.package_id == "sys-only").unwrap();
        assert_eq!(sys.origin, CatalogOrigin::SystemWide);
    }

    #[tokio::test]
    async fn test_hydrate_valid_native() {
        let dir = TempDir::new().unwrap();
        write_native(dir.path(), &NativeSpec { version: "1.4.0".into(), ..NativeSpec::new("demo") });
        let loader = loader(dir.path());

        let stub = loader.scan_one("demo").await.unwrap();
        let local = loader.hydrate(stub).await;
        assert!(local.is_hydrated());
        assert_eq!(local.descriptor.version, "1.4.0");
        assert_eq!(local.descriptor.display_name, "demo catalog");
        assert_eq!(local.handle().unwrap().kind(), CatalogKind::Native);
    }

    #[tokio::test]
    async fn test_hydrate_corrupt_returns_marker_and_purges() {
        let dir = TempDir::new().unwrap();
        let path = write_native(dir.path(), &NativeSpec { tamper: true, ..NativeSpec::new("demo") });
        let loader = loader(dir.path());

        let stub = loader.scan_one("demo").await.unwrap();
        let local = loader.hydrate(stub).await;
        assert!(local.is_failed());
        assert!(local.handle().is_none());
        assert!(!path.exists());
    }
}
