//! Native catalog handle
//!
//! A native catalog is a `.cpkg` archive holding a compiled library. The
//! library is extracted next to the package and opened with `libloading` on
//! the first query, so hydrating a native catalog never runs foreign code.
//!
//! The library must export:
//!
//! ```c
//! int catalog_invoke(const char* method, const char* params, char** result);
//! void catalog_free(char* result);
//! ```
//!
//! `params` and `*result` are UTF-8 JSON. A non-zero return code is a failure
//! and `*result` may then carry an error message.

use async_trait::async_trait;
use libloading::{Library, Symbol};
use serde_json::Value;
use std::ffi::{c_char, CStr, CString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::handle::PluginHandle;
use super::types::{CatalogKind, CatalogMetadata, PackageId};
use crate::core::error::{CatalogError, Result};

type InvokeFn = unsafe extern "C" fn(*const c_char, *const c_char, *mut *mut c_char) -> i32;
type FreeFn = unsafe extern "C" fn(*mut c_char);

/// Directory, inside the package directory, holding the extracted library
pub const EXTRACT_DIR: &str = ".lib";

/// [`PluginHandle`] backed by a dynamically loaded library
pub struct NativeHandle {
    package_id: PackageId,
    package: PathBuf,
    metadata: CatalogMetadata,
    library: Mutex<Option<Arc<Library>>>,
}

impl NativeHandle {
    /// Create a handle for a validated package; nothing is loaded yet
    pub fn new(package: PathBuf, metadata: CatalogMetadata) -> Self {
        Self {
            package_id: metadata.id.clone(),
            package,
            metadata,
            library: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.library.try_lock().map(|l| l.is_some()).unwrap_or(true)
    }

    async fn library(&self) -> Result<Arc<Library>> {
        let mut slot = self.library.lock().await;
        if let Some(library) = slot.as_ref() {
            return Ok(Arc::clone(library));
        }

        let package = self.package.clone();
        let metadata = self.metadata.clone();
        let library = tokio::task::spawn_blocking(move || open_library(&package, &metadata))
            .await
            .map_err(|e| CatalogError::LoadFailed(format!("loader task failed: {}", e)))??;

        let library = Arc::new(library);
        *slot = Some(Arc::clone(&library));
        Ok(library)
    }
}

fn is_platform_library(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(std::env::consts::DLL_EXTENSION))
        .unwrap_or(false)
}

fn open_library(package: &Path, metadata: &CatalogMetadata) -> Result<Library> {
    let entry = metadata
        .library
        .as_deref()
        .ok_or_else(|| CatalogError::LoadFailed(format!("{} names no library", metadata.id)))?;
    let file_name = Path::new(entry)
        .file_name()
        .ok_or_else(|| CatalogError::LoadFailed(format!("invalid library entry {}", entry)))?;

    let dir = package
        .parent()
        .ok_or_else(|| CatalogError::LoadFailed("package has no directory".to_string()))?
        .join(EXTRACT_DIR);
    let target = dir.join(file_name);

    if !is_platform_library(&target) {
        return Err(CatalogError::LoadFailed(format!(
            "{} is not a {} library",
            entry,
            std::env::consts::DLL_EXTENSION
        )));
    }

    let mut archive = zip::ZipArchive::new(std::fs::File::open(package)?)
        .map_err(|e| CatalogError::LoadFailed(format!("unreadable package: {}", e)))?;
    let mut source = archive
        .by_name(entry)
        .map_err(|_| CatalogError::LoadFailed(format!("library {} missing from package", entry)))?;
    let mut bytes = Vec::with_capacity(source.size() as usize);
    source.read_to_end(&mut bytes)?;

    std::fs::create_dir_all(&dir)?;
    std::fs::write(&target, &bytes)?;

    // Loading a library runs its initialisers; packages were integrity-checked at install.
    let library = unsafe { Library::new(&target) }
        .map_err(|e| CatalogError::LoadFailed(format!("failed to load {:?}: {}", target, e)))?;

    info!(package_id = %metadata.id, path = ?target, "Native catalog library loaded");
    Ok(library)
}

fn call_library(library: &Library, package_id: &str, method: &str, params: &Value) -> Result<Value> {
    let method_c = CString::new(method)
        .map_err(|e| CatalogError::Execution(format!("invalid method name: {}", e)))?;
    let params_c = CString::new(serde_json::to_string(params)?)
        .map_err(|e| CatalogError::Execution(format!("invalid params: {}", e)))?;

    let (invoke, free): (Symbol<InvokeFn>, Symbol<FreeFn>) = unsafe {
        let invoke = library.get(b"catalog_invoke\0").map_err(|e| {
            CatalogError::LoadFailed(format!("{} does not export catalog_invoke: {}", package_id, e))
        })?;
        let free = library.get(b"catalog_free\0").map_err(|e| {
            CatalogError::LoadFailed(format!("{} does not export catalog_free: {}", package_id, e))
        })?;
        (invoke, free)
    };

    let mut result_ptr: *mut c_char = std::ptr::null_mut();
    let code = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| unsafe {
        invoke(method_c.as_ptr(), params_c.as_ptr(), &mut result_ptr)
    }))
    .map_err(|_| {
        error!(package_id = %package_id, method = %method, "Native catalog panicked");
        CatalogError::Execution(format!("{} panicked in {}", package_id, method))
    })?;

    let text = if result_ptr.is_null() {
        None
    } else {
        let text = unsafe { CStr::from_ptr(result_ptr) }.to_string_lossy().into_owned();
        unsafe { free(result_ptr) };
        Some(text)
    };

    if code != 0 {
        return Err(CatalogError::Execution(format!(
            "{}.{} failed with code {}: {}",
            package_id,
            method,
            code,
            text.unwrap_or_default()
        )));
    }

    let text = text.ok_or_else(|| {
        CatalogError::Execution(format!("{}.{} returned no result", package_id, method))
    })?;
    Ok(serde_json::from_str(&text)?)
}

#[async_trait]
impl PluginHandle for NativeHandle {
    fn package_id(&self) -> &PackageId {
        &self.package_id
    }

    fn kind(&self) -> CatalogKind {
        CatalogKind::Native
    }

    async fn invoke(&self, method: &str, params: Value) -> Result<Value> {
        let library = self.library().await?;
        let package_id = self.package_id.clone();
        let method = method.to_string();

        debug!(package_id = %package_id, method = %method, "Invoking native catalog");
        tokio::task::spawn_blocking(move || call_library(&library, &package_id, &method, &params))
            .await
            .map_err(|e| CatalogError::Execution(format!("native call task failed: {}", e)))?
    }

    async fn shutdown(&self) -> Result<()> {
        // Calls in flight keep their own Arc; the library unloads after them.
        self.library.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::{write_native, NativeSpec};
    use crate::plugin::validator::{PackageIntegrityChecker, ZipManifestChecker};
    use tempfile::TempDir;

    fn handle_for(root: &Path, id: &str) -> NativeHandle {
        let package = write_native(root, &NativeSpec::new(id));
        let metadata = ZipManifestChecker::default()
            .parse_and_validate(&std::fs::read(&package).unwrap())
            .unwrap();
        NativeHandle::new(package, metadata)
    }

    #[test]
    fn test_construction_loads_nothing() {
        let dir = TempDir::new().unwrap();
        let handle = handle_for(dir.path(), "demo");
        assert!(!handle.is_loaded());
        assert_eq!(handle.kind(), CatalogKind::Native);
        assert!(!dir.path().join("demo").join(EXTRACT_DIR).exists());
    }

    #[test]
    fn test_platform_library_extension() {
        let name = format!("libdemo.{}", std::env::consts::DLL_EXTENSION);
        assert!(is_platform_library(Path::new(&name)));
        assert!(!is_platform_library(Path::new("libdemo.txt")));
        assert!(!is_platform_library(Path::new("libdemo")));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_garbage_library_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let handle = handle_for(dir.path(), "demo");

        let err = handle.search("anything", 1).await.unwrap_err();
        assert!(matches!(err, CatalogError::LoadFailed(_)));
        assert!(!handle.is_loaded());
        assert!(dir.path().join("demo").join(EXTRACT_DIR).join("libdemo.so").exists());
    }
}
