//! Catalog artifact validation
//!
//! Checks staged downloads and installed packages before anything tries to
//! load them. Native packages go through a [`PackageIntegrityChecker`];
//! script packages only need a manifest and a non-empty entry point.
//!
//! Installed artifacts that fail the check are deleted on the spot
//! ([`CatalogValidator::validate_installed`]), so a corrupt package costs one
//! log line instead of a crash.

use sha2::{Digest, Sha256};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{CatalogKind, CatalogMetadata, MANIFEST_FILE};
use crate::core::error::{CatalogError, Result};

/// Result of validating one artifact
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Valid(CatalogMetadata),
    Invalid(String),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid(_))
    }

    pub fn into_result(self) -> Result<CatalogMetadata> {
        match self {
            ValidationOutcome::Valid(metadata) => Ok(metadata),
            ValidationOutcome::Invalid(reason) => Err(CatalogError::ValidationFailed(reason)),
        }
    }
}

/// Parses the metadata block of a native package and verifies its integrity
pub trait PackageIntegrityChecker: Send + Sync {
    fn parse_and_validate(&self, bytes: &[u8]) -> Result<CatalogMetadata>;
}

/// Hex encoded SHA-256 digest
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Default checker for `.cpkg` archives.
///
/// The archive must carry `manifest.json` whose `checksums` map covers the
/// compiled library, and every listed entry must hash to the recorded value.
#[derive(Debug, Clone)]
pub struct ZipManifestChecker {
    min_lib_version: u64,
    max_lib_version: u64,
}

impl ZipManifestChecker {
    pub fn new(min_lib_version: u64, max_lib_version: u64) -> Self {
        Self { min_lib_version, max_lib_version }
    }
}

impl Default for ZipManifestChecker {
    fn default() -> Self {
        Self::new(2, 2)
    }
}

impl PackageIntegrityChecker for ZipManifestChecker {
    fn parse_and_validate(&self, bytes: &[u8]) -> Result<CatalogMetadata> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;

        let metadata: CatalogMetadata = {
            let mut entry = archive
                .by_name(MANIFEST_FILE)
                .map_err(|_| CatalogError::ValidationFailed("package has no manifest".to_string()))?;
            let mut raw = String::new();
            entry.read_to_string(&mut raw)?;
            serde_json::from_str(&raw)
                .map_err(|e| CatalogError::ValidationFailed(format!("malformed manifest: {}", e)))?
        };

        if metadata.id.trim().is_empty() || metadata.name.trim().is_empty() || metadata.version.trim().is_empty() {
            return Err(CatalogError::ValidationFailed(
                "manifest must declare id, name and version".to_string(),
            ));
        }

        match metadata.lib_major() {
            Some(major) if (self.min_lib_version..=self.max_lib_version).contains(&major) => {}
            _ => {
                return Err(CatalogError::ValidationFailed(format!(
                    "unsupported lib version {} (supported {}..={})",
                    metadata.lib_version, self.min_lib_version, self.max_lib_version
                )))
            }
        }

        let library = metadata
            .library
            .as_deref()
            .ok_or_else(|| CatalogError::ValidationFailed("manifest names no library".to_string()))?;
        if !metadata.checksums.contains_key(library) {
            return Err(CatalogError::ValidationFailed(format!(
                "library {} is not covered by checksums",
                library
            )));
        }

        for (name, expected) in &metadata.checksums {
            let mut entry = archive.by_name(name).map_err(|_| {
                CatalogError::ValidationFailed(format!("checksummed entry {} is missing", name))
            })?;
            let mut buf = Vec::with_capacity(entry.size() as usize);
            entry.read_to_end(&mut buf)?;
            if !sha256_hex(&buf).eq_ignore_ascii_case(expected) {
                return Err(CatalogError::ValidationFailed(format!("checksum mismatch for {}", name)));
            }
        }

        Ok(metadata)
    }
}

/// Validates catalog artifacts by kind
#[derive(Clone)]
pub struct CatalogValidator {
    checker: Arc<dyn PackageIntegrityChecker>,
}

impl CatalogValidator {
    pub fn new(checker: Arc<dyn PackageIntegrityChecker>) -> Self {
        Self { checker }
    }

    /// Validate an artifact without side effects.
    ///
    /// `path` is the `.cpkg` file for native catalogs and the entry-point
    /// script for script catalogs.
    pub async fn validate(&self, path: &Path, kind: CatalogKind) -> ValidationOutcome {
        match self.check(path, kind).await {
            Ok(metadata) => ValidationOutcome::Valid(metadata),
            Err(CatalogError::ValidationFailed(reason)) => ValidationOutcome::Invalid(reason),
            Err(e) => ValidationOutcome::Invalid(e.to_string()),
        }
    }

    /// Validate an installed artifact and delete it when invalid
    pub async fn validate_installed(&self, path: &Path, kind: CatalogKind) -> ValidationOutcome {
        let outcome = self.validate(path, kind).await;
        if let ValidationOutcome::Invalid(reason) = &outcome {
            self.purge(path, reason).await;
        }
        outcome
    }

    /// Delete an artifact that must not be loaded
    pub async fn purge(&self, path: &Path, reason: &str) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => warn!(path = ?path, reason = %reason, "Removed invalid catalog artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = ?path, error = %e, "Failed to remove invalid catalog artifact"),
        }
    }

    async fn check(&self, path: &Path, kind: CatalogKind) -> Result<CatalogMetadata> {
        let len = tokio::fs::metadata(path).await?.len();
        if len == 0 {
            return Err(CatalogError::ValidationFailed("artifact is empty".to_string()));
        }

        let metadata = match kind {
            CatalogKind::Native => {
                let bytes = tokio::fs::read(path).await?;
                let checker = Arc::clone(&self.checker);
                tokio::task::spawn_blocking(move || checker.parse_and_validate(&bytes))
                    .await
                    .map_err(|e| CatalogError::ValidationFailed(format!("checker panicked: {}", e)))??
            }
            CatalogKind::Script => self.check_script(path).await?,
        };

        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        if kind == CatalogKind::Native && stem != metadata.id {
            return Err(CatalogError::ValidationFailed(format!(
                "package file {} does not match manifest id {}",
                stem, metadata.id
            )));
        }

        debug!(package_id = %metadata.id, kind = %kind, "Artifact validated");
        Ok(metadata)
    }

    async fn check_script(&self, entry: &Path) -> Result<CatalogMetadata> {
        let dir = entry
            .parent()
            .ok_or_else(|| CatalogError::ValidationFailed("entry point has no directory".to_string()))?;
        let raw = match tokio::fs::read_to_string(dir.join(MANIFEST_FILE)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CatalogError::ValidationFailed("script has no manifest".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let metadata: CatalogMetadata = serde_json::from_str(&raw)
            .map_err(|e| CatalogError::ValidationFailed(format!("malformed manifest: {}", e)))?;

        let expected = dir.join(metadata.entry_file());
        if expected != entry {
            return Err(CatalogError::ValidationFailed(format!(
                "manifest entry {} does not match {}",
                metadata.entry_file(),
                entry.display()
            )));
        }
        Ok(metadata)
    }
}

impl Default for CatalogValidator {
    fn default() -> Self {
        Self::new(Arc::new(ZipManifestChecker::default()))
    }
}
