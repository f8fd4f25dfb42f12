//! Catalog type definitions
//!
//! Descriptors, manifests, install steps and change events shared by the
//! loader, installer and store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use super::handle::PluginHandle;

/// Stable identifier of an installed or installable catalog
pub type PackageId = String;

/// File extension of a native catalog package
pub const NATIVE_EXTENSION: &str = "cpkg";
/// File extension of a script catalog entry point
pub const SCRIPT_EXTENSION: &str = "js";
/// File extension of a catalog icon
pub const ICON_EXTENSION: &str = "png";
/// Manifest file name, inside native archives and beside script entry points
pub const MANIFEST_FILE: &str = "manifest.json";
/// Marker written by the installer for catalogs fetched from a remote index
pub const REMOTE_MARKER: &str = ".remote";

/// How a catalog's code is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    /// Compiled library shipped inside a `.cpkg` archive
    Native,
    /// Interpreted JavaScript entry point
    Script,
}

impl CatalogKind {
    pub fn file_extension(&self) -> &'static str {
        match self {
            CatalogKind::Native => NATIVE_EXTENSION,
            CatalogKind::Script => SCRIPT_EXTENSION,
        }
    }
}

impl fmt::Display for CatalogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogKind::Native => f.pad("native"),
            CatalogKind::Script => f.pad("script"),
        }
    }
}

/// Where an installed catalog came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogOrigin {
    SystemWide,
    SideloadedLocal,
    Remote,
}

impl CatalogOrigin {
    /// Local and remote installs live in the user's extensions directory
    pub fn is_system(&self) -> bool {
        matches!(self, CatalogOrigin::SystemWide)
    }
}

impl fmt::Display for CatalogOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogOrigin::SystemWide => f.pad("system"),
            CatalogOrigin::SideloadedLocal => f.pad("local"),
            CatalogOrigin::Remote => f.pad("remote"),
        }
    }
}

/// Lightweight description of an installed catalog, derived from the
/// filesystem alone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogDescriptor {
    pub package_id: PackageId,
    pub display_name: String,
    pub version: String,
    pub icon_ref: Option<PathBuf>,
    pub kind: CatalogKind,
    pub origin: CatalogOrigin,
    /// The package file (`.cpkg`) or script entry point
    pub artifact: PathBuf,
}

/// Manifest carried by every catalog package.
///
/// Native packages embed it as `manifest.json` inside the archive; script
/// packages keep it next to the entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogMetadata {
    pub id: PackageId,
    pub name: String,
    pub version: String,

    /// Version of the catalog API the package was built against
    #[serde(default = "default_lib_version")]
    pub lib_version: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Entry symbol or class advertised by the package
    #[serde(default)]
    pub source_class: Option<String>,

    #[serde(default)]
    pub nsfw: bool,

    #[serde(default)]
    pub lang: Option<String>,

    /// Archive path of the compiled library (native only)
    #[serde(default)]
    pub library: Option<String>,

    /// Script entry file name (script only), defaults to `<id>.js`
    #[serde(default)]
    pub entry: Option<String>,

    /// SHA-256 of archive entries, hex encoded (native only)
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

fn default_lib_version() -> String {
    "2.0".to_string()
}

impl CatalogMetadata {
    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            lib_version: default_lib_version(),
            description: None,
            source_class: None,
            nsfw: false,
            lang: None,
            library: None,
            entry: None,
            checksums: BTreeMap::new(),
        }
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }

    pub fn with_library(mut self, library: impl Into<String>) -> Self {
        self.library = Some(library.into());
        self
    }

    pub fn with_lib_version(mut self, lib_version: impl Into<String>) -> Self {
        self.lib_version = lib_version.into();
        self
    }

    /// Script entry file name
    pub fn entry_file(&self) -> String {
        self.entry
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.id, SCRIPT_EXTENSION))
    }

    /// Major component of `lib_version` ("2.1" -> 2)
    pub fn lib_major(&self) -> Option<u64> {
        self.lib_version.split('.').next()?.trim().parse().ok()
    }
}

/// Loading state of an entry in the store
#[derive(Clone)]
pub enum CatalogState {
    /// Listed from the filesystem, not yet able to answer queries
    Stub,
    /// Manifest parsed and runtime handle constructed
    Hydrated {
        metadata: CatalogMetadata,
        handle: Arc<dyn PluginHandle>,
    },
    /// Hydration failed; kept so the failure is visible in listings
    Failed { reason: String },
}

impl fmt::Debug for CatalogState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogState::Stub => write!(f, "Stub"),
            CatalogState::Hydrated { metadata, handle } => f
                .debug_struct("Hydrated")
                .field("metadata", metadata)
                .field("kind", &handle.kind())
                .finish(),
            CatalogState::Failed { reason } => f.debug_struct("Failed").field("reason", reason).finish(),
        }
    }
}

/// An installed catalog as held by the store
#[derive(Debug, Clone)]
pub struct CatalogLocal {
    pub descriptor: CatalogDescriptor,
    pub state: CatalogState,
}

impl CatalogLocal {
    pub fn stub(descriptor: CatalogDescriptor) -> Self {
        Self { descriptor, state: CatalogState::Stub }
    }

    pub fn failed(descriptor: CatalogDescriptor, reason: impl Into<String>) -> Self {
        Self {
            descriptor,
            state: CatalogState::Failed { reason: reason.into() },
        }
    }

    pub fn package_id(&self) -> &str {
        &self.descriptor.package_id
    }

    pub fn is_hydrated(&self) -> bool {
        matches!(self.state, CatalogState::Hydrated { .. })
    }

    pub fn is_stub(&self) -> bool {
        matches!(self.state, CatalogState::Stub)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, CatalogState::Failed { .. })
    }

    pub fn handle(&self) -> Option<&Arc<dyn PluginHandle>> {
        match &self.state {
            CatalogState::Hydrated { handle, .. } => Some(handle),
            _ => None,
        }
    }

    pub fn metadata(&self) -> Option<&CatalogMetadata> {
        match &self.state {
            CatalogState::Hydrated { metadata, .. } => Some(metadata),
            _ => None,
        }
    }
}

/// An installable catalog listed by a remote index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogRemote {
    pub package_id: PackageId,
    #[serde(default)]
    pub name: Option<String>,
    pub version: String,
    pub package_url: String,
    #[serde(default)]
    pub icon_url: Option<String>,
    /// SHA-256 of the package payload, hex encoded
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub kind: Option<CatalogKind>,
}

impl CatalogRemote {
    pub fn new(package_id: impl Into<String>, version: impl Into<String>, package_url: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            name: None,
            version: version.into(),
            package_url: package_url.into(),
            icon_url: None,
            checksum: None,
            kind: None,
        }
    }

    /// Declared kind, or inferred from the package URL (`*.js` is a script)
    pub fn kind(&self) -> CatalogKind {
        if let Some(kind) = self.kind {
            return kind;
        }
        let path = url::Url::parse(&self.package_url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.package_url.clone());
        if path.ends_with(&format!(".{}", SCRIPT_EXTENSION)) {
            CatalogKind::Script
        } else {
            CatalogKind::Native
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.package_id)
    }
}

/// One state of the linear install state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallStep {
    Idle,
    Downloading,
    Installing,
    Completed,
    Error(String),
}

impl InstallStep {
    pub fn is_terminal(&self) -> bool {
        matches!(self, InstallStep::Completed | InstallStep::Error(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstallStep::Idle => "Idle",
            InstallStep::Downloading => "Downloading",
            InstallStep::Installing => "Installing",
            InstallStep::Completed => "Completed",
            InstallStep::Error(_) => "Error",
        }
    }
}

impl fmt::Display for InstallStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallStep::Error(reason) => write!(f, "Error: {}", reason),
            other => write!(f, "{}", other.name()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    SystemInstall,
    SystemUninstall,
    LocalInstall,
    LocalUninstall,
}

impl ChangeKind {
    pub fn is_install(&self) -> bool {
        matches!(self, ChangeKind::SystemInstall | ChangeKind::LocalInstall)
    }

    pub fn is_system(&self) -> bool {
        matches!(self, ChangeKind::SystemInstall | ChangeKind::SystemUninstall)
    }
}

/// Identity-only notification that a catalog was installed or removed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationChangeEvent {
    pub package_id: PackageId,
    pub kind: ChangeKind,
    pub observed_at: DateTime<Utc>,
}

impl InstallationChangeEvent {
    pub fn new(package_id: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            package_id: package_id.into(),
            kind,
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_kind_inference() {
        let native = CatalogRemote::new("demo", "1.0.0", "https://x/demo.cpkg");
        assert_eq!(native.kind(), CatalogKind::Native);

        let script = CatalogRemote::new("demo", "1.0.0", "https://x/catalogs/demo.js?rev=3");
        assert_eq!(script.kind(), CatalogKind::Script);

        let declared = CatalogRemote {
            kind: Some(CatalogKind::Script),
            ..CatalogRemote::new("demo", "1.0.0", "https://x/download/42")
        };
        assert_eq!(declared.kind(), CatalogKind::Script);
    }

    #[test]
    fn test_remote_index_json_shape() {
        let json = r#"[{"packageId":"demo","version":"1.2.0","packageUrl":"https://x/demo.cpkg","iconUrl":"https://x/demo.png","checksum":null}]"#;
        let remotes: Vec<CatalogRemote> = serde_json::from_str(json).unwrap();
        assert_eq!(remotes.len(), 1);
        assert_eq!(remotes[0].package_id, "demo");
        assert_eq!(remotes[0].icon_url.as_deref(), Some("https://x/demo.png"));
        assert_eq!(remotes[0].display_name(), "demo");
    }

    #[test]
    fn test_manifest_defaults() {
        let meta: CatalogMetadata =
            serde_json::from_str(r#"{"id":"demo","name":"Demo","version":"1.0.0"}"#).unwrap();
        assert_eq!(meta.lib_major(), Some(2));
        assert_eq!(meta.entry_file(), "demo.js");
        assert!(!meta.nsfw);
        assert!(meta.checksums.is_empty());
    }

    #[test]
    fn test_install_step_terminal() {
        assert!(!InstallStep::Idle.is_terminal());
        assert!(!InstallStep::Downloading.is_terminal());
        assert!(InstallStep::Completed.is_terminal());
        assert!(InstallStep::Error("boom".into()).is_terminal());
        assert_eq!(InstallStep::Error("boom".into()).to_string(), "Error: boom");
    }

    #[test]
    fn test_change_kind_flags() {
        assert!(ChangeKind::LocalInstall.is_install());
        assert!(!ChangeKind::LocalInstall.is_system());
        assert!(ChangeKind::SystemUninstall.is_system());
        assert!(!ChangeKind::SystemUninstall.is_install());
    }
}
