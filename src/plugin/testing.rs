//! Fixtures shared by the catalog tests

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use url::Url;
use zip::write::SimpleFileOptions;

use super::transport::{Transport, TransportResponse};
use super::types::{CatalogMetadata, MANIFEST_FILE};
use super::validator::sha256_hex;
use crate::core::error::Result;

/// Shape of a generated native package
#[derive(Debug, Clone)]
pub struct NativeSpec {
    pub id: String,
    pub version: String,
    pub lib_version: String,
    /// Size of the fake library payload
    pub library_size: usize,
    /// Corrupt the library after checksumming it
    pub tamper: bool,
}

impl NativeSpec {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: "1.0.0".to_string(),
            lib_version: "2.1".to_string(),
            library_size: 1024,
            tamper: false,
        }
    }
}

/// Build a `.cpkg` archive in memory
pub fn native_package(spec: &NativeSpec) -> Vec<u8> {
    let library_name = format!("lib/lib{}.so", spec.id.replace('.', "_"));
    let mut library: Vec<u8> = (0..spec.library_size).map(|i| (i % 251) as u8).collect();

    let mut metadata = CatalogMetadata::new(&spec.id, format!("{} catalog", spec.id), &spec.version)
        .with_lib_version(&spec.lib_version)
        .with_library(&library_name)
        .with_lang("en");
    metadata.checksums.insert(library_name.clone(), sha256_hex(&library));
    if spec.tamper {
        library[0] ^= 0xff;
    }

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer.start_file(MANIFEST_FILE, SimpleFileOptions::default()).unwrap();
    writer
        .write_all(serde_json::to_string(&metadata).unwrap().as_bytes())
        .unwrap();
    writer.start_file(library_name, SimpleFileOptions::default()).unwrap();
    writer.write_all(&library).unwrap();
    writer.finish().unwrap().into_inner()
}

/// Write `<root>/<id>/<id>.cpkg` and return its path
pub fn write_native(root: &Path, spec: &NativeSpec) -> PathBuf {
    let dir = root.join(&spec.id);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}.cpkg", spec.id));
    std::fs::write(&path, native_package(spec)).unwrap();
    path
}

/// Source of a small script catalog answering every query from memory
pub fn script_source(id: &str) -> String {
    format!(
        r#"globalThis.catalog = {{
  id: "{id}",
  async search(params) {{
    return {{ items: [{{ title: params.query + " ({id})", url: "/novel/1" }}], hasNextPage: params.page < 2 }};
  }},
  async details(params) {{
    return {{ title: "Novel", url: params.url, author: "Anon", genres: [] }};
  }},
  async chapters(params) {{
    return [{{ name: "Chapter 1", url: params.url + "/1", number: 1 }}];
  }},
  async content(params) {{
    return {{ url: params.url, paragraphs: ["first", "second"] }};
  }},
}};
"#
    )
}

/// Write `<root>/<id>/manifest.json` plus `<root>/<id>/<id>.js` and return the entry path
pub fn write_script(root: &Path, id: &str) -> PathBuf {
    let dir = root.join(id);
    std::fs::create_dir_all(&dir).unwrap();
    let metadata = CatalogMetadata::new(id, format!("{} catalog", id), "1.0.0");
    std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec(&metadata).unwrap()).unwrap();
    let entry = dir.join(metadata.entry_file());
    std::fs::write(&entry, script_source(id)).unwrap();
    entry
}

struct Route {
    status: u16,
    body: Bytes,
    delay: Duration,
}

/// In-memory [`Transport`]; unknown URLs answer 404
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<HashMap<String, usize>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: Vec<u8>) {
        self.respond_after(url, status, body, Duration::ZERO);
    }

    pub fn respond_after(&self, url: &str, status: u16, body: Vec<u8>, delay: Duration) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route { status, body: Bytes::from(body), delay },
        );
    }

    pub fn hits(&self, url: &str) -> usize {
        self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn get(&self, url: &Url) -> Result<TransportResponse> {
        *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;

        let (status, body, delay) = match self.routes.lock().unwrap().get(url.as_str()) {
            Some(route) => (route.status, route.body.clone(), route.delay),
            None => (404, Bytes::new(), Duration::ZERO),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(TransportResponse { status, body })
    }
}
