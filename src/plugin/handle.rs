//! Runtime handle interface
//!
//! A hydrated catalog answers content queries through [`PluginHandle`],
//! regardless of whether its code is a native library or a script. Both
//! backends speak the same JSON call convention: a method name plus a JSON
//! params object in, a JSON value out.
//!
//! Supported methods:
//! - `search` with `{ "query", "page" }` returning a [`SearchPage`]
//! - `details` with `{ "url" }` returning [`NovelDetails`]
//! - `chapters` with `{ "url" }` returning a list of [`ChapterRef`]
//! - `content` with `{ "url" }` returning [`ChapterContent`]

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::types::{CatalogKind, PackageId};
use crate::core::error::{CatalogError, Result};

/// Query interface of a loaded catalog
#[async_trait]
pub trait PluginHandle: Send + Sync {
    fn package_id(&self) -> &PackageId;

    fn kind(&self) -> CatalogKind;

    /// Invoke a catalog method with JSON params
    ///
    /// # Errors
    /// Returns [`CatalogError::Execution`] if the catalog reports a failure
    /// and [`CatalogError::LoadFailed`] if its code cannot be brought up.
    async fn invoke(&self, method: &str, params: Value) -> Result<Value>;

    /// Release runtime resources. Further calls may bring them back up.
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Search for novels by keyword
    ///
    /// # Arguments
    /// * `query` - Search keyword
    /// * `page` - Page number (1-indexed)
    async fn search(&self, query: &str, page: u32) -> Result<SearchPage> {
        let value = self.invoke("search", json!({ "query": query, "page": page })).await?;
        decode(self.package_id(), "search", value)
    }

    /// Get detailed information about a novel
    async fn details(&self, url: &str) -> Result<NovelDetails> {
        let value = self.invoke("details", json!({ "url": url })).await?;
        decode(self.package_id(), "details", value)
    }

    /// Get the chapter list of a novel, in reading order
    async fn chapters(&self, url: &str) -> Result<Vec<ChapterRef>> {
        let value = self.invoke("chapters", json!({ "url": url })).await?;
        decode(self.package_id(), "chapters", value)
    }

    /// Get the text of one chapter
    async fn content(&self, url: &str) -> Result<ChapterContent> {
        let value = self.invoke("content", json!({ "url": url })).await?;
        decode(self.package_id(), "content", value)
    }
}

fn decode<T: DeserializeOwned>(package_id: &str, method: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| {
        CatalogError::Execution(format!(
            "{} returned a malformed {} result: {}",
            package_id, method, e
        ))
    })
}

/// A page of search results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPage {
    pub items: Vec<NovelSummary>,
    #[serde(default)]
    pub has_next_page: bool,
}

/// Novel entry as shown in listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NovelSummary {
    pub title: String,
    /// Catalog-relative URL used for follow-up queries
    pub url: String,
    #[serde(default)]
    pub cover: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NovelDetails {
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cover: Option<String>,
    #[serde(default)]
    pub genres: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRef {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub number: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterContent {
    pub url: String,
    /// Paragraphs in reading order
    pub paragraphs: Vec<String>,
}
