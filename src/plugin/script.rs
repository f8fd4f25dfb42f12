//! Script catalog handle
//!
//! Script catalogs are JavaScript files that assign their query functions to
//! `globalThis.catalog`:
//!
//! ```js
//! globalThis.catalog = {
//!   async search({ query, page }) { ... },
//!   async details({ url }) { ... },
//!   async chapters({ url }) { ... },
//!   async content({ url }) { ... },
//! };
//! ```
//!
//! `deno_core::JsRuntime` is `!Send`, so each catalog gets a dedicated worker
//! thread running a current-thread tokio runtime. The handle talks to it over
//! a channel. The worker is started by the first query and stops when the
//! handle is shut down or dropped.

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde_json::Value;
use std::path::PathBuf;
use std::thread;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info};

use super::handle::PluginHandle;
use super::types::{CatalogKind, PackageId};
use crate::core::error::{CatalogError, Result};

enum ScriptCommand {
    Call {
        method: String,
        params: Value,
        resp: oneshot::Sender<Result<Value>>,
    },
    Shutdown,
}

/// [`PluginHandle`] backed by an embedded JavaScript runtime
pub struct ScriptHandle {
    package_id: PackageId,
    entry: PathBuf,
    worker: Mutex<Option<mpsc::Sender<ScriptCommand>>>,
}

impl ScriptHandle {
    /// Create a handle for a validated script; the runtime starts on first use
    pub fn new(package_id: PackageId, entry: PathBuf) -> Self {
        Self {
            package_id,
            entry,
            worker: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .try_lock()
            .map(|w| w.as_ref().map(|tx| !tx.is_closed()).unwrap_or(false))
            .unwrap_or(true)
    }

    async fn sender(&self) -> Result<mpsc::Sender<ScriptCommand>> {
        let mut slot = self.worker.lock().await;
        if let Some(tx) = slot.as_ref().filter(|tx| !tx.is_closed()) {
            return Ok(tx.clone());
        }

        let source = tokio::fs::read_to_string(&self.entry).await.map_err(|e| {
            CatalogError::LoadFailed(format!("cannot read {}: {}", self.entry.display(), e))
        })?;
        let tx = spawn_worker(self.package_id.clone(), source).await?;
        *slot = Some(tx.clone());
        Ok(tx)
    }
}

/// Start the worker thread and wait until the script has been evaluated
async fn spawn_worker(package_id: PackageId, source: String) -> Result<mpsc::Sender<ScriptCommand>> {
    let (tx, mut rx) = mpsc::channel::<ScriptCommand>(32);
    let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
    let thread_id = package_id.clone();

    thread::Builder::new()
        .name(format!("catalog-js-{}", package_id))
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(CatalogError::LoadFailed(format!(
                        "cannot start script runtime: {}",
                        e
                    ))));
                    return;
                }
            };

            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, async move {
                let mut engine = match ScriptEngine::new(&thread_id, source) {
                    Ok(engine) => {
                        let _ = ready_tx.send(Ok(()));
                        engine
                    }
                    Err(e) => {
                        error!(package_id = %thread_id, error = %e, "Script catalog failed to start");
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                info!(package_id = %thread_id, "Script catalog ready");

                while let Some(cmd) = rx.recv().await {
                    match cmd {
                        ScriptCommand::Call { method, params, resp } => {
                            let result = engine.call(&method, params).await;
                            let _ = resp.send(result);
                        }
                        ScriptCommand::Shutdown => break,
                    }
                }
                debug!(package_id = %thread_id, "Script catalog worker exiting");
            });
        })
        .map_err(|e| CatalogError::LoadFailed(format!("cannot spawn script worker: {}", e)))?;

    ready_rx
        .await
        .map_err(|_| CatalogError::LoadFailed(format!("script worker for {} died", package_id)))??;
    Ok(tx)
}

struct ScriptEngine {
    runtime: JsRuntime,
    package_id: PackageId,
}

impl ScriptEngine {
    fn new(package_id: &str, source: String) -> Result<Self> {
        let mut runtime = JsRuntime::new(RuntimeOptions::default());
        runtime
            .execute_script("<catalog>", source.into())
            .map_err(|e| CatalogError::LoadFailed(format!("{} failed to evaluate: {}", package_id, e)))?;

        let mut engine = Self { runtime, package_id: package_id.to_string() };
        let shape = engine
            .read_global("(typeof globalThis.catalog === 'object' && globalThis.catalog !== null) ? 'ok' : 'missing'")
            .map_err(|e| CatalogError::LoadFailed(e.to_string()))?;
        if shape.as_deref() != Some("ok") {
            return Err(CatalogError::LoadFailed(format!(
                "{} does not define globalThis.catalog",
                package_id
            )));
        }
        Ok(engine)
    }

    async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let script = format!(
            r#"
            globalThis.__catalog_status = "pending";
            globalThis.__catalog_result = undefined;
            globalThis.__catalog_error = undefined;
            (async () => {{
              try {{
                const fn = globalThis.catalog[{method}];
                if (typeof fn !== "function") throw new Error("unknown method " + {method});
                const result = await fn.call(globalThis.catalog, {params});
                globalThis.__catalog_result = JSON.stringify(result === undefined ? null : result);
                globalThis.__catalog_status = "success";
              }} catch (e) {{
                globalThis.__catalog_error = String(e && e.message ? e.message : e);
                globalThis.__catalog_status = "error";
              }}
            }})();
            "#,
            method = serde_json::to_string(method)?,
            params = serde_json::to_string(&params)?,
        );

        self.runtime
            .execute_script("<catalog_call>", script.into())
            .map_err(|e| self.execution_error(method, e))?;
        self.runtime
            .run_event_loop(Default::default())
            .await
            .map_err(|e| self.execution_error(method, e))?;

        let status = self.read_global("globalThis.__catalog_status")?;
        match status.as_deref() {
            Some("success") => {
                let raw = self.read_global("globalThis.__catalog_result")?.unwrap_or_else(|| "null".to_string());
                self.read_global("globalThis.__catalog_result = undefined")?;
                Ok(serde_json::from_str(&raw)?)
            }
            Some("error") => {
                let message = self.read_global("globalThis.__catalog_error")?.unwrap_or_default();
                Err(CatalogError::Execution(format!("{}.{}: {}", self.package_id, method, message)))
            }
            other => Err(CatalogError::Execution(format!(
                "{}.{} did not settle (status {:?})",
                self.package_id, method, other
            ))),
        }
    }

    /// Evaluate `expr` and stringify the result; `None` for null or undefined
    fn read_global(&mut self, expr: &str) -> Result<Option<String>> {
        let value = self
            .runtime
            .execute_script("<catalog_read>", expr.to_string().into())
            .map_err(|e| CatalogError::Execution(e.to_string()))?;

        let scope = &mut self.runtime.handle_scope();
        let local = v8::Local::new(scope, value);
        if local.is_null_or_undefined() {
            return Ok(None);
        }
        Ok(local.to_string(scope).map(|s| s.to_rust_string_lossy(scope)))
    }

    fn execution_error(&self, method: &str, e: impl std::fmt::Display) -> CatalogError {
        CatalogError::Execution(format!("{}.{}: {}", self.package_id, method, e))
    }
}

#[async_trait]
impl PluginHandle for ScriptHandle {
    fn package_id(&self) -> &PackageId {
        &self.package_id
    }

    fn kind(&self) -> CatalogKind {
        CatalogKind::Script
    }

    async fn invoke(&self, method: &str, params: Value) -> Result<Value> {
        let tx = self.sender().await?;
        let (resp_tx, resp_rx) = oneshot::channel();

        tx.send(ScriptCommand::Call {
            method: method.to_string(),
            params,
            resp: resp_tx,
        })
        .await
        .map_err(|_| CatalogError::Execution(format!("script worker for {} is gone", self.package_id)))?;

        resp_rx
            .await
            .map_err(|_| CatalogError::Execution(format!("script worker for {} dropped the call", self.package_id)))?
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.worker.lock().await.take() {
            let _ = tx.send(ScriptCommand::Shutdown).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::write_script;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_script_answers_queries() {
        let dir = TempDir::new().unwrap();
        let entry = write_script(dir.path(), "demo");
        let handle = ScriptHandle::new("demo".into(), entry);
        assert!(!handle.is_running());

        let page = handle.search("dragon", 1).await.unwrap();
        assert_eq!(page.items[0].title, "dragon (demo)");
        assert!(page.has_next_page);
        assert!(handle.is_running());

        let content = handle.content("/novel/1/1").await.unwrap();
        assert_eq!(content.paragraphs, vec!["first", "second"]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_method_is_execution_error() {
        let dir = TempDir::new().unwrap();
        let entry = write_script(dir.path(), "demo");
        let handle = ScriptHandle::new("demo".into(), entry);

        let err = handle.invoke("popular", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, CatalogError::Execution(ref m) if m.contains("unknown method popular")));
    }

    #[tokio::test]
    async fn test_script_without_catalog_fails_to_load() {
        let dir = TempDir::new().unwrap();
        let entry = dir.path().join("broken.js");
        std::fs::write(&entry, "const nothing = 1;").unwrap();
        let handle = ScriptHandle::new("broken".into(), entry);

        let err = handle.search("x", 1).await.unwrap_err();
        assert!(matches!(err, CatalogError::LoadFailed(_)));
        assert!(!handle.is_running());
    }
}
