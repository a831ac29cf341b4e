//! Plugin host - discovery and lifecycle of out-of-process data providers
//!
//! Provider plugins are standalone executables dropped into the plugin
//! directory. The host launches each one as a subprocess, talks to it over a
//! handshake-protected stdio RPC and keeps a per-plugin price sub-pool.
//! Replacing a binary on disk hot-swaps the running plugin at the next
//! discovery pass.

mod handle;
pub mod pool;
pub mod rpc;

pub use handle::PluginHandle;
pub use pool::SubPool;
pub use rpc::Adapter;

use crate::types::{OracleError, PluginInfo};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Registry of running plugins, keyed by the on-disk file name.
pub struct PluginHost {
    plugin_dir: PathBuf,
    handles: RwLock<HashMap<String, Arc<PluginHandle>>>,
}

impl std::fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHost")
            .field("plugin_dir", &self.plugin_dir)
            .finish()
    }
}

impl PluginHost {
    /// Enumerates the plugin directory and launches everything found there.
    /// An empty directory is a startup failure; individual plugins that fail
    /// to load are logged and skipped.
    pub async fn start(plugin_dir: impl Into<PathBuf>) -> Result<Self, OracleError> {
        let host = Self {
            plugin_dir: plugin_dir.into(),
            handles: RwLock::new(HashMap::new()),
        };

        let entries = host.list_plugin_dir();
        if entries.is_empty() {
            return Err(OracleError::StartupFatal(format!(
                "no plugins at plugin dir {}, please install the plugins",
                host.plugin_dir.display()
            )));
        }
        for (name, _) in entries {
            host.launch(&name).await;
        }
        Ok(host)
    }

    /// One discovery pass: launch new binaries, replace the ones whose mtime
    /// advanced past the running instance's start time. Entries missing from
    /// the directory are left running, the file may be absent mid-update.
    pub async fn discover(&self) {
        for (name, mtime) in self.list_plugin_dir() {
            let existing = self.handles.read().await.get(&name).cloned();
            match existing {
                None => {
                    info!(plugin = %name, "new plugin discovered, setting it up");
                    self.launch(&name).await;
                }
                Some(handle) if mtime > handle.started_at() => {
                    info!(plugin = %name, "plugin binary updated, replacing running instance");
                    handle.close().await;
                    self.handles.write().await.remove(&name);
                    self.launch(&name).await;
                }
                Some(_) => {}
            }
        }
    }

    /// Snapshot of the running plugin handles for one collection pass.
    pub async fn handles(&self) -> Vec<Arc<PluginHandle>> {
        self.handles.read().await.values().cloned().collect()
    }

    /// Registry rows for status callers.
    pub async fn registry(&self) -> Vec<PluginInfo> {
        self.handles
            .read()
            .await
            .values()
            .map(|handle| PluginInfo {
                name: handle.name().to_string(),
                version: handle.version().to_string(),
                started_at: DateTime::<Utc>::from(handle.started_at()),
            })
            .collect()
    }

    /// Terminates every plugin subprocess.
    pub async fn close_all(&self) {
        let handles: Vec<_> = self.handles.write().await.drain().collect();
        for (_, handle) in handles {
            handle.close().await;
        }
    }

    async fn launch(&self, name: &str) {
        let sub_pool = SubPool::new();
        match PluginHandle::launch(&self.plugin_dir, name, sub_pool).await {
            Ok(handle) => {
                info!(plugin = %name, version = %handle.version(), "plugin on ready");
                self.handles
                    .write()
                    .await
                    .insert(name.to_string(), Arc::new(handle));
            }
            Err(e) => warn!(plugin = %name, error = %e, "cannot load plugin"),
        }
    }

    /// A host with no plugins and no directory, for cache-level tests.
    #[cfg(test)]
    pub(crate) fn empty_for_tests() -> Self {
        Self {
            plugin_dir: PathBuf::new(),
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Non-directory entries of the plugin directory with their mtimes.
    fn list_plugin_dir(&self) -> Vec<(String, SystemTime)> {
        let entries = match std::fs::read_dir(&self.plugin_dir) {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    dir = %self.plugin_dir.display(),
                    error = %e,
                    "cannot read plugin dir, please double check plugins are saved there"
                );
                return Vec::new();
            }
        };

        let mut plugins = Vec::new();
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                continue;
            }
            let Ok(mtime) = meta.modified() else { continue };
            plugins.push((entry.file_name().to_string_lossy().into_owned(), mtime));
        }
        plugins
    }
}
