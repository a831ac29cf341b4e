//! A running plugin subprocess: the child process, its RPC channel and its
//! price sub-pool.

use crate::plugins::pool::SubPool;
use crate::plugins::rpc::{self, FetchRequest, FetchResponse, Handshake};
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

/// One running plugin. Exclusively owned by the plugin host; the collection
/// tick borrows handles only for the duration of one pass.
pub struct PluginHandle {
    name: String,
    version: String,
    started_at: SystemTime,
    sub_pool: Arc<SubPool>,
    proc: Mutex<ProcState>,
}

/// Child process plus the stdio halves of the RPC channel. Guarded by one
/// mutex so requests and responses stay paired.
struct ProcState {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

impl PluginHandle {
    /// Spawns the plugin binary with the launch cookie in its environment and
    /// verifies the handshake line before accepting it.
    pub async fn launch(dir: &Path, name: &str, sub_pool: Arc<SubPool>) -> Result<Self> {
        let path = dir.join(name);
        let mut child = Command::new(&path)
            .env(rpc::COOKIE_KEY, rpc::COOKIE_VALUE)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn plugin {}", path.display()))?;

        let stdin = child.stdin.take().context("plugin stdin unavailable")?;
        let stdout = child.stdout.take().context("plugin stdout unavailable")?;
        let mut lines = BufReader::new(stdout).lines();

        let first = timeout(rpc::HANDSHAKE_TIMEOUT, lines.next_line())
            .await
            .context("plugin handshake timed out")?
            .context("reading plugin handshake failed")?
            .context("plugin exited before handshake")?;
        let handshake = Handshake::parse(&first)?;
        handshake.verify()?;

        Ok(Self {
            name: name.to_string(),
            version: handshake.plugin_version,
            started_at: SystemTime::now(),
            sub_pool,
            proc: Mutex::new(ProcState {
                child,
                stdin,
                stdout: lines,
                next_id: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    pub fn sub_pool(&self) -> &SubPool {
        &self.sub_pool
    }

    /// Requests prices for `symbols` and folds the reply into the sub-pool.
    /// One request is in flight per plugin at a time.
    pub async fn fetch_prices(&self, symbols: &[String]) -> Result<()> {
        let mut proc = self.proc.lock().await;
        proc.next_id += 1;

        let request = FetchRequest {
            id: proc.next_id,
            symbols: symbols.to_vec(),
        };
        let mut frame = serde_json::to_vec(&request)?;
        frame.push(b'\n');
        proc.stdin
            .write_all(&frame)
            .await
            .with_context(|| format!("writing to plugin {} failed", self.name))?;
        proc.stdin.flush().await?;

        let line = proc
            .stdout
            .next_line()
            .await
            .with_context(|| format!("reading from plugin {} failed", self.name))?
            .with_context(|| format!("plugin {} closed its stdout", self.name))?;
        let response: FetchResponse = serde_json::from_str(&line)
            .with_context(|| format!("malformed response from plugin {}", self.name))?;

        if response.id != request.id {
            bail!(
                "plugin {} answered request {} with id {}",
                self.name,
                request.id,
                response.id
            );
        }
        if let Some(error) = response.error {
            bail!("plugin {} error: {error}", self.name);
        }

        for price in response.prices {
            self.sub_pool.put(price).await;
        }
        Ok(())
    }

    /// Terminates the subprocess. The RPC channel and sub-pool go away with
    /// the handle.
    pub async fn close(&self) {
        let mut proc = self.proc.lock().await;
        if let Err(e) = proc.child.kill().await {
            debug!(plugin = %self.name, error = %e, "plugin already gone on close");
        }
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("started_at", &self.started_at)
            .finish()
    }
}
