//! Plugin wire protocol: a cookie-guarded handshake followed by
//! line-delimited JSON request/response frames over the subprocess's stdio.

use crate::types::{OracleError, Price};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

/// Protocol fields every plugin must present before it is loaded. The
/// four-tuple below is fixed between host and plugins; a mismatch means the
/// binary speaks a different protocol generation and cannot be used.
pub const PROTOCOL_VERSION: u32 = 1;
pub const COOKIE_KEY: &str = "ORACLE_PLUGIN_MAGIC_COOKIE";
pub const COOKIE_VALUE: &str = "5e1c06a04267a40ad8fa4af3d4f38581";
pub const TRANSPORT: &str = "stdio";

/// How long the host waits for the handshake line after spawning a plugin.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Price request sent by the host, one JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub id: u64,
    pub symbols: Vec<String>,
}

/// Plugin reply. Fewer prices than requested symbols is normal and means "no
/// fresh data" for the absent ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResponse {
    pub id: u64,
    #[serde(default)]
    pub prices: Vec<Price>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Parsed handshake line:
/// `protocolVersion|cookieKey|cookieValue|transport|pluginVersion`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: u32,
    pub cookie_key: String,
    pub cookie_value: String,
    pub transport: String,
    pub plugin_version: String,
}

impl Handshake {
    /// The line a well-behaved plugin prints on stdout right after launch.
    pub fn line(plugin_version: &str) -> String {
        format!("{PROTOCOL_VERSION}|{COOKIE_KEY}|{COOKIE_VALUE}|{TRANSPORT}|{plugin_version}")
    }

    pub fn parse(line: &str) -> Result<Self, OracleError> {
        let fields: Vec<&str> = line.trim().split('|').collect();
        if fields.len() != 5 {
            return Err(OracleError::HandshakeMismatch(format!(
                "expected 5 handshake fields, got {}",
                fields.len()
            )));
        }
        let protocol_version = fields[0].parse::<u32>().map_err(|_| {
            OracleError::HandshakeMismatch(format!("bad protocol version {:?}", fields[0]))
        })?;
        Ok(Self {
            protocol_version,
            cookie_key: fields[1].to_string(),
            cookie_value: fields[2].to_string(),
            transport: fields[3].to_string(),
            plugin_version: fields[4].to_string(),
        })
    }

    /// Checks the fixed four-tuple against this host's protocol.
    pub fn verify(&self) -> Result<(), OracleError> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(OracleError::HandshakeMismatch(format!(
                "protocol version {} != {}",
                self.protocol_version, PROTOCOL_VERSION
            )));
        }
        if self.cookie_key != COOKIE_KEY || self.cookie_value != COOKIE_VALUE {
            return Err(OracleError::HandshakeMismatch("cookie mismatch".to_string()));
        }
        if self.transport != TRANSPORT {
            return Err(OracleError::HandshakeMismatch(format!(
                "unsupported transport {:?}",
                self.transport
            )));
        }
        Ok(())
    }
}

/// The interface a data-provider plugin implements.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Provider name used in logs.
    fn name(&self) -> &'static str;

    /// Version string reported in the handshake.
    fn version(&self) -> &'static str;

    /// Fetches current prices for the requested symbols. Implementations may
    /// return fewer entries than requested.
    async fn fetch_prices(&self, symbols: &[String]) -> Result<Vec<Price>>;
}

/// Runs the plugin side of the protocol: verifies the launch cookie, emits
/// the handshake line and then serves fetch requests until stdin closes.
/// Plugin binaries call this from `main`.
pub async fn serve<A: Adapter>(adapter: A) -> Result<()> {
    match std::env::var(COOKIE_KEY) {
        Ok(v) if v == COOKIE_VALUE => {}
        _ => bail!(
            "{} is an oracle data plugin and is not meant to be executed directly",
            adapter.name()
        ),
    }

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{}\n", Handshake::line(adapter.version())).as_bytes())
        .await
        .context("writing handshake failed")?;
    stdout.flush().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let request: FetchRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(plugin = adapter.name(), error = %e, "dropping malformed request");
                continue;
            }
        };

        let response = match adapter.fetch_prices(&request.symbols).await {
            Ok(prices) => FetchResponse {
                id: request.id,
                prices,
                error: None,
            },
            Err(e) => FetchResponse {
                id: request.id,
                prices: Vec::new(),
                error: Some(e.to_string()),
            },
        };

        let mut frame = serde_json::to_vec(&response)?;
        frame.push(b'\n');
        stdout.write_all(&frame).await?;
        stdout.flush().await?;
    }

    Ok(())
}
