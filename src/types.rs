//! Core types shared by the oracle server, the plugin host and the chain
//! reporter.

use chrono::{DateTime, Utc};
use ethers::types::{H256, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Integer scaling factor applied to prices before on-chain encoding.
pub const PRICE_PRECISION: u64 = 1_000_000_000;

/// Node version, reported by the oracle server and the bundled plugins.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One price observation for one symbol from one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub symbol: String,
    pub price: Decimal,
    /// Provider-side observation time, milliseconds since epoch.
    pub timestamp: i64,
}

impl Price {
    /// A price is usable while it is younger than `valid_data_age_ms` and not
    /// stamped in the future.
    pub fn is_fresh(&self, now_ms: i64, valid_data_age_ms: i64) -> bool {
        now_ms - self.timestamp < valid_data_age_ms && self.timestamp <= now_ms
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}@{}", self.symbol, self.price, self.timestamp)
    }
}

/// Aggregated price cache keyed by symbol.
pub type PriceBySymbol = HashMap<String, Price>;

/// Registry row describing a running provider plugin.
#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
}

/// Everything the reporter must retain about one voting round: the symbol
/// order and prices it committed to, the salt, and the resulting commitment
/// hash. Kept buffered so the next round can reveal it.
#[derive(Debug, Clone)]
pub struct RoundData {
    pub round: u64,
    pub symbols: Vec<String>,
    pub prices: PriceBySymbol,
    pub salt: U256,
    pub commitment: H256,
    /// Hash of the accepted vote transaction, filled in after submission.
    pub tx: Option<H256>,
}

/// Error kinds the event loops distinguish. Transient network failures stay
/// plain `anyhow` errors and are logged at the tick that observed them.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("l1 node is syncing with its peers")]
    PeerSyncInProgress,

    #[error("no available prices collected yet")]
    NoAvailablePrice,

    #[error("event subscription lost: {0}")]
    SubscriptionLost(String),

    #[error("plugin handshake mismatch: {0}")]
    HandshakeMismatch(String),

    #[error("startup failure: {0}")]
    StartupFatal(String),
}
