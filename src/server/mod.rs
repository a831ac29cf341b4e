//! Oracle server - symbol set, price collection and the aggregated cache
//!
//! Owns the plugin host and drives two periodic jobs: a collection tick that
//! fans out to every plugin and aggregates the results into the price cache,
//! and a discovery tick that picks up new or updated plugin binaries.

pub mod aggregator;

use crate::config::OracleConfig;
use crate::plugins::PluginHost;
use crate::types::{now_millis, OracleError, PluginInfo, Price, PriceBySymbol, VERSION};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// The narrow surface the chain reporter consumes: push the contract's symbol
/// list in, pull fresh prices out.
#[async_trait]
pub trait PriceService: Send + Sync {
    async fn update_symbols(&self, symbols: Vec<String>);
    async fn get_prices_by_symbols(&self, symbols: &[String]) -> PriceBySymbol;
}

pub struct OracleServer {
    symbols: RwLock<Vec<String>>,
    prices: RwLock<PriceBySymbol>,
    host: PluginHost,
    update_interval: Duration,
    discovery_interval: Duration,
    valid_data_age_ms: i64,
    shutdown: watch::Sender<bool>,
}

impl OracleServer {
    /// Builds the server and performs startup plugin discovery. An empty
    /// plugin directory is fatal.
    pub async fn new(cfg: OracleConfig) -> Result<Self, OracleError> {
        let host = PluginHost::start(&cfg.plugin_dir).await?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            symbols: RwLock::new(cfg.symbols),
            prices: RwLock::new(PriceBySymbol::new()),
            host,
            update_interval: Duration::from_secs(cfg.update_interval_secs),
            discovery_interval: Duration::from_secs(cfg.plugin_discovery_interval_secs),
            valid_data_age_ms: cfg.valid_data_age_ms,
            shutdown,
        })
    }

    pub fn version(&self) -> &'static str {
        VERSION
    }

    /// Union-merges new symbols into the set, preserving first-insertion
    /// order. Symbols are never removed.
    pub async fn update_symbols(&self, new_symbols: &[String]) {
        let mut symbols = self.symbols.write().await;
        for symbol in new_symbols {
            if !symbols.contains(symbol) {
                symbols.push(symbol.clone());
            }
        }
    }

    /// Snapshot of the current symbol set.
    pub async fn symbols(&self) -> Vec<String> {
        self.symbols.read().await.clone()
    }

    /// Snapshot of the aggregated price cache.
    pub async fn get_prices(&self) -> PriceBySymbol {
        self.prices.read().await.clone()
    }

    /// Cache snapshot filtered to `symbols`, dropping entries that are stale
    /// or not collected yet.
    pub async fn get_prices_by_symbols(&self, symbols: &[String]) -> PriceBySymbol {
        let now = now_millis();
        let prices = self.prices.read().await;
        let mut out = PriceBySymbol::new();
        for symbol in symbols {
            match prices.get(symbol) {
                Some(price) if price.is_fresh(now, self.valid_data_age_ms) => {
                    out.insert(symbol.clone(), price.clone());
                }
                Some(_) => warn!(symbol = %symbol, "price is out of update"),
                None => warn!(symbol = %symbol, "price not available yet"),
            }
        }
        out
    }

    /// Writes one aggregated price into the cache.
    pub async fn update_price(&self, price: Price) {
        self.prices.write().await.insert(price.symbol.clone(), price);
    }

    /// Registry rows of the running plugins.
    pub async fn plugins(&self) -> Vec<PluginInfo> {
        self.host.registry().await
    }

    /// One collection pass: fan out to every plugin in parallel, then
    /// aggregate the fresh per-plugin observations per symbol. Symbols with
    /// no fresh data keep their previous cache entry.
    pub async fn collect_prices(&self) {
        let symbols = self.symbols().await;
        let handles = self.host.handles().await;

        let mut workers = Vec::with_capacity(handles.len());
        for handle in &handles {
            let handle = handle.clone();
            let symbols = symbols.clone();
            workers.push(tokio::spawn(async move {
                let result = handle.fetch_prices(&symbols).await;
                (handle.name().to_string(), result)
            }));
        }
        for worker in workers {
            match worker.await {
                Ok((name, Err(e))) => {
                    warn!(plugin = %name, error = %e, "fetching prices from plugin failed")
                }
                Err(e) => warn!(error = %e, "price worker aborted"),
                Ok((_, Ok(()))) => {}
            }
        }

        let now = now_millis();
        for symbol in &symbols {
            let mut observations = Vec::new();
            for handle in &handles {
                if let Some(price) = handle.sub_pool().get(symbol).await {
                    if price.is_fresh(now, self.valid_data_age_ms) {
                        observations.push(price);
                    }
                }
            }

            let Some(aggregated) = aggregator::median(
                &observations.iter().map(|p| p.price).collect::<Vec<_>>(),
            ) else {
                continue;
            };
            // the cache entry carries the freshest contributing observation time
            let timestamp = observations.iter().map(|p| p.timestamp).max().unwrap_or(now);

            self.update_price(Price {
                symbol: symbol.clone(),
                price: aggregated,
                timestamp,
            })
            .await;
        }
    }

    /// Runs the collection and discovery tickers until `stop` is called.
    pub async fn run(&self) {
        let mut update_tick = interval(self.update_interval);
        update_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut discovery_tick = interval(self.discovery_interval);
        discovery_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    self.host.close_all().await;
                    info!("oracle server ticker jobs stopped");
                    return;
                }
                _ = discovery_tick.tick() => self.host.discover().await,
                _ = update_tick.tick() => self.collect_prices().await,
            }
        }
    }

    /// Signals the event loop to exit and close all plugin handles.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[async_trait]
impl PriceService for OracleServer {
    async fn update_symbols(&self, symbols: Vec<String>) {
        OracleServer::update_symbols(self, &symbols).await;
    }

    async fn get_prices_by_symbols(&self, symbols: &[String]) -> PriceBySymbol {
        OracleServer::get_prices_by_symbols(self, symbols).await
    }
}
