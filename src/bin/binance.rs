//! Binance spot-price plugin
//!
//! Standalone plugin binary launched by the oracle node's plugin host. Oracle
//! symbols like `BTCUSD` trade as USDT pairs on Binance, so the adapter
//! translates the requested symbols, fetches spot tickers over REST and
//! reports them back keyed by the original symbol.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use oracle_node::plugins::rpc::{self, Adapter};
use oracle_node::types::{now_millis, Price, VERSION};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const BINANCE_REST_URL: &str = "https://api.binance.com/api/v3/ticker/price";

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

struct BinanceAdapter {
    client: reqwest::Client,
}

impl BinanceAdapter {
    fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

/// Maps an oracle symbol to the Binance pair it trades as.
fn to_exchange_pair(symbol: &str) -> Option<String> {
    symbol
        .strip_suffix("USD")
        .filter(|base| !base.is_empty())
        .map(|base| format!("{base}USDT"))
}

/// Translates exchange tickers back to the requested oracle symbols,
/// dropping pairs nobody asked for and prices that do not parse.
fn parse_tickers(
    tickers: Vec<TickerPrice>,
    requested: &HashMap<String, String>,
    now: i64,
) -> Vec<Price> {
    tickers
        .into_iter()
        .filter_map(|ticker| {
            let symbol = requested.get(&ticker.symbol)?.clone();
            let price: Decimal = ticker.price.parse().ok()?;
            Some(Price {
                symbol,
                price,
                timestamp: now,
            })
        })
        .collect()
}

#[async_trait]
impl Adapter for BinanceAdapter {
    fn name(&self) -> &'static str {
        "binance"
    }

    fn version(&self) -> &'static str {
        VERSION
    }

    async fn fetch_prices(&self, symbols: &[String]) -> Result<Vec<Price>> {
        // exchange pair -> requested oracle symbol
        let mut requested = HashMap::new();
        for symbol in symbols {
            if let Some(pair) = to_exchange_pair(symbol) {
                requested.insert(pair, symbol.clone());
            }
        }
        if requested.is_empty() {
            return Ok(Vec::new());
        }

        let pairs = serde_json::to_string(&requested.keys().collect::<Vec<_>>())?;
        let response = self
            .client
            .get(BINANCE_REST_URL)
            .query(&[("symbols", pairs.as_str())])
            .send()
            .await
            .context("Failed to fetch tickers from Binance")?;

        if !response.status().is_success() {
            bail!("Binance API returned error: {}", response.status());
        }

        let tickers: Vec<TickerPrice> = response
            .json()
            .await
            .context("Failed to parse Binance ticker response")?;

        Ok(parse_tickers(tickers, &requested, now_millis()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the RPC frames, logs go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();
    rpc::serve(BinanceAdapter::new()?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn oracle_symbols_translate_to_usdt_pairs() {
        assert_eq!(to_exchange_pair("BTCUSD").as_deref(), Some("BTCUSDT"));
        assert_eq!(to_exchange_pair("ETHUSD").as_deref(), Some("ETHUSDT"));
        assert_eq!(to_exchange_pair("USD"), None);
        assert_eq!(to_exchange_pair("BTCEUR"), None);
    }

    #[test]
    fn tickers_map_back_to_requested_symbols() {
        let requested: HashMap<String, String> = [
            ("BTCUSDT".to_string(), "BTCUSD".to_string()),
            ("ETHUSDT".to_string(), "ETHUSD".to_string()),
        ]
        .into();
        let tickers: Vec<TickerPrice> = serde_json::from_str(
            r#"[
                {"symbol":"BTCUSDT","price":"30000.00000000"},
                {"symbol":"ETHUSDT","price":"2000.50000000"},
                {"symbol":"SOLUSDT","price":"100.0"}
            ]"#,
        )
        .unwrap();

        let mut prices = parse_tickers(tickers, &requested, 1_700_000_000_000);
        prices.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        assert_eq!(prices.len(), 2);
        assert_eq!(prices[0].symbol, "BTCUSD");
        assert_eq!(prices[0].price, dec!(30000));
        assert_eq!(prices[1].symbol, "ETHUSD");
        assert_eq!(prices[1].price, dec!(2000.5));
        assert_eq!(prices[1].timestamp, 1_700_000_000_000);
    }

    #[test]
    fn unparsable_prices_are_dropped() {
        let requested: HashMap<String, String> =
            [("BTCUSDT".to_string(), "BTCUSD".to_string())].into();
        let tickers = vec![TickerPrice {
            symbol: "BTCUSDT".to_string(),
            price: "not-a-number".to_string(),
        }];
        assert!(parse_tickers(tickers, &requested, 0).is_empty());
    }
}
