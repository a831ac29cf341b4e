//! Per-plugin price sub-pools.

use crate::types::Price;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Latest observations from a single provider plugin, keyed by symbol.
///
/// Written by the owning plugin worker, read by the collection tick. The pool
/// is dropped together with its plugin handle, so a replaced plugin always
/// starts from an empty pool.
#[derive(Debug, Default)]
pub struct SubPool {
    prices: Mutex<HashMap<String, Price>>,
}

impl SubPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Stores a price, overwriting any prior entry for the symbol.
    pub async fn put(&self, price: Price) {
        self.prices.lock().await.insert(price.symbol.clone(), price);
    }

    pub async fn get(&self, symbol: &str) -> Option<Price> {
        self.prices.lock().await.get(symbol).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn price(symbol: &str, value: rust_decimal::Decimal, ts: i64) -> Price {
        Price {
            symbol: symbol.to_string(),
            price: value,
            timestamp: ts,
        }
    }

    #[tokio::test]
    async fn put_overwrites_prior_entry() {
        let pool = SubPool::new();
        pool.put(price("BTCUSD", dec!(30000), 1)).await;
        pool.put(price("BTCUSD", dec!(31000), 2)).await;

        let got = pool.get("BTCUSD").await.unwrap();
        assert_eq!(got.price, dec!(31000));
        assert_eq!(got.timestamp, 2);
    }

    #[tokio::test]
    async fn get_missing_symbol_is_none() {
        let pool = SubPool::new();
        assert!(pool.get("ETHUSD").await.is_none());
    }
}
