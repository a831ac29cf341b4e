//! Commit-reveal vote encoding.
//!
//! A vote is the round's symbol-ordered price list, each price scaled by
//! `PRICE_PRECISION` and packed as a 32-byte big-endian word, with 32 zero
//! bytes standing in for a missing symbol. The commitment is keccak-256 over
//! the packed votes with the salt word appended.

use crate::types::{PriceBySymbol, PRICE_PRECISION};
use ethers::types::{H256, U256};
use ethers::utils::keccak256;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// `floor(price × PRICE_PRECISION)` as the chain's 256-bit price value.
pub fn encode_price(price: Decimal) -> U256 {
    let scaled = (price * Decimal::from(PRICE_PRECISION)).floor();
    U256::from(scaled.to_u128().unwrap_or_default())
}

/// The symbol-ordered vote list for a round; missing symbols vote zero.
pub fn encode_votes(symbols: &[String], prices: &PriceBySymbol) -> Vec<U256> {
    symbols
        .iter()
        .map(|symbol| {
            prices
                .get(symbol)
                .map(|p| encode_price(p.price))
                .unwrap_or_default()
        })
        .collect()
}

/// Packed commitment preimage: the vote words followed by the salt word.
pub fn encode_preimage(symbols: &[String], prices: &PriceBySymbol, salt: U256) -> Vec<u8> {
    let votes = encode_votes(symbols, prices);
    let mut packed = Vec::with_capacity((votes.len() + 1) * 32);
    let mut word = [0u8; 32];
    for vote in votes {
        vote.to_big_endian(&mut word);
        packed.extend_from_slice(&word);
    }
    salt.to_big_endian(&mut word);
    packed.extend_from_slice(&word);
    packed
}

/// Splits a packed preimage back into its vote words and trailing salt.
/// Returns `None` when the input is not a whole number of words or lacks the
/// salt.
pub fn decode_preimage(packed: &[u8]) -> Option<(Vec<U256>, U256)> {
    if packed.is_empty() || packed.len() % 32 != 0 {
        return None;
    }
    let mut words: Vec<U256> = packed
        .chunks_exact(32)
        .map(U256::from_big_endian)
        .collect();
    let salt = words.pop()?;
    Some((words, salt))
}

/// Commitment hash for one round's data.
pub fn commitment_hash(symbols: &[String], prices: &PriceBySymbol, salt: U256) -> H256 {
    H256::from(keccak256(encode_preimage(symbols, prices, salt)))
}
