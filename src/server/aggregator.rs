//! Price aggregation across providers.

use rust_decimal::{Decimal, RoundingStrategy};

/// Decimal places carried on the wire; the even-count median is settled at
/// this scale.
const WIRE_SCALE: u32 = 9;

/// Median of the given prices. A single price is returned unchanged; an even
/// count resolves to the mean of the two central elements, rounded
/// half-to-even at wire precision.
pub fn median(prices: &[Decimal]) -> Option<Decimal> {
    if prices.is_empty() {
        return None;
    }

    let mut sorted = prices.to_vec();
    sorted.sort();

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        return Some(sorted[mid]);
    }

    let mean = (sorted[mid - 1] + sorted[mid]) / Decimal::TWO;
    Some(mean.round_dp_with_strategy(WIRE_SCALE, RoundingStrategy::MidpointNearestEven))
}
