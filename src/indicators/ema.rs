// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// Formula:
//   alpha  = 2 / (period + 1)
//   EMA_t  = EMA_{t-1} + alpha * (close_t - EMA_{t-1})
//
// The first EMA value is seeded with the SMA of the first `period` closes and
// sits on the bar at index `period - 1`.  Earlier bars carry no value.
// =============================================================================

/// Compute the EMA series aligned one-to-one with `closes`.
///
/// The output always has `closes.len()` entries; the first `period - 1` are
/// `None`.  Once a non-finite value is produced every later entry is `None`.
///
/// # Edge cases
/// - `period == 0` => all `None`
/// - `closes.len() < period` => all `None`
pub fn ema(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    let alpha = 2.0 / (period + 1) as f64;

    // Seed: SMA of the first `period` values.
    let seed = closes[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return out;
    }
    out[period - 1] = Some(seed);

    let mut prev = seed;
    for (i, &close) in closes.iter().enumerate().skip(period) {
        let value = prev + alpha * (close - prev);
        if !value.is_finite() {
            break;
        }
        out[i] = Some(value);
        prev = value;
    }

    out
}
