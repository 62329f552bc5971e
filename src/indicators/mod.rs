// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators stored alongside
// every bar.  The series functions return one `Option<f64>` per input so
// callers can zip them straight back onto their bars; `None` means "not
// enough history yet" and is persisted as `null`.

pub mod ema;
pub mod rsi;
pub mod vwap;

use crate::types::{round4, TradingDaySeries};

pub const RSI_PERIOD: usize = 14;
pub const EMA_FAST_PERIOD: usize = 10;
pub const EMA_SLOW_PERIOD: usize = 20;

/// Fewest prior sessions worth of closes the updater hands to [`annotate`].
pub const MIN_LOOKBACK_SESSIONS: usize = RSI_PERIOD;

/// Annotate freshly fetched `days` in place.
///
/// EMA and RSI run over `lookback_closes` followed by every close in `days`
/// (chronological), and only the values that land on bars of `days` are kept.
/// VWAP is computed per day from that day's first bar.  Existing indicator
/// values on the bars are overwritten.
pub fn annotate(lookback_closes: &[f64], days: &mut TradingDaySeries) {
    let fresh: usize = days.values().map(Vec::len).sum();
    let mut closes = Vec::with_capacity(lookback_closes.len() + fresh);
    closes.extend_from_slice(lookback_closes);
    closes.extend(days.values().flatten().map(|bar| bar.close));

    let rsi_14 = rsi::rsi(&closes, RSI_PERIOD);
    let ema_10 = ema::ema(&closes, EMA_FAST_PERIOD);
    let ema_20 = ema::ema(&closes, EMA_SLOW_PERIOD);

    let mut idx = lookback_closes.len();
    for bars in days.values_mut() {
        let vwap = vwap::session_vwap(bars);
        for (bar, vwap) in bars.iter_mut().zip(vwap) {
            bar.rsi_14 = rsi_14[idx].map(round4);
            bar.ema_10 = ema_10[idx].map(round4);
            bar.ema_20 = ema_20[idx].map(round4);
            bar.vwap = vwap.map(round4);
            idx += 1;
        }
    }
}
