// =============================================================================
// Volume-Weighted Average Price (VWAP) — intraday, resets every session
// =============================================================================
//
//   typical_t = (high_t + low_t + close_t) / 3
//   VWAP_t    = Σ(typical_i * volume_i) / Σ(volume_i)      for i in day[..=t]
//
// Callers pass exactly one trading day; nothing carries over between calls.
// =============================================================================

use crate::types::Bar;

/// Cumulative VWAP for one session, aligned one-to-one with `bars`.
///
/// While the day-to-date volume is still zero the entry is `None`.
pub fn session_vwap(bars: &[Bar]) -> Vec<Option<f64>> {
    let mut cum_pv = 0.0_f64;
    let mut cum_vol = 0.0_f64;

    bars.iter()
        .map(|bar| {
            let volume = bar.volume as f64;
            cum_pv += bar.typical_price() * volume;
            cum_vol += volume;
            if cum_vol > 0.0 {
                let v = cum_pv / cum_vol;
                v.is_finite().then_some(v)
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn bar(minute: u32, high: f64, low: f64, close: f64, volume: u64) -> Bar {
        let time = NaiveTime::from_hms_opt(9, 30 + minute, 0).unwrap();
        Bar::new(time, close, high, low, close, volume)
    }

    #[test]
    fn first_bar_is_typical_price() {
        let bars = vec![bar(0, 12.0, 9.0, 10.5, 100)];
        let v = session_vwap(&bars);
        assert!((v[0].unwrap() - 10.5).abs() < 1e-12);
    }

    #[test]
    fn cumulative_weighting() {
        let bars = vec![bar(0, 10.0, 10.0, 10.0, 100), bar(1, 20.0, 20.0, 20.0, 300)];
        let v = session_vwap(&bars);
        assert_eq!(v[0], Some(10.0));
        // (10*100 + 20*300) / 400 = 17.5
        assert!((v[1].unwrap() - 17.5).abs() < 1e-12);
    }

    #[test]
    fn zero_volume_prefix_has_no_value() {
        let bars = vec![
            bar(0, 10.0, 10.0, 10.0, 0),
            bar(1, 11.0, 11.0, 11.0, 0),
            bar(2, 12.0, 12.0, 12.0, 50),
        ];
        let v = session_vwap(&bars);
        assert_eq!(v[0], None);
        assert_eq!(v[1], None);
        assert_eq!(v[2], Some(12.0));
    }

    #[test]
    fn empty_session() {
        assert!(session_vwap(&[]).is_empty());
    }
}
