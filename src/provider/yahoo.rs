// =============================================================================
// Yahoo Finance chart client — one-minute bars
// =============================================================================
//
// GET {base}/v8/finance/chart/{TICKER}?period1=..&period2=..&interval=1m
//
// Yahoo serves 1-minute history for roughly the last 30 days and at most
// about 8 days per request, hence `max_request_days() == 7` plus a half-day
// margin either side.  Timestamps come back as UTC epoch seconds and are
// converted to exchange-local wall time with the timezone named in the
// response metadata.
//
// Status mapping:
//   429            -> FetchError::RateLimited (honours Retry-After)
//   5xx / network  -> FetchError::ProviderUnavailable
//   404 Not Found  -> FetchError::SymbolNotFound
//   422            -> empty result (range outside the 1m history window)
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::FetchError;
use crate::provider::BarSource;
use crate::types::RawBar;

pub const DEFAULT_BASE_URL: &str = "https://query2.finance.yahoo.com";

/// Margin added around each requested range so sessions in any exchange
/// timezone are fully covered; bars are filtered back to the range afterwards.
const RANGE_MARGIN_SECS: i64 = 12 * 3600;

/// Yahoo rejects a 1-minute request outright when `period1` lies further back
/// than this horizon, so `period1` is never allowed past it.
const MINUTE_HISTORY_SECS: i64 = 30 * 24 * 3600;

/// Slack kept inside the horizon to absorb clock skew and request latency.
const HORIZON_SLACK_SECS: i64 = 10 * 60;

// -----------------------------------------------------------------------------
// Response shapes
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: ChartBody,
}

#[derive(Debug, Deserialize)]
struct ChartBody {
    result: Option<Vec<ChartData>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    meta: ChartMeta,
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChartMeta {
    #[serde(default)]
    exchange_timezone_name: Option<String>,
    #[serde(default)]
    gmtoffset: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    quote: Vec<QuoteData>,
}

#[derive(Debug, Deserialize)]
struct QuoteData {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

/// Exchange timezone resolved from the response metadata.
enum ExchangeZone {
    Named(Tz),
    Fixed(FixedOffset),
}

impl ExchangeZone {
    fn from_meta(meta: &ChartMeta) -> Self {
        if let Some(tz) = meta
            .exchange_timezone_name
            .as_deref()
            .and_then(|name| name.parse::<Tz>().ok())
        {
            return Self::Named(tz);
        }
        let offset = meta
            .gmtoffset
            .and_then(FixedOffset::east_opt)
            .unwrap_or_else(|| Utc.fix());
        Self::Fixed(offset)
    }

    fn local(&self, epoch_secs: i64) -> Option<NaiveDateTime> {
        let utc = DateTime::from_timestamp(epoch_secs, 0)?;
        Some(match self {
            Self::Named(tz) => tz.from_utc_datetime(&utc.naive_utc()).naive_local(),
            Self::Fixed(offset) => offset.from_utc_datetime(&utc.naive_utc()).naive_local(),
        })
    }
}

// -----------------------------------------------------------------------------
// Client
// -----------------------------------------------------------------------------

/// Yahoo Finance chart API client.
#[derive(Clone)]
pub struct YahooProvider {
    base_url: String,
    client: reqwest::Client,
}

impl YahooProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36")
            .build()?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(%base_url, "YahooProvider initialised");

        Ok(Self { base_url, client })
    }

    /// Chart URL for `[start, end]` as of `now`, or `None` when the whole
    /// range lies beyond the 1-minute history horizon.
    fn chart_url(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let earliest = now.timestamp() - MINUTE_HISTORY_SECS + HORIZON_SLACK_SECS;
        let period1 = (start.and_time(Default::default()).and_utc().timestamp() - RANGE_MARGIN_SECS)
            .max(earliest);
        let period2 = end
            .succ_opt()
            .unwrap_or(end)
            .and_time(Default::default())
            .and_utc()
            .timestamp()
            + RANGE_MARGIN_SECS;
        if period1 >= period2 {
            return None;
        }
        Some(format!(
            "{}/v8/finance/chart/{ticker}?period1={period1}&period2={period2}\
             &interval=1m&includePrePost=false",
            self.base_url
        ))
    }

    fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

impl BarSource for YahooProvider {
    fn name(&self) -> &str {
        "yahoo_finance"
    }

    #[instrument(skip(self), name = "yahoo::fetch_minute_bars")]
    async fn fetch_minute_bars(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<RawBar>, FetchError> {
        let Some(url) = self.chart_url(ticker, start, end, Utc::now()) else {
            warn!(%ticker, %start, %end, "range entirely outside the provider's 1m history window");
            return Ok(Vec::new());
        };

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FetchError::ProviderUnavailable(format!("request failed: {e}")))?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited {
                retry_after: Self::retry_after(resp.headers()),
            });
        }
        if status.is_server_error() {
            return Err(FetchError::ProviderUnavailable(format!("HTTP {status}")));
        }
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            warn!(%ticker, %start, %end, "range outside the provider's 1m history window");
            return Ok(Vec::new());
        }

        let body = resp
            .text()
            .await
            .map_err(|e| FetchError::ProviderUnavailable(format!("reading body failed: {e}")))?;

        let chart: ChartResponse = match serde_json::from_str(&body) {
            Ok(chart) => chart,
            Err(e) if status.is_success() => {
                return Err(FetchError::InvalidResponse(format!("unparsable chart JSON: {e}")))
            }
            Err(_) => return Err(FetchError::InvalidResponse(format!("HTTP {status}"))),
        };

        let bars = parse_chart(ticker, chart, start, end)?;
        debug!(%ticker, %start, %end, count = bars.len(), "minute bars fetched");
        Ok(bars)
    }
}

impl std::fmt::Debug for YahooProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YahooProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Parsing
// -----------------------------------------------------------------------------

/// Turn a chart response into market-local bars dated within `[start, end]`.
///
/// Rows with any missing price are skipped (Yahoo pads halted minutes with
/// nulls); a missing volume counts as zero.
fn parse_chart(
    ticker: &str,
    resp: ChartResponse,
    start: NaiveDate,
    end: NaiveDate,
) -> Result<Vec<RawBar>, FetchError> {
    let data = match resp.chart.result {
        Some(results) => results.into_iter().next(),
        None => match resp.chart.error {
            Some(err) if err.code == "Not Found" => {
                return Err(FetchError::SymbolNotFound {
                    symbol: ticker.to_string(),
                })
            }
            Some(err) if err.code == "Unprocessable Entity" => {
                warn!(%ticker, description = %err.description, "range outside history window");
                return Ok(Vec::new());
            }
            Some(err) => {
                return Err(FetchError::InvalidResponse(format!(
                    "{}: {}",
                    err.code, err.description
                )))
            }
            None => return Err(FetchError::InvalidResponse("empty result with no error".into())),
        },
    };

    let Some(data) = data else {
        return Ok(Vec::new());
    };
    // A range without sessions comes back with no timestamp array at all.
    let Some(timestamps) = data.timestamp else {
        return Ok(Vec::new());
    };
    let quote = data
        .indicators
        .quote
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::InvalidResponse("no quote data".into()))?;

    let zone = ExchangeZone::from_meta(&data.meta);
    let mut bars = Vec::with_capacity(timestamps.len());

    for (i, &ts) in timestamps.iter().enumerate() {
        let at = |v: &Vec<Option<f64>>| v.get(i).copied().flatten();
        let (Some(open), Some(high), Some(low), Some(close)) =
            (at(&quote.open), at(&quote.high), at(&quote.low), at(&quote.close))
        else {
            continue;
        };
        let volume = at(&quote.volume).unwrap_or(0.0).max(0.0) as u64;

        let local = zone
            .local(ts)
            .ok_or_else(|| FetchError::InvalidResponse(format!("invalid timestamp: {ts}")))?;
        let date = local.date();
        if date < start || date > end {
            continue;
        }
        let time = local
            .time()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(|| local.time());

        bars.push(RawBar {
            date,
            time,
            open,
            high,
            low,
            close,
            volume,
        });
    }

    Ok(bars)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn parse(json: &str, start: NaiveDate, end: NaiveDate) -> Result<Vec<RawBar>, FetchError> {
        let resp: ChartResponse = serde_json::from_str(json).unwrap();
        parse_chart("QQQ", resp, start, end)
    }

    // 2026-02-18 14:30:00 UTC == 09:30 America/New_York (EST, UTC-5)
    const OPEN_TS: i64 = 1_771_425_000;

    fn chart_json(timestamps: &[i64], tz: &str) -> String {
        let n = timestamps.len();
        let prices: Vec<String> = (0..n).map(|i| format!("{}", 500.0 + i as f64)).collect();
        let prices = prices.join(",");
        let volumes: Vec<String> = (0..n).map(|i| format!("{}", 1000 + i)).collect();
        format!(
            r#"{{"chart":{{"result":[{{"meta":{{"exchangeTimezoneName":"{tz}","gmtoffset":-18000}},
            "timestamp":[{ts}],
            "indicators":{{"quote":[{{"open":[{p}],"high":[{p}],"low":[{p}],"close":[{p}],"volume":[{v}]}}]}}}}],"error":null}}}}"#,
            ts = timestamps.iter().map(|t| t.to_string()).collect::<Vec<_>>().join(","),
            p = prices,
            v = volumes.join(","),
        )
    }

    #[test]
    fn converts_to_exchange_local_time() {
        let json = chart_json(&[OPEN_TS, OPEN_TS + 60], "America/New_York");
        let bars = parse(&json, d(2026, 2, 18), d(2026, 2, 18)).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, d(2026, 2, 18));
        assert_eq!(bars[0].time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(bars[1].time, NaiveTime::from_hms_opt(9, 31, 0).unwrap());
        assert_eq!(bars[1].volume, 1001);
    }

    #[test]
    fn falls_back_to_gmtoffset() {
        let json = chart_json(&[OPEN_TS], "Not/AZone");
        let bars = parse(&json, d(2026, 2, 18), d(2026, 2, 18)).unwrap();
        assert_eq!(bars[0].time, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
    }

    #[test]
    fn drops_bars_outside_range() {
        let next_day = OPEN_TS + 24 * 3600;
        let json = chart_json(&[OPEN_TS, next_day], "America/New_York");
        let bars = parse(&json, d(2026, 2, 19), d(2026, 2, 19)).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].date, d(2026, 2, 19));
    }

    #[test]
    fn skips_rows_with_null_prices() {
        let json = format!(
            r#"{{"chart":{{"result":[{{"meta":{{"exchangeTimezoneName":"America/New_York"}},
            "timestamp":[{a},{b}],
            "indicators":{{"quote":[{{"open":[1.0,null],"high":[1.0,2.0],"low":[1.0,2.0],"close":[1.0,2.0],"volume":[null,5]}}]}}}}],"error":null}}}}"#,
            a = OPEN_TS,
            b = OPEN_TS + 60
        );
        let bars = parse(&json, d(2026, 2, 18), d(2026, 2, 18)).unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].volume, 0);
    }

    #[test]
    fn missing_timestamps_is_empty() {
        let json = r#"{"chart":{"result":[{"meta":{},"indicators":{"quote":[{}]}}],"error":null}}"#;
        assert!(parse(json, d(2026, 2, 21), d(2026, 2, 22)).unwrap().is_empty());
    }

    #[test]
    fn not_found_error() {
        let json = r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found, symbol may be delisted"}}}"#;
        let err = parse(json, d(2026, 2, 18), d(2026, 2, 18)).unwrap_err();
        assert!(matches!(err, FetchError::SymbolNotFound { .. }));
    }

    #[test]
    fn out_of_window_error_is_empty() {
        let json = r#"{"chart":{"result":null,"error":{"code":"Unprocessable Entity","description":"1m data not available for startTime=1. The requested range must be within the last 30 days."}}}"#;
        assert!(parse(json, d(2025, 1, 1), d(2025, 1, 7)).unwrap().is_empty());
    }

    fn query_param(url: &str, name: &str) -> i64 {
        let prefix = format!("{name}=");
        url.split(['?', '&'])
            .find_map(|kv| kv.strip_prefix(prefix.as_str()))
            .unwrap()
            .parse()
            .unwrap()
    }

    #[test]
    fn chart_url_covers_range_with_margin() {
        let provider = YahooProvider::new("http://localhost:9/", Duration::from_secs(1)).unwrap();
        let now = d(2026, 2, 19).and_hms_opt(15, 0, 0).unwrap().and_utc();
        let url = provider.chart_url("NVDA", d(2026, 2, 17), d(2026, 2, 18), now).unwrap();
        let p1 = d(2026, 2, 17).and_time(Default::default()).and_utc().timestamp() - RANGE_MARGIN_SECS;
        let p2 = d(2026, 2, 19).and_time(Default::default()).and_utc().timestamp() + RANGE_MARGIN_SECS;
        assert!(url.starts_with("http://localhost:9/v8/finance/chart/NVDA?"));
        assert!(url.contains(&format!("period1={p1}")));
        assert!(url.contains(&format!("period2={p2}")));
        assert!(url.contains("interval=1m"));
    }

    #[test]
    fn chart_url_never_reaches_past_history_horizon() {
        let provider = YahooProvider::new("http://localhost:9", Duration::from_secs(1)).unwrap();
        let now = d(2026, 2, 19).and_hms_opt(15, 0, 0).unwrap().and_utc();
        let today = d(2026, 2, 19);
        let oldest = today - chrono::Days::new(30);

        let url = provider
            .chart_url("QQQ", oldest, oldest + chrono::Days::new(6), now)
            .unwrap();
        let horizon = now.timestamp() - MINUTE_HISTORY_SECS;
        assert!(query_param(&url, "period1") > horizon);
        assert!(query_param(&url, "period1") < query_param(&url, "period2"));
    }

    #[test]
    fn chart_url_skips_range_beyond_horizon() {
        let provider = YahooProvider::new("http://localhost:9", Duration::from_secs(1)).unwrap();
        let now = d(2026, 2, 19).and_hms_opt(15, 0, 0).unwrap().and_utc();
        assert!(provider.chart_url("QQQ", d(2025, 12, 1), d(2025, 12, 7), now).is_none());
    }
}
