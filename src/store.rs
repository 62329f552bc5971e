// =============================================================================
// Record Store — one line-oriented `.records` file per ticker
// =============================================================================
//
// File layout:  <data_dir>/<TICKER>.records
// Line format:  <YYYY-MM-DD>: <JSON array of bar objects>
//
// Every line stands on its own.  A line that fails to parse is skipped with a
// warning and the remaining dates still load, so one corrupt line never costs
// the whole history.
//
// Writes go to a hidden temporary sibling first, are synced, and then renamed
// over the live file.  Readers therefore see either the old or the new file,
// never a half-written one.
// =============================================================================

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::{MalformedRecordLine, StoreError};
use crate::types::{Bar, DatedBar, TickerStore, TradingDaySeries};

const EXTENSION: &str = "records";
const SEPARATOR: &str = ": ";
const MAX_TICKER_LEN: usize = 16;

/// Handle on the directory holding every ticker's record file.
#[derive(Debug, Clone)]
pub struct RecordStore {
    data_dir: PathBuf,
}

impl RecordStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Uppercase `raw` and check it is safe to use as a file name.
    ///
    /// Accepts 1–16 characters from `[A-Z0-9.^=-]`, not starting with `.`.
    pub fn normalize_ticker(raw: &str) -> Result<String, StoreError> {
        let ticker = raw.trim().to_uppercase();
        let valid = !ticker.is_empty()
            && ticker.len() <= MAX_TICKER_LEN
            && !ticker.starts_with('.')
            && ticker
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
        if valid {
            Ok(ticker)
        } else {
            Err(StoreError::InvalidTicker(raw.to_string()))
        }
    }

    fn path_for(&self, ticker: &str) -> PathBuf {
        self.data_dir.join(format!("{ticker}.{EXTENSION}"))
    }

    fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Load every parsable date for `ticker`, logging a warning per skipped
    /// line.  Fails with [`StoreError::NotFound`] when no file exists.
    pub fn load(&self, ticker: &str) -> Result<TickerStore, StoreError> {
        let (store, skipped) = self.load_report(ticker)?;
        for bad in &skipped {
            warn!(ticker = %store.ticker, line = bad.line, reason = %bad.reason, "skipping malformed record line");
        }
        Ok(store)
    }

    /// Like [`load`](Self::load) but hands the skipped lines back to the
    /// caller instead of only logging them.
    pub fn load_report(
        &self,
        ticker: &str,
    ) -> Result<(TickerStore, Vec<MalformedRecordLine>), StoreError> {
        let ticker = Self::normalize_ticker(ticker)?;
        let path = self.path_for(&ticker);
        let reader = self.open(&ticker, &path)?;

        let mut store = TickerStore::new(ticker);
        let mut skipped = Vec::new();

        for (idx, raw) in reader.split(b'\n').enumerate() {
            let line_no = idx + 1;
            let raw = raw.map_err(Self::io_err(&path))?;
            let line = match std::str::from_utf8(&raw) {
                Ok(s) => s.trim(),
                Err(_) => {
                    skipped.push(MalformedRecordLine {
                        line: line_no,
                        reason: "not valid UTF-8".into(),
                    });
                    continue;
                }
            };
            if line.is_empty() {
                continue;
            }
            match parse_line(line) {
                Ok((date, bars)) => {
                    if store.days.insert(date, bars).is_some() {
                        warn!(ticker = %store.ticker, %date, line = line_no, "duplicate date line; later line wins");
                    }
                }
                Err(reason) => skipped.push(MalformedRecordLine {
                    line: line_no,
                    reason,
                }),
            }
        }

        debug!(
            ticker = %store.ticker,
            days = store.days.len(),
            bars = store.bar_count(),
            skipped = skipped.len(),
            "records loaded"
        );
        Ok((store, skipped))
    }

    /// Bars for `ticker` whose date lies in `[start, end)`, oldest first, each
    /// tagged with its date.  Lines outside the range are skipped without
    /// decoding their JSON.
    pub fn read_range(
        &self,
        ticker: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<DatedBar>, StoreError> {
        let ticker = Self::normalize_ticker(ticker)?;
        let path = self.path_for(&ticker);
        let reader = self.open(&ticker, &path)?;

        let in_range = |date: NaiveDate| {
            start.map_or(true, |s| date >= s) && end.map_or(true, |e| date < e)
        };

        let mut days = TradingDaySeries::new();
        for (idx, raw) in reader.split(b'\n').enumerate() {
            let raw = raw.map_err(Self::io_err(&path))?;
            let Ok(line) = std::str::from_utf8(&raw) else {
                warn!(%ticker, line = idx + 1, "skipping non-UTF-8 record line");
                continue;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(date) = line_date(line) {
                if !in_range(date) {
                    continue;
                }
            }
            match parse_line(line) {
                Ok((date, bars)) => {
                    days.insert(date, bars);
                }
                Err(reason) => {
                    warn!(%ticker, line = idx + 1, %reason, "skipping malformed record line");
                }
            }
        }

        Ok(days
            .into_iter()
            .flat_map(|(date, bars)| bars.into_iter().map(move |bar| DatedBar { date, bar }))
            .collect())
    }

    /// Tickers that currently have a record file, sorted.
    pub fn list_tickers(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err(&self.data_dir)(e)),
        };

        let mut tickers: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(EXTENSION))
            .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
            .filter(|stem| matches!(Self::normalize_ticker(stem), Ok(t) if t == *stem))
            .collect();
        tickers.sort();
        Ok(tickers)
    }

    fn open(&self, ticker: &str, path: &Path) -> Result<BufReader<File>, StoreError> {
        match File::open(path) {
            Ok(file) => Ok(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound {
                ticker: ticker.to_string(),
            }),
            Err(e) => Err(Self::io_err(path)(e)),
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Replace the persisted records of `store.ticker` with `store.days`.
    ///
    /// The full content is serialised before anything touches disk; the file
    /// is then written to a temporary sibling, synced and renamed into place,
    /// and the directory is synced so the rename itself survives a crash.
    pub fn save(&self, store: &TickerStore) -> Result<(), StoreError> {
        let ticker = Self::normalize_ticker(&store.ticker)?;
        let path = self.path_for(&ticker);

        let mut content = String::new();
        for (date, bars) in store.days.iter().filter(|(_, bars)| !bars.is_empty()) {
            content.push_str(&format_line(*date, bars)?);
            content.push('\n');
        }

        fs::create_dir_all(&self.data_dir).map_err(Self::io_err(&self.data_dir))?;

        let tmp_path = self
            .data_dir
            .join(format!(".{ticker}.{EXTENSION}.{}.tmp", std::process::id()));

        let written = Self::write_synced(&tmp_path, content.as_bytes())
            .and_then(|()| fs::rename(&tmp_path, &path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(Self::io_err(&path)(e));
        }
        Self::sync_dir(&self.data_dir).map_err(Self::io_err(&self.data_dir))?;

        info!(
            %ticker,
            days = store.days.len(),
            bars = store.bar_count(),
            path = %path.display(),
            "records saved (atomic)"
        );
        Ok(())
    }

    fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(bytes)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    }

    #[cfg(unix)]
    fn sync_dir(dir: &Path) -> std::io::Result<()> {
        File::open(dir)?.sync_all()
    }

    #[cfg(not(unix))]
    fn sync_dir(_dir: &Path) -> std::io::Result<()> {
        Ok(())
    }

    /// Delete the record file for `ticker`.  Returns whether a file existed.
    pub fn remove(&self, ticker: &str) -> Result<bool, StoreError> {
        let ticker = Self::normalize_ticker(ticker)?;
        let path = self.path_for(&ticker);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(%ticker, "existing records deleted");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Self::io_err(&path)(e)),
        }
    }
}

// =============================================================================
// Merge
// =============================================================================

/// Fold `incoming` into `existing` one whole date at a time.
///
/// A date missing from `existing` is inserted; a date present in both is
/// replaced outright by the incoming bars, never spliced bar by bar.  This is
/// what lets a later, more complete fetch supersede a day captured mid-session.
pub fn merge(mut existing: TradingDaySeries, incoming: TradingDaySeries) -> TradingDaySeries {
    for (date, bars) in incoming {
        existing.insert(date, bars);
    }
    existing
}

// =============================================================================
// Line codec
// =============================================================================

/// Render one record line (without the trailing newline).
pub fn format_line(date: NaiveDate, bars: &[Bar]) -> Result<String, serde_json::Error> {
    Ok(format!("{date}{SEPARATOR}{}", serde_json::to_string(bars)?))
}

/// Parse one record line, checking the per-day invariants.
pub fn parse_line(line: &str) -> Result<(NaiveDate, Vec<Bar>), String> {
    let (date_str, json) = line
        .split_once(SEPARATOR)
        .ok_or_else(|| "missing `: ` separator".to_string())?;
    let date = NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d")
        .map_err(|e| format!("bad date {date_str:?}: {e}"))?;
    let bars: Vec<Bar> =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON for {date}: {e}"))?;

    if bars.is_empty() {
        return Err(format!("no bars for {date}"));
    }
    if let Some(w) = bars.windows(2).find(|w| w[0].time >= w[1].time) {
        return Err(format!(
            "bar times not strictly increasing for {date} at {}",
            w[1].time.format("%H:%M")
        ));
    }
    Ok((date, bars))
}

/// Cheap date peek used to skip lines without decoding their JSON.
fn line_date(line: &str) -> Option<NaiveDate> {
    let (date_str, _) = line.split_once(SEPARATOR)?;
    NaiveDate::parse_from_str(date_str.trim(), "%Y-%m-%d").ok()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, d).unwrap()
    }

    fn bars(n: usize, base: f64) -> Vec<Bar> {
        (0..n)
            .map(|i| {
                let time = NaiveTime::from_hms_opt(9, 30 + i as u32, 0).unwrap();
                let mut bar = Bar::new(time, base, base + 0.5, base - 0.5, base + 0.25, 100 + i as u64);
                bar.vwap = Some(base + 0.0833);
                bar
            })
            .collect()
    }

    fn sample_store(ticker: &str) -> TickerStore {
        let mut store = TickerStore::new(ticker);
        store.days.insert(day(17), bars(3, 100.0));
        store.days.insert(day(18), bars(2, 101.0));
        store
    }

    // ---- ticker validation ------------------------------------------------

    #[test]
    fn normalize_ticker_uppercases_and_validates() {
        assert_eq!(RecordStore::normalize_ticker(" nvda ").unwrap(), "NVDA");
        assert_eq!(RecordStore::normalize_ticker("^gspc").unwrap(), "^GSPC");
        assert_eq!(RecordStore::normalize_ticker("brk-b").unwrap(), "BRK-B");
        assert!(RecordStore::normalize_ticker("").is_err());
        assert!(RecordStore::normalize_ticker("../etc/passwd").is_err());
        assert!(RecordStore::normalize_ticker(".hidden").is_err());
        assert!(RecordStore::normalize_ticker("A/B").is_err());
        assert!(RecordStore::normalize_ticker("ABCDEFGHIJKLMNOPQ").is_err());
    }

    // ---- load / save ------------------------------------------------------

    #[test]
    fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        assert!(matches!(store.load("QQQ"), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("data"));
        let original = sample_store("QQQ");

        store.save(&original).unwrap();
        let loaded = store.load("qqq").unwrap();

        assert_eq!(loaded, original);
    }

    #[test]
    fn saved_file_is_one_line_per_date() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.save(&sample_store("NVDA")).unwrap();

        let text = fs::read_to_string(dir.path().join("NVDA.records")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("2026-02-17: [{"));
        assert!(lines[1].starts_with("2026-02-18: [{"));
        assert!(lines[0].contains("\"RSI_14\":null"));
    }

    #[test]
    fn save_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.save(&sample_store("NVDA")).unwrap();
        store.save(&sample_store("NVDA")).unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["NVDA.records".to_string()]);
    }

    #[cfg(unix)]
    #[test]
    fn directory_sync_requires_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        RecordStore::sync_dir(dir.path()).unwrap();
        assert!(RecordStore::sync_dir(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn save_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.save(&sample_store("QQQ")).unwrap();

        let mut smaller = TickerStore::new("QQQ");
        smaller.days.insert(day(20), bars(1, 99.0));
        store.save(&smaller).unwrap();

        assert_eq!(store.load("QQQ").unwrap(), smaller);
    }

    #[test]
    fn malformed_line_is_skipped_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.save(&sample_store("SNDK")).unwrap();

        let path = dir.path().join("SNDK.records");
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("2026-02-19: [{\"time\": \"09:30\", \"open\": 1.0,\n");
        text.push_str(&format_line(day(20), &bars(1, 105.0)).unwrap());
        text.push('\n');
        fs::write(&path, text).unwrap();

        let (loaded, skipped) = store.load_report("SNDK").unwrap();
        assert_eq!(loaded.days.len(), 3);
        assert!(loaded.days.contains_key(&day(17)));
        assert!(loaded.days.contains_key(&day(20)));
        assert!(!loaded.days.contains_key(&day(19)));
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].line, 3);
        assert!(skipped[0].reason.contains("invalid JSON"));
    }

    #[test]
    fn invalid_utf8_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let mut bytes = format_line(day(17), &bars(1, 10.0)).unwrap().into_bytes();
        bytes.extend_from_slice(b"\n\xff\xfe garbage\n");
        fs::write(dir.path().join("QQQ.records"), bytes).unwrap();

        let (loaded, skipped) = store.load_report("QQQ").unwrap();
        assert_eq!(loaded.days.len(), 1);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].line, 2);
    }

    #[test]
    fn duplicate_date_later_line_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let text = format!(
            "{}\n{}\n",
            format_line(day(17), &bars(1, 10.0)).unwrap(),
            format_line(day(17), &bars(2, 20.0)).unwrap()
        );
        fs::write(dir.path().join("QQQ.records"), text).unwrap();

        let loaded = store.load("QQQ").unwrap();
        assert_eq!(loaded.days[&day(17)], bars(2, 20.0));
    }

    #[test]
    fn remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.save(&sample_store("QQQ")).unwrap();
        assert!(store.remove("QQQ").unwrap());
        assert!(!store.remove("QQQ").unwrap());
        assert!(matches!(store.load("QQQ"), Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn list_tickers_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        store.save(&sample_store("QQQ")).unwrap();
        store.save(&sample_store("NVDA")).unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join(".QQQ.records.1.tmp"), "x").unwrap();

        assert_eq!(store.list_tickers().unwrap(), vec!["NVDA", "QQQ"]);
    }

    #[test]
    fn list_tickers_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("nope"));
        assert!(store.list_tickers().unwrap().is_empty());
    }

    // ---- read_range -------------------------------------------------------

    #[test]
    fn read_range_is_half_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let mut s = sample_store("QQQ");
        s.days.insert(day(19), bars(4, 102.0));
        store.save(&s).unwrap();

        let got = store.read_range("QQQ", Some(day(18)), Some(day(19))).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|b| b.date == day(18)));

        let all = store.read_range("QQQ", None, None).unwrap();
        assert_eq!(all.len(), 9);
        assert_eq!(all.first().unwrap().date, day(17));
        assert_eq!(all.last().unwrap().date, day(19));
    }

    #[test]
    fn read_range_skips_out_of_range_corruption_silently() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        let text = format!(
            "2026-02-16: not json at all\n{}\n",
            format_line(day(17), &bars(2, 10.0)).unwrap()
        );
        fs::write(dir.path().join("QQQ.records"), text).unwrap();

        let got = store.read_range("QQQ", Some(day(17)), None).unwrap();
        assert_eq!(got.len(), 2);
    }

    // ---- merge ------------------------------------------------------------

    #[test]
    fn merge_replaces_whole_days_and_appends_new_ones() {
        let existing = sample_store("QQQ").days;
        let mut incoming = TradingDaySeries::new();
        incoming.insert(day(18), bars(5, 200.0));
        incoming.insert(day(19), bars(3, 201.0));

        let merged = merge(existing.clone(), incoming);

        assert_eq!(merged.len(), 3);
        assert_eq!(merged[&day(17)], existing[&day(17)]);
        assert_eq!(merged[&day(18)], bars(5, 200.0));
        assert_eq!(merged[&day(19)], bars(3, 201.0));
    }

    #[test]
    fn merge_shorter_replacement_drops_old_bars() {
        let mut existing = TradingDaySeries::new();
        existing.insert(day(18), bars(5, 1.0));
        let mut incoming = TradingDaySeries::new();
        incoming.insert(day(18), bars(2, 2.0));

        let merged = merge(existing, incoming);
        assert_eq!(merged[&day(18)], bars(2, 2.0));
    }

    // ---- line codec -------------------------------------------------------

    #[test]
    fn parse_line_rejects_broken_lines() {
        assert!(parse_line("2026-02-17 [1,2]").unwrap_err().contains("separator"));
        assert!(parse_line("2026-13-01: []").unwrap_err().contains("bad date"));
        assert!(parse_line("2026-02-17: []").unwrap_err().contains("no bars"));

        let mut unordered = bars(2, 1.0);
        unordered.swap(0, 1);
        let line = format_line(day(17), &unordered).unwrap();
        assert!(parse_line(&line).unwrap_err().contains("strictly increasing"));
    }
}
