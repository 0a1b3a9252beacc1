//! Candle files for backtests
//!
//! CSV input needs a header row naming at least `time,open,high,low,close`;
//! `volume` is optional and columns may come in any order.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

use super::engine::BacktestReport;
use crate::domain::{BarKey, Granularity, PriceBar};
use crate::error::{FxError, Result};

/// Unix seconds or millis, RFC 3339, or a naive UTC datetime
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = s.parse::<i64>() {
        if ts > 1_000_000_000_000 {
            return Utc.timestamp_millis_opt(ts).single();
        }
        return Utc.timestamp_opt(ts, 0).single();
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    let formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&dt));
        }
    }

    None
}

struct Columns {
    time: usize,
    open: usize,
    high: usize,
    low: usize,
    close: usize,
    volume: Option<usize>,
}

impl Columns {
    fn from_header(header: &str) -> Result<Self> {
        let names: Vec<String> = header
            .split(',')
            .map(|c| c.trim().trim_matches('"').to_ascii_lowercase())
            .collect();
        let find = |wanted: &[&str]| names.iter().position(|n| wanted.contains(&n.as_str()));
        let require = |wanted: &[&str]| {
            find(wanted).ok_or_else(|| FxError::MarketData(format!("CSV header is missing '{}'", wanted[0])))
        };

        Ok(Self {
            time: require(&["time", "timestamp", "date", "datetime"])?,
            open: require(&["open", "o"])?,
            high: require(&["high", "h"])?,
            low: require(&["low", "l"])?,
            close: require(&["close", "c"])?,
            volume: find(&["volume", "v"]),
        })
    }
}

fn decimal_at(parts: &[&str], idx: usize, line: usize) -> Result<Decimal> {
    let raw = parts
        .get(idx)
        .map(|s| s.trim())
        .ok_or_else(|| FxError::MarketData(format!("line {line}: missing column {idx}")))?;
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| FxError::MarketData(format!("line {line}: invalid number '{raw}'")))
}

/// Read bars for one instrument from a CSV reader
pub fn read_csv<R: BufRead>(reader: R, instrument: &str, granularity: Granularity) -> Result<Vec<PriceBar>> {
    let mut lines = reader.lines();
    let header = match lines.next() {
        Some(line) => line?,
        None => return Ok(Vec::new()),
    };
    let columns = Columns::from_header(&header)?;
    let mut bars = Vec::new();

    for (i, line) in lines.enumerate() {
        let line_no = i + 2;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.split(',').collect();

        let Some(open_time) = parts.get(columns.time).and_then(|s| parse_timestamp(s)) else {
            warn!("Skipping line {}: invalid timestamp", line_no);
            continue;
        };

        let bar = PriceBar {
            instrument: instrument.to_string(),
            granularity,
            open_time,
            open: decimal_at(&parts, columns.open, line_no)?,
            high: decimal_at(&parts, columns.high, line_no)?,
            low: decimal_at(&parts, columns.low, line_no)?,
            close: decimal_at(&parts, columns.close, line_no)?,
            volume: match columns.volume {
                Some(idx) => decimal_at(&parts, idx, line_no).unwrap_or(Decimal::ZERO),
                None => Decimal::ZERO,
            },
        };

        if let Err(e) = bar.validate() {
            warn!("Skipping line {}: {}", line_no, e);
            continue;
        }
        bars.push(bar);
    }

    Ok(bars)
}

/// Load bars for one instrument from a CSV file
pub fn load_csv<P: AsRef<Path>>(path: P, instrument: &str, granularity: Granularity) -> Result<Vec<PriceBar>> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let bars = read_csv(BufReader::new(file), instrument, granularity)?;
    info!("Loaded {} bars from {}", bars.len(), path.display());
    Ok(bars)
}

/// Stable sort by open time, then keep the last bar seen for each key
pub fn prepare_bars(mut bars: Vec<PriceBar>) -> Vec<PriceBar> {
    bars.sort_by(|a, b| a.open_time.cmp(&b.open_time));

    let mut index: HashMap<BarKey, usize> = HashMap::new();
    let mut out: Vec<PriceBar> = Vec::with_capacity(bars.len());
    for bar in bars {
        match index.get(&bar.key()) {
            Some(&i) => out[i] = bar,
            None => {
                index.insert(bar.key(), out.len());
                out.push(bar);
            }
        }
    }
    out
}

/// Write `trades.csv`, `equity_curve.csv` and `report.json` into `dir`
pub fn write_reports<P: AsRef<Path>>(report: &BacktestReport, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    std::fs::create_dir_all(dir)?;

    let mut trades = File::create(dir.join("trades.csv"))?;
    writeln!(
        trades,
        "position_id,instrument,side,units,entry_time,entry_price,exit_time,exit_price,exit_reason,pnl"
    )?;
    for t in &report.trades {
        writeln!(
            trades,
            "{},{},{},{},{},{},{},{},{},{}",
            t.position_id,
            t.instrument,
            t.side,
            t.units,
            t.entry_time.to_rfc3339(),
            t.entry_price,
            t.exit_time.to_rfc3339(),
            t.exit_price,
            t.exit_reason,
            t.pnl
        )?;
    }

    let mut equity = File::create(dir.join("equity_curve.csv"))?;
    writeln!(equity, "time,equity")?;
    for point in &report.metrics.equity_curve {
        writeln!(equity, "{},{}", point.time.to_rfc3339(), point.equity)?;
    }

    std::fs::write(dir.join("report.json"), serde_json::to_vec_pretty(report)?)?;
    info!("Backtest reports written to {}", dir.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::io::Cursor;

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 5, 1, 13, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-05-01T13:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-05-01 13:30:00"), Some(expected));
        assert_eq!(parse_timestamp("1714570200"), Some(expected));
        assert_eq!(parse_timestamp("1714570200000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_read_csv_any_column_order() {
        let csv = "close,time,high,low,open\n\
                   1.1005,2024-05-01T00:00:00Z,1.1010,1.0995,1.1000\n\
                   bad,row\n\
                   1.1010,2024-05-01T00:05:00Z,1.1015,1.1000,1.1005\n";
        let bars = read_csv(Cursor::new(csv), "EUR_USD", Granularity::M5).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].close, dec!(1.1005));
        assert_eq!(bars[1].open, dec!(1.1005));
        assert_eq!(bars[0].volume, Decimal::ZERO);
    }

    #[test]
    fn test_read_csv_missing_column() {
        let csv = "time,open,high,low\n2024-05-01T00:00:00Z,1,1,1\n";
        assert!(read_csv(Cursor::new(csv), "EUR_USD", Granularity::M5).is_err());
    }

    #[test]
    fn test_prepare_bars_sorts_and_keeps_last_duplicate() {
        let csv = "time,open,high,low,close,volume\n\
                   2024-05-01T00:10:00Z,1.2,1.2,1.2,1.2,1\n\
                   2024-05-01T00:00:00Z,1.0,1.0,1.0,1.0,1\n\
                   2024-05-01T00:10:00Z,1.3,1.3,1.3,1.3,2\n";
        let bars = read_csv(Cursor::new(csv), "EUR_USD", Granularity::M5).unwrap();
        let prepared = prepare_bars(bars);

        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared[0].close, dec!(1.0));
        assert_eq!(prepared[1].close, dec!(1.3));
        assert_eq!(prepared[1].volume, dec!(2));
    }
}
