//! Business-day calendar arithmetic.
//!
//! Stocks and ETFs trade Monday through Friday; crypto trades every calendar
//! day. Gap discovery and chunking both walk dates through these helpers so
//! the two sides agree on what counts as a missing day.

use crate::models::{AssetClass, DateRange};
use chrono::{Days, NaiveDate};

/// All trading days for the asset class in `[start, end]`, ascending.
pub fn business_days(asset_class: AssetClass, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut days = Vec::new();
    let mut d = start;
    while d <= end {
        if asset_class.is_trading_day(d) {
            days.push(d);
        }
        match d.checked_add_days(Days::new(1)) {
            Some(next) => d = next,
            None => break,
        }
    }
    days
}

/// Number of trading days in `[start, end]`.
pub fn business_day_count(asset_class: AssetClass, start: NaiveDate, end: NaiveDate) -> u32 {
    business_days(asset_class, start, end).len() as u32
}

/// The next trading day strictly after `date`.
pub fn next_business_day(asset_class: AssetClass, date: NaiveDate) -> NaiveDate {
    let mut d = date.succ_opt().expect("date overflow");
    while !asset_class.is_trading_day(d) {
        d = d.succ_opt().expect("date overflow");
    }
    d
}

/// Split `[start, end]` into inclusive sub-ranges of at most `chunk_days`
/// calendar days each, ascending. Upstream calls never span more than one
/// chunk.
pub fn chunk_range(start: NaiveDate, end: NaiveDate, chunk_days: i64) -> Vec<(NaiveDate, NaiveDate)> {
    assert!(chunk_days >= 1, "chunk_days must be positive");
    let mut chunks = Vec::new();
    if start > end {
        return chunks;
    }
    let mut chunk_start = start;
    loop {
        let chunk_end = chunk_start
            .checked_add_days(Days::new((chunk_days - 1) as u64))
            .unwrap_or(end)
            .min(end);
        chunks.push((chunk_start, chunk_end));
        if chunk_end >= end {
            break;
        }
        chunk_start = chunk_end.succ_opt().expect("date overflow");
    }
    chunks
}

/// Group an ascending list of missing trading days into maximal runs of
/// consecutive trading days. The output is ready for batched refetch.
pub fn group_missing_days(asset_class: AssetClass, missing: &[NaiveDate]) -> Vec<DateRange> {
    let mut ranges: Vec<DateRange> = Vec::new();
    for &day in missing {
        match ranges.last_mut() {
            Some(last) if next_business_day(asset_class, last.end) == day => {
                last.end = day;
                last.days += 1;
            }
            _ => ranges.push(DateRange {
                start: day,
                end: day,
                days: 1,
            }),
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_stock_week_skips_weekend() {
        // Mon 2024-03-04 .. Sun 2024-03-10
        let days = business_days(AssetClass::Stock, d(2024, 3, 4), d(2024, 3, 10));
        assert_eq!(days.len(), 5);
        assert_eq!(days.first().unwrap(), &d(2024, 3, 4));
        assert_eq!(days.last().unwrap(), &d(2024, 3, 8));
    }

    #[test]
    fn test_crypto_week_is_full() {
        let days = business_days(AssetClass::Crypto, d(2024, 3, 4), d(2024, 3, 10));
        assert_eq!(days.len(), 7);
    }

    #[test]
    fn test_next_business_day_over_weekend() {
        // Friday -> Monday for stocks, Friday -> Saturday for crypto.
        assert_eq!(next_business_day(AssetClass::Stock, d(2024, 3, 8)), d(2024, 3, 11));
        assert_eq!(next_business_day(AssetClass::Crypto, d(2024, 3, 8)), d(2024, 3, 9));
    }

    #[test]
    fn test_chunking_covers_range_exactly() {
        let chunks = chunk_range(d(2023, 1, 1), d(2024, 1, 10), 365);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (d(2023, 1, 1), d(2023, 12, 31)));
        assert_eq!(chunks[1], (d(2024, 1, 1), d(2024, 1, 10)));

        // A range inside one chunk stays whole.
        let chunks = chunk_range(d(2024, 1, 2), d(2024, 1, 5), 365);
        assert_eq!(chunks, vec![(d(2024, 1, 2), d(2024, 1, 5))]);

        // Inverted range yields nothing.
        assert!(chunk_range(d(2024, 1, 5), d(2024, 1, 2), 365).is_empty());
    }

    #[test]
    fn test_group_missing_days_bridges_weekend() {
        // Fri + Mon are consecutive business days for stocks.
        let missing = [d(2024, 3, 8), d(2024, 3, 11), d(2024, 3, 13)];
        let ranges = group_missing_days(AssetClass::Stock, &missing);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start, d(2024, 3, 8));
        assert_eq!(ranges[0].end, d(2024, 3, 11));
        assert_eq!(ranges[0].days, 2);
        assert_eq!(ranges[1].start, d(2024, 3, 13));
        assert_eq!(ranges[1].days, 1);
    }

    #[test]
    fn test_group_missing_days_crypto_breaks_on_calendar_gap() {
        let missing = [d(2024, 3, 8), d(2024, 3, 9), d(2024, 3, 11)];
        let ranges = group_missing_days(AssetClass::Crypto, &missing);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].days, 2);
    }
}
