//! Candle validation.
//!
//! Pure transformation of a raw candle batch into validated candles plus a
//! batch summary. Six hard checks each contribute 1/6 of the quality score;
//! the gap classifier and the volume-anomaly detector attach notes and
//! downgrade the score without by themselves failing a candle. Candles are
//! expected in ascending timestamp order so the gap classifier sees the
//! correct predecessor.

use crate::models::{BatchSummary, RawCandle, Timeframe, ValidatedCandle};
use chrono::{DateTime, Datelike, Utc, Weekday};

/// Score at or above which a candle that passed every hard check counts as
/// validated. Anomaly penalties can pull an otherwise clean candle below it.
pub const QUALITY_THRESHOLD: f64 = 0.85;

const GAP_PENALTY: f64 = 0.2;
const VOLUME_ANOMALY_PENALTY: f64 = 0.1;
const MAX_MOVE_PCT: f64 = 500.0;

const NOTE_GAP_MODERATE: &str = "moderate gap (possible dividend/corporate event)";
const NOTE_GAP_LARGE: &str = "large gap (possible split or major event)";
const NOTE_GAP_EXTREME: &str = "extreme gap (possible data corruption)";

/// Validate a raw batch for one `(symbol, timeframe)`.
///
/// Output always has the same length and order as the input; rejected
/// candles flow through flagged, never dropped.
pub fn validate_batch(
    symbol: &str,
    timeframe: Timeframe,
    source: &str,
    raw: &[RawCandle],
    ingested_at: DateTime<Utc>,
) -> (Vec<ValidatedCandle>, BatchSummary) {
    let median_volume = median(raw.iter().map(|c| c.volume));

    let mut out = Vec::with_capacity(raw.len());
    let mut summary = BatchSummary {
        total: raw.len(),
        ..BatchSummary::default()
    };
    // Previous accepted candle for the gap classifier; duplicates do not
    // advance it.
    let mut prev: Option<(DateTime<Utc>, f64)> = None;
    let mut last_ts: Option<DateTime<Utc>> = None;

    for candle in raw {
        let mut notes = Vec::new();
        let mut passed = 0u32;

        // 1. high >= low
        if candle.high >= candle.low {
            passed += 1;
        } else {
            notes.push(format!(
                "High ({}) < Low ({})",
                fmt_px(candle.high),
                fmt_px(candle.low)
            ));
        }

        // 2. high >= max(open, close)
        let body_high = candle.open.max(candle.close);
        if candle.high >= body_high {
            passed += 1;
        } else {
            notes.push(format!(
                "High ({}) < max(O,C) ({})",
                fmt_px(candle.high),
                fmt_px(body_high)
            ));
        }

        // 3. low <= min(open, close)
        let body_low = candle.open.min(candle.close);
        if candle.low <= body_low {
            passed += 1;
        } else {
            notes.push(format!(
                "Low ({}) > min(O,C) ({})",
                fmt_px(candle.low),
                fmt_px(body_low)
            ));
        }

        // 4. all prices positive
        if candle.open > 0.0 && candle.high > 0.0 && candle.low > 0.0 && candle.close > 0.0 {
            passed += 1;
        } else {
            notes.push("Non-positive OHLC value".to_string());
        }

        // 5. volume non-negative
        if candle.volume >= 0.0 {
            passed += 1;
        } else {
            notes.push(format!("Negative volume ({})", fmt_px(candle.volume)));
        }

        // 6. close-vs-open move below 500%
        let move_ok = if candle.open > 0.0 {
            (candle.close - candle.open).abs() / candle.open * 100.0 < MAX_MOVE_PCT
        } else {
            // Undefined move; check 4 already failed this candle.
            true
        };
        if move_ok {
            passed += 1;
        } else {
            notes.push(format!(
                "Close ({}) moved >= {}% from open ({})",
                fmt_px(candle.close),
                MAX_MOVE_PCT as i64,
                fmt_px(candle.open)
            ));
        }

        let hard_pass = passed == 6;

        // Duplicate timestamps break the identity invariant; hard failure
        // outside the six checks.
        let duplicate = last_ts == Some(candle.ts);
        if duplicate {
            notes.push("duplicate timestamp in batch".to_string());
        }
        last_ts = Some(candle.ts);

        // Gap classification against the previous accepted candle.
        let mut gap_detected = false;
        if let Some((prev_ts, prev_close)) = prev {
            if !duplicate {
                if let Some(note) = classify_gap(prev_ts, prev_close, candle.ts, candle.open) {
                    gap_detected = true;
                    notes.push(note.to_string());
                }
            }
        }

        // Volume anomaly against the batch median.
        let mut volume_anomaly = false;
        if median_volume > 0.0 {
            let ratio = candle.volume / median_volume;
            if !(0.5..=10.0).contains(&ratio) {
                volume_anomaly = true;
                notes.push(format!("volume anomaly ({ratio:.2}x batch median)"));
            }
        }

        let mut score = passed as f64 / 6.0;
        if gap_detected {
            score -= GAP_PENALTY;
        }
        if volume_anomaly {
            score -= VOLUME_ANOMALY_PENALTY;
        }
        let score = score.clamp(0.0, 1.0);

        let validated = hard_pass && !duplicate && score >= QUALITY_THRESHOLD;

        if !duplicate {
            prev = Some((candle.ts, candle.close));
        }

        if validated {
            summary.passed += 1;
        } else {
            summary.failed += 1;
        }
        if gap_detected {
            summary.gaps_flagged += 1;
        }
        if volume_anomaly {
            summary.volume_anomalies += 1;
        }

        out.push(ValidatedCandle {
            symbol: symbol.to_string(),
            timeframe,
            ts: candle.ts,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            source: source.to_string(),
            validated,
            quality_score: score,
            validation_notes: notes,
            gap_detected,
            volume_anomaly,
            ingested_at,
        });
    }

    (out, summary)
}

/// Classify the calendar/price gap between consecutive candles.
///
/// Returns the note for a significant gap, or `None` when the gap is benign
/// (weekend rollover, holiday span, or a move under 2%).
fn classify_gap(
    prev_ts: DateTime<Utc>,
    prev_close: f64,
    ts: DateTime<Utc>,
    open: f64,
) -> Option<&'static str> {
    if prev_close <= 0.0 {
        return None;
    }

    let calendar_days = (ts.date_naive() - prev_ts.date_naive()).num_days();
    let gap_pct = (open - prev_close).abs() / prev_close * 100.0;

    // Friday -> Monday is one business day regardless of the move size.
    if prev_ts.weekday() == Weekday::Fri
        && ts.weekday() == Weekday::Mon
        && (2..=3).contains(&calendar_days)
    {
        return None;
    }
    // Longer spans are holidays, not data problems.
    if calendar_days >= 3 {
        return None;
    }
    if gap_pct < 2.0 {
        return None;
    }
    if gap_pct < 5.0 {
        Some(NOTE_GAP_MODERATE)
    } else if gap_pct < 10.0 {
        Some(NOTE_GAP_LARGE)
    } else {
        Some(NOTE_GAP_EXTREME)
    }
}

fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut v: Vec<f64> = values.filter(|x| x.is_finite()).collect();
    if v.is_empty() {
        return 0.0;
    }
    v.sort_by(|a, b| a.partial_cmp(b).expect("finite volumes"));
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        (v[mid - 1] + v[mid]) / 2.0
    } else {
        v[mid]
    }
}

/// Trim the fraction when a price is whole, so notes read "90" not "90.0".
fn fmt_px(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn candle(t: DateTime<Utc>, o: f64, h: f64, l: f64, c: f64, v: f64) -> RawCandle {
        RawCandle {
            ts: t,
            open: o,
            high: h,
            low: l,
            close: c,
            volume: v,
        }
    }

    fn now() -> DateTime<Utc> {
        ts(2024, 6, 1)
    }

    #[test]
    fn test_clean_daily_batch_scores_one() {
        // AAPL 2024-01-02..2024-01-05, no gap over 2%.
        let raw = vec![
            candle(ts(2024, 1, 2), 100.0, 101.0, 99.0, 100.5, 1000.0),
            candle(ts(2024, 1, 3), 100.6, 101.5, 100.0, 101.0, 1100.0),
            candle(ts(2024, 1, 4), 101.1, 102.0, 100.5, 101.8, 900.0),
            candle(ts(2024, 1, 5), 101.9, 102.5, 101.0, 102.2, 1050.0),
        ];
        let (out, summary) = validate_batch("AAPL", Timeframe::D1, "upstream", &raw, now());

        assert_eq!(out.len(), 4);
        assert_eq!(summary.passed, 4);
        assert_eq!(summary.failed, 0);
        for c in &out {
            assert!(c.validated);
            assert_eq!(c.quality_score, 1.0);
            assert!(!c.gap_detected);
            assert!(!c.volume_anomaly);
            assert!(c.validation_notes.is_empty());
        }
    }

    #[test]
    fn test_corruption_candle_fails_check_two() {
        let raw = vec![candle(ts(2024, 1, 2), 100.0, 90.0, 80.0, 95.0, 1000.0)];
        let (out, summary) = validate_batch("AAPL", Timeframe::D1, "upstream", &raw, now());

        let c = &out[0];
        assert!(!c.validated);
        assert!((c.quality_score - 5.0 / 6.0).abs() < 1e-9);
        assert!(c
            .validation_notes
            .iter()
            .any(|n| n == "High (90) < max(O,C) (100)"));
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_flat_candle_passes_all_checks() {
        // close == open, high == low == open.
        let raw = vec![candle(ts(2024, 1, 2), 50.0, 50.0, 50.0, 50.0, 10.0)];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(out[0].validated);
        assert_eq!(out[0].quality_score, 1.0);
    }

    #[test]
    fn test_move_boundary_at_500_pct() {
        // Exactly 500%: fails check 6.
        let raw = vec![candle(ts(2024, 1, 2), 10.0, 60.0, 10.0, 60.0, 10.0)];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(!out[0].validated);
        assert!((out[0].quality_score - 5.0 / 6.0).abs() < 1e-9);

        // 499.99...%: passes.
        let raw = vec![candle(ts(2024, 1, 2), 10.0, 59.999, 10.0, 59.999, 10.0)];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(out[0].validated);
    }

    #[test]
    fn test_friday_to_monday_gap_is_exempt() {
        // 2024-03-08 is a Friday, 2024-03-11 a Monday; 50% gap.
        let raw = vec![
            candle(ts(2024, 3, 8), 100.0, 101.0, 99.0, 100.0, 10.0),
            candle(ts(2024, 3, 11), 150.0, 151.0, 149.0, 150.0, 10.0),
        ];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(!out[1].gap_detected);
        assert!(out[1].validated);
    }

    #[test]
    fn test_midweek_moderate_gap_flagged() {
        // 2024-03-05 Tue -> 2024-03-06 Wed, 3% gap.
        let raw = vec![
            candle(ts(2024, 3, 5), 100.0, 101.0, 99.0, 100.0, 10.0),
            candle(ts(2024, 3, 6), 103.0, 104.0, 102.0, 103.5, 10.0),
        ];
        let (out, summary) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        let c = &out[1];
        assert!(c.gap_detected);
        assert!((c.quality_score - 0.8).abs() < 1e-9);
        assert!(c.validation_notes.iter().any(|n| n == NOTE_GAP_MODERATE));
        // Penalty pulls an otherwise clean candle below the threshold.
        assert!(!c.validated);
        assert_eq!(summary.gaps_flagged, 1);
    }

    #[test]
    fn test_split_sized_gap_is_flagged() {
        // Mon close 300 -> Tue open 150: 50% gap, consecutive business days.
        let raw = vec![
            candle(ts(2024, 3, 4), 300.0, 301.0, 299.0, 300.0, 10.0),
            candle(ts(2024, 3, 5), 150.0, 151.0, 149.0, 150.5, 10.0),
        ];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        let c = &out[1];
        assert!(c.gap_detected);
        assert!(c.validation_notes.iter().any(|n| n == NOTE_GAP_EXTREME));
    }

    #[test]
    fn test_gap_bands() {
        // 6% -> large.
        let raw = vec![
            candle(ts(2024, 3, 5), 100.0, 101.0, 99.0, 100.0, 10.0),
            candle(ts(2024, 3, 6), 106.0, 107.0, 105.0, 106.0, 10.0),
        ];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(out[1].validation_notes.iter().any(|n| n == NOTE_GAP_LARGE));

        // 12% -> extreme.
        let raw = vec![
            candle(ts(2024, 3, 5), 100.0, 101.0, 99.0, 100.0, 10.0),
            candle(ts(2024, 3, 6), 112.0, 113.0, 111.0, 112.0, 10.0),
        ];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(out[1].validation_notes.iter().any(|n| n == NOTE_GAP_EXTREME));

        // 1.5% -> benign.
        let raw = vec![
            candle(ts(2024, 3, 5), 100.0, 101.0, 99.0, 100.0, 10.0),
            candle(ts(2024, 3, 6), 101.5, 102.0, 101.0, 101.5, 10.0),
        ];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(!out[1].gap_detected);
    }

    #[test]
    fn test_holiday_span_is_exempt(){
        // Tue -> Fri (3 calendar days), 8% move: treated as holiday span.
        let raw = vec![
            candle(ts(2024, 3, 5), 100.0, 101.0, 99.0, 100.0, 10.0),
            candle(ts(2024, 3, 8), 108.0, 109.0, 107.0, 108.0, 10.0),
        ];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(!out[1].gap_detected);
    }

    #[test]
    fn test_single_candle_batch_has_no_anomalies() {
        let raw = vec![candle(ts(2024, 1, 2), 100.0, 101.0, 99.0, 100.0, 777.0)];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(out[0].validated);
        assert!(!out[0].gap_detected);
        assert!(!out[0].volume_anomaly);
    }

    #[test]
    fn test_volume_anomaly_bounds() {
        // Median of [100, 100, 100, 100, 2000] is 100; 2000 is 20x.
        let raw = vec![
            candle(ts(2024, 1, 1), 100.0, 101.0, 99.0, 100.0, 100.0),
            candle(ts(2024, 1, 2), 100.0, 101.0, 99.0, 100.0, 100.0),
            candle(ts(2024, 1, 3), 100.0, 101.0, 99.0, 100.0, 100.0),
            candle(ts(2024, 1, 4), 100.0, 101.0, 99.0, 100.0, 100.0),
            candle(ts(2024, 1, 5), 100.0, 101.0, 99.0, 100.0, 2000.0),
        ];
        let (out, summary) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(out[4].volume_anomaly);
        assert!((out[4].quality_score - 0.9).abs() < 1e-9);
        // 0.9 is still above the threshold.
        assert!(out[4].validated);
        assert_eq!(summary.volume_anomalies, 1);

        // Ratio below half the median flags too.
        let raw = vec![
            candle(ts(2024, 1, 1), 100.0, 101.0, 99.0, 100.0, 100.0),
            candle(ts(2024, 1, 2), 100.0, 101.0, 99.0, 100.0, 100.0),
            candle(ts(2024, 1, 3), 100.0, 101.0, 99.0, 100.0, 30.0),
        ];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(out[2].volume_anomaly);
    }

    #[test]
    fn test_zero_median_disables_volume_detector() {
        let raw = vec![
            candle(ts(2024, 1, 1), 100.0, 101.0, 99.0, 100.0, 0.0),
            candle(ts(2024, 1, 2), 100.0, 101.0, 99.0, 100.0, 0.0),
        ];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert!(out.iter().all(|c| !c.volume_anomaly));
    }

    #[test]
    fn test_duplicate_timestamp_rejected() {
        let t = ts(2024, 1, 2);
        let raw = vec![
            candle(t, 100.0, 101.0, 99.0, 100.0, 10.0),
            candle(t, 100.0, 101.0, 99.0, 100.0, 10.0),
        ];
        let (out, summary) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert_eq!(out.len(), 2);
        assert!(out[0].validated);
        assert!(!out[1].validated);
        assert!(out[1]
            .validation_notes
            .iter()
            .any(|n| n == "duplicate timestamp in batch"));
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_output_preserves_length_and_order() {
        let raw = vec![
            candle(ts(2024, 1, 2), 100.0, 90.0, 80.0, 95.0, 10.0), // broken
            candle(ts(2024, 1, 3), -5.0, 1.0, -6.0, 0.5, 10.0),    // non-positive
            candle(ts(2024, 1, 4), 100.0, 101.0, 99.0, 100.0, -3.0), // negative volume
        ];
        let (out, _) = validate_batch("X", Timeframe::D1, "upstream", &raw, now());
        assert_eq!(out.len(), raw.len());
        for (r, v) in raw.iter().zip(&out) {
            assert_eq!(r.ts, v.ts);
        }
    }
}
