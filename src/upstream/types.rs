//! Provider wire types and their domain counterparts.

use crate::models::RawCandle;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Wire payloads
// =============================================================================

/// Candle endpoint body. The provider is not trusted to order candles.
#[derive(Debug, Deserialize)]
pub(crate) struct CandlesPayload {
    #[serde(default)]
    pub candles: Vec<WireCandle>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireCandle {
    /// Epoch seconds UTC of the bucket open.
    pub t: i64,
    pub o: f64,
    pub h: f64,
    pub l: f64,
    pub c: f64,
    pub v: f64,
}

impl WireCandle {
    pub fn into_raw(self) -> Option<RawCandle> {
        let ts = Utc.timestamp_opt(self.t, 0).single()?;
        Some(RawCandle {
            ts,
            open: self.o,
            high: self.h,
            low: self.l,
            close: self.c,
            volume: self.v,
        })
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct DividendsPayload {
    #[serde(default)]
    pub dividends: Vec<Dividend>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SplitsPayload {
    #[serde(default)]
    pub splits: Vec<Split>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EarningsPayload {
    #[serde(default)]
    pub earnings: Vec<Earnings>,
}

// =============================================================================
// Domain types for the enrichment endpoints
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dividend {
    pub ex_date: NaiveDate,
    pub pay_date: Option<NaiveDate>,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub date: NaiveDate,
    pub numerator: u32,
    pub denominator: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Earnings {
    pub date: NaiveDate,
    pub eps_actual: Option<f64>,
    pub eps_estimate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Call,
    Put,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionContract {
    pub contract: String,
    pub kind: OptionKind,
    pub strike: f64,
    pub expiry: NaiveDate,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub open_interest: Option<u64>,
}

/// Point-in-time snapshot of a symbol's listed options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsSnapshot {
    pub symbol: String,
    pub as_of: DateTime<Utc>,
    #[serde(default)]
    pub contracts: Vec<OptionContract>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_candle_conversion() {
        let wire = WireCandle {
            t: 1_704_153_600, // 2024-01-02 00:00:00 UTC
            o: 100.0,
            h: 101.0,
            l: 99.0,
            c: 100.5,
            v: 1000.0,
        };
        let raw = wire.into_raw().unwrap();
        assert_eq!(raw.ts.timestamp(), 1_704_153_600);
        assert_eq!(raw.close, 100.5);
    }

    #[test]
    fn test_candles_payload_parses_missing_list_as_empty() {
        let payload: CandlesPayload = serde_json::from_str("{}").unwrap();
        assert!(payload.candles.is_empty());
    }

    #[test]
    fn test_options_snapshot_round_trip() {
        let snap = OptionsSnapshot {
            symbol: "AAPL".to_string(),
            as_of: Utc.timestamp_opt(1_704_153_600, 0).single().unwrap(),
            contracts: vec![OptionContract {
                contract: "AAPL240119C00190000".to_string(),
                kind: OptionKind::Call,
                strike: 190.0,
                expiry: NaiveDate::from_ymd_opt(2024, 1, 19).unwrap(),
                bid: Some(1.2),
                ask: Some(1.3),
                open_interest: Some(5400),
            }],
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: OptionsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
