use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};

use crate::core::{CallerKey, Transaction};

/// Largest number of timestamps falling in any half-open window `[t, t + window)`.
///
/// `timestamps` must be sorted ascending. An empty or negative window holds nothing.
pub fn max_calls_in_window(timestamps: &[DateTime<Utc>], window: Duration) -> usize {
    if window <= Duration::zero() {
        return 0;
    }
    let mut best = 0;
    let mut start = 0;
    for (end, t) in timestamps.iter().enumerate() {
        while *t - timestamps[start] >= window {
            start += 1;
        }
        best = best.max(end - start + 1);
    }
    best
}

/// Callers that invoked one signature on one contract more than `min_calls`
/// times inside some window of length `window`. Inhumane call rates.
pub fn detect_bursts(transactions: &[Transaction], min_calls: usize, window: Duration) -> BTreeSet<CallerKey> {
    let mut calls: BTreeMap<(CallerKey, String), Vec<DateTime<Utc>>> = BTreeMap::new();
    for tx in transactions {
        let (Some(to_address), Some(signature)) = (tx.to_address.as_ref(), tx.signature()) else {
            continue;
        };
        let key = CallerKey {
            caller: tx.from_address.clone(),
            to_address: to_address.clone(),
        };
        calls.entry((key, signature)).or_default().push(tx.block_timestamp);
    }

    calls
        .into_iter()
        .filter_map(|((key, _), mut timestamps)| {
            if timestamps.len() <= min_calls {
                return None;
            }
            timestamps.sort();
            (max_calls_in_window(&timestamps, window) > min_calls).then_some(key)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn call(from: &str, to: &str, input: &str, secs: i64) -> Transaction {
        Transaction {
            from_address: from.to_string(),
            to_address: Some(to.to_string()),
            input: input.to_string(),
            created_contract_address: None,
            block_timestamp: ts(secs),
        }
    }

    fn minute() -> Duration {
        Duration::seconds(60)
    }

    #[test]
    fn window_counts() {
        let stamps: Vec<_> = [0, 10, 20, 59, 60, 61].iter().map(|s| ts(*s)).collect();
        // [10, 70) holds 10, 20, 59, 60, 61
        assert_eq!(max_calls_in_window(&stamps, minute()), 5);
        assert_eq!(max_calls_in_window(&stamps[..4], minute()), 4);
        assert_eq!(max_calls_in_window(&[], minute()), 0);
    }

    #[test]
    fn degenerate_window_holds_nothing() {
        let stamps: Vec<_> = (0..6).map(ts).collect();
        assert_eq!(max_calls_in_window(&stamps, Duration::zero()), 0);
        assert_eq!(max_calls_in_window(&stamps, Duration::seconds(-60)), 0);

        let txs: Vec<_> = (0..6).map(|i| call("0xa", "0xx", "0xaaaaaaaa", i)).collect();
        assert!(detect_bursts(&txs, 5, Duration::zero()).is_empty());
    }

    #[test]
    fn six_calls_in_a_minute_is_a_burst() {
        let txs: Vec<_> = (0..6).map(|i| call("0xa", "0xx", "0xaaaaaaaa", i * 10)).collect();
        let bursts = detect_bursts(&txs, 5, minute());
        assert_eq!(bursts.len(), 1);
        assert!(bursts.contains(&CallerKey {
            caller: "0xa".into(),
            to_address: "0xx".into()
        }));
    }

    #[test]
    fn five_calls_is_not_a_burst() {
        let txs: Vec<_> = (0..5).map(|i| call("0xa", "0xx", "0xaaaaaaaa", i)).collect();
        assert!(detect_bursts(&txs, 5, minute()).is_empty());
    }

    #[test]
    fn spread_out_calls_are_not_a_burst() {
        let txs: Vec<_> = (0..20).map(|i| call("0xa", "0xx", "0xaaaaaaaa", i * 15)).collect();
        // at most 4 calls fall in any 60s window
        assert!(detect_bursts(&txs, 5, minute()).is_empty());
    }

    #[test]
    fn burst_straddling_minute_boundary() {
        // 3 calls at the end of one calendar minute, 3 at the start of the next
        let secs = [55, 56, 57, 61, 62, 63];
        let txs: Vec<_> = secs.iter().map(|s| call("0xa", "0xx", "0xaaaaaaaa", *s)).collect();
        assert_eq!(detect_bursts(&txs, 5, minute()).len(), 1);
    }

    #[test]
    fn signatures_counted_separately() {
        let mut txs: Vec<_> = (0..3).map(|i| call("0xa", "0xx", "0xaaaaaaaa", i)).collect();
        txs.extend((0..3).map(|i| call("0xa", "0xx", "0xbbbbbbbb", i)));
        assert!(detect_bursts(&txs, 5, minute()).is_empty());
    }

    #[test]
    fn unsorted_input() {
        let secs = [30, 0, 50, 10, 40, 20];
        let txs: Vec<_> = secs.iter().map(|s| call("0xa", "0xx", "0xaaaaaaaa", *s)).collect();
        assert_eq!(detect_bursts(&txs, 5, minute()).len(), 1);
    }
}
