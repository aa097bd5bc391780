use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::core::Transaction;

/// Invocation count of one signature by one caller on one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureCount {
    pub from_address: String,
    pub to_address: String,
    pub signature: String,
    pub invocations: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// Total order used for ranking: count desc, then signature, contract, caller asc.
fn rank_order(a: &SignatureCount, b: &SignatureCount) -> Ordering {
    b.invocations
        .cmp(&a.invocations)
        .then_with(|| a.signature.cmp(&b.signature))
        .then_with(|| a.to_address.cmp(&b.to_address))
        .then_with(|| a.from_address.cmp(&b.from_address))
}

/// Count calls per distinct (caller, contract, signature) and rank them.
///
/// Creation transactions and payloads without a selector are not counted.
pub fn rank_signatures(transactions: &[Transaction]) -> Vec<SignatureCount> {
    let mut counts: HashMap<(&str, &str, String), SignatureCount> = HashMap::new();

    for tx in transactions {
        let Some(to_address) = tx.to_address.as_deref() else { continue };
        let Some(signature) = tx.signature() else { continue };

        counts
            .entry((tx.from_address.as_str(), to_address, signature.clone()))
            .and_modify(|c| {
                c.invocations += 1;
                c.first_seen = c.first_seen.min(tx.block_timestamp);
                c.last_seen = c.last_seen.max(tx.block_timestamp);
            })
            .or_insert_with(|| SignatureCount {
                from_address: tx.from_address.clone(),
                to_address: to_address.to_string(),
                signature,
                invocations: 1,
                first_seen: tx.block_timestamp,
                last_seen: tx.block_timestamp,
            });
    }

    let mut ranked: Vec<SignatureCount> = counts.into_values().collect();
    ranked.sort_by(rank_order);
    ranked
}

/// The `k` most frequently invoked triples. Ties at the cutoff fall by the ranking order.
pub fn top_signatures(transactions: &[Transaction], k: usize) -> Vec<SignatureCount> {
    let mut ranked = rank_signatures(transactions);
    ranked.truncate(k);
    ranked
}

/// Total calls per (contract, signature) across every caller in the window.
pub fn invocations_by_contract(transactions: &[Transaction]) -> HashMap<(String, String), u64> {
    let mut totals = HashMap::new();
    for tx in transactions {
        let (Some(to_address), Some(signature)) = (tx.to_address.as_ref(), tx.signature()) else {
            continue;
        };
        *totals.entry((to_address.clone(), signature)).or_insert(0) += 1;
    }
    totals
}
