use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::core::Transaction;

/// Address that deployed a suspicious contract inside the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspiciousCreator {
    pub creator: String,
    pub created_contract: String,
    pub block_timestamp: DateTime<Utc>,
}

/// Contract deployed by a suspicious creator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingContract {
    pub to_address: String,
    pub creator: String,
    pub block_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Propagation {
    pub creators: Vec<SuspiciousCreator>,
    pub siblings: Vec<SiblingContract>,
}

/// Spread suspicion from contracts to their creators, then to everything those creators deployed.
///
/// Exactly two hops: siblings are not expanded further in the same run. Only
/// `created_contract_address` values observed in the window are returned.
pub fn propagate(suspicious_contracts: &BTreeSet<String>, transactions: &[Transaction]) -> Propagation {
    if suspicious_contracts.is_empty() {
        return Propagation::default();
    }

    // hop 1: contract -> creator
    let mut creators: BTreeMap<(String, String), DateTime<Utc>> = BTreeMap::new();
    for tx in transactions {
        let Some(created) = tx.created_contract_address.as_deref() else { continue };
        if tx.from_address.is_empty() || !suspicious_contracts.contains(created) {
            continue;
        }
        creators
            .entry((tx.from_address.clone(), created.to_string()))
            .and_modify(|t| *t = (*t).min(tx.block_timestamp))
            .or_insert(tx.block_timestamp);
    }

    let creator_set: BTreeSet<&str> = creators.keys().map(|(creator, _)| creator.as_str()).collect();

    // hop 2: creator -> every contract it deployed
    let mut siblings: BTreeMap<String, (String, DateTime<Utc>)> = BTreeMap::new();
    for tx in transactions {
        let Some(created) = tx.created_contract_address.as_deref() else { continue };
        if !creator_set.contains(tx.from_address.as_str()) {
            continue;
        }
        siblings
            .entry(created.to_string())
            .and_modify(|(creator, t)| {
                if tx.block_timestamp < *t {
                    *creator = tx.from_address.clone();
                    *t = tx.block_timestamp;
                }
            })
            .or_insert((tx.from_address.clone(), tx.block_timestamp));
    }

    Propagation {
        creators: creators
            .into_iter()
            .map(|((creator, created_contract), block_timestamp)| SuspiciousCreator {
                creator,
                created_contract,
                block_timestamp,
            })
            .collect(),
        siblings: siblings
            .into_iter()
            .map(|(to_address, (creator, block_timestamp))| SiblingContract {
                to_address,
                creator,
                block_timestamp,
            })
            .collect(),
    }
}
