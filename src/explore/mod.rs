pub mod frequency;
pub mod propagate;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::ExplorerConfig;
use crate::core::{CallerKey, CallerRecord, ContractRecord, SignatureKey, SignatureRecord, TagBatch, Transaction};
use crate::tags::Tag;
use propagate::SuspiciousCreator;

/// Explorer result: the batch to persist plus the creators that drove propagation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExploreOutput {
    pub batch: TagBatch,
    pub creators: Vec<SuspiciousCreator>,
}

/// Flags the most frequently called signatures and spreads suspicion from them.
pub struct Explorer {
    top_signatures: usize,
}

impl Explorer {
    pub fn new(config: &ExplorerConfig) -> Self {
        Self {
            top_signatures: config.top_signatures,
        }
    }

    pub fn explore(&self, transactions: &[Transaction], now: DateTime<Utc>) -> ExploreOutput {
        if transactions.is_empty() {
            info!("Explorer: empty transaction window, nothing to tag");
            return ExploreOutput::default();
        }

        let top = frequency::top_signatures(transactions, self.top_signatures);
        let totals = frequency::invocations_by_contract(transactions);
        info!("Explorer: {} suspicious signature triples from {} txs", top.len(), transactions.len());

        let mut signatures: BTreeMap<SignatureKey, SignatureRecord> = BTreeMap::new();
        let mut contracts: BTreeMap<String, ContractRecord> = BTreeMap::new();
        let mut callers: BTreeMap<CallerKey, CallerRecord> = BTreeMap::new();

        for count in &top {
            let key = SignatureKey {
                to_address: count.to_address.clone(),
                signature: count.signature.clone(),
            };
            let invocations = totals
                .get(&(key.to_address.clone(), key.signature.clone()))
                .copied()
                .unwrap_or(count.invocations);
            signatures
                .entry(key)
                .and_modify(|s| s.block_timestamp = s.block_timestamp.max(count.last_seen))
                .or_insert_with(|| SignatureRecord {
                    to_address: count.to_address.clone(),
                    signature: count.signature.clone(),
                    invocations,
                    tag: Tag::suspicious(),
                    block_timestamp: count.last_seen,
                    updated_at: Some(now),
                });

            contracts
                .entry(count.to_address.clone())
                .and_modify(|c| c.block_timestamp = c.block_timestamp.min(count.first_seen))
                .or_insert_with(|| ContractRecord {
                    to_address: count.to_address.clone(),
                    tag: Tag::suspicious(),
                    block_timestamp: count.first_seen,
                    updated_at: Some(now),
                });

            let caller_key = CallerKey {
                caller: count.from_address.clone(),
                to_address: count.to_address.clone(),
            };
            callers
                .entry(caller_key)
                .and_modify(|c| c.block_timestamp = c.block_timestamp.max(count.last_seen))
                .or_insert_with(|| CallerRecord {
                    caller: count.from_address.clone(),
                    to_address: count.to_address.clone(),
                    tag: Tag::suspicious(),
                    block_timestamp: count.last_seen,
                    updated_at: Some(now),
                });
        }

        let suspicious: BTreeSet<String> = contracts.keys().cloned().collect();
        let propagation = propagate::propagate(&suspicious, transactions);
        let mut sibling_count = 0usize;
        // every suspicious contract created in the window is its own creator's sibling,
        // so this also moves its timestamp back to the creation
        for sibling in propagation.siblings {
            match contracts.entry(sibling.to_address.clone()) {
                Entry::Occupied(mut entry) => {
                    let record = entry.get_mut();
                    record.block_timestamp = record.block_timestamp.min(sibling.block_timestamp);
                }
                Entry::Vacant(entry) => {
                    sibling_count += 1;
                    debug!(contract = %sibling.to_address, creator = %sibling.creator, "sibling of suspicious contract");
                    entry.insert(ContractRecord {
                        to_address: sibling.to_address,
                        tag: Tag::suspicious(),
                        block_timestamp: sibling.block_timestamp,
                        updated_at: Some(now),
                    });
                }
            }
        }

        info!(
            "Explorer: {} contracts ({} via creators), {} signatures, {} callers, {} suspicious creators",
            contracts.len(),
            sibling_count,
            signatures.len(),
            callers.len(),
            propagation.creators.len()
        );

        ExploreOutput {
            batch: TagBatch {
                contracts: contracts.into_values().collect(),
                signatures: signatures.into_values().collect(),
                callers: callers.into_values().collect(),
            },
            creators: propagation.creators,
        }
    }
}
