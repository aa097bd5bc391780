use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::{Tag, Whitelist};
use crate::core::{CallerKey, CallerRecord, ContractRecord, SignatureKey, SignatureRecord, TagBatch};

/// Whether `candidate` should replace `current` as the single tag for a key.
///
/// Any bot tag beats a suspicious one; within a label the higher confidence wins.
/// Equal tags keep the incumbent, so the result does not depend on input order.
fn supersedes(candidate: &Tag, current: &Tag) -> bool {
    match (candidate.is_bot(), current.is_bot()) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.confidence > current.confidence,
    }
}

/// Collapse every candidate tag to one tag per natural key.
pub fn merge_tags<K, I>(candidates: I) -> BTreeMap<K, Tag>
where
    K: Ord,
    I: IntoIterator<Item = (K, Tag)>,
{
    let mut merged: BTreeMap<K, Tag> = BTreeMap::new();
    for (key, tag) in candidates {
        merged
            .entry(key)
            .and_modify(|current| {
                if supersedes(&tag, current) {
                    *current = tag;
                }
            })
            .or_insert(tag);
    }
    merged
}

/// Heuristic output before merging: any number of tags per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidates {
    pub contracts: Vec<(String, Tag)>,
    pub signatures: Vec<(SignatureKey, Tag)>,
    pub callers: Vec<(CallerKey, Tag)>,
}

impl Candidates {
    pub fn extend(&mut self, other: Candidates) {
        self.contracts.extend(other.contracts);
        self.signatures.extend(other.signatures);
        self.callers.extend(other.callers);
    }

    pub fn len(&self) -> usize {
        self.contracts.len() + self.signatures.len() + self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Contracts already carrying a bot candidate, deduplicated and sorted.
    pub fn bot_contracts(&self) -> Vec<String> {
        let mut contracts: Vec<String> = self
            .contracts
            .iter()
            .filter(|(_, tag)| tag.is_bot())
            .map(|(address, _)| address.clone())
            .collect();
        contracts.sort();
        contracts.dedup();
        contracts
    }
}

/// Apply merged tags to the base records, drop whitelisted entities and stamp `updated_at`.
///
/// Base records supply every non-tag attribute, so a candidate whose key has no base
/// record is ignored: merging never invents entities.
pub fn build_batch(
    base_contracts: &[ContractRecord],
    base_signatures: &[SignatureRecord],
    base_callers: &[CallerRecord],
    candidates: Candidates,
    whitelist: &Whitelist,
    now: DateTime<Utc>,
) -> (TagBatch, usize) {
    let contract_tags = merge_tags(
        base_contracts
            .iter()
            .map(|c| (c.to_address.clone(), c.tag))
            .chain(candidates.contracts),
    );
    let signature_tags = merge_tags(
        base_signatures
            .iter()
            .map(|s| (s.key(), s.tag))
            .chain(candidates.signatures),
    );
    let caller_tags = merge_tags(
        base_callers
            .iter()
            .map(|c| (c.key(), c.tag))
            .chain(candidates.callers),
    );

    let mut removed = 0usize;
    let mut batch = TagBatch::default();

    for record in dedupe_by_key(base_contracts, |c| c.to_address.clone(), |c| c.block_timestamp) {
        if whitelist.contains(&record.to_address) {
            removed += 1;
            continue;
        }
        let Some(tag) = contract_tags.get(&record.to_address) else { continue };
        batch.contracts.push(ContractRecord {
            tag: *tag,
            updated_at: Some(now),
            ..record.clone()
        });
    }

    for record in dedupe_by_key(base_signatures, SignatureRecord::key, |s| s.block_timestamp) {
        if whitelist.contains(&record.to_address) {
            removed += 1;
            continue;
        }
        let Some(tag) = signature_tags.get(&record.key()) else { continue };
        batch.signatures.push(SignatureRecord {
            tag: *tag,
            updated_at: Some(now),
            ..record.clone()
        });
    }

    for record in dedupe_by_key(base_callers, CallerRecord::key, |c| c.block_timestamp) {
        if whitelist.contains(&record.to_address) || whitelist.contains(&record.caller) {
            removed += 1;
            continue;
        }
        let Some(tag) = caller_tags.get(&record.key()) else { continue };
        batch.callers.push(CallerRecord {
            tag: *tag,
            updated_at: Some(now),
            ..record.clone()
        });
    }

    (batch, removed)
}

/// One record per key, keeping the latest `block_timestamp`; ordered by key.
pub fn dedupe_by_key<'a, T, K, F, G>(records: &'a [T], key: F, timestamp: G) -> Vec<&'a T>
where
    K: Ord,
    F: Fn(&T) -> K,
    G: Fn(&T) -> DateTime<Utc>,
{
    let mut latest: BTreeMap<K, &T> = BTreeMap::new();
    for record in records {
        latest
            .entry(key(record))
            .and_modify(|current| {
                if timestamp(record) > timestamp(current) {
                    *current = record;
                }
            })
            .or_insert(record);
    }
    latest.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn contract(address: &str, secs: i64) -> ContractRecord {
        ContractRecord {
            to_address: address.to_string(),
            tag: Tag::suspicious(),
            block_timestamp: ts(secs),
            updated_at: None,
        }
    }

    fn signature(address: &str, sig: &str, invocations: u64) -> SignatureRecord {
        SignatureRecord {
            to_address: address.to_string(),
            signature: sig.to_string(),
            invocations,
            tag: Tag::suspicious(),
            block_timestamp: ts(100),
            updated_at: None,
        }
    }

    fn caller(caller: &str, address: &str) -> CallerRecord {
        CallerRecord {
            caller: caller.to_string(),
            to_address: address.to_string(),
            tag: Tag::suspicious(),
            block_timestamp: ts(100),
            updated_at: None,
        }
    }

    #[test]
    fn bot_supersedes_suspicious() {
        let merged = merge_tags(vec![("x", Tag::suspicious()), ("x", Tag::bot(0.6))]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["x"], Tag::bot(0.6));
    }

    #[test]
    fn highest_bot_confidence_wins() {
        let merged = merge_tags(vec![
            ("x", Tag::bot(0.7)),
            ("x", Tag::bot(0.95)),
            ("x", Tag::suspicious()),
            ("x", Tag::bot(0.6)),
        ]);
        assert_eq!(merged["x"], Tag::bot(0.95));
    }

    #[test]
    fn merge_is_order_independent() {
        let forward = vec![("x", Tag::bot(0.6)), ("x", Tag::bot(1.0)), ("y", Tag::suspicious())];
        let mut backward = forward.clone();
        backward.reverse();
        assert_eq!(merge_tags(forward), merge_tags(backward));
    }

    #[test]
    fn merge_is_idempotent() {
        let once = merge_tags(vec![("x", Tag::bot(0.7)), ("x", Tag::suspicious())]);
        let twice = merge_tags(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn suspicious_only_kept_unchanged() {
        let merged = merge_tags(vec![("x", Tag::suspicious()), ("x", Tag::suspicious())]);
        assert_eq!(merged["x"], Tag::suspicious());
    }

    #[test]
    fn build_batch_applies_merged_tags() {
        let contracts = vec![contract("0xa", 10), contract("0xb", 20)];
        let signatures = vec![signature("0xa", "0x11111111", 50)];
        let callers = vec![caller("0xc1", "0xa")];
        let candidates = Candidates {
            contracts: vec![("0xa".into(), Tag::bot(0.95)), ("0xa".into(), Tag::bot(0.7))],
            signatures: vec![(signatures[0].key(), Tag::bot(1.0))],
            callers: vec![(callers[0].key(), Tag::bot(0.6))],
        };

        let (batch, removed) = build_batch(
            &contracts,
            &signatures,
            &callers,
            candidates,
            &Whitelist::default(),
            ts(1_000),
        );

        assert_eq!(removed, 0);
        assert_eq!(batch.contracts.len(), 2);
        assert_eq!(batch.contracts[0].tag, Tag::bot(0.95));
        assert_eq!(batch.contracts[1].tag, Tag::suspicious());
        assert_eq!(batch.signatures[0].tag, Tag::bot(1.0));
        assert_eq!(batch.signatures[0].invocations, 50);
        assert_eq!(batch.callers[0].tag, Tag::bot(0.6));
        assert!(batch.contracts.iter().all(|c| c.updated_at == Some(ts(1_000))));
    }

    #[test]
    fn whitelisted_entities_never_emitted() {
        let contracts = vec![contract("0xlegit", 10), contract("0xbot", 10)];
        let signatures = vec![signature("0xlegit", "0x11111111", 500)];
        let callers = vec![caller("0xc1", "0xlegit"), caller("0xlegit", "0xbot")];
        let candidates = Candidates {
            contracts: vec![("0xlegit".into(), Tag::bot(1.0)), ("0xlegit".into(), Tag::bot(0.95))],
            signatures: vec![(signatures[0].key(), Tag::bot(1.0))],
            callers: vec![(callers[0].key(), Tag::bot(1.0))],
        };

        let (batch, removed) = build_batch(
            &contracts,
            &signatures,
            &callers,
            candidates,
            &Whitelist::new(["0xLEGIT"]),
            ts(1_000),
        );

        assert_eq!(removed, 4);
        assert_eq!(batch.contracts.len(), 1);
        assert_eq!(batch.contracts[0].to_address, "0xbot");
        assert!(batch.signatures.is_empty());
        assert!(batch.callers.is_empty());
    }

    #[test]
    fn candidates_without_base_record_are_dropped() {
        let contracts = vec![contract("0xa", 10)];
        let candidates = Candidates {
            contracts: vec![("0xunseen".into(), Tag::bot(1.0))],
            ..Default::default()
        };
        let (batch, _) =
            build_batch(&contracts, &[], &[], candidates, &Whitelist::default(), ts(1));
        assert_eq!(batch.contracts.len(), 1);
        assert_eq!(batch.contracts[0].to_address, "0xa");
    }

    #[test]
    fn duplicate_base_rows_collapse_to_latest() {
        let contracts = vec![contract("0xa", 10), contract("0xa", 30), contract("0xa", 20)];
        let (batch, _) = build_batch(
            &contracts,
            &[],
            &[],
            Candidates::default(),
            &Whitelist::default(),
            ts(1),
        );
        assert_eq!(batch.contracts.len(), 1);
        assert_eq!(batch.contracts[0].block_timestamp, ts(30));
    }

    #[test]
    fn bot_contracts_deduplicated() {
        let candidates = Candidates {
            contracts: vec![
                ("0xb".into(), Tag::bot(0.95)),
                ("0xa".into(), Tag::bot(0.95)),
                ("0xb".into(), Tag::bot(0.7)),
                ("0xc".into(), Tag::suspicious()),
            ],
            ..Default::default()
        };
        assert_eq!(candidates.bot_contracts(), vec!["0xa".to_string(), "0xb".to_string()]);
    }
}
