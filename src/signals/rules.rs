use std::collections::{BTreeSet, HashMap};

use chrono::Duration;
use md5::{Digest, Md5};

use super::ScoringContext;
use super::burst::detect_bursts;
use super::similarity::rounded_ratio;
use crate::config::AnalyzerConfig;
use crate::tags::Tag;
use crate::tags::merge::Candidates;

/// A heuristic that proposes bot tags for suspicious entities.
///
/// Rules run in order and each one sees the candidates produced before it, so
/// rules that build on earlier bot tags (signature reuse, similarity) come later.
pub trait Rule {
    fn name(&self) -> &str;
    fn evaluate(&self, ctx: &ScoringContext, found: &Candidates) -> Candidates;
}

/// Return all rules in evaluation order.
pub fn default_rules(config: &AnalyzerConfig) -> Vec<Box<dyn Rule + Send + Sync>> {
    vec![
        Box::new(SeedSignatureRule),
        Box::new(SignatureReuseRule {
            min_confidence: config.reuse_min_confidence,
        }),
        Box::new(BytecodeHashRule),
        Box::new(BytecodeSimilarityRule {
            threshold: config.similarity_threshold,
        }),
        Box::new(CallerVolumeRule {
            threshold: config.caller_volume_threshold,
        }),
        Box::new(BurstFrequencyRule {
            min_calls: config.burst_min_calls,
            window: Duration::seconds(config.burst_window_seconds),
        }),
    ]
}

/// MD5 hex digest of a contract's code identifier.
pub fn code_fingerprint(identifier: &str) -> String {
    hex::encode(Md5::digest(identifier.as_bytes()))
}

// --- Individual Rules ---

/// Every signature on a seed contract.
struct SeedSignatureRule;
impl Rule for SeedSignatureRule {
    fn name(&self) -> &str { "seed_signature" }
    fn evaluate(&self, ctx: &ScoringContext, _found: &Candidates) -> Candidates {
        let signatures = ctx
            .signatures
            .iter()
            .filter(|s| ctx.seed.contracts.contains(&s.to_address))
            .map(|s| (s.key(), Tag::bot(1.0)))
            .collect();
        Candidates {
            signatures,
            ..Default::default()
        }
    }
}

/// The same selector reused on another contract.
struct SignatureReuseRule {
    min_confidence: f64,
}
impl Rule for SignatureReuseRule {
    fn name(&self) -> &str { "signature_reuse" }
    fn evaluate(&self, ctx: &ScoringContext, found: &Candidates) -> Candidates {
        let confident: Vec<_> = found
            .signatures
            .iter()
            .filter(|(_, tag)| tag.is_bot() && tag.confidence >= self.min_confidence)
            .collect();
        if confident.is_empty() {
            return Candidates::default();
        }
        let selectors: BTreeSet<&str> = confident.iter().map(|(key, _)| key.signature.as_str()).collect();
        let tagged: BTreeSet<_> = confident.iter().map(|(key, _)| key).collect();

        let signatures = ctx
            .signatures
            .iter()
            .map(|s| s.key())
            .filter(|key| !tagged.contains(key) && selectors.contains(key.signature.as_str()))
            .map(|key| (key, Tag::bot(0.6)))
            .collect();
        Candidates {
            signatures,
            ..Default::default()
        }
    }
}

/// Contract code fingerprint identical to a seed contract's.
struct BytecodeHashRule;
impl Rule for BytecodeHashRule {
    fn name(&self) -> &str { "bytecode_hash" }
    fn evaluate(&self, ctx: &ScoringContext, _found: &Candidates) -> Candidates {
        if ctx.seed.contracts.is_empty() {
            return Candidates::default();
        }
        let seed_hashes: BTreeSet<String> = ctx.seed.contracts.iter().map(|c| code_fingerprint(c)).collect();
        let contracts = ctx
            .contracts
            .iter()
            .filter(|c| seed_hashes.contains(&code_fingerprint(&c.to_address)))
            .map(|c| (c.to_address.clone(), Tag::bot(0.95)))
            .collect();
        Candidates {
            contracts,
            ..Default::default()
        }
    }
}

/// Contract code close to an already bot-tagged contract.
///
/// Compares every suspicious contract with every bot contract: O(S·B). Fine for
/// batches of hundreds; a hotspot if the suspicious set grows much larger.
struct BytecodeSimilarityRule {
    threshold: f64,
}
impl Rule for BytecodeSimilarityRule {
    fn name(&self) -> &str { "bytecode_similarity" }
    fn evaluate(&self, ctx: &ScoringContext, found: &Candidates) -> Candidates {
        let bots = found.bot_contracts();
        if bots.is_empty() {
            return Candidates::default();
        }
        let contracts = ctx
            .contracts
            .iter()
            .filter(|c| bots.binary_search(&c.to_address).is_err())
            .filter(|c| {
                let best = bots
                    .iter()
                    .map(|bot| rounded_ratio(&c.to_address, bot))
                    .fold(0.0, f64::max);
                best > self.threshold
            })
            .map(|c| (c.to_address.clone(), Tag::bot(0.7)))
            .collect();
        Candidates {
            contracts,
            ..Default::default()
        }
    }
}

/// Callers of a seed contract; heavy contracts make their callers certain.
struct CallerVolumeRule {
    threshold: u64,
}
impl Rule for CallerVolumeRule {
    fn name(&self) -> &str { "caller_volume" }
    fn evaluate(&self, ctx: &ScoringContext, _found: &Candidates) -> Candidates {
        if ctx.seed.contracts.is_empty() {
            return Candidates::default();
        }
        // busiest signature per contract; contracts without one count as 0
        let mut invocations: HashMap<&str, u64> = HashMap::new();
        for s in &ctx.signatures {
            let entry = invocations.entry(s.to_address.as_str()).or_insert(0);
            *entry = (*entry).max(s.invocations);
        }

        let callers = ctx
            .callers
            .iter()
            .filter(|c| ctx.seed.contracts.contains(&c.to_address))
            .map(|c| {
                let count = invocations.get(c.to_address.as_str()).copied().unwrap_or(0);
                let confidence = if count > self.threshold { 1.0 } else { 0.6 };
                (c.key(), Tag::bot(confidence))
            })
            .collect();
        Candidates {
            callers,
            ..Default::default()
        }
    }
}

/// Tagged callers hammering one signature faster than a human could.
struct BurstFrequencyRule {
    min_calls: usize,
    window: Duration,
}
impl Rule for BurstFrequencyRule {
    fn name(&self) -> &str { "burst_frequency" }
    fn evaluate(&self, ctx: &ScoringContext, _found: &Candidates) -> Candidates {
        if ctx.callers.is_empty() || ctx.transactions.is_empty() {
            return Candidates::default();
        }
        let bursts = detect_bursts(ctx.transactions, self.min_calls, self.window);
        let tagged_contracts: BTreeSet<&str> = ctx.contracts.iter().map(|c| c.to_address.as_str()).collect();

        let callers = ctx
            .callers
            .iter()
            .filter(|c| tagged_contracts.contains(c.to_address.as_str()))
            .map(|c| c.key())
            .filter(|key| bursts.contains(key))
            .map(|key| (key, Tag::bot(0.7)))
            .collect();
        Candidates {
            callers,
            ..Default::default()
        }
    }
}
