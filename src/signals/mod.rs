pub mod burst;
pub mod rules;
pub mod similarity;

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::AnalyzerConfig;
use crate::core::{
    CallerRecord, ContractRecord, SignatureKey, SignatureRecord, TaggedSet, TagBatch, Transaction,
};
use crate::tags::Whitelist;
use crate::tags::merge::{Candidates, build_batch, dedupe_by_key};
use rules::Rule;

/// Known-bot seed: the top-N tagged signatures by invocation count and their contracts.
///
/// Chosen over the whole tagged set, not just the rows still suspicious, so a rerun picks
/// the same seed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Seed {
    pub signatures: Vec<SignatureKey>,
    pub contracts: BTreeSet<String>,
}

impl Seed {
    /// Ranked by invocations desc, then contract and signature asc.
    pub fn select(signatures: &[&SignatureRecord], size: usize) -> Self {
        let mut ranked: Vec<&SignatureRecord> = signatures.to_vec();
        ranked.sort_by(|a, b| {
            b.invocations
                .cmp(&a.invocations)
                .then_with(|| a.to_address.cmp(&b.to_address))
                .then_with(|| a.signature.cmp(&b.signature))
        });
        ranked.truncate(size);
        Self {
            signatures: ranked.iter().map(|s| s.key()).collect(),
            contracts: ranked.iter().map(|s| s.to_address.clone()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Everything a rule may look at. One row per natural key.
pub struct ScoringContext<'a> {
    pub contracts: Vec<&'a ContractRecord>,
    pub signatures: Vec<&'a SignatureRecord>,
    pub callers: Vec<&'a CallerRecord>,
    pub transactions: &'a [Transaction],
    pub seed: Seed,
}

impl<'a> ScoringContext<'a> {
    pub fn new(input: &'a TaggedSet, transactions: &'a [Transaction], seed_size: usize) -> Self {
        let contracts = dedupe_by_key(&input.contracts, |c| c.to_address.clone(), |c| c.block_timestamp);
        let signatures = dedupe_by_key(&input.signatures, SignatureRecord::key, |s| s.block_timestamp);
        let callers = dedupe_by_key(&input.callers, CallerRecord::key, |c| c.block_timestamp);
        let seed = Seed::select(&signatures, seed_size);
        Self {
            contracts,
            signatures,
            callers,
            transactions,
            seed,
        }
    }
}

/// Analyzer result: the batch to persist plus what drove it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzeOutput {
    pub batch: TagBatch,
    pub seed: Seed,
    pub candidates: usize,
    pub whitelisted: usize,
}

/// The scoring engine applies all rules and merges their candidates per entity.
pub struct ScoringEngine {
    rules: Vec<Box<dyn Rule + Send + Sync>>,
    seed_size: usize,
}

impl ScoringEngine {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            rules: rules::default_rules(config),
            seed_size: config.seed_size,
        }
    }

    /// Run every rule in order; later rules see earlier candidates.
    pub fn score(&self, ctx: &ScoringContext) -> Candidates {
        let mut found = Candidates::default();
        for rule in &self.rules {
            let produced = rule.evaluate(ctx, &found);
            debug!(
                rule = rule.name(),
                contracts = produced.contracts.len(),
                signatures = produced.signatures.len(),
                callers = produced.callers.len(),
                "rule evaluated"
            );
            found.extend(produced);
        }
        found
    }

    /// Score tagged entities, collapse to one tag per key and drop whitelisted ones.
    ///
    /// Existing bot tags take part in the merge, so rerunning on the output gives the same tags.
    pub fn analyze(
        &self,
        input: &TaggedSet,
        transactions: &[Transaction],
        whitelist: &Whitelist,
        now: DateTime<Utc>,
    ) -> AnalyzeOutput {
        if input.is_empty() {
            info!("Analyzer: no tagged entities, nothing to score");
            return AnalyzeOutput::default();
        }

        let ctx = ScoringContext::new(input, transactions, self.seed_size);
        info!(
            "Analyzer: {} contracts, {} signatures, {} callers, seed of {} signatures on {} contracts",
            ctx.contracts.len(),
            ctx.signatures.len(),
            ctx.callers.len(),
            ctx.seed.signatures.len(),
            ctx.seed.contracts.len()
        );

        let candidates = self.score(&ctx);
        let candidate_count = candidates.len();
        let (batch, whitelisted) = build_batch(
            &input.contracts,
            &input.signatures,
            &input.callers,
            candidates,
            whitelist,
            now,
        );

        let bots = batch.contracts.iter().filter(|c| c.tag.is_bot()).count()
            + batch.signatures.iter().filter(|s| s.tag.is_bot()).count()
            + batch.callers.iter().filter(|c| c.tag.is_bot()).count();
        info!(
            "Analyzer: {candidate_count} bot candidates merged into {} rows ({bots} bot), {whitelisted} whitelisted rows removed",
            batch.len()
        );

        AnalyzeOutput {
            batch,
            seed: ctx.seed,
            candidates: candidate_count,
            whitelisted,
        }
    }
}
