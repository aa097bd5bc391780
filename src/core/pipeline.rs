use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::core::TagBatch;
use crate::db::DataStore;
use crate::error::{BotRadarError, Result};
use crate::explore::Explorer;
use crate::signals::ScoringEngine;

/// Which pass to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Explore,
    Analyze,
}

/// Counts reported after a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub stage: Stage,
    pub transactions: usize,
    pub contracts: usize,
    pub signatures: usize,
    pub callers: usize,
    pub bot_tags: usize,
    pub whitelisted: usize,
    pub rows_merged: usize,
    pub finished_at: DateTime<Utc>,
}

/// Set when the boundary gives up on a run; checked before anything is written.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Explore: read the transaction window, flag suspicious entities, merge them.
pub fn run_explore(
    store: &impl DataStore,
    config: &Config,
    now: DateTime<Utc>,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let since = now - chrono::Duration::days(config.explorer.window_days);
    let transactions = store.transaction_window(since)?;
    info!("Pulled {} transactions since {since}", transactions.len());

    let output = Explorer::new(&config.explorer).explore(&transactions, now);
    for creator in &output.creators {
        info!(
            creator = %creator.creator,
            contract = %creator.created_contract,
            deployed_at = %creator.block_timestamp,
            "suspicious creator"
        );
    }

    let rows_merged = persist(store, &output.batch, cancel)?;
    Ok(RunSummary {
        stage: Stage::Explore,
        transactions: transactions.len(),
        contracts: output.batch.contracts.len(),
        signatures: output.batch.signatures.len(),
        callers: output.batch.callers.len(),
        bot_tags: 0,
        whitelisted: 0,
        rows_merged,
        finished_at: now,
    })
}

/// Analyze: re-score every tagged entity and merge the confidence tags.
pub fn run_analyze(
    store: &impl DataStore,
    config: &Config,
    now: DateTime<Utc>,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let tagged = store.tagged_entities()?;
    let since = now - chrono::Duration::days(config.analyzer.window_days);
    let transactions = store.transaction_window(since)?;
    let whitelist = store.whitelist()?;
    if whitelist.is_empty() {
        warn!("Whitelist is empty, no contracts will be exempted");
    } else {
        info!("Whitelist holds {} addresses", whitelist.len());
    }
    info!(
        "Pulled {} tagged contracts, {} signatures, {} callers ({} still suspicious), {} transactions",
        tagged.contracts.len(),
        tagged.signatures.len(),
        tagged.callers.len(),
        tagged.contracts.iter().filter(|c| c.tag.is_suspicious()).count()
            + tagged.signatures.iter().filter(|s| s.tag.is_suspicious()).count()
            + tagged.callers.iter().filter(|c| c.tag.is_suspicious()).count(),
        transactions.len()
    );

    let output = ScoringEngine::new(&config.analyzer).analyze(&tagged, &transactions, &whitelist, now);
    if output.seed.is_empty() && !tagged.is_empty() {
        warn!("No tagged signatures to seed from, only burst scoring applies");
    } else {
        info!(
            "Scored {} bot candidates from a seed of {} signatures",
            output.candidates,
            output.seed.signatures.len()
        );
    }
    let batch = &output.batch;
    let bot_tags = batch.contracts.iter().filter(|c| c.tag.is_bot()).count()
        + batch.signatures.iter().filter(|s| s.tag.is_bot()).count()
        + batch.callers.iter().filter(|c| c.tag.is_bot()).count();

    let rows_merged = persist(store, batch, cancel)?;
    Ok(RunSummary {
        stage: Stage::Analyze,
        transactions: transactions.len(),
        contracts: batch.contracts.len(),
        signatures: batch.signatures.len(),
        callers: batch.callers.len(),
        bot_tags,
        whitelisted: output.whitelisted,
        rows_merged,
        finished_at: now,
    })
}

fn persist(store: &impl DataStore, batch: &TagBatch, cancel: &CancelFlag) -> Result<usize> {
    if cancel.is_cancelled() {
        warn!("Run cancelled, discarding batch of {} rows", batch.len());
        return Err(BotRadarError::Cancelled);
    }
    if batch.is_empty() {
        info!("Nothing to merge");
        return Ok(0);
    }
    match store.merge_batch(batch) {
        Ok(rows) => {
            info!("Merged {rows} rows");
            Ok(rows)
        }
        Err(e) => {
            error!("Merge failed, batch discarded: {e}");
            Err(e)
        }
    }
}

/// Run one stage on a blocking thread, bounded by `timeout`.
///
/// On expiry the run is flagged cancelled so it will not commit, and `Timeout` is returned.
pub async fn run_stage<S>(stage: Stage, store: S, config: Config, timeout: Duration) -> Result<RunSummary>
where
    S: DataStore + Send + 'static,
{
    let cancel = CancelFlag::new();
    let task_cancel = cancel.clone();
    let handle = tokio::task::spawn_blocking(move || {
        let now = Utc::now();
        match stage {
            Stage::Explore => run_explore(&store, &config, now, &task_cancel),
            Stage::Analyze => run_analyze(&store, &config, now, &task_cancel),
        }
    });

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(BotRadarError::Task(join_error.to_string())),
        Err(_) => {
            cancel.cancel();
            error!("{stage:?} run exceeded {timeout:?}");
            Err(BotRadarError::Timeout(timeout))
        }
    }
}

/// Run stages in order on a fresh runtime; the first failure stops the rest.
///
/// The runtime is shut down without waiting for a timed-out stage that is still blocked
/// in the store, so the caller returns on time. That stage's cancel flag keeps it from
/// committing when it wakes.
pub fn run_stages<S>(stages: &[Stage], store: S, config: &Config, timeout: Duration) -> Result<Vec<RunSummary>>
where
    S: DataStore + Clone + Send + 'static,
{
    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        let mut summaries = Vec::with_capacity(stages.len());
        for &stage in stages {
            info!("Starting {stage:?}");
            summaries.push(run_stage(stage, store.clone(), config.clone(), timeout).await?);
        }
        Ok(summaries)
    });
    rt.shutdown_background();
    result
}
