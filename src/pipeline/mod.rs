//! The scrape-ingest pipeline: merge → batch → dedupe → reconcile.
//!
//! One stage pulls from the previous one, so a slow reconciliation pass
//! naturally backpressures the scrapers; nothing buffers beyond the batch
//! being assembled. Batches are reconciled strictly one at a time in
//! arrival order.

pub mod batch;
pub mod dedupe;
pub mod merge;
pub mod reconcile;

use anyhow::{Context, Result};
use futures::StreamExt;

use crate::catalog::CatalogStore;
use crate::scrape::{ProductJob, ProductSource};
use crate::util::env::env_parse;
use dedupe::RunDedup;
use reconcile::{ReconcileProcessor, RunStats};

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: env_parse("INGEST_BATCH_SIZE", 100usize),
        }
    }
}

/// Run one complete pipeline pass over the given sources.
///
/// A stream-level scrape failure aborts the run with an error (the job
/// layer marks the job failed); reconciliation failures never do.
pub async fn run<S: CatalogStore + ?Sized>(
    sources: &[Box<dyn ProductSource>],
    processor: &mut ReconcileProcessor<S>,
    cfg: &PipelineConfig,
) -> Result<RunStats> {
    let merged = merge::merge_sources(sources);
    let batched = batch::batches(merged, cfg.batch_size);
    futures::pin_mut!(batched);

    let mut dedup = RunDedup::new(|job: &ProductJob| job.url.clone());
    while let Some(next) = batched.next().await {
        let batch = next
            .map_err(anyhow::Error::from)
            .context("scrape stream failed")?;
        let fresh = dedup.filter_batch(batch);
        if fresh.is_empty() {
            continue;
        }
        processor.process_batch(fresh).await;
    }
    Ok(processor.finalize().await)
}
