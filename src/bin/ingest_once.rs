//! One full scrape-ingest pass.
//!
//! Sources are NDJSON fixture files (one per website, `name=website_id=path`),
//! which is how captured scrapes are replayed; live site scrapers plug in
//! through the same `ProductSource` trait from their own deployment crate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use pricewatch::alerts::{alert_delay, run_alert_notifier, LogNotifier};
use pricewatch::bus;
use pricewatch::cache::TtlCache;
use pricewatch::catalog::pg::PgCatalogStore;
use pricewatch::catalog::similarity::SimilarityConfig;
use pricewatch::metadata::SpecMapper;
use pricewatch::pipeline::{self, reconcile::ReconcileProcessor, PipelineConfig};
use pricewatch::scrape::{ndjson::NdjsonSource, ProductSource};
use pricewatch::util::db::Db;
use pricewatch::util::env::{self, env_parse};
use pricewatch::util::logging::init_tracing;

#[derive(Parser, Debug)]
#[command(about = "Run one scrape-ingest pipeline pass")]
struct Args {
    /// Source specs, one per website: `name=website_id=path.ndjson`
    #[arg(required = true)]
    sources: Vec<String>,

    /// Override INGEST_BATCH_SIZE for this run.
    #[arg(long)]
    batch_size: Option<usize>,
}

fn parse_source(spec: &str) -> Result<Box<dyn ProductSource>> {
    let mut parts = spec.splitn(3, '=');
    let (name, website_id, path) = (parts.next(), parts.next(), parts.next());
    match (name, website_id, path) {
        (Some(name), Some(website_id), Some(path)) => {
            let website_id: i64 = website_id
                .parse()
                .with_context(|| format!("bad website id in source spec {spec:?}"))?;
            Ok(Box::new(NdjsonSource::new(name, website_id, path)))
        }
        _ => anyhow::bail!("source spec {spec:?} is not name=website_id=path"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env::bootstrap_cli("ingest_once");
    init_tracing("info")?;
    let args = Args::parse();

    let db = Db::connect(&env::db_url()?, env_parse("DB_MAX_CONNECTIONS", 10u32)).await?;
    let store = Arc::new(PgCatalogStore::new(db));

    let sources: Vec<Box<dyn ProductSource>> = args
        .sources
        .iter()
        .map(|s| parse_source(s))
        .collect::<Result<_>>()?;

    let cache = Arc::new(TtlCache::new(Duration::from_secs(env_parse(
        "LISTING_CACHE_TTL_SECS",
        300u64,
    ))));
    let (events_tx, events_rx) = bus::channel();
    let notifier = tokio::spawn(run_alert_notifier(
        store.clone(),
        Arc::new(LogNotifier),
        events_rx,
        alert_delay(),
    ));

    let mut processor = ReconcileProcessor::new(
        store,
        SpecMapper::with_defaults(),
        SimilarityConfig::default(),
        cache,
        Some(events_tx),
    );
    let mut cfg = PipelineConfig::default();
    if let Some(batch_size) = args.batch_size {
        cfg.batch_size = batch_size;
    }

    let stats = pipeline::run(&sources, &mut processor, &cfg).await?;
    println!(
        "ingest complete: websites={} products={} prices={} batches_ok={} batches_failed={}",
        stats.website_ids.len(),
        stats.products_seen,
        stats.prices_recorded,
        stats.batches_ok,
        stats.batches_failed
    );

    // dropping the processor closes the event channel; the notifier drains
    // its pending run-completed event and exits
    drop(processor);
    notifier.await.context("alert notifier task")?;
    Ok(())
}
