//! Long-running scrape scheduler.
//!
//! The scrape pipeline runs isolated in a child process (it holds long-lived
//! connections; a fresh process per run cannot leak state across runs) on a
//! fixed interval with single-flight protection. An in-process successor
//! sweeps price watches afterwards as a backstop for alerts missed while the
//! child was the one holding the event channel.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use pricewatch::alerts::{notify_due_alerts, LogNotifier};
use pricewatch::catalog::pg::PgCatalogStore;
use pricewatch::jobs::{Scheduler, SubprocessSpec, Task};
use pricewatch::util::db::Db;
use pricewatch::util::env::{self, env_opt, env_parse, env_req};
use pricewatch::util::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    env::bootstrap_cli("scheduler");
    init_tracing("info")?;

    let db = Db::connect(&env::db_url()?, env_parse("DB_MAX_CONNECTIONS", 5u32)).await?;
    let store = Arc::new(PgCatalogStore::new(db));

    let ingest_bin =
        env_opt("INGEST_ONCE_BIN").unwrap_or_else(|| "target/debug/ingest_once".to_string());
    // e.g. INGEST_SOURCES="shop-a=1=fixtures/shop-a.ndjson shop-b=2=fixtures/shop-b.ndjson"
    let source_args: Vec<String> = env_req("INGEST_SOURCES")?
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let interval = Duration::from_secs(env_parse("SCRAPE_INTERVAL_SECS", 3600u64));

    let alert_sweep = Task::in_process("alert_sweep", {
        let store = store.clone();
        move || {
            let store = store.clone();
            async move {
                notify_due_alerts(store.as_ref(), &LogNotifier).await?;
                Ok(())
            }
        }
    });

    let scrape = Task::subprocess(
        "scrape_ingest",
        SubprocessSpec {
            program: ingest_bin,
            args: source_args,
            inherit_env: vec![
                "DATABASE_URL".into(),
                "RUST_LOG".into(),
                "INGEST_BATCH_SIZE".into(),
                "ALERT_DELAY_MS".into(),
            ],
        },
    )
    .every(interval)
    .then(alert_sweep);

    let scheduler = Arc::new(Scheduler::new());
    let handle = scheduler.spawn_schedule(Arc::new(scrape));
    handle.await?;
    Ok(())
}
