//! Batch reconciliation: the sink at the end of the scrape pipeline.
//!
//! Per batch: upsert the batch's manufacturer strings, resolve their ids,
//! upsert external products by URL and append one price observation per
//! job. A failing batch is logged with its payload and abandoned; the
//! stream always continues; one bad batch must not halt ingestion.
//!
//! At end-of-stream the processor drains: view refresh, manufacturer and
//! product sync, metadata re-normalization, similarity detection, cache
//! invalidation and the run-completed event for the alert notifier. Steps
//! run in order (later ones depend on earlier side effects) and each is
//! caught independently.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use itertools::Itertools;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{EventSender, PipelineEvent};
use crate::cache::TtlCache;
use crate::catalog::similarity::{self, SimilarityConfig};
use crate::catalog::{CatalogStore, ExternalProductRow, PriceRow};
use crate::metadata::SpecMapper;
use crate::scrape::ProductJob;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Idle,
    Draining,
}

#[derive(Debug, Default, Clone)]
pub struct RunStats {
    pub batches_ok: u64,
    pub batches_failed: u64,
    pub products_seen: u64,
    pub prices_recorded: u64,
    pub website_ids: BTreeSet<i64>,
}

pub type ListingCache = TtlCache<String, serde_json::Value>;

pub struct ReconcileProcessor<S: CatalogStore + ?Sized> {
    store: Arc<S>,
    mapper: SpecMapper,
    similarity: SimilarityConfig,
    cache: Arc<ListingCache>,
    events: Option<EventSender>,
    state: ProcessorState,
    stats: RunStats,
    run_id: Uuid,
}

impl<S: CatalogStore + ?Sized> ReconcileProcessor<S> {
    pub fn new(
        store: Arc<S>,
        mapper: SpecMapper,
        similarity: SimilarityConfig,
        cache: Arc<ListingCache>,
        events: Option<EventSender>,
    ) -> Self {
        Self {
            store,
            mapper,
            similarity,
            cache,
            events,
            state: ProcessorState::Idle,
            stats: RunStats::default(),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> ProcessorState {
        self.state
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Reconcile one batch. Never fails upstream: errors are logged with
    /// the offending payload and the batch is dropped.
    pub async fn process_batch(&mut self, batch: Vec<ProductJob>) {
        if batch.is_empty() {
            return;
        }
        match self.try_process_batch(&batch).await {
            Ok(()) => {
                self.stats.batches_ok += 1;
                self.stats.products_seen += batch.len() as u64;
                for job in &batch {
                    self.stats.website_ids.insert(job.website_id);
                }
            }
            Err(err) => {
                self.stats.batches_failed += 1;
                let payload =
                    serde_json::to_string(&batch).unwrap_or_else(|_| "<unserializable>".into());
                error!(error = %err, batch_len = batch.len(), %payload, "batch reconciliation failed, dropping batch");
            }
        }
    }

    async fn try_process_batch(&mut self, batch: &[ProductJob]) -> Result<()> {
        // 1. manufacturer strings present in this batch, one upsert per pair
        let pairs: Vec<(String, i64)> = batch
            .iter()
            .map(|j| (j.manufacturer_name.trim().to_string(), j.website_id))
            .unique()
            .collect();
        self.store
            .upsert_external_manufacturers(&pairs)
            .await
            .context("manufacturer upsert")?;

        // 2. re-fetch to resolve ids; a hole here means the upsert merged
        // into nothing and must fail loudly
        let manufacturer_ids = self
            .store
            .external_manufacturer_map(&pairs)
            .await
            .context("manufacturer map fetch")?;

        let mut rows = Vec::with_capacity(batch.len());
        for job in batch {
            let key = (job.manufacturer_name.trim().to_string(), job.website_id);
            let em_id = *manufacturer_ids.get(&key).with_context(|| {
                format!(
                    "external manufacturer missing after upsert: {:?} @ website {}",
                    key.0, key.1
                )
            })?;
            // scrapers usually ship a slug; repair the ones that don't
            let slug = if job.slug.trim().is_empty() {
                crate::scrape::slug_or_checksum(&job.name, &job.url)
            } else {
                job.slug.clone()
            };
            rows.push(ExternalProductRow {
                url: job.url.clone(),
                name: job.name.clone(),
                slug,
                available: job.available,
                category_id: job.category_id,
                website_id: job.website_id,
                external_manufacturer_id: em_id,
                raw_metadata: raw_metadata_value(job),
            });
        }

        // 3. URL-keyed product upsert; never touches internal_product_id
        let product_ids = self
            .store
            .upsert_external_products(&rows)
            .await
            .context("external product upsert")?;

        // 4. one appended price observation per job
        let now = Utc::now();
        let mut prices = Vec::with_capacity(batch.len());
        for job in batch {
            let ep_id = *product_ids
                .get(&job.url)
                .with_context(|| format!("no external product id returned for {}", job.url))?;
            prices.push(PriceRow {
                external_product_id: ep_id,
                price_minor: job.price_minor,
                available: job.available,
                recorded_at: now,
            });
        }
        self.store
            .insert_prices(&prices)
            .await
            .context("price append")?;
        self.stats.prices_recorded += prices.len() as u64;
        Ok(())
    }

    /// End-of-stream drain. Each step is caught independently; a failure is
    /// logged and the next step still runs.
    pub async fn finalize(&mut self) -> RunStats {
        self.state = ProcessorState::Draining;

        if let Err(err) = self.store.refresh_latest_prices().await {
            warn!(error = %err, "latest price view refresh failed");
        }
        if let Err(err) = self.store.sync_manufacturers().await {
            error!(error = %err, "manufacturer sync failed");
        }
        if let Err(err) = self.store.sync_products().await {
            error!(error = %err, "product sync failed");
        }
        if let Err(err) = self.normalize_metadata().await {
            error!(error = %err, "metadata normalization failed");
        }
        if let Err(err) = similarity::detect_and_merge(self.store.as_ref(), self.similarity).await {
            error!(error = %err, "similarity detection failed");
        }
        self.cache.clear();
        self.publish_run_completed();

        info!(
            run_id = %self.run_id,
            batches_ok = self.stats.batches_ok,
            batches_failed = self.stats.batches_failed,
            products = self.stats.products_seen,
            prices = self.stats.prices_recorded,
            websites = self.stats.website_ids.len(),
            "pipeline run finalized"
        );
        self.stats.clone()
    }

    async fn normalize_metadata(&self) -> Result<()> {
        let products = self.store.internal_products_for_metadata().await?;
        let updates: Vec<(i64, serde_json::Value)> = products
            .iter()
            .map(|p| {
                let raw = p
                    .raw_metadata
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                (p.id, self.mapper.normalize(&raw).into_value())
            })
            .collect();
        self.store.store_parsed_metadata(&updates).await
    }

    fn publish_run_completed(&self) {
        let Some(events) = &self.events else {
            return;
        };
        let event = PipelineEvent::RunCompleted {
            run_id: self.run_id,
            website_ids: self.stats.website_ids.iter().copied().collect(),
            products_seen: self.stats.products_seen,
            prices_recorded: self.stats.prices_recorded,
        };
        // never block pipeline completion on a slow consumer
        if let Err(err) = events.try_send(event) {
            warn!(error = %err, "run-completed event dropped");
        }
    }
}

fn raw_metadata_value(job: &ProductJob) -> serde_json::Value {
    serde_json::Value::Object(
        job.raw_metadata
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::from(v.as_str())))
            .collect(),
    )
}
