//! Canonical catalog: entity rows and the storage contract the pipeline
//! reconciles against.
//!
//! The relational schema itself is owned elsewhere (migrations are not part
//! of this crate); this module fixes the operations the pipeline needs:
//! idempotent upserts keyed on declared unique constraints, append-only
//! price history, and the end-of-run sync/maintenance statements.

pub mod pg;
pub mod similarity;

#[cfg(test)]
pub mod mem;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// External-product upsert payload, one per scraped job. Conflict target is
/// the URL; `internal_product_id` is intentionally absent: the upsert must
/// never touch an established link.
#[derive(Debug, Clone)]
pub struct ExternalProductRow {
    pub url: String,
    pub name: String,
    pub slug: String,
    pub available: bool,
    pub category_id: i64,
    pub website_id: i64,
    pub external_manufacturer_id: i64,
    pub raw_metadata: serde_json::Value,
}

/// Append-only price observation.
#[derive(Debug, Clone)]
pub struct PriceRow {
    pub external_product_id: i64,
    pub price_minor: Option<i64>,
    pub available: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Internal product with the merged raw metadata of its external listings,
/// as input to metadata re-normalization.
#[derive(Debug, Clone)]
pub struct InternalProductMeta {
    pub id: i64,
    pub raw_metadata: serde_json::Value,
}

/// Name/category projection used by similarity detection.
#[derive(Debug, Clone)]
pub struct InternalProductName {
    pub id: i64,
    pub name: String,
    pub category_id: i64,
}

/// A suspected-duplicate pair of internal products. `product_a_id` is
/// always the smaller id so a pair has one canonical spelling.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarPair {
    pub product_a_id: i64,
    pub product_b_id: i64,
    pub score: f64,
    pub marked_different: bool,
}

impl SimilarPair {
    pub fn new(a: i64, b: i64, score: f64) -> Self {
        Self {
            product_a_id: a.min(b),
            product_b_id: a.max(b),
            score,
            marked_different: false,
        }
    }
}

/// A price watch whose threshold was crossed by the latest price.
#[derive(Debug, Clone)]
pub struct AlertTrigger {
    pub watch_id: i64,
    pub email: String,
    pub internal_product_id: i64,
    pub product_name: String,
    pub threshold_minor: i64,
    pub current_minor: i64,
}

/// The fixed storage interface the pipeline runs against. One implementation
/// talks to Postgres; tests run the same reconciliation against an
/// in-memory double.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Idempotent upsert of per-website manufacturer strings, conflict on
    /// (name, website_id). Must never overwrite an existing canonical link.
    async fn upsert_external_manufacturers(&self, pairs: &[(String, i64)]) -> Result<()>;

    /// Resolve (name, website_id) pairs to external manufacturer ids.
    async fn external_manufacturer_map(
        &self,
        pairs: &[(String, i64)],
    ) -> Result<HashMap<(String, i64), i64>>;

    /// Upsert external products keyed on URL, merging name/slug/metadata
    /// only. Returns url → id for every row in the input.
    async fn upsert_external_products(
        &self,
        rows: &[ExternalProductRow],
    ) -> Result<HashMap<String, i64>>;

    /// Append price observations; never updates or deletes.
    async fn insert_prices(&self, rows: &[PriceRow]) -> Result<()>;

    /// Refresh the latest-price materialized view consumed by read APIs.
    async fn refresh_latest_prices(&self) -> Result<()>;

    /// Create missing canonical manufacturers from still-unlinked external
    /// manufacturer names, then backfill the links. Returns rows linked.
    async fn sync_manufacturers(&self) -> Result<u64>;

    /// Create missing internal products for unlinked external products,
    /// then backfill `internal_product_id` by (name, category). Returns
    /// rows linked.
    async fn sync_products(&self) -> Result<u64>;

    async fn internal_products_for_metadata(&self) -> Result<Vec<InternalProductMeta>>;

    async fn store_parsed_metadata(&self, updates: &[(i64, serde_json::Value)]) -> Result<()>;

    async fn internal_products_by_name(&self) -> Result<Vec<InternalProductName>>;

    async fn existing_similar_pairs(&self) -> Result<Vec<SimilarPair>>;

    async fn insert_similar_pairs(&self, pairs: &[SimilarPair]) -> Result<()>;

    /// Repoint every external product of `drop_id` at `keep_id` and delete
    /// the emptied internal product.
    async fn merge_internal_products(&self, keep_id: i64, drop_id: i64) -> Result<()>;

    /// Delete similarity rows referencing internal products that no longer
    /// exist. Returns rows removed.
    async fn prune_stale_similarities(&self) -> Result<u64>;

    /// Active price watches whose product's latest price is at or below the
    /// watch threshold.
    async fn due_price_alerts(&self) -> Result<Vec<AlertTrigger>>;
}
