//! In-memory catalog double for tests.
//!
//! Mirrors the conflict-target semantics of the Postgres store closely
//! enough to exercise reconciliation end-to-end: URL-keyed product upserts
//! that never touch an established internal link, (name, website) keyed
//! manufacturer upserts, append-only prices, and the two-statement syncs.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{
    AlertTrigger, CatalogStore, ExternalProductRow, InternalProductMeta, InternalProductName,
    PriceRow, SimilarPair,
};

#[derive(Debug, Clone)]
pub struct MemExternalManufacturer {
    pub id: i64,
    pub name: String,
    pub website_id: i64,
    pub manufacturer_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MemManufacturer {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MemExternalProduct {
    pub id: i64,
    pub row: ExternalProductRow,
    pub internal_product_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct MemInternalProduct {
    pub id: i64,
    pub name: String,
    pub category_id: i64,
    pub manufacturer_id: Option<i64>,
    pub parsed_metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct MemWatch {
    pub id: i64,
    pub email: String,
    pub internal_product_id: i64,
    pub threshold_minor: i64,
    pub active: bool,
}

#[derive(Default)]
struct MemState {
    next_id: i64,
    external_manufacturers: Vec<MemExternalManufacturer>,
    manufacturers: Vec<MemManufacturer>,
    external_products: Vec<MemExternalProduct>,
    internal_products: Vec<MemInternalProduct>,
    prices: Vec<PriceRow>,
    similar: Vec<SimilarPair>,
    watches: Vec<MemWatch>,
    latest_price_refreshes: u64,
}

impl MemState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemCatalogStore {
    state: Mutex<MemState>,
}

impl MemCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn external_product_count(&self) -> usize {
        self.state.lock().await.external_products.len()
    }

    pub async fn price_count(&self) -> usize {
        self.state.lock().await.prices.len()
    }

    pub async fn external_manufacturers(&self) -> Vec<MemExternalManufacturer> {
        self.state.lock().await.external_manufacturers.clone()
    }

    pub async fn external_products(&self) -> Vec<MemExternalProduct> {
        self.state.lock().await.external_products.clone()
    }

    pub async fn internal_products(&self) -> Vec<MemInternalProduct> {
        self.state.lock().await.internal_products.clone()
    }

    pub async fn similar_pairs(&self) -> Vec<SimilarPair> {
        self.state.lock().await.similar.clone()
    }

    pub async fn latest_price_refreshes(&self) -> u64 {
        self.state.lock().await.latest_price_refreshes
    }

    pub async fn add_watch(&self, email: &str, internal_product_id: i64, threshold_minor: i64) {
        let mut st = self.state.lock().await;
        let id = st.next_id();
        st.watches.push(MemWatch {
            id,
            email: email.to_string(),
            internal_product_id,
            threshold_minor,
            active: true,
        });
    }

    /// Pin an internal link directly, as an admin remap would.
    pub async fn link_external_product(&self, url: &str, internal_product_id: i64) {
        let mut st = self.state.lock().await;
        if let Some(ep) = st.external_products.iter_mut().find(|p| p.row.url == url) {
            ep.internal_product_id = Some(internal_product_id);
        }
    }

    pub async fn mark_pair_different(&self, a: i64, b: i64) {
        let mut st = self.state.lock().await;
        let (a, b) = (a.min(b), a.max(b));
        match st
            .similar
            .iter()
            .position(|p| p.product_a_id == a && p.product_b_id == b)
        {
            Some(idx) => st.similar[idx].marked_different = true,
            None => st.similar.push(SimilarPair {
                product_a_id: a,
                product_b_id: b,
                score: 1.0,
                marked_different: true,
            }),
        }
    }
}

#[async_trait]
impl CatalogStore for MemCatalogStore {
    async fn upsert_external_manufacturers(&self, pairs: &[(String, i64)]) -> Result<()> {
        let mut st = self.state.lock().await;
        for (name, website_id) in pairs {
            let exists = st
                .external_manufacturers
                .iter()
                .any(|m| m.name == *name && m.website_id == *website_id);
            if !exists {
                let id = st.next_id();
                st.external_manufacturers.push(MemExternalManufacturer {
                    id,
                    name: name.clone(),
                    website_id: *website_id,
                    manufacturer_id: None,
                });
            }
        }
        Ok(())
    }

    async fn external_manufacturer_map(
        &self,
        pairs: &[(String, i64)],
    ) -> Result<HashMap<(String, i64), i64>> {
        let st = self.state.lock().await;
        let mut map = HashMap::new();
        for (name, website_id) in pairs {
            if let Some(m) = st
                .external_manufacturers
                .iter()
                .find(|m| m.name == *name && m.website_id == *website_id)
            {
                map.insert((name.clone(), *website_id), m.id);
            }
        }
        Ok(map)
    }

    async fn upsert_external_products(
        &self,
        rows: &[ExternalProductRow],
    ) -> Result<HashMap<String, i64>> {
        let mut st = self.state.lock().await;
        let mut map = HashMap::new();
        for row in rows {
            match st
                .external_products
                .iter()
                .position(|p| p.row.url == row.url)
            {
                Some(idx) => {
                    // merge listing fields; internal_product_id stays untouched
                    let existing = &mut st.external_products[idx];
                    existing.row.name = row.name.clone();
                    existing.row.slug = row.slug.clone();
                    existing.row.available = row.available;
                    existing.row.external_manufacturer_id = row.external_manufacturer_id;
                    existing.row.raw_metadata = row.raw_metadata.clone();
                    map.insert(row.url.clone(), existing.id);
                }
                None => {
                    let id = st.next_id();
                    st.external_products.push(MemExternalProduct {
                        id,
                        row: row.clone(),
                        internal_product_id: None,
                    });
                    map.insert(row.url.clone(), id);
                }
            }
        }
        Ok(map)
    }

    async fn insert_prices(&self, rows: &[PriceRow]) -> Result<()> {
        let mut st = self.state.lock().await;
        st.prices.extend(rows.iter().cloned());
        Ok(())
    }

    async fn refresh_latest_prices(&self) -> Result<()> {
        self.state.lock().await.latest_price_refreshes += 1;
        Ok(())
    }

    async fn sync_manufacturers(&self) -> Result<u64> {
        let mut st = self.state.lock().await;
        let unlinked: Vec<String> = st
            .external_manufacturers
            .iter()
            .filter(|m| m.manufacturer_id.is_none())
            .map(|m| m.name.trim().to_lowercase())
            .collect();
        for name in unlinked {
            if !st.manufacturers.iter().any(|m| m.name == name) {
                let id = st.next_id();
                st.manufacturers.push(MemManufacturer { id, name });
            }
        }
        let canonical: HashMap<String, i64> = st
            .manufacturers
            .iter()
            .map(|m| (m.name.clone(), m.id))
            .collect();
        let mut linked = 0u64;
        for em in &mut st.external_manufacturers {
            if em.manufacturer_id.is_none() {
                if let Some(id) = canonical.get(&em.name.trim().to_lowercase()) {
                    em.manufacturer_id = Some(*id);
                    linked += 1;
                }
            }
        }
        Ok(linked)
    }

    async fn sync_products(&self) -> Result<u64> {
        let mut st = self.state.lock().await;
        let manufacturer_of: HashMap<i64, Option<i64>> = st
            .external_manufacturers
            .iter()
            .map(|m| (m.id, m.manufacturer_id))
            .collect();
        let missing: Vec<(String, i64, Option<i64>)> = st
            .external_products
            .iter()
            .filter(|p| p.internal_product_id.is_none())
            .map(|p| {
                (
                    p.row.name.clone(),
                    p.row.category_id,
                    manufacturer_of
                        .get(&p.row.external_manufacturer_id)
                        .copied()
                        .flatten(),
                )
            })
            .collect();
        for (name, category_id, manufacturer_id) in missing {
            let exists = st
                .internal_products
                .iter()
                .any(|ip| ip.name == name && ip.category_id == category_id);
            if !exists {
                let id = st.next_id();
                st.internal_products.push(MemInternalProduct {
                    id,
                    name,
                    category_id,
                    manufacturer_id,
                    parsed_metadata: serde_json::Value::Null,
                });
            }
        }
        let by_key: HashMap<(String, i64), i64> = st
            .internal_products
            .iter()
            .map(|ip| ((ip.name.clone(), ip.category_id), ip.id))
            .collect();
        let mut linked = 0u64;
        for ep in &mut st.external_products {
            if ep.internal_product_id.is_none() {
                if let Some(id) = by_key.get(&(ep.row.name.clone(), ep.row.category_id)) {
                    ep.internal_product_id = Some(*id);
                    linked += 1;
                }
            }
        }
        Ok(linked)
    }

    async fn internal_products_for_metadata(&self) -> Result<Vec<InternalProductMeta>> {
        let st = self.state.lock().await;
        let mut merged: HashMap<i64, serde_json::Map<String, serde_json::Value>> = HashMap::new();
        let mut order = Vec::new();
        for ep in &st.external_products {
            let Some(id) = ep.internal_product_id else {
                continue;
            };
            let entry = merged.entry(id).or_insert_with(|| {
                order.push(id);
                serde_json::Map::new()
            });
            if let serde_json::Value::Object(map) = &ep.row.raw_metadata {
                entry.extend(map.clone());
            }
        }
        Ok(order
            .into_iter()
            .map(|id| InternalProductMeta {
                id,
                raw_metadata: serde_json::Value::Object(merged.remove(&id).unwrap_or_default()),
            })
            .collect())
    }

    async fn store_parsed_metadata(&self, updates: &[(i64, serde_json::Value)]) -> Result<()> {
        let mut st = self.state.lock().await;
        for (id, meta) in updates {
            if let Some(ip) = st.internal_products.iter_mut().find(|ip| ip.id == *id) {
                ip.parsed_metadata = meta.clone();
            }
        }
        Ok(())
    }

    async fn internal_products_by_name(&self) -> Result<Vec<InternalProductName>> {
        let st = self.state.lock().await;
        Ok(st
            .internal_products
            .iter()
            .map(|ip| InternalProductName {
                id: ip.id,
                name: ip.name.clone(),
                category_id: ip.category_id,
            })
            .collect())
    }

    async fn existing_similar_pairs(&self) -> Result<Vec<SimilarPair>> {
        Ok(self.state.lock().await.similar.clone())
    }

    async fn insert_similar_pairs(&self, pairs: &[SimilarPair]) -> Result<()> {
        let mut st = self.state.lock().await;
        for pair in pairs {
            match st.similar.iter().position(|p| {
                p.product_a_id == pair.product_a_id && p.product_b_id == pair.product_b_id
            }) {
                Some(idx) => st.similar[idx].score = pair.score,
                None => st.similar.push(pair.clone()),
            }
        }
        Ok(())
    }

    async fn merge_internal_products(&self, keep_id: i64, drop_id: i64) -> Result<()> {
        let mut st = self.state.lock().await;
        for ep in &mut st.external_products {
            if ep.internal_product_id == Some(drop_id) {
                ep.internal_product_id = Some(keep_id);
            }
        }
        for w in &mut st.watches {
            if w.internal_product_id == drop_id {
                w.internal_product_id = keep_id;
            }
        }
        st.internal_products.retain(|ip| ip.id != drop_id);
        Ok(())
    }

    async fn prune_stale_similarities(&self) -> Result<u64> {
        let mut st = self.state.lock().await;
        let live: Vec<i64> = st.internal_products.iter().map(|ip| ip.id).collect();
        let before = st.similar.len();
        st.similar
            .retain(|p| live.contains(&p.product_a_id) && live.contains(&p.product_b_id));
        Ok((before - st.similar.len()) as u64)
    }

    async fn due_price_alerts(&self) -> Result<Vec<AlertTrigger>> {
        let st = self.state.lock().await;
        let mut out = Vec::new();
        for w in st.watches.iter().filter(|w| w.active) {
            let Some(product) = st
                .internal_products
                .iter()
                .find(|ip| ip.id == w.internal_product_id)
            else {
                continue;
            };
            // cheapest latest observation across the product's listings
            let mut current: Option<i64> = None;
            for ep in st
                .external_products
                .iter()
                .filter(|ep| ep.internal_product_id == Some(w.internal_product_id))
            {
                let latest = st
                    .prices
                    .iter()
                    .filter(|p| p.external_product_id == ep.id && p.price_minor.is_some())
                    .max_by_key(|p| p.recorded_at);
                if let Some(p) = latest.and_then(|p| p.price_minor) {
                    current = Some(current.map_or(p, |c: i64| c.min(p)));
                }
            }
            if let Some(current_minor) = current {
                if current_minor <= w.threshold_minor {
                    out.push(AlertTrigger {
                        watch_id: w.id,
                        email: w.email.clone(),
                        internal_product_id: w.internal_product_id,
                        product_name: product.name.clone(),
                        threshold_minor: w.threshold_minor,
                        current_minor,
                    });
                }
            }
        }
        Ok(out)
    }
}
