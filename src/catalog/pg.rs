//! Postgres-backed catalog store.
//!
//! All writes go through multi-row `INSERT ... ON CONFLICT` statements so a
//! rerun over the same scrape output merges instead of duplicating. The
//! schema (tables, unique constraints, the `latest_prices` materialized
//! view) is owned by the surrounding deployment; this module only assumes
//! the declared conflict targets exist.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row};
use tracing::{instrument, warn};

use super::{
    AlertTrigger, CatalogStore, ExternalProductRow, InternalProductMeta, InternalProductName,
    PriceRow, SimilarPair,
};
use crate::util::db::Db;

#[derive(Clone)]
pub struct PgCatalogStore {
    db: Db,
}

impl PgCatalogStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CatalogStore for PgCatalogStore {
    #[instrument(skip(self, pairs), fields(pairs = pairs.len()))]
    async fn upsert_external_manufacturers(&self, pairs: &[(String, i64)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> =
            QueryBuilder::new("INSERT INTO external_manufacturers (name, website_id) ");
        qb.push_values(pairs, |mut b, (name, website_id)| {
            b.push_bind(name).push_bind(website_id);
        });
        // no-op merge keeps the statement idempotent without ever touching
        // an established manufacturer_id link
        qb.push(" ON CONFLICT (name, website_id) DO UPDATE SET name = EXCLUDED.name");
        qb.build().persistent(false).execute(&self.db.pool).await?;
        Ok(())
    }

    async fn external_manufacturer_map(
        &self,
        pairs: &[(String, i64)],
    ) -> Result<HashMap<(String, i64), i64>> {
        if pairs.is_empty() {
            return Ok(HashMap::new());
        }
        let names: Vec<String> = pairs.iter().map(|(n, _)| n.clone()).collect();
        let website_ids: Vec<i64> = pairs.iter().map(|(_, w)| *w).collect();
        let rows = sqlx::query(
            "SELECT id, name, website_id FROM external_manufacturers
             WHERE name = ANY($1) AND website_id = ANY($2)",
        )
        .persistent(false)
        .bind(&names)
        .bind(&website_ids)
        .fetch_all(&self.db.pool)
        .await?;
        let mut map = HashMap::with_capacity(rows.len());
        for r in rows {
            map.insert(
                (r.get::<String, _>("name"), r.get::<i64, _>("website_id")),
                r.get::<i64, _>("id"),
            );
        }
        Ok(map)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn upsert_external_products(
        &self,
        rows: &[ExternalProductRow],
    ) -> Result<HashMap<String, i64>> {
        if rows.is_empty() {
            return Ok(HashMap::new());
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO external_products
             (url, name, slug, available, category_id, website_id, external_manufacturer_id, raw_metadata, updated_at) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(&r.url)
                .push_bind(&r.name)
                .push_bind(&r.slug)
                .push_bind(r.available)
                .push_bind(r.category_id)
                .push_bind(r.website_id)
                .push_bind(r.external_manufacturer_id)
                .push_bind(&r.raw_metadata)
                .push("now()");
        });
        // merge listing fields only; internal_product_id is deliberately
        // not in the update list so an established link survives reruns
        qb.push(
            " ON CONFLICT (url) DO UPDATE SET
                name = EXCLUDED.name,
                slug = EXCLUDED.slug,
                available = EXCLUDED.available,
                external_manufacturer_id = EXCLUDED.external_manufacturer_id,
                raw_metadata = EXCLUDED.raw_metadata,
                updated_at = now()
              RETURNING id, url",
        );
        let returned = qb
            .build()
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?;
        let mut map = HashMap::with_capacity(returned.len());
        for r in returned {
            map.insert(r.get::<String, _>("url"), r.get::<i64, _>("id"));
        }
        Ok(map)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_prices(&self, rows: &[PriceRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO prices (external_product_id, price_minor, available, recorded_at) ",
        );
        qb.push_values(rows, |mut b, r| {
            b.push_bind(r.external_product_id)
                .push_bind(r.price_minor)
                .push_bind(r.available)
                .push_bind(r.recorded_at);
        });
        qb.build().persistent(false).execute(&self.db.pool).await?;
        Ok(())
    }

    async fn refresh_latest_prices(&self) -> Result<()> {
        // Concurrent refresh keeps readers unblocked; fall back to a plain
        // refresh when the unique index it needs is missing.
        if let Err(err) = sqlx::raw_sql("REFRESH MATERIALIZED VIEW CONCURRENTLY latest_prices")
            .execute(&self.db.pool)
            .await
        {
            warn!(error = %err, "concurrent latest_prices refresh failed, retrying plain");
            sqlx::raw_sql("REFRESH MATERIALIZED VIEW latest_prices")
                .execute(&self.db.pool)
                .await?;
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn sync_manufacturers(&self) -> Result<u64> {
        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "INSERT INTO manufacturers (name)
             SELECT DISTINCT lower(trim(em.name))
             FROM external_manufacturers em
             WHERE em.manufacturer_id IS NULL
             ON CONFLICT (name) DO NOTHING",
        )
        .persistent(false)
        .execute(&mut *tx)
        .await?;
        let linked = sqlx::query(
            "UPDATE external_manufacturers em
             SET manufacturer_id = m.id
             FROM manufacturers m
             WHERE em.manufacturer_id IS NULL
               AND m.name = lower(trim(em.name))",
        )
        .persistent(false)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(linked)
    }

    #[instrument(skip(self))]
    async fn sync_products(&self) -> Result<u64> {
        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "INSERT INTO internal_products (name, category_id, manufacturer_id)
             SELECT DISTINCT ep.name, ep.category_id, em.manufacturer_id
             FROM external_products ep
             JOIN external_manufacturers em ON em.id = ep.external_manufacturer_id
             WHERE ep.internal_product_id IS NULL
             ON CONFLICT (name, category_id) DO NOTHING",
        )
        .persistent(false)
        .execute(&mut *tx)
        .await?;
        let linked = sqlx::query(
            "UPDATE external_products ep
             SET internal_product_id = ip.id
             FROM internal_products ip
             WHERE ep.internal_product_id IS NULL
               AND ip.name = ep.name
               AND ip.category_id = ep.category_id",
        )
        .persistent(false)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok(linked)
    }

    async fn internal_products_for_metadata(&self) -> Result<Vec<InternalProductMeta>> {
        let rows = sqlx::query(
            "SELECT ep.internal_product_id AS id, ep.raw_metadata
             FROM external_products ep
             WHERE ep.internal_product_id IS NOT NULL
             ORDER BY ep.internal_product_id, ep.id",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await?;
        // Merge the raw maps of all listings of one product; later listings
        // win on key collisions (deterministic via the ORDER BY above).
        let mut merged: HashMap<i64, serde_json::Map<String, serde_json::Value>> = HashMap::new();
        let mut order: Vec<i64> = Vec::new();
        for r in rows {
            let id: i64 = r.get("id");
            let raw: serde_json::Value = r.get("raw_metadata");
            let entry = merged.entry(id).or_insert_with(|| {
                order.push(id);
                serde_json::Map::new()
            });
            if let serde_json::Value::Object(map) = raw {
                entry.extend(map);
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
        if updates.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "UPDATE internal_products AS ip SET parsed_metadata = v.meta FROM (VALUES ",
        );
        for (i, (id, meta)) in updates.iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push("(")
                .push_bind(id)
                .push("::bigint, ")
                .push_bind(meta)
                .push("::jsonb)");
        }
        qb.push(") AS v(id, meta) WHERE ip.id = v.id");
        qb.build().persistent(false).execute(&self.db.pool).await?;
        Ok(())
    }

    async fn internal_products_by_name(&self) -> Result<Vec<InternalProductName>> {
        let rows = sqlx::query("SELECT id, name, category_id FROM internal_products")
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| InternalProductName {
                id: r.get("id"),
                name: r.get("name"),
                category_id: r.get("category_id"),
            })
            .collect())
    }

    async fn existing_similar_pairs(&self) -> Result<Vec<SimilarPair>> {
        let rows = sqlx::query(
            "SELECT internal_product_a_id, internal_product_b_id, score, marked_different
             FROM similar_internal_products",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| SimilarPair {
                product_a_id: r.get("internal_product_a_id"),
                product_b_id: r.get("internal_product_b_id"),
                score: r.get("score"),
                marked_different: r.get("marked_different"),
            })
            .collect())
    }

    async fn insert_similar_pairs(&self, pairs: &[SimilarPair]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<'_, sqlx::Postgres> = QueryBuilder::new(
            "INSERT INTO similar_internal_products
             (internal_product_a_id, internal_product_b_id, score) ",
        );
        qb.push_values(pairs, |mut b, p| {
            b.push_bind(p.product_a_id)
                .push_bind(p.product_b_id)
                .push_bind(p.score);
        });
        // refresh the score but leave the manual marked_different verdict alone
        qb.push(
            " ON CONFLICT (internal_product_a_id, internal_product_b_id)
              DO UPDATE SET score = EXCLUDED.score",
        );
        qb.build().persistent(false).execute(&self.db.pool).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn merge_internal_products(&self, keep_id: i64, drop_id: i64) -> Result<()> {
        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "UPDATE external_products SET internal_product_id = $1 WHERE internal_product_id = $2",
        )
        .persistent(false)
        .bind(keep_id)
        .bind(drop_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE price_watches SET internal_product_id = $1 WHERE internal_product_id = $2",
        )
        .persistent(false)
        .bind(keep_id)
        .bind(drop_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM internal_products WHERE id = $1")
            .persistent(false)
            .bind(drop_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn prune_stale_similarities(&self) -> Result<u64> {
        let removed = sqlx::query(
            "DELETE FROM similar_internal_products s
             WHERE NOT EXISTS (SELECT 1 FROM internal_products ip WHERE ip.id = s.internal_product_a_id)
                OR NOT EXISTS (SELECT 1 FROM internal_products ip WHERE ip.id = s.internal_product_b_id)",
        )
        .persistent(false)
        .execute(&self.db.pool)
        .await?
        .rows_affected();
        Ok(removed)
    }

    async fn due_price_alerts(&self) -> Result<Vec<AlertTrigger>> {
        let rows = sqlx::query(
            "SELECT w.id AS watch_id, w.email, w.internal_product_id, ip.name AS product_name,
                    w.threshold_minor, lp.price_minor AS current_minor
             FROM price_watches w
             JOIN internal_products ip ON ip.id = w.internal_product_id
             JOIN LATERAL (
                 SELECT l.price_minor
                 FROM latest_prices l
                 JOIN external_products ep ON ep.id = l.external_product_id
                 WHERE ep.internal_product_id = w.internal_product_id
                   AND l.price_minor IS NOT NULL
                 ORDER BY l.price_minor ASC
                 LIMIT 1
             ) lp ON TRUE
             WHERE w.active = TRUE AND lp.price_minor <= w.threshold_minor",
        )
        .persistent(false)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| AlertTrigger {
                watch_id: r.get("watch_id"),
                email: r.get("email"),
                internal_product_id: r.get("internal_product_id"),
                product_name: r.get("product_name"),
                threshold_minor: r.get("threshold_minor"),
                current_minor: r.get("current_minor"),
            })
            .collect())
    }
}
