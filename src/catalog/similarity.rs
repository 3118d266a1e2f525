//! Near-duplicate detection across internal products.
//!
//! Candidates are scored by Jaro-Winkler similarity of normalized names,
//! within one category only. Pairs at or above the auto-merge threshold
//! collapse immediately (unless an operator marked them different); the
//! rest are stored for manual review. Stale pairs referencing deleted
//! products are pruned afterwards.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use strsim::jaro_winkler;
use tracing::{info, warn};

use super::{CatalogStore, InternalProductName, SimilarPair};
use crate::util::env::env_parse;

/// Minimum score for a pair to be recorded as a duplicate candidate.
pub const MIN_SIMILARITY: f64 = 0.85;

/// Score at or above which a pair is merged without review.
pub const AUTO_MERGE_SIMILARITY: f64 = 0.97;

#[derive(Debug, Clone, Copy)]
pub struct SimilarityConfig {
    pub min_score: f64,
    pub auto_merge_score: f64,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            min_score: env_parse("SIMILARITY_MIN_SCORE", MIN_SIMILARITY),
            auto_merge_score: env_parse("SIMILARITY_AUTO_MERGE_SCORE", AUTO_MERGE_SIMILARITY),
        }
    }
}

/// Canonicalized name key used for fuzzy comparison.
///
/// Normalization keeps the digits as a separate signature so model revisions
/// ("Aspire 5" vs "Aspire 7") never merge on an otherwise identical name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductNameKey {
    normalized: String,
    numeric_sig: String,
}

impl ProductNameKey {
    pub fn new(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        let numeric_sig: String = normalized.chars().filter(|c| c.is_ascii_digit()).collect();
        Self {
            normalized,
            numeric_sig,
        }
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Whether the numeric signatures agree (both empty counts as agreement).
    pub fn numeric_compatible(&self, other: &Self) -> bool {
        self.numeric_sig == other.numeric_sig
    }

    pub fn similarity(&self, other: &Self) -> f64 {
        jaro_winkler(&self.normalized, &other.normalized)
    }
}

/// Score one pair of products; None when they cannot be duplicates.
pub fn score_pair(a: &InternalProductName, b: &InternalProductName) -> Option<f64> {
    if a.category_id != b.category_id {
        return None;
    }
    let ka = ProductNameKey::new(&a.name);
    let kb = ProductNameKey::new(&b.name);
    if ka.normalized().is_empty() || kb.normalized().is_empty() {
        return None;
    }
    if !ka.numeric_compatible(&kb) {
        return None;
    }
    Some(ka.similarity(&kb))
}

/// One full detection pass: score, auto-merge, persist candidates, prune.
pub async fn detect_and_merge<S: CatalogStore + ?Sized>(
    store: &S,
    cfg: SimilarityConfig,
) -> Result<()> {
    let products = store.internal_products_by_name().await?;
    let vetoed: HashSet<(i64, i64)> = store
        .existing_similar_pairs()
        .await?
        .into_iter()
        .filter(|p| p.marked_different)
        .map(|p| (p.product_a_id, p.product_b_id))
        .collect();

    let mut candidates: Vec<SimilarPair> = Vec::new();
    let mut merged_away: HashSet<i64> = HashSet::new();

    let mut by_category: BTreeMap<i64, Vec<&InternalProductName>> = BTreeMap::new();
    for p in &products {
        by_category.entry(p.category_id).or_default().push(p);
    }

    for group in by_category.values() {
        for i in 0..group.len() {
            for j in (i + 1)..group.len() {
                let (a, b) = (group[i], group[j]);
                if merged_away.contains(&a.id) || merged_away.contains(&b.id) {
                    continue;
                }
                let Some(score) = score_pair(a, b) else {
                    continue;
                };
                if score < cfg.min_score {
                    continue;
                }
                let pair = SimilarPair::new(a.id, b.id, score);
                if vetoed.contains(&(pair.product_a_id, pair.product_b_id)) {
                    continue;
                }
                if score >= cfg.auto_merge_score {
                    let (keep, drop) = (pair.product_a_id, pair.product_b_id);
                    info!(keep, drop, score, "auto-merging near-identical products");
                    if let Err(err) = store.merge_internal_products(keep, drop).await {
                        warn!(keep, drop, error = %err, "auto-merge failed, keeping as candidate");
                        candidates.push(pair);
                    } else {
                        merged_away.insert(drop);
                    }
                } else {
                    candidates.push(pair);
                }
            }
        }
    }

    store.insert_similar_pairs(&candidates).await?;
    let pruned = store.prune_stale_similarities().await?;
    info!(
        candidates = candidates.len(),
        merged = merged_away.len(),
        pruned,
        "similarity pass complete"
    );
    Ok(())
}
