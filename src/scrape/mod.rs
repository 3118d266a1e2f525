//! Scraper-facing types: the transient scraped record, the error taxonomy
//! and the source contract the ingest pipeline consumes.
//!
//! Site-specific selector logic lives outside this crate; a source only has
//! to produce a lazy stream of [`ProductJob`]s and keep per-item failures to
//! itself (log and skip).

pub mod fetch;
pub mod ndjson;
pub mod paged;

use std::collections::HashMap;

use futures::stream::BoxStream;
use thiserror::Error;

/// One scraped product listing, as produced by a per-website scraper.
/// Consumed exactly once by reconciliation; never persisted as-is.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ProductJob {
    pub name: String,
    /// Price in minor currency units. None when the listing hides the price
    /// (e.g. "call for price").
    pub price_minor: Option<i64>,
    pub available: bool,
    /// Canonical product URL; unique within a website and the cross-run
    /// dedup key for external products.
    pub url: String,
    pub slug: String,
    /// Free-text manufacturer string as scraped, not yet canonicalized.
    pub manufacturer_name: String,
    #[serde(default)]
    pub raw_metadata: HashMap<String, String>,
    pub category_id: i64,
    pub website_id: i64,
}

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("http {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network: {0}")]
    Net(#[from] reqwest::Error),
    #[error("malformed page: {0}")]
    Parse(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A per-website scraping unit. `stream` is lazy: no request is issued until
/// the pipeline polls it. An `Err` item is a stream-level failure and aborts
/// the whole run; per-product failures must be swallowed by the source.
pub trait ProductSource: Send + Sync {
    fn name(&self) -> &str;
    fn website_id(&self) -> i64;
    fn stream(&self) -> BoxStream<'_, Result<ProductJob, ScrapeError>>;
}

/// Lowercase-alphanumeric slug used for external product rows.
pub fn slugify(input: &str) -> String {
    let mut slug = String::new();
    let mut last_dash = false;
    for ch in input.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash && !slug.is_empty() {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

const MAX_SLUG_LEN: usize = 255;
const SLUG_CHECKSUM_HEX_LEN: usize = 8;

/// Slug that is guaranteed non-empty and within the column limit.
///
/// Names made entirely of punctuation (or non-ASCII scripts) slugify to
/// nothing; those fall back to a checksum of the URL, which is stable across
/// runs. Overlong slugs are clamped with the same checksum appended so two
/// long names that share a 255-char prefix cannot collide.
pub fn slug_or_checksum(name: &str, url: &str) -> String {
    use sha1::{Digest, Sha1};

    let checksum = {
        let mut hasher = Sha1::new();
        hasher.update(url.trim().as_bytes());
        let hex = format!("{:x}", hasher.finalize());
        hex.chars().take(SLUG_CHECKSUM_HEX_LEN).collect::<String>()
    };
    let base = slugify(name);
    if base.is_empty() {
        return format!("p-{checksum}");
    }
    if base.len() <= MAX_SLUG_LEN {
        return base;
    }
    let cut = MAX_SLUG_LEN - SLUG_CHECKSUM_HEX_LEN - 1;
    let clamped: String = base.chars().take(cut).collect();
    format!("{}-{checksum}", clamped.trim_end_matches('-'))
}
