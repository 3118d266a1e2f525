//! pricewatch: scrape-ingest pipeline for cross-site product price
//! tracking. Scraper outputs are merged, batched, deduplicated by URL and
//! reconciled into a canonical Postgres catalog with append-only price
//! history; see `pipeline::run` for the end-to-end pass.

pub mod alerts;
pub mod bus;
pub mod cache;
pub mod catalog;
pub mod jobs;
pub mod metadata;
pub mod pipeline;
pub mod scrape;

pub mod util {
    pub mod db;
    pub mod env;
    pub mod logging;
}
