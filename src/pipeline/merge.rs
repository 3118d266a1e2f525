//! Fan-in of per-website scraper streams.
//!
//! Items are emitted as soon as any source yields one; no inter-source
//! ordering is promised. The merged stream completes when every source has
//! completed, and surfaces the first stream-level error (fail-fast).

use futures::stream::{select_all, BoxStream, SelectAll};

use crate::scrape::{ProductJob, ProductSource, ScrapeError};

pub type MergedStream<'a> = SelectAll<BoxStream<'a, Result<ProductJob, ScrapeError>>>;

/// Merge the lazy streams of every registered source into one.
pub fn merge_sources(sources: &[Box<dyn ProductSource>]) -> MergedStream<'_> {
    select_all(sources.iter().map(|s| s.stream()))
}
