//! Generic category-listing walk shared by site scrapers.
//!
//! A site plugs in a [`ListingParser`] (its selector logic, out of tree) and
//! gets the standard walk: listing pages fetched in order until an empty
//! page or the page cap, one throttled request per page, page failures
//! logged and skipped without ending the run.

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::warn;

use super::fetch::ThrottledFetcher;
use super::{ProductJob, ProductSource, ScrapeError};
use crate::util::env::env_parse;

/// Site-specific parsing contract: build page URLs and extract jobs from a
/// fetched listing body.
pub trait ListingParser: Send + Sync {
    fn page_url(&self, page: u32) -> String;
    fn parse_page(&self, body: &str, page: u32) -> Result<Vec<ProductJob>, ScrapeError>;
}

pub struct PagedSource<P> {
    name: String,
    website_id: i64,
    fetcher: ThrottledFetcher,
    parser: P,
    max_pages: u32,
}

impl<P: ListingParser> PagedSource<P> {
    pub fn new(name: impl Into<String>, website_id: i64, fetcher: ThrottledFetcher, parser: P) -> Self {
        Self {
            name: name.into(),
            website_id,
            fetcher,
            parser,
            max_pages: env_parse("SCRAPE_MAX_PAGES", 500u32),
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages;
        self
    }

    /// Fetch and parse one listing page; None once the walk is over.
    /// A failed page yields an empty batch so the walk moves on.
    async fn next_page(&self, page: u32) -> Option<Vec<ProductJob>> {
        if page >= self.max_pages {
            return None;
        }
        let url = self.parser.page_url(page);
        let body = match self.fetcher.get_text(&url).await {
            Ok(body) => body,
            Err(err) => {
                warn!(source = %self.name, page, %url, error = %err, "listing page fetch failed, skipping page");
                return Some(Vec::new());
            }
        };
        match self.parser.parse_page(&body, page) {
            Ok(jobs) if jobs.is_empty() => None,
            Ok(jobs) => Some(jobs),
            Err(err) => {
                warn!(source = %self.name, page, %url, error = %err, "listing page parse failed, skipping page");
                Some(Vec::new())
            }
        }
    }
}

impl<P: ListingParser> ProductSource for PagedSource<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn website_id(&self) -> i64 {
        self.website_id
    }

    fn stream(&self) -> BoxStream<'_, Result<ProductJob, ScrapeError>> {
        futures::stream::unfold(0u32, move |page| async move {
            let jobs = self.next_page(page).await?;
            Some((futures::stream::iter(jobs.into_iter().map(Ok)), page + 1))
        })
        .flatten()
        .boxed()
    }
}
