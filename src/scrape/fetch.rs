//! Shared throttled HTTP fetcher for scrapers.
//!
//! Every source site gets its own token bucket so one slow or strict site
//! never starves the others; this is the only explicit concurrency cap in
//! the system.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use reqwest::Client;
use tracing::warn;

use super::ScrapeError;
use crate::util::env::env_parse;

#[derive(Clone, Debug)]
pub struct FetchConfig {
    /// Outbound requests per second against one website.
    pub rps: u32,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            rps: env_parse("SCRAPE_RPS", 3u32),
            retry_attempts: env_parse("SCRAPE_MAX_RETRIES", 3u32),
            retry_base_delay_ms: env_parse("SCRAPE_BACKOFF_MS", 300u64),
            user_agent: env_parse(
                "SCRAPE_USER_AGENT",
                format!("pricewatch/{}", env!("CARGO_PKG_VERSION")),
            ),
        }
    }
}

/// Rate-limited HTTP client with bounded retry. Cheap to clone.
#[derive(Clone)]
pub struct ThrottledFetcher {
    http: Client,
    cfg: FetchConfig,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl ThrottledFetcher {
    pub fn new(cfg: FetchConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(cfg.rps.max(1)).unwrap());
        let http = Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client");
        Self {
            http,
            cfg,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    /// Fetch a page body as text, waiting for a token first. Transient
    /// failures (network errors, 429, 5xx) are retried with exponential
    /// backoff and jitter; anything else surfaces immediately.
    pub async fn get_text(&self, url: &str) -> Result<String, ScrapeError> {
        let mut attempt = 0u32;
        loop {
            self.limiter.until_ready().await;
            match self.try_get_text(url).await {
                Ok(body) => return Ok(body),
                Err(err) if attempt + 1 < self.cfg.retry_attempts && is_transient(&err) => {
                    let backoff = self.backoff_delay(attempt);
                    warn!(%url, attempt, error = %err, backoff_ms = backoff.as_millis() as u64, "transient fetch failure, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fetch and decode a JSON document.
    pub async fn get_json(&self, url: &str) -> Result<serde_json::Value, ScrapeError> {
        let body = self.get_text(url).await?;
        serde_json::from_str(&body).map_err(|e| ScrapeError::Parse(format!("{url}: {e}")))
    }

    async fn try_get_text(&self, url: &str) -> Result<String, ScrapeError> {
        let resp = self.http.get(url).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ScrapeError::Http {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }
        Ok(body)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.cfg.retry_base_delay_ms << attempt.min(6);
        let jitter = rand::thread_rng().gen_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}

fn is_transient(err: &ScrapeError) -> bool {
    match err {
        ScrapeError::Net(_) => true,
        ScrapeError::Http { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}
