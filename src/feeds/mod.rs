//! Price Feeds: the composite spot price the probability model reads,
//! the third-party aggregator used as a cross-check, and the on-chain
//! oracle used for settlement-lag detection. Shares a rate limiter and
//! a retry-with-backoff HTTP helper across all three.

mod aggregator;
mod composite;
mod oracle;

pub use aggregator::AggregatorFeed;
pub use composite::{CompositeFeed, PricePoint};
pub use oracle::{OracleFeed, OracleLagAnalysis};

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::StatusCode;
use tokio::time::{sleep, timeout};
use tracing::warn;

const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;

/// Simple fixed-window rate limiter, shared by every REST-polling feed.
pub(crate) struct RateLimiter {
    requests_per_window: u32,
    current: u32,
    window: Duration,
    window_start: std::time::Instant,
}

impl RateLimiter {
    pub(crate) fn new(requests_per_window: u32, window: Duration) -> Self {
        Self {
            requests_per_window,
            current: 0,
            window,
            window_start: std::time::Instant::now(),
        }
    }

    pub(crate) async fn acquire(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= self.window {
            self.current = 0;
            self.window_start = std::time::Instant::now();
        }
        if self.current >= self.requests_per_window {
            let wait = self.window.saturating_sub(elapsed);
            if !wait.is_zero() {
                sleep(wait).await;
                self.current = 0;
                self.window_start = std::time::Instant::now();
            }
        }
        self.current += 1;
    }
}

/// GET with bounded retries and exponential-ish backoff on 429/transport
/// errors; a non-2xx, non-429 response is a hard failure.
pub(crate) async fn get_with_retry(
    client: &reqwest::Client,
    url: &str,
    params: &[(&str, String)],
) -> Result<reqwest::Response> {
    let mut backoff_ms = INITIAL_BACKOFF_MS;
    let mut last_err = None;

    for attempt in 0..MAX_RETRIES {
        let request = client.get(url).query(params);
        match timeout(Duration::from_secs(10), request.send()).await {
            Ok(Ok(response)) => {
                if response.status().is_success() {
                    return Ok(response);
                } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
                    warn!(attempt = attempt + 1, "rate limited, backing off");
                    sleep(Duration::from_millis(backoff_ms * 10)).await;
                    backoff_ms *= 2;
                } else {
                    let status = response.status();
                    let text = response.text().await.unwrap_or_default();
                    bail!("feed request failed: {status}: {text}");
                }
            }
            Ok(Err(e)) => {
                last_err = Some(e.into());
                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
            }
            Err(_) => {
                last_err = Some(anyhow::anyhow!("request to {url} timed out"));
                sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("exhausted retries for {url}")))
        .context("get_with_retry")
}
