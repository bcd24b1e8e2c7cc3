//! Third-party spot-price aggregator client: a CoinGecko-shaped
//! `/simple/price` endpoint, treated as a soft dependency — a failed
//! fetch keeps serving the last good value rather than erroring out.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::warn;

use super::get_with_retry;

#[derive(Debug, Clone, Copy)]
pub struct AggregatorPrice {
    pub usd: f64,
    pub last_updated_at: i64,
    pub fetched_at_ms: i64,
}

#[derive(Deserialize)]
struct CoinEntry {
    usd: f64,
    last_updated_at: i64,
}

pub struct AggregatorFeed {
    client: reqwest::Client,
    base_url: String,
    api_key_header: Option<(String, String)>,
    cache: RwLock<HashMap<String, AggregatorPrice>>,
}

impl AggregatorFeed {
    pub fn new(base_url: impl Into<String>, api_key_header: Option<(String, String)>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key_header,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch `coin_id`'s USD price. On a non-200 or transport failure
    /// the cached value (if any) is returned and the failure is logged
    /// rather than propagated.
    pub async fn fetch(&self, coin_id: &str) -> Option<AggregatorPrice> {
        match self.fetch_fresh(coin_id).await {
            Ok(price) => {
                self.cache.write().insert(coin_id.to_string(), price);
                Some(price)
            }
            Err(e) => {
                warn!(coin_id, error = %e, "aggregator fetch failed, serving cached value");
                self.cached(coin_id)
            }
        }
    }

    async fn fetch_fresh(&self, coin_id: &str) -> anyhow::Result<AggregatorPrice> {
        let url = format!("{}/simple/price", self.base_url);
        let params = [
            ("ids", coin_id.to_string()),
            ("vs_currencies", "usd".to_string()),
            ("include_last_updated_at", "true".to_string()),
            ("precision", "full".to_string()),
        ];
        let mut request = self.client.get(&url).query(&params);
        if let Some((name, value)) = &self.api_key_header {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            anyhow::bail!("aggregator returned {}", response.status());
        }
        let body: HashMap<String, CoinEntry> = response.json().await?;
        let entry = body
            .get(coin_id)
            .ok_or_else(|| anyhow::anyhow!("coin id {coin_id} missing from aggregator response"))?;
        Ok(AggregatorPrice {
            usd: entry.usd,
            last_updated_at: entry.last_updated_at,
            fetched_at_ms: Utc::now().timestamp_millis(),
        })
    }

    pub fn cached(&self, coin_id: &str) -> Option<AggregatorPrice> {
        self.cache.read().get(coin_id).copied()
    }

    /// Milliseconds since the cached value was last refreshed
    /// successfully; `None` if nothing has ever been cached.
    pub fn staleness_ms(&self, coin_id: &str, now_ms: i64) -> Option<i64> {
        self.cached(coin_id).map(|p| (now_ms - p.fetched_at_ms).max(0))
    }
}
