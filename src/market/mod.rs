//! Market tickers served through the TTL cache.
//!
//! [`TickerFeed`] pulls the current ticker list from an upstream price API;
//! [`TickerService`] answers `GET /api/tickers` from a [`TtlCache`] so a burst
//! of page loads costs at most one upstream call per TTL window.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::TtlCache;
use crate::http::{Response, StatusCode};
use crate::proxy::ErrorBody;

/// Route the ticker list is served on.
pub const TICKERS_PATH: &str = "/api/tickers";

/// Upper bound on a single feed request. Keeps a hung upstream from pinning
/// the cache's in-flight fetch forever.
pub const DEFAULT_FEED_TIMEOUT: Duration = Duration::from_secs(10);

/// One row of market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub price: f64,
    /// Fractional 24h change, e.g. `0.01` for +1%.
    #[serde(rename = "change24h", default, skip_serializing_if = "Option::is_none")]
    pub change_24h: Option<f64>,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to build ticker feed client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("ticker feed request failed: {0}")]
    Request(#[source] reqwest::Error),

    #[error("ticker feed answered {status} for {url}")]
    Status { status: u16, url: String },

    #[error("ticker feed returned malformed JSON: {0}")]
    Decode(#[source] reqwest::Error),
}

/// Client for the upstream ticker endpoint.
#[derive(Debug, Clone)]
pub struct TickerFeed {
    client: reqwest::Client,
    url: String,
}

impl TickerFeed {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("swapgate/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FeedError::Client)?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches the current ticker list.
    pub async fn fetch(&self) -> Result<Vec<Ticker>, FeedError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(FeedError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status {
                status: status.as_u16(),
                url: self.url.clone(),
            });
        }

        let tickers: Vec<Ticker> = response.json().await.map_err(FeedError::Decode)?;
        debug!(count = tickers.len(), url = %self.url, "ticker feed fetched");
        Ok(tickers)
    }
}

/// Serves the ticker list from a cache backed by a [`TickerFeed`].
#[derive(Debug, Clone)]
pub struct TickerService {
    feed: Arc<TickerFeed>,
    cache: TtlCache<Vec<Ticker>>,
}

impl TickerService {
    pub fn new(feed: TickerFeed, ttl: Duration) -> Self {
        Self {
            feed: Arc::new(feed),
            cache: TtlCache::new(ttl),
        }
    }

    pub fn cache(&self) -> &TtlCache<Vec<Ticker>> {
        &self.cache
    }

    /// Returns the cached list, refreshing it when stale.
    ///
    /// Answers `502` with an [`ErrorBody`] when the refresh fails. A stale
    /// entry is not served; it stays in place until a refresh succeeds.
    pub async fn handle(&self) -> Response {
        let feed = Arc::clone(&self.feed);
        match self
            .cache
            .get_or_fetch(move || async move { feed.fetch().await })
            .await
        {
            Ok(tickers) => Response::json(StatusCode::Ok, tickers.as_slice()),
            Err(e) => {
                warn!(error = %e, url = %self.feed.url(), "ticker refresh failed");
                ErrorBody::from_error("Failed to load market tickers", &e)
                    .into_response(StatusCode::BadGateway)
            }
        }
    }
}
