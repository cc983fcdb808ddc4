//! Application wiring: configuration in, routed middleware pipeline out.

use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::config::{AppConfig, ConfigError};
use crate::market::{DEFAULT_FEED_TIMEOUT, FeedError, TICKERS_PATH, TickerFeed, TickerService};
use crate::middleware::{LoggerMiddleware, Pipeline};
use crate::proxy::{CredentialSource, EnvCredential, ProxyError, UpstreamProxy};
use crate::{Method, Request, Response, Router, Server, ServerError, StatusCode};

pub const HEALTH_PATH: &str = "/health";

/// Top-level error for starting and running the service.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Server(#[from] ServerError),
}

/// The assembled service: proxy, optional ticker endpoint, health check.
#[derive(Debug)]
pub struct App {
    config: AppConfig,
    proxy: Arc<UpstreamProxy>,
    tickers: Option<TickerService>,
}

impl App {
    /// Builds the service, reading the API key from the configured env var.
    pub fn new(config: AppConfig) -> Result<Self, AppError> {
        let credential = Arc::new(EnvCredential::new(&config.api_key_var));
        Self::with_credential(config, credential)
    }

    /// Builds the service with an explicit credential source.
    pub fn with_credential(
        config: AppConfig,
        credential: Arc<dyn CredentialSource>,
    ) -> Result<Self, AppError> {
        let proxy = Arc::new(UpstreamProxy::new(config.proxy(), credential)?);

        let tickers = match &config.ticker_url {
            Some(url) => {
                let timeout = config.upstream_timeout.unwrap_or(DEFAULT_FEED_TIMEOUT);
                let feed = TickerFeed::new(url.as_str(), timeout)?;
                Some(TickerService::new(feed, config.ticker_ttl))
            }
            None => None,
        };

        Ok(Self {
            config,
            proxy,
            tickers,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Registers every route. Fixed paths come before the proxy wildcard.
    pub fn router(&self) -> Router {
        let mut router = Router::new();

        router.get(HEALTH_PATH, |_req: Request| async {
            Response::json(StatusCode::Ok, &serde_json::json!({ "status": "ok" }))
        });

        if let Some(tickers) = &self.tickers {
            let tickers = tickers.clone();
            router.get(TICKERS_PATH, move |_req: Request| {
                let tickers = tickers.clone();
                async move { tickers.handle().await }
            });
        }

        let proxy = Arc::clone(&self.proxy);
        router.methods(
            &Method::PROXIED,
            &self.proxy.config().route_pattern(),
            move |request: Request| {
                let proxy = Arc::clone(&proxy);
                async move { proxy.forward(request).await }
            },
        );

        router
    }

    /// The router behind the request logger, ready for [`Server::run`].
    pub fn into_handler(
        self,
    ) -> impl Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>> + Send + Sync + 'static
    {
        Pipeline::new(self.router())
            .layer(LoggerMiddleware)
            .into_handler()
    }

    /// Binds the configured address and serves until `shutdown` resolves.
    pub async fn serve<S>(self, shutdown: S) -> Result<(), AppError>
    where
        S: Future<Output = ()>,
    {
        let server = Server::bind(&self.config.bind).await?;
        info!(
            address = %server.local_addr(),
            prefix = %self.config.proxy_prefix,
            origin = %self.config.upstream_origin,
            tickers = self.tickers.is_some(),
            "starting swapgate"
        );
        server.run_until(self.into_handler(), shutdown).await?;
        Ok(())
    }
}
