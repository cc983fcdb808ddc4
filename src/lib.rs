//! # swapgate
//!
//! Server core for a USDC/WETH rebalancing dashboard: a credential-injecting
//! proxy in front of a DEX-aggregation API, and a coalescing TTL cache for
//! market tickers, hosted on a small async HTTP/1.1 server.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use swapgate::app::App;
//! use swapgate::config::AppConfig;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let app = App::new(AppConfig::from_env()?)?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod cache;
pub mod config;
pub mod http;
pub mod market;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod server;

pub use cache::{FetchError, TtlCache};
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{ProxyConfig, UpstreamProxy};
pub use router::Router;
pub use server::{Server, ServerError};
