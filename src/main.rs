use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swapgate::app::App;
use swapgate::config::AppConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::from_env()?;
    if std::env::var(&config.api_key_var).is_err() {
        // Not fatal: the key is read per request and may be provided later.
        error!(var = %config.api_key_var, "upstream API key is not set; proxy calls will fail");
    }

    let app = App::new(config)?;
    app.serve(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("ctrl-c received");
    })
    .await?;

    Ok(())
}
