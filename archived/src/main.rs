use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use archived::{Config, Dispatcher};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "archived=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting archived dispatcher");

    let config = Config::load().await?;
    let mut dispatcher = Dispatcher::new(config).await?;

    if let Err(e) = dispatcher.run().await {
        error!("Dispatcher error: {}", e);
        return Err(e);
    }

    Ok(())
}
