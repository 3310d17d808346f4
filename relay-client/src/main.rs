use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relay_client::{Client, ClientConfig, FileTokenSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ClientConfig::from_env()?;
    info!(
        server_name = %config.server_name,
        relay = %format!("{}://{}{}", config.relay_scheme, config.relay_address, config.relay_prefix),
        backend = %format!("{}://{}", config.backend_scheme, config.backend_address),
        "Relay client starting"
    );

    // Token acquisition is delegated to whatever keeps the token file
    // fresh (a sidecar or mounted service-account token).
    let client = match std::env::var("RELAY_CLIENT_TOKEN_FILE") {
        Ok(path) => Client::with_token_source(config, Arc::new(FileTokenSource::new(path)))?,
        Err(_) => Client::new(config)?,
    };

    let fatal = client.start().await;
    Err(fatal.into())
}
