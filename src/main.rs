use pbx_core::{Config, CoreContext, SipServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides; info otherwise
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting pbx-core");

    let path = std::env::args().nth(1).unwrap_or_else(|| "pbx.toml".to_string());
    let config = Config::load(&path)?;
    info!(
        "Configuration loaded from {} ({} extensions, {} trunks)",
        path,
        config.extensions.len(),
        config.trunks.len()
    );

    let ctx = CoreContext::from_config(config).await?;
    let (server, rx) = SipServer::bind(ctx).await?;
    let server = Arc::new(server);

    let dispatcher = {
        let server = server.clone();
        tokio::spawn(async move { server.run(rx).await })
    };
    info!("Listening for SIP on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    server.shutdown();
    dispatcher.await?;

    Ok(())
}
