use std::sync::Arc;

use clap::Parser;
use lenscap_proxy::{
  config::{read_config, Args},
  listener::ProxyListener,
  Engine,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let args = Args::parse();
  let config = Arc::new(read_config(&args.config)?);
  let engine = Engine::new(config).await?;

  // First run mints the root; after that the persisted pair is reused.
  let ca = engine.ca.load_or_generate().await?;
  info!(fingerprint = %hex::encode(ca.fingerprint()), "certificate authority ready");

  let listener = ProxyListener::bind(engine).await?;
  info!(addr = %listener.local_addr()?, "lenscap proxy started");

  let shutdown = listener.shutdown_handle();
  tokio::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    info!("interrupt received, shutting down");
    shutdown.shutdown();
  });

  listener.run().await;
  Ok(())
}
