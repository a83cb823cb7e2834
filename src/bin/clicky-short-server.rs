use anyhow::Context;
use clicky_short::{
    config::{self, Settings},
    server::{Server, StartOutcome, app_state_capsule, router},
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_tracing()?;

    let settings = Settings::from_env()?;
    let addr = settings.addr.clone();
    let container = config::init_container(settings).await?;

    let server = Server::new(router(container.read(app_state_capsule)), addr);
    if let StartOutcome::Started(local_addr) = server.start().await? {
        info!(%local_addr, "Accepting connections; press Ctrl-C to stop");
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C; draining in-flight requests");
    server.stop().await?;
    Ok(())
}
