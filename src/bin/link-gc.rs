use anyhow::Context;
use clicky_short::{
    config::{self, Settings},
    registry::url_registry_capsule,
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::init_tracing()?;

    let container = config::init_container(Settings::from_env()?).await?;

    let count = container
        .read(url_registry_capsule)
        .expire_sweep()
        .await
        .context("Failed to deactivate expired links")?;
    info!(count, "Expiration sweep finished");
    Ok(())
}
