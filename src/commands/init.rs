use anyhow::{Context, Result};
use devstack_secrets::config::Settings;
use devstack_secrets::error::BackendState;
use devstack_secrets::fs_util;
use devstack_secrets::materials::BootstrapMaterials;
use devstack_secrets::unseal::wait_for_health;
use tracing::info;

use super::anonymous_client;

pub(crate) async fn run_init(settings: &Settings) -> Result<()> {
    let keys_file = settings.keys_file();
    if fs_util::file_mode(&keys_file).await?.is_some() {
        anyhow::bail!(
            "{} already exists; the backend was initialized before",
            keys_file.display()
        );
    }

    let client = anonymous_client(settings)?;
    let state = wait_for_health(&client, settings.retry.policy()).await?;
    if state != BackendState::Uninitialized {
        anyhow::bail!("Secrets backend at {} is already initialized ({state})", settings.vault_addr);
    }

    info!(
        "Initializing secrets backend with {} shares, threshold {}",
        settings.init.shares, settings.init.threshold
    );
    let response = client
        .init(settings.init.shares, settings.init.threshold)
        .await
        .context("Backend initialization failed")?;
    let materials = BootstrapMaterials::persist(
        &settings.keys_dir,
        &response,
        u32::from(settings.init.shares),
        u32::from(settings.init.threshold),
    )
    .await?;

    println!("Secrets backend initialized.");
    println!(
        "  unseal shares: {} (threshold {})",
        materials.unseal_keys.shares().len(),
        materials.unseal_keys.threshold()
    );
    println!("  keys file: {}", keys_file.display());
    println!("  root token file: {}", settings.root_token_file().display());
    println!("Next: devstack-secrets unseal && devstack-secrets bootstrap");
    Ok(())
}
