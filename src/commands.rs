pub(crate) mod bootstrap;
pub(crate) mod init;
pub(crate) mod inspect;
pub(crate) mod rotate;
pub(crate) mod service_token;
pub(crate) mod status;
pub(crate) mod unseal;

use anyhow::{Context, Result};
use devstack_secrets::config::Settings;
use devstack_secrets::error::{BackendState, PipelineError};
use devstack_secrets::materials::BootstrapMaterials;
use devstack_secrets::unseal::wait_for_health;
use devstack_secrets::vault::VaultClient;

/// Client without a token, for health, init and unseal.
pub(crate) fn anonymous_client(settings: &Settings) -> Result<VaultClient> {
    let mut client = VaultClient::new(&settings.vault_addr, settings.request_timeout())?;
    client.set_retry_policy(settings.retry.policy());
    Ok(client)
}

/// Loads the key material and returns a root-authenticated client for an
/// unsealed backend.
pub(crate) async fn root_client(settings: &Settings) -> Result<(VaultClient, BootstrapMaterials)> {
    let materials = BootstrapMaterials::load(&settings.keys_dir).await?;
    let mut client = anonymous_client(settings)?;
    client.set_token(materials.root_token.token().clone());
    match wait_for_health(&client, settings.retry.policy()).await? {
        BackendState::Unsealed | BackendState::Standby => Ok((client, materials)),
        BackendState::Sealed => Err(PipelineError::NotReady {
            state: BackendState::Sealed,
            hint: "run `devstack-secrets unseal` first",
        }
        .into()),
        BackendState::Uninitialized => Err(PipelineError::NotReady {
            state: BackendState::Uninitialized,
            hint: "run `devstack-secrets init` first",
        }
        .into()),
    }
}

pub(crate) fn runtime(label: &str) -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new()
        .with_context(|| format!("Failed to initialize async runtime for {label}"))
}
