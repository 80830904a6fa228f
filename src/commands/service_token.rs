use anyhow::Result;
use devstack_secrets::config::Settings;
use devstack_secrets::error::PipelineError;

use super::root_client;
use crate::cli::args::ServiceTokenArgs;

pub(crate) async fn run_service_token(settings: &Settings, args: &ServiceTokenArgs) -> Result<()> {
    let catalog = settings.catalog()?;
    let spec = catalog.get(&args.service)?;
    let (client, _materials) = root_client(settings).await?;

    let policy = spec.policy_name();
    if !client.retrying(|| client.policy_exists(&policy)).await? {
        return Err(anyhow::Error::from(PipelineError::NotFound {
            what: "service policy",
            location: policy,
        })
        .context("Run `devstack-secrets bootstrap` first"));
    }
    let ttl = args
        .ttl
        .as_deref()
        .unwrap_or(&settings.pki.service_token_ttl);
    // Not retried: a lost response would leave an extra live token.
    let token = client
        .create_token(std::slice::from_ref(&policy), ttl, &spec.name)
        .await?;
    println!("{}", token.expose());
    Ok(())
}
