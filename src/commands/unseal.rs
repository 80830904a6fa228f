use anyhow::Result;
use devstack_secrets::config::Settings;
use devstack_secrets::materials::BootstrapMaterials;
use devstack_secrets::unseal::{UnsealCoordinator, UnsealOutcome};

use super::anonymous_client;

pub(crate) async fn run_unseal(settings: &Settings) -> Result<()> {
    let client = anonymous_client(settings)?;
    let mut coordinator = UnsealCoordinator::new(&client, settings.retry.policy());
    let keys_dir = settings.keys_dir.clone();
    let outcome = coordinator
        .run(|| async move { Ok(BootstrapMaterials::load(&keys_dir).await?.unseal_keys) })
        .await?;
    match outcome {
        UnsealOutcome::AwaitingInitialization => {
            println!("Secrets backend is not initialized yet.");
            println!("Run `devstack-secrets init`, then `devstack-secrets unseal` again.");
        }
        UnsealOutcome::AlreadyUnsealed => println!("Secrets backend is already unsealed."),
        UnsealOutcome::Unsealed { submitted } => {
            println!("Secrets backend unsealed ({submitted} share(s) submitted).");
        }
    }
    Ok(())
}
