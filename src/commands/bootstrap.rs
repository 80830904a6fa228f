use anyhow::Result;
use devstack_secrets::certs::CertificateMaterializer;
use devstack_secrets::config::Settings;
use devstack_secrets::seeder::SecretSeeder;
use devstack_secrets::trust::TrustHierarchyBuilder;
use tracing::info;

use super::root_client;
use crate::cli::output::print_step_table;

pub(crate) async fn run_bootstrap(settings: &Settings) -> Result<()> {
    let catalog = settings.catalog()?;
    let (client, _materials) = root_client(settings).await?;

    info!("Building trust hierarchy for {} service(s)", catalog.len());
    let mut reports = TrustHierarchyBuilder::new(&client, settings, &catalog)
        .run()
        .await?;
    reports.extend(
        SecretSeeder::new(&client, &settings.kv_mount, &catalog)
            .run()
            .await?,
    );
    reports.extend(
        CertificateMaterializer::new(&client, settings, &catalog)
            .run(None, false)
            .await?,
    );
    print_step_table("Bootstrap:", &reports);
    Ok(())
}
