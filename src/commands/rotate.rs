use anyhow::Result;
use devstack_secrets::certs::CertificateMaterializer;
use devstack_secrets::config::Settings;
use devstack_secrets::seeder::SecretSeeder;

use super::root_client;
use crate::cli::args::RotateCertificatesArgs;
use crate::cli::output::print_step_table;

pub(crate) async fn run_rotate_certificates(
    settings: &Settings,
    args: &RotateCertificatesArgs,
) -> Result<()> {
    let catalog = settings.catalog()?;
    let (client, _materials) = root_client(settings).await?;
    let reports = CertificateMaterializer::new(&client, settings, &catalog)
        .run(args.service.as_deref(), args.force)
        .await?;
    print_step_table("Certificates:", &reports);
    Ok(())
}

pub(crate) async fn run_rotate_credentials(settings: &Settings, service: &str) -> Result<()> {
    let catalog = settings.catalog()?;
    let (client, _materials) = root_client(settings).await?;
    let rotated = SecretSeeder::new(&client, &settings.kv_mount, &catalog)
        .rotate(service)
        .await?;
    println!("Rotated credentials: {}", rotated.join(", "));
    println!("Restart the affected containers to pick up the new password.");
    Ok(())
}
