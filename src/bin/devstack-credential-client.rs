use anyhow::{Context, Result};
use clap::Parser;
use devstack_secrets::config::ClientSettings;
use devstack_secrets::error::exit_code_for;
use devstack_secrets::wrapper::CredentialClient;
use devstack_secrets::Args;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            error!("Credential client failed: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run() -> Result<i32> {
    let args = Args::parse();
    let mut settings = ClientSettings::new(args.config.clone())?;
    settings.merge_with_args(&args);
    settings.validate()?;
    info!(
        "Credential client starting for {} against {}",
        settings.service, settings.vault_addr
    );
    let mut client = CredentialClient::new(settings)?;

    let runtime = tokio::runtime::Runtime::new()
        .context("Failed to initialize async runtime for credential client")?;
    runtime.block_on(async {
        let prepared = client.prepare().await?;
        client.handoff(&prepared, &args.command).await
    })
}
