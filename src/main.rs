use anyhow::Result;
use clap::Parser;
use devstack_secrets::config::Settings;
use devstack_secrets::error::exit_code_for;
use tracing::error;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use crate::cli::args::{Cli, CliCommand};
use crate::commands::runtime;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        error!("devstack-secrets failed: {err:#}");
        std::process::exit(exit_code_for(&err));
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::new(cli.global.config.clone())?;
    settings.merge_with_args(&cli.global.overrides());
    settings.validate()?;

    match cli.command {
        CliCommand::Init => runtime("init")?.block_on(commands::init::run_init(&settings)),
        CliCommand::Unseal => {
            runtime("unseal")?.block_on(commands::unseal::run_unseal(&settings))
        }
        CliCommand::Bootstrap => {
            runtime("bootstrap")?.block_on(commands::bootstrap::run_bootstrap(&settings))
        }
        CliCommand::Status => {
            runtime("status")?.block_on(commands::status::run_status(&settings))
        }
        CliCommand::Token => runtime("token")?.block_on(commands::inspect::run_token(&settings)),
        CliCommand::CaCert => {
            runtime("ca-cert")?.block_on(commands::inspect::run_ca_cert(&settings))
        }
        CliCommand::ShowPassword(args) => runtime("show-password")?.block_on(
            commands::inspect::run_show_password(&settings, &args.service),
        ),
        CliCommand::RotateCertificates(args) => runtime("rotate-certificates")?.block_on(
            commands::rotate::run_rotate_certificates(&settings, &args),
        ),
        CliCommand::RotateCredentials(args) => runtime("rotate-credentials")?.block_on(
            commands::rotate::run_rotate_credentials(&settings, &args.service),
        ),
        CliCommand::ServiceToken(args) => runtime("service-token")?.block_on(
            commands::service_token::run_service_token(&settings, &args),
        ),
    }
}
