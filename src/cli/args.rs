use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use devstack_secrets::config::SettingsOverrides;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bootstrap and operate the local development secrets backend",
    long_about = None
)]
pub(crate) struct Cli {
    #[command(flatten)]
    pub(crate) global: GlobalArgs,

    #[command(subcommand)]
    pub(crate) command: CliCommand,
}

#[derive(Args, Debug, Clone)]
pub(crate) struct GlobalArgs {
    /// Path to configuration file (default: devstack.toml)
    #[arg(long, short, global = true)]
    pub(crate) config: Option<PathBuf>,

    /// Secrets backend address
    #[arg(long, env = "VAULT_ADDR", global = true)]
    pub(crate) vault_addr: Option<String>,

    /// Directory holding keys.json, root-token and exported certificates
    #[arg(long, global = true)]
    pub(crate) keys_dir: Option<PathBuf>,

    /// KV v2 mount holding service credentials
    #[arg(long, global = true)]
    pub(crate) kv_mount: Option<String>,
}

impl GlobalArgs {
    pub(crate) fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            vault_addr: self.vault_addr.clone(),
            keys_dir: self.keys_dir.clone(),
            kv_mount: self.kv_mount.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub(crate) enum CliCommand {
    /// Initialize the backend and store unseal keys and root token
    Init,
    /// Submit unseal shares until the backend is unsealed
    Unseal,
    /// Create the trust hierarchy, seed credentials and issue certificates
    Bootstrap,
    /// Report backend, credential and certificate state
    Status,
    /// Print the root token
    Token,
    /// Print the exported CA chain
    CaCert,
    /// Print a service's credentials in plaintext
    ShowPassword(ServiceArgs),
    /// Reissue missing, expiring or insecure certificate bundles
    RotateCertificates(RotateCertificatesArgs),
    /// Replace a service's password
    RotateCredentials(ServiceArgs),
    /// Mint a token that can only read one service's credentials
    ServiceToken(ServiceTokenArgs),
}

#[derive(Args, Debug)]
pub(crate) struct ServiceArgs {
    /// Managed service name
    pub(crate) service: String,
}

#[derive(Args, Debug)]
pub(crate) struct RotateCertificatesArgs {
    /// Only this service
    #[arg(long)]
    pub(crate) service: Option<String>,

    /// Reissue even when the current bundle is valid
    #[arg(long)]
    pub(crate) force: bool,
}

#[derive(Args, Debug)]
pub(crate) struct ServiceTokenArgs {
    /// Managed service name
    pub(crate) service: String,

    /// Token TTL (defaults to pki.service_token_ttl)
    #[arg(long)]
    pub(crate) ttl: Option<String>,
}
