use std::path::PathBuf;

use clap::Parser;

use crate::config::HandoffMode;
use crate::services::ServiceKind;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Fetch a service's credentials from the secrets backend and hand off to its entrypoint",
    long_about = None
)]
pub struct Args {
    /// Path to configuration file (default: credential-client.toml)
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Managed service name (e.g. postgres, redis-2)
    #[arg(long, env = "DEVSTACK_SERVICE")]
    pub service: Option<String>,

    /// Service kind, inferred from the service name when omitted
    #[arg(long, value_enum)]
    pub kind: Option<ServiceKind>,

    /// Secrets backend address
    #[arg(long, env = "VAULT_ADDR")]
    pub vault_addr: Option<String>,

    /// Secrets backend token
    #[arg(long, env = "VAULT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// File holding the secrets backend token
    #[arg(long, env = "VAULT_TOKEN_FILE")]
    pub token_file: Option<PathBuf>,

    /// Directory holding cert.pem, key.pem and ca.pem
    #[arg(long, env = "DEVSTACK_CERT_DIR")]
    pub cert_dir: Option<PathBuf>,

    /// Writable directory for generated config and staged certificates
    #[arg(long)]
    pub runtime_dir: Option<PathBuf>,

    /// Drop to this user before handing off
    #[arg(long)]
    pub run_as: Option<String>,

    /// Serve TLS only; a record with TLS disabled is rejected
    #[arg(long)]
    pub require_tls: bool,

    /// Handoff mode for the wrapped entrypoint
    #[arg(long, value_enum)]
    pub handoff: Option<HandoffMode>,

    /// Health poll attempts before giving up
    #[arg(long)]
    pub retry_attempts: Option<u32>,

    /// Delay between health poll attempts in milliseconds
    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    /// Entrypoint and its arguments, after `--`
    #[arg(last = true, required = true, num_args = 1..)]
    pub command: Vec<String>,
}
