use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Deserializer};

use crate::error::PipelineError;
use crate::services::{ServiceCatalog, ServiceKind, ServiceSpec};
use crate::utils::RetryPolicy;
use crate::vault::VaultToken;

mod defaults;
mod validation;

const DEFAULT_CONFIG_FILE: &str = "devstack.toml";
const DEFAULT_CLIENT_CONFIG_FILE: &str = "credential-client.toml";
const ENV_PREFIX: &str = "DEVSTACK";
const CLIENT_ENV_PREFIX: &str = "DEVSTACK_CLIENT";
const ENV_SEPARATOR: &str = "__";
const KEYS_FILE: &str = "keys.json";
const ROOT_TOKEN_FILE: &str = "root-token";
const CA_CHAIN_FILE: &str = "ca/ca-chain.pem";
const CERTS_SUBDIR: &str = "certs";

/// Operator-side settings for the bootstrap commands.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub vault_addr: String,
    pub kv_mount: String,
    pub keys_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub retry: RetrySettings,
    pub init: InitSettings,
    pub pki: PkiSettings,
    pub certs: CertSettings,
    #[serde(default)]
    pub services: Option<Vec<ServiceSpec>>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetrySettings {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl RetrySettings {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, Duration::from_millis(self.delay_ms))
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct InitSettings {
    pub shares: u8,
    pub threshold: u8,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PkiSettings {
    pub root_mount: String,
    pub intermediate_mount: String,
    pub root_common_name: String,
    pub intermediate_common_name: String,
    pub root_ttl: String,
    pub intermediate_ttl: String,
    pub cert_ttl: String,
    pub service_token_ttl: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CertSettings {
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(deserialize_with = "deserialize_duration")]
    pub renew_before: Duration,
}

/// Overrides the operator CLI can apply on top of file and environment.
#[derive(Debug, Default, Clone)]
pub struct SettingsOverrides {
    pub vault_addr: Option<String>,
    pub keys_dir: Option<PathBuf>,
    pub kv_mount: Option<String>,
}

impl Settings {
    /// Loads settings from defaults, an optional TOML file and `DEVSTACK_*`
    /// environment variables, in that order.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let builder = defaults::apply_defaults(Config::builder())?;
        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
        builder
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator(ENV_SEPARATOR),
            )
            .build()?
            .try_deserialize()
    }

    pub fn merge_with_args(&mut self, overrides: &SettingsOverrides) {
        if let Some(addr) = &overrides.vault_addr {
            addr.clone_into(&mut self.vault_addr);
        }
        if let Some(keys_dir) = &overrides.keys_dir {
            keys_dir.clone_into(&mut self.keys_dir);
        }
        if let Some(mount) = &overrides.kv_mount {
            mount.clone_into(&mut self.kv_mount);
        }
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        validation::validate_settings(self)
    }

    /// The configured service list, or the built-in catalog.
    ///
    /// # Errors
    /// Returns an error if a configured list is invalid.
    pub fn catalog(&self) -> Result<ServiceCatalog> {
        match &self.services {
            Some(specs) => ServiceCatalog::from_specs(specs.clone()),
            None => Ok(ServiceCatalog::builtin()),
        }
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub fn keys_file(&self) -> PathBuf {
        self.keys_dir.join(KEYS_FILE)
    }

    #[must_use]
    pub fn root_token_file(&self) -> PathBuf {
        self.keys_dir.join(ROOT_TOKEN_FILE)
    }

    #[must_use]
    pub fn ca_chain_file(&self) -> PathBuf {
        self.keys_dir.join(CA_CHAIN_FILE)
    }

    #[must_use]
    pub fn cert_root(&self) -> PathBuf {
        self.certs
            .dir
            .clone()
            .unwrap_or_else(|| self.keys_dir.join(CERTS_SUBDIR))
    }

    #[must_use]
    pub fn service_cert_dir(&self, service: &str) -> PathBuf {
        self.cert_root().join(service)
    }
}

/// How the credential client hands control to the wrapped entrypoint.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// Replace the process image.
    Exec,
    /// Run as a child, forward signals, mirror its exit status.
    Supervise,
}

/// Settings for one credential client invocation.
#[derive(Deserialize, Clone)]
pub struct ClientSettings {
    pub vault_addr: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    pub kv_mount: String,
    pub service: String,
    #[serde(default)]
    pub kind: Option<ServiceKind>,
    pub cert_dir: PathBuf,
    pub runtime_dir: PathBuf,
    #[serde(default)]
    pub run_as: Option<String>,
    pub require_tls: bool,
    pub handoff: HandoffMode,
    pub retry: RetrySettings,
    pub request_timeout_secs: u64,
}

impl fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSettings")
            .field("vault_addr", &self.vault_addr)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_file", &self.token_file)
            .field("kv_mount", &self.kv_mount)
            .field("service", &self.service)
            .field("kind", &self.kind)
            .field("cert_dir", &self.cert_dir)
            .field("runtime_dir", &self.runtime_dir)
            .field("run_as", &self.run_as)
            .field("require_tls", &self.require_tls)
            .field("handoff", &self.handoff)
            .field("retry", &self.retry)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl ClientSettings {
    /// Loads client settings from defaults, an optional TOML file and
    /// `DEVSTACK_CLIENT_*` environment variables.
    ///
    /// # Errors
    /// Returns error if configuration parsing fails.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let builder = defaults::apply_client_defaults(Config::builder())?;
        let path = config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CLIENT_CONFIG_FILE));
        builder
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(CLIENT_ENV_PREFIX)
                    .prefix_separator("_")
                    .separator(ENV_SEPARATOR),
            )
            .build()?
            .try_deserialize()
    }

    /// Merges CLI arguments into the settings, overriding values if present.
    pub fn merge_with_args(&mut self, args: &crate::client_args::Args) {
        if let Some(service) = &args.service {
            service.clone_into(&mut self.service);
        }
        if let Some(kind) = args.kind {
            self.kind = Some(kind);
        }
        if let Some(addr) = &args.vault_addr {
            addr.clone_into(&mut self.vault_addr);
        }
        if let Some(token) = &args.token {
            self.token = Some(token.clone());
        }
        if let Some(token_file) = &args.token_file {
            self.token_file = Some(token_file.clone());
        }
        if let Some(cert_dir) = &args.cert_dir {
            cert_dir.clone_into(&mut self.cert_dir);
        }
        if let Some(runtime_dir) = &args.runtime_dir {
            runtime_dir.clone_into(&mut self.runtime_dir);
        }
        if let Some(run_as) = &args.run_as {
            self.run_as = Some(run_as.clone());
        }
        if args.require_tls {
            self.require_tls = true;
        }
        if let Some(handoff) = args.handoff {
            self.handoff = handoff;
        }
        if let Some(attempts) = args.retry_attempts {
            self.retry.attempts = attempts;
        }
        if let Some(delay_ms) = args.retry_delay_ms {
            self.retry.delay_ms = delay_ms;
        }
    }

    /// Validates configuration values for correctness.
    ///
    /// # Errors
    /// Returns error if any setting is invalid or out of range.
    pub fn validate(&self) -> Result<()> {
        validation::validate_client_settings(self)
    }

    #[must_use]
    pub fn service_kind(&self) -> ServiceKind {
        self.kind
            .unwrap_or_else(|| ServiceKind::infer(&self.service))
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Resolves the token from the inline value or the token file and
    /// validates it. No network access happens here.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidToken`] when no usable token is
    /// configured, or an I/O error when the token file cannot be read.
    pub fn resolve_token(&self) -> Result<VaultToken> {
        if let Some(token) = &self.token {
            return Ok(VaultToken::parse(token)?);
        }
        let Some(path) = &self.token_file else {
            return Err(PipelineError::InvalidToken("no token or token file configured").into());
        };
        let raw = read_token_file(path)?;
        Ok(VaultToken::parse(&raw)?)
    }
}

fn read_token_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read token file {}", path.display()))
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}
