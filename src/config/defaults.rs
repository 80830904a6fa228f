use std::path::PathBuf;

use config::{ConfigBuilder, ConfigError, builder::DefaultState};

const DEFAULT_VAULT_ADDR: &str = "http://127.0.0.1:8200";
const DEFAULT_KV_MOUNT: &str = "secret";
const DEFAULT_KEYS_SUBDIR: &str = ".config/vault";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 5;
const DEFAULT_RETRY_ATTEMPTS: u32 = 30;
const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_INIT_SHARES: u8 = 5;
const DEFAULT_INIT_THRESHOLD: u8 = 3;
const DEFAULT_ROOT_MOUNT: &str = "pki";
const DEFAULT_INTERMEDIATE_MOUNT: &str = "pki_int";
const DEFAULT_ROOT_COMMON_NAME: &str = "DevStack Root CA";
const DEFAULT_INTERMEDIATE_COMMON_NAME: &str = "DevStack Intermediate CA";
const DEFAULT_ROOT_TTL: &str = "87600h";
const DEFAULT_INTERMEDIATE_TTL: &str = "43800h";
const DEFAULT_CERT_TTL: &str = "8760h";
const DEFAULT_RENEW_BEFORE: &str = "720h";
const DEFAULT_SERVICE_TOKEN_TTL: &str = "768h";

const DEFAULT_CLIENT_CERT_DIR: &str = "/etc/devstack/certs";
const DEFAULT_CLIENT_RUNTIME_DIR: &str = "/run/devstack";
const DEFAULT_CLIENT_RETRY_ATTEMPTS: u32 = 30;
const DEFAULT_CLIENT_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_CLIENT_HANDOFF: &str = "exec";

pub(crate) fn default_keys_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join(DEFAULT_KEYS_SUBDIR)
}

pub(crate) fn apply_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("vault_addr", DEFAULT_VAULT_ADDR)?
        .set_default("kv_mount", DEFAULT_KV_MOUNT)?
        .set_default("keys_dir", default_keys_dir().to_string_lossy().to_string())?
        .set_default("request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?
        .set_default("retry.attempts", DEFAULT_RETRY_ATTEMPTS)?
        .set_default("retry.delay_ms", DEFAULT_RETRY_DELAY_MS)?
        .set_default("init.shares", DEFAULT_INIT_SHARES)?
        .set_default("init.threshold", DEFAULT_INIT_THRESHOLD)?
        .set_default("pki.root_mount", DEFAULT_ROOT_MOUNT)?
        .set_default("pki.intermediate_mount", DEFAULT_INTERMEDIATE_MOUNT)?
        .set_default("pki.root_common_name", DEFAULT_ROOT_COMMON_NAME)?
        .set_default(
            "pki.intermediate_common_name",
            DEFAULT_INTERMEDIATE_COMMON_NAME,
        )?
        .set_default("pki.root_ttl", DEFAULT_ROOT_TTL)?
        .set_default("pki.intermediate_ttl", DEFAULT_INTERMEDIATE_TTL)?
        .set_default("pki.cert_ttl", DEFAULT_CERT_TTL)?
        .set_default("pki.service_token_ttl", DEFAULT_SERVICE_TOKEN_TTL)?
        .set_default("certs.renew_before", DEFAULT_RENEW_BEFORE)
}

pub(crate) fn apply_client_defaults(
    builder: ConfigBuilder<DefaultState>,
) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    builder
        .set_default("vault_addr", DEFAULT_VAULT_ADDR)?
        .set_default("kv_mount", DEFAULT_KV_MOUNT)?
        .set_default("service", "")?
        .set_default("cert_dir", DEFAULT_CLIENT_CERT_DIR)?
        .set_default("runtime_dir", DEFAULT_CLIENT_RUNTIME_DIR)?
        .set_default("require_tls", false)?
        .set_default("handoff", DEFAULT_CLIENT_HANDOFF)?
        .set_default("request_timeout_secs", DEFAULT_REQUEST_TIMEOUT_SECS)?
        .set_default("retry.attempts", DEFAULT_CLIENT_RETRY_ATTEMPTS)?
        .set_default("retry.delay_ms", DEFAULT_CLIENT_RETRY_DELAY_MS)
}
