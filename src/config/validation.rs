use anyhow::Result;

use super::{ClientSettings, PkiSettings, RetrySettings, Settings};
use crate::services::validate_service_name;

pub(crate) fn validate_settings(settings: &Settings) -> Result<()> {
    validate_addr(&settings.vault_addr, "vault_addr")?;
    validate_mount(&settings.kv_mount, "kv_mount")?;
    if settings.keys_dir.as_os_str().is_empty() {
        anyhow::bail!("keys_dir must not be empty");
    }
    if settings.request_timeout_secs == 0 {
        anyhow::bail!("request_timeout_secs must be greater than 0");
    }
    validate_retry_settings(&settings.retry, "retry")?;
    if settings.init.shares == 0 {
        anyhow::bail!("init.shares must be greater than 0");
    }
    if settings.init.threshold == 0 {
        anyhow::bail!("init.threshold must be greater than 0");
    }
    if settings.init.threshold > settings.init.shares {
        anyhow::bail!("init.threshold must be <= init.shares");
    }
    validate_pki_settings(&settings.pki)?;
    if let Some(dir) = &settings.certs.dir
        && dir.as_os_str().is_empty()
    {
        anyhow::bail!("certs.dir must not be empty");
    }
    if settings.certs.renew_before.is_zero() {
        anyhow::bail!("certs.renew_before must be greater than 0");
    }
    settings.catalog()?;
    Ok(())
}

pub(crate) fn validate_client_settings(settings: &ClientSettings) -> Result<()> {
    validate_addr(&settings.vault_addr, "vault_addr")?;
    validate_mount(&settings.kv_mount, "kv_mount")?;
    if settings.service.trim().is_empty() {
        anyhow::bail!("service must not be empty");
    }
    validate_service_name(&settings.service)?;
    if settings.cert_dir.as_os_str().is_empty() {
        anyhow::bail!("cert_dir must not be empty");
    }
    if settings.runtime_dir.as_os_str().is_empty() {
        anyhow::bail!("runtime_dir must not be empty");
    }
    if let Some(user) = &settings.run_as
        && user.trim().is_empty()
    {
        anyhow::bail!("run_as must not be empty when set");
    }
    if settings.request_timeout_secs == 0 {
        anyhow::bail!("request_timeout_secs must be greater than 0");
    }
    validate_retry_settings(&settings.retry, "retry")?;
    Ok(())
}

fn validate_pki_settings(pki: &PkiSettings) -> Result<()> {
    validate_mount(&pki.root_mount, "pki.root_mount")?;
    validate_mount(&pki.intermediate_mount, "pki.intermediate_mount")?;
    if pki.root_mount == pki.intermediate_mount {
        anyhow::bail!("pki.root_mount and pki.intermediate_mount must differ");
    }
    if pki.root_common_name.trim().is_empty() {
        anyhow::bail!("pki.root_common_name must not be empty");
    }
    if pki.intermediate_common_name.trim().is_empty() {
        anyhow::bail!("pki.intermediate_common_name must not be empty");
    }
    for (label, ttl) in [
        ("pki.root_ttl", &pki.root_ttl),
        ("pki.intermediate_ttl", &pki.intermediate_ttl),
        ("pki.cert_ttl", &pki.cert_ttl),
        ("pki.service_token_ttl", &pki.service_token_ttl),
    ] {
        humantime::parse_duration(ttl)
            .map_err(|err| anyhow::anyhow!("{label} is not a valid duration ({ttl}): {err}"))?;
    }
    Ok(())
}

fn validate_retry_settings(retry: &RetrySettings, label: &str) -> Result<()> {
    if retry.attempts == 0 {
        anyhow::bail!("{label}.attempts must be greater than 0");
    }
    Ok(())
}

fn validate_addr(addr: &str, label: &str) -> Result<()> {
    if !(addr.starts_with("http://") || addr.starts_with("https://")) {
        anyhow::bail!("{label} must start with http:// or https://");
    }
    Ok(())
}

fn validate_mount(mount: &str, label: &str) -> Result<()> {
    if mount.is_empty() || mount.starts_with('/') || mount.ends_with('/') {
        anyhow::bail!("{label} must be a non-empty path without leading or trailing '/'");
    }
    Ok(())
}
