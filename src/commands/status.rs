use std::fmt;

use anyhow::Result;
use devstack_secrets::certs::{BundlePaths, BundleState, inspect_bundle};
use devstack_secrets::config::Settings;
use devstack_secrets::error::BackendState;
use devstack_secrets::materials::BootstrapMaterials;
use devstack_secrets::vault::KvMountStatus;
use tracing::debug;

use super::anonymous_client;
use crate::cli::output::print_status;

pub(crate) struct StatusSummary {
    pub(crate) vault_addr: String,
    pub(crate) backend: Result<BackendState, String>,
    pub(crate) kv_mount_name: String,
    pub(crate) kv_mount: Option<String>,
    pub(crate) note: Option<String>,
    pub(crate) services: Vec<ServiceStatus>,
}

pub(crate) struct ServiceStatus {
    pub(crate) name: String,
    pub(crate) credential: Presence,
    pub(crate) certificate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Presence {
    Present,
    Missing,
    Unknown,
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // padding is applied by the status table
        f.pad(match self {
            Presence::Present => "present",
            Presence::Missing => "missing",
            Presence::Unknown => "unknown",
        })
    }
}

pub(crate) async fn run_status(settings: &Settings) -> Result<()> {
    let summary = collect_status(settings).await?;
    print_status(&summary);
    Ok(())
}

async fn collect_status(settings: &Settings) -> Result<StatusSummary> {
    let catalog = settings.catalog()?;
    let mut client = anonymous_client(settings)?;
    let mut summary = StatusSummary {
        vault_addr: settings.vault_addr.clone(),
        backend: client.health().await.map_err(|err| format!("{err:#}")),
        kv_mount_name: settings.kv_mount.clone(),
        kv_mount: None,
        note: None,
        services: Vec::new(),
    };

    let ready = matches!(
        summary.backend,
        Ok(BackendState::Unsealed | BackendState::Standby)
    );
    let authenticated = if ready {
        match BootstrapMaterials::load(&settings.keys_dir).await {
            Ok(materials) => {
                client.set_token(materials.root_token.token().clone());
                true
            }
            Err(err) => {
                debug!("Key material unavailable: {err:#}");
                summary.note = Some(format!(
                    "no root token in {}; credential checks skipped",
                    settings.keys_dir.display()
                ));
                false
            }
        }
    } else {
        false
    };

    if authenticated {
        let status = client.kv_mount_status(&settings.kv_mount).await?;
        summary.kv_mount = Some(
            match status {
                KvMountStatus::Ok => "kv v2",
                KvMountStatus::Missing => "missing",
                KvMountStatus::NotKv => "not a KV mount",
                KvMountStatus::NotV2 => "KV v1",
            }
            .to_string(),
        );
    }

    for spec in catalog.iter() {
        let credential = if authenticated {
            if client.kv_exists(&settings.kv_mount, &spec.name).await? {
                Presence::Present
            } else {
                Presence::Missing
            }
        } else {
            Presence::Unknown
        };
        let paths = BundlePaths::in_dir(&settings.service_cert_dir(&spec.name));
        let certificate = match inspect_bundle(&paths, settings.certs.renew_before).await {
            Ok(state) => describe_bundle(&state),
            Err(err) => format!("unreadable ({err})"),
        };
        summary.services.push(ServiceStatus {
            name: spec.name.clone(),
            credential,
            certificate,
        });
    }
    Ok(summary)
}

fn describe_bundle(state: &BundleState) -> String {
    match state {
        BundleState::Missing => "missing".to_string(),
        BundleState::Insecure { path, mode } => {
            format!("insecure mode {mode:03o} on {}", path.display())
        }
        BundleState::Mismatched => "key does not match certificate".to_string(),
        BundleState::Expiring { not_after } => format!("expiring {not_after}"),
        BundleState::Valid { not_after } => format!("valid until {not_after}"),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_describe_bundle_insecure() {
        let state = BundleState::Insecure {
            path: PathBuf::from("/certs/postgres/key.pem"),
            mode: 0o644,
        };
        assert_eq!(
            describe_bundle(&state),
            "insecure mode 644 on /certs/postgres/key.pem"
        );
    }

    #[test]
    fn test_presence_pads() {
        assert_eq!(format!("{:<8}|", Presence::Missing), "missing |");
    }
}
