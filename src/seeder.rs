//! Seeds one credential record per service and rotates them on request.
//!
//! Generated values never reach a log macro.

use anyhow::{Context, Result};
use tracing::info;

use crate::credentials::{CredentialRecord, generate_password};
use crate::error::PipelineError;
use crate::report::{StepReport, StepStatus};
use crate::services::{ServiceCatalog, ServiceSpec};
use crate::vault::{KvSecret, KvWrite, VaultClient};

const DEFAULT_TLS_ENABLED: bool = true;

pub struct SecretSeeder<'a> {
    client: &'a VaultClient,
    kv_mount: &'a str,
    catalog: &'a ServiceCatalog,
}

impl<'a> SecretSeeder<'a> {
    #[must_use]
    pub fn new(client: &'a VaultClient, kv_mount: &'a str, catalog: &'a ServiceCatalog) -> Self {
        Self {
            client,
            kv_mount,
            catalog,
        }
    }

    /// Creates missing records. Existing records are left untouched.
    ///
    /// # Errors
    /// Returns an error naming the service whose record could not be seeded.
    pub async fn run(&self) -> Result<Vec<StepReport>> {
        let mut reports = Vec::with_capacity(self.catalog.len());
        for spec in self.catalog.iter() {
            let name = format!("credential:{}", spec.name);
            let status = self
                .client
                .retrying(|| self.seed_one(spec))
                .await
                .with_context(|| format!("Seeding {} failed", spec.name))?;
            info!("{name}: {status}");
            reports.push(StepReport::new(name, status));
        }
        Ok(reports)
    }

    async fn seed_one(&self, spec: &ServiceSpec) -> Result<StepStatus> {
        if self.client.kv_exists(self.kv_mount, &spec.name).await? {
            return Ok(StepStatus::AlreadyPresent);
        }
        let password = match &spec.password_group {
            Some(leader) => read_credential(self.client, self.kv_mount, leader).await?.1.password,
            None => generate_password()?,
        };
        let record = CredentialRecord::for_service(spec, password, DEFAULT_TLS_ENABLED);
        match self
            .client
            .write_kv(self.kv_mount, &spec.name, record.to_value()?, Some(0))
            .await?
        {
            KvWrite::Written { .. } => Ok(StepStatus::Created),
            KvWrite::CasMismatch => Ok(StepStatus::AlreadyPresent),
        }
    }

    /// Replaces a record wholesale with a new password, keeping its TLS
    /// flag. Services sharing the password are rotated with it.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] when the record does not exist,
    /// and an error when `service` shares another service's password or the
    /// record changed concurrently.
    pub async fn rotate(&self, service: &str) -> Result<Vec<String>> {
        let spec = self.catalog.get(service)?;
        if let Some(leader) = &spec.password_group {
            anyhow::bail!("{service} shares the password of {leader}; rotate {leader} instead");
        }
        let password = generate_password()?;
        let mut rotated = Vec::new();
        let members = std::iter::once(spec).chain(
            self.catalog
                .iter()
                .filter(|candidate| candidate.password_group.as_deref() == Some(service)),
        );
        for member in members {
            match self
                .client
                .retrying(|| self.rotate_one(member, &password))
                .await?
            {
                KvWrite::Written { .. } => {
                    info!("Rotated credential for {}", member.name);
                    rotated.push(member.name.clone());
                }
                KvWrite::CasMismatch => anyhow::bail!(
                    "Credential for {} changed during rotation; re-run to retry",
                    member.name
                ),
            }
        }
        Ok(rotated)
    }

    async fn rotate_one(&self, member: &ServiceSpec, password: &str) -> Result<KvWrite> {
        let (secret, current) = read_credential(self.client, self.kv_mount, &member.name).await?;
        let record =
            CredentialRecord::for_service(member, password.to_string(), current.tls_enabled);
        self.client
            .write_kv(
                self.kv_mount,
                &member.name,
                record.to_value()?,
                Some(secret.version),
            )
            .await
    }
}

/// Reads one service's record in a single request.
///
/// # Errors
/// Returns [`PipelineError::NotFound`] when absent and
/// [`PipelineError::SchemaMismatch`] when malformed.
pub async fn read_credential(
    client: &VaultClient,
    kv_mount: &str,
    service: &str,
) -> Result<(KvSecret, CredentialRecord)> {
    let path = format!("{kv_mount}/{service}");
    let secret = client
        .read_kv(kv_mount, service)
        .await?
        .ok_or_else(|| PipelineError::NotFound {
            what: "credential record",
            location: path.clone(),
        })?;
    let record = CredentialRecord::from_value(&path, secret.data.clone())?;
    Ok((secret, record))
}
