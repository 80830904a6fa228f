//! Root and intermediate CA, per-service issuance roles and read policies.
//!
//! Every step checks the backend first and only creates what is missing, so
//! a failed run can be resumed by running it again.

use std::future::Future;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::{PkiSettings, Settings};
use crate::fs_util::{self, WriteStatus};
use crate::report::{StepReport, StepStatus};
use crate::services::ServiceCatalog;
use crate::vault::{RoleRequest, VaultClient};

pub struct TrustHierarchyBuilder<'a> {
    client: &'a VaultClient,
    pki: &'a PkiSettings,
    kv_mount: &'a str,
    catalog: &'a ServiceCatalog,
    ca_chain_path: PathBuf,
}

impl<'a> TrustHierarchyBuilder<'a> {
    #[must_use]
    pub fn new(client: &'a VaultClient, settings: &'a Settings, catalog: &'a ServiceCatalog) -> Self {
        Self {
            client,
            pki: &settings.pki,
            kv_mount: &settings.kv_mount,
            catalog,
            ca_chain_path: settings.ca_chain_file(),
        }
    }

    /// Runs all steps in order, stopping at the first failure.
    ///
    /// # Errors
    /// Returns an error naming the step that failed.
    pub async fn run(&self) -> Result<Vec<StepReport>> {
        let mut reports = Vec::new();
        let client = self.client;
        let pki = self.pki;
        let kv_mount = self.kv_mount;

        reports.push(step(client, "kv-mount", || client.ensure_kv_v2(kv_mount)).await?);
        reports.push(
            step(client, "root-pki-mount", || {
                client.ensure_mount(&pki.root_mount, "pki", &pki.root_ttl)
            })
            .await?,
        );
        reports.push(
            step(client, "intermediate-pki-mount", || {
                client.ensure_mount(&pki.intermediate_mount, "pki", &pki.intermediate_ttl)
            })
            .await?,
        );
        reports.push(step(client, "root-ca", || self.ensure_root_ca()).await?);
        reports.push(step(client, "intermediate-ca", || self.ensure_intermediate_ca()).await?);

        for spec in self.catalog.iter() {
            let role = RoleRequest::for_service(&spec.name, &pki.cert_ttl);
            let role = &role;
            reports.push(
                step(client, format!("role:{}", spec.name), || async move {
                    if client
                        .role_exists(&pki.intermediate_mount, spec.role_name())
                        .await?
                    {
                        return Ok(false);
                    }
                    client
                        .write_role(&pki.intermediate_mount, spec.role_name(), role)
                        .await?;
                    Ok(true)
                })
                .await?,
            );
        }

        for spec in self.catalog.iter() {
            let name = spec.policy_name();
            let document = spec.policy_document(kv_mount);
            let (name, document) = (name.as_str(), document.as_str());
            reports.push(
                step(client, format!("policy:{}", spec.name), || async move {
                    if client.policy_exists(name).await? {
                        return Ok(false);
                    }
                    client.write_policy(name, document).await?;
                    Ok(true)
                })
                .await?,
            );
        }

        reports.push(step(client, "ca-chain-export", || self.export_chain()).await?);
        Ok(reports)
    }

    async fn ensure_root_ca(&self) -> Result<bool> {
        if self
            .client
            .read_ca_certificate(&self.pki.root_mount)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        self.client
            .generate_root(
                &self.pki.root_mount,
                &self.pki.root_common_name,
                &self.pki.root_ttl,
            )
            .await?;
        Ok(true)
    }

    async fn ensure_intermediate_ca(&self) -> Result<bool> {
        if self
            .client
            .read_ca_certificate(&self.pki.intermediate_mount)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        let csr = self
            .client
            .generate_intermediate_csr(
                &self.pki.intermediate_mount,
                &self.pki.intermediate_common_name,
            )
            .await
            .context("Failed to generate intermediate CSR")?;
        let signed = self
            .client
            .sign_intermediate(
                &self.pki.root_mount,
                &csr,
                &self.pki.intermediate_common_name,
                &self.pki.intermediate_ttl,
            )
            .await
            .context("Root CA refused to sign the intermediate")?;
        self.client
            .set_signed_intermediate(&self.pki.intermediate_mount, &signed)
            .await
            .context("Failed to install the signed intermediate")?;
        Ok(true)
    }

    async fn export_chain(&self) -> Result<bool> {
        let root = self
            .client
            .read_ca_certificate(&self.pki.root_mount)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Root CA is missing after creation"))?;
        let intermediate = self
            .client
            .read_ca_certificate(&self.pki.intermediate_mount)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Intermediate CA is missing after creation"))?;
        let chain = chain_pem(&root, &intermediate);
        let status = fs_util::write_public_file(&self.ca_chain_path, chain.as_bytes()).await?;
        Ok(status == WriteStatus::Written)
    }
}

/// Root first, then intermediate, newline terminated.
#[must_use]
pub fn chain_pem(root: &str, intermediate: &str) -> String {
    format!("{}\n{}\n", root.trim(), intermediate.trim())
}

/// Runs one check-then-act step, retrying it whole on transient failures.
async fn step<Action, Fut>(
    client: &VaultClient,
    name: impl Into<String>,
    action: Action,
) -> Result<StepReport>
where
    Action: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let name = name.into();
    let created = client
        .retrying(action)
        .await
        .with_context(|| format!("Trust hierarchy step {name} failed"))?;
    let status = StepStatus::from_created(created);
    info!("{name}: {status}");
    Ok(StepReport::new(name, status))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_pem_orders_root_first() {
        let chain = chain_pem("ROOT\n", "\nINT");
        assert_eq!(chain, "ROOT\nINT\n");
    }
}
