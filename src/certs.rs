use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tracing::info;

use crate::config::Settings;
use crate::error::PipelineError;
use crate::fs_util;
use crate::report::{StepReport, StepStatus};
use crate::services::{ServiceCatalog, ServiceSpec};
use crate::vault::{SignRequest, VaultClient};

pub const CERT_FILE: &str = "cert.pem";
pub const KEY_FILE: &str = "key.pem";
pub const CA_FILE: &str = "ca.pem";

/// File locations of one service's certificate bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl BundlePaths {
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert: dir.join(CERT_FILE),
            key: dir.join(KEY_FILE),
            ca: dir.join(CA_FILE),
        }
    }

    #[must_use]
    pub fn all(&self) -> [&Path; 3] {
        [&self.cert, &self.key, &self.ca]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleState {
    Missing,
    Insecure { path: PathBuf, mode: u32 },
    /// The key on disk does not belong to the certificate.
    Mismatched,
    Expiring { not_after: OffsetDateTime },
    Valid { not_after: OffsetDateTime },
}

/// Parses the certificate expiration timestamp.
///
/// # Errors
/// Returns an error if the certificate cannot be parsed.
pub fn parse_cert_not_after(cert_bytes: &[u8]) -> Result<OffsetDateTime> {
    let pem = x509_parser::pem::parse_x509_pem(cert_bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse PEM certificate: {e}"))?
        .1;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse X509 certificate: {e}"))?;
    Ok(cert.validity().not_after.to_datetime())
}

/// Whether `key_pem` is the private key of the certificate in `cert_bytes`.
/// An unreadable key counts as not matching.
///
/// # Errors
/// Returns an error if the certificate cannot be parsed.
pub fn key_matches_cert(key_pem: &str, cert_bytes: &[u8]) -> Result<bool> {
    let Ok(key) = rcgen::KeyPair::from_pem(key_pem) else {
        return Ok(false);
    };
    let pem = x509_parser::pem::parse_x509_pem(cert_bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse PEM certificate: {e}"))?
        .1;
    let (_, cert) = x509_parser::parse_x509_certificate(&pem.contents)
        .map_err(|e| anyhow::anyhow!("Failed to parse X509 certificate: {e}"))?;
    Ok(cert.public_key().subject_public_key.data.as_ref() == key.public_key_raw())
}

/// # Errors
/// Returns an error if `renew_before` does not fit a signed duration.
pub fn expires_within(
    not_after: OffsetDateTime,
    renew_before: Duration,
    now: OffsetDateTime,
) -> Result<bool> {
    let renew_before = time::Duration::try_from(renew_before)
        .map_err(|_| anyhow::anyhow!("renew_before duration is too large"))?;
    Ok(not_after <= now + renew_before)
}

/// Checks presence, modes, key/certificate pairing and expiry of a bundle
/// without modifying it.
///
/// # Errors
/// Returns an error on I/O failures or an unparsable certificate.
pub async fn inspect_bundle(paths: &BundlePaths, renew_before: Duration) -> Result<BundleState> {
    for path in paths.all() {
        let Err(err) = fs_util::check_secure_mode(path).await else {
            continue;
        };
        let state = match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::NotFound { .. }) => BundleState::Missing,
            Some(PipelineError::PermissionViolation { path, mode }) => BundleState::Insecure {
                path: path.clone(),
                mode: *mode,
            },
            _ => return Err(err),
        };
        return Ok(state);
    }
    let cert_bytes = tokio::fs::read(&paths.cert)
        .await
        .with_context(|| format!("Failed to read {}", paths.cert.display()))?;
    let key_pem = tokio::fs::read_to_string(&paths.key)
        .await
        .with_context(|| format!("Failed to read {}", paths.key.display()))?;
    if !key_matches_cert(&key_pem, &cert_bytes)? {
        return Ok(BundleState::Mismatched);
    }
    let not_after = parse_cert_not_after(&cert_bytes)?;
    if expires_within(not_after, renew_before, OffsetDateTime::now_utc())? {
        Ok(BundleState::Expiring { not_after })
    } else {
        Ok(BundleState::Valid { not_after })
    }
}

/// Generates a private key and CSR for the service. The key stays local.
///
/// # Errors
/// Returns an error if a name is not a valid SAN or key generation fails.
pub fn build_csr(spec: &ServiceSpec) -> Result<(String, String)> {
    let mut params = rcgen::CertificateParams::default();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, spec.name.clone());
    let mut sans = Vec::new();
    for name in spec.dns_names() {
        let dns_name = name.try_into()?;
        sans.push(rcgen::SanType::DnsName(dns_name));
    }
    for ip in spec.ip_sans() {
        sans.push(rcgen::SanType::IpAddress(ip));
    }
    params.subject_alt_names = sans;
    let key = rcgen::KeyPair::generate()?;
    let csr = params.serialize_request(&key)?;
    Ok((csr.pem()?, key.serialize_pem()))
}

pub struct CertificateMaterializer<'a> {
    client: &'a VaultClient,
    catalog: &'a ServiceCatalog,
    pki_mount: &'a str,
    cert_ttl: &'a str,
    cert_root: PathBuf,
    renew_before: Duration,
}

impl<'a> CertificateMaterializer<'a> {
    #[must_use]
    pub fn new(client: &'a VaultClient, settings: &'a Settings, catalog: &'a ServiceCatalog) -> Self {
        Self {
            client,
            catalog,
            pki_mount: &settings.pki.intermediate_mount,
            cert_ttl: &settings.pki.cert_ttl,
            cert_root: settings.cert_root(),
            renew_before: settings.certs.renew_before,
        }
    }

    /// Issues bundles for every service, or just `only`. With `force` the
    /// fast path is skipped and every selected bundle is reissued.
    ///
    /// # Errors
    /// Returns an error naming the service whose bundle failed.
    pub async fn run(&self, only: Option<&str>, force: bool) -> Result<Vec<StepReport>> {
        let selected: Vec<&ServiceSpec> = match only {
            Some(name) => vec![self.catalog.get(name)?],
            None => self.catalog.iter().collect(),
        };
        let mut reports = Vec::with_capacity(selected.len());
        for spec in selected {
            let name = format!("certificate:{}", spec.name);
            let status = self
                .materialize(spec, force)
                .await
                .with_context(|| format!("Issuing certificate for {} failed", spec.name))?;
            info!("{name}: {status}");
            reports.push(StepReport::new(name, status));
        }
        Ok(reports)
    }

    async fn materialize(&self, spec: &ServiceSpec, force: bool) -> Result<StepStatus> {
        let dir = self.cert_root.join(&spec.name);
        let paths = BundlePaths::in_dir(&dir);
        if !force
            && matches!(
                inspect_bundle(&paths, self.renew_before).await?,
                BundleState::Valid { .. }
            )
        {
            return Ok(StepStatus::AlreadyPresent);
        }

        let (csr, key_pem) = build_csr(spec)?;
        let request = SignRequest {
            csr,
            common_name: spec.name.clone(),
            alt_names: spec.dns_names().join(","),
            ip_sans: spec
                .ip_sans()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            ttl: self.cert_ttl.to_string(),
            format: "pem".to_string(),
        };
        let signed = self
            .client
            .retrying(|| self.client.sign_csr(self.pki_mount, spec.role_name(), &request))
            .await?;

        fs_util::ensure_secrets_dir(&dir).await?;
        fs_util::write_secret_atomic(&paths.key, key_pem.as_bytes()).await?;
        fs_util::write_secret_atomic(
            &paths.cert,
            format!("{}\n", signed.certificate.trim()).as_bytes(),
        )
        .await?;
        fs_util::write_secret_atomic(&paths.ca, signed.chain_pem().as_bytes()).await?;
        Ok(StepStatus::Created)
    }
}
