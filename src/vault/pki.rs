use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{RawResponse, VaultClient};

const PEM_BUNDLE_FORMAT: &str = "pem_bundle";

/// Issuance rules written to `<mount>/roles/<name>`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RoleRequest {
    pub allowed_domains: Vec<String>,
    pub allow_bare_domains: bool,
    pub allow_subdomains: bool,
    pub allow_localhost: bool,
    pub allow_ip_sans: bool,
    pub server_flag: bool,
    pub client_flag: bool,
    pub key_type: String,
    pub ttl: String,
    pub max_ttl: String,
}

impl RoleRequest {
    /// Role that lets a single service sign CSRs for its own name.
    #[must_use]
    pub fn for_service(service: &str, ttl: &str) -> Self {
        Self {
            allowed_domains: vec![service.to_string(), "localhost".to_string()],
            allow_bare_domains: true,
            allow_subdomains: false,
            allow_localhost: true,
            allow_ip_sans: true,
            server_flag: true,
            client_flag: true,
            key_type: "any".to_string(),
            ttl: ttl.to_string(),
            max_ttl: ttl.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SignRequest {
    pub csr: String,
    pub common_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub alt_names: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip_sans: String,
    pub ttl: String,
    pub format: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignedCertificate {
    pub certificate: String,
    #[serde(default)]
    pub issuing_ca: String,
    #[serde(default)]
    pub ca_chain: Vec<String>,
}

impl SignedCertificate {
    /// Chain to hand to clients: the issuing CA followed by its parents.
    #[must_use]
    pub fn chain_pem(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if self.ca_chain.is_empty() {
            parts.push(self.issuing_ca.trim());
        } else {
            parts.extend(self.ca_chain.iter().map(|pem| pem.trim()));
        }
        let mut out = parts
            .into_iter()
            .filter(|pem| !pem.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        out.push('\n');
        out
    }
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct CertificateData {
    #[serde(default)]
    certificate: String,
}

#[derive(Debug, Deserialize)]
struct CsrData {
    csr: String,
}

impl VaultClient {
    /// Reads the CA certificate of a PKI mount. `None` when no CA has been
    /// generated or imported yet.
    ///
    /// # Errors
    /// Returns an error if the request fails for another reason.
    pub async fn read_ca_certificate(&self, mount: &str) -> Result<Option<String>> {
        let raw = self.get_raw(&format!("{mount}/cert/ca"), true).await?;
        let RawResponse::Body(text) = raw else {
            return Ok(None);
        };
        let parsed: DataEnvelope<CertificateData> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse CA response for {mount}"))?;
        let pem = parsed.data.certificate.trim().to_string();
        Ok((!pem.is_empty()).then_some(pem))
    }

    /// Generates a self-signed root inside `mount`. The key never leaves the backend.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    pub async fn generate_root(&self, mount: &str, common_name: &str, ttl: &str) -> Result<String> {
        let body = serde_json::json!({
            "common_name": common_name,
            "ttl": ttl,
            "key_type": "ec",
            "key_bits": 256,
        });
        let parsed: DataEnvelope<CertificateData> = self
            .post_json(&format!("{mount}/root/generate/internal"), &body)
            .await?;
        Ok(parsed.data.certificate)
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn generate_intermediate_csr(&self, mount: &str, common_name: &str) -> Result<String> {
        let body = serde_json::json!({
            "common_name": common_name,
            "key_type": "ec",
            "key_bits": 256,
        });
        let parsed: DataEnvelope<CsrData> = self
            .post_json(&format!("{mount}/intermediate/generate/internal"), &body)
            .await?;
        Ok(parsed.data.csr)
    }

    /// Signs an intermediate CSR with the root in `root_mount`, returning a
    /// PEM bundle of the intermediate and its issuer.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    pub async fn sign_intermediate(
        &self,
        root_mount: &str,
        csr: &str,
        common_name: &str,
        ttl: &str,
    ) -> Result<String> {
        let body = serde_json::json!({
            "csr": csr,
            "common_name": common_name,
            "ttl": ttl,
            "format": PEM_BUNDLE_FORMAT,
        });
        let parsed: DataEnvelope<CertificateData> = self
            .post_json(&format!("{root_mount}/root/sign-intermediate"), &body)
            .await?;
        Ok(parsed.data.certificate)
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn set_signed_intermediate(&self, mount: &str, certificate: &str) -> Result<()> {
        let body = serde_json::json!({ "certificate": certificate });
        let _: serde_json::Value = self
            .post_json(&format!("{mount}/intermediate/set-signed"), &body)
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn role_exists(&self, mount: &str, name: &str) -> Result<bool> {
        let raw = self.get_raw(&format!("{mount}/roles/{name}"), true).await?;
        Ok(matches!(raw, RawResponse::Body(_)))
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn write_role(&self, mount: &str, name: &str, role: &RoleRequest) -> Result<()> {
        let _: serde_json::Value = self
            .post_json(&format!("{mount}/roles/{name}"), role)
            .await?;
        Ok(())
    }

    /// Signs a locally generated CSR under `role`.
    ///
    /// # Errors
    /// Returns an error if the request fails or the role rejects the CSR.
    pub async fn sign_csr(
        &self,
        mount: &str,
        role: &str,
        request: &SignRequest,
    ) -> Result<SignedCertificate> {
        let parsed: DataEnvelope<SignedCertificate> = self
            .post_json(&format!("{mount}/sign/{role}"), request)
            .await?;
        Ok(parsed.data)
    }
}
