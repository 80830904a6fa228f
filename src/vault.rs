use std::any::TypeId;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{BackendState, PipelineError};
use crate::utils::{Attempt, RetryPolicy, WaitOutcome, wait_until_ready};

mod pki;

pub use pki::{RoleRequest, SignRequest, SignedCertificate};

const VAULT_TOKEN_HEADER: &str = "X-Vault-Token";
const CAS_MISMATCH_MARKER: &str = "check-and-set";
const MISSING_MOUNT_MARKER: &str = "No secret engine mount";

/// Shortest token accepted before any request is attempted.
pub const MIN_TOKEN_LEN: usize = 20;

/// A validated backend token.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultToken(String);

impl VaultToken {
    /// Validates a raw token string.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidToken`] if the token is too short or
    /// contains whitespace or non-ASCII characters.
    pub fn parse(raw: &str) -> Result<Self, PipelineError> {
        let token = raw.trim();
        if token.is_empty() {
            return Err(PipelineError::InvalidToken("token is empty"));
        }
        if token.len() < MIN_TOKEN_LEN {
            return Err(PipelineError::InvalidToken(
                "token is shorter than the minimum accepted length",
            ));
        }
        if !token.chars().all(|ch| ch.is_ascii_graphic()) {
            return Err(PipelineError::InvalidToken(
                "token contains whitespace or non-ASCII characters",
            ));
        }
        Ok(Self(token.to_string()))
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VaultToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultToken(<redacted>)")
    }
}

#[derive(Debug, Clone)]
pub struct VaultClient {
    base_url: String,
    client: Client,
    token: Option<VaultToken>,
    retry: RetryPolicy,
}

/// Non-success answer from the backend API.
#[derive(Debug, thiserror::Error)]
#[error("Secrets backend API error ({status}): {body}")]
pub struct ApiError {
    pub status: StatusCode,
    pub body: String,
}

/// Whether `err` came from the transport or a 5xx answer. Anything else
/// (missing paths, 4xx, malformed records) will not change on retry.
#[must_use]
pub fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<reqwest::Error>().is_some()
            || cause
                .downcast_ref::<ApiError>()
                .is_some_and(|api| api.status.is_server_error())
    })
}

#[derive(Debug, Deserialize)]
pub struct InitStatus {
    pub initialized: bool,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct SealStatus {
    pub sealed: bool,
    #[serde(default)]
    pub t: Option<u32>,
    #[serde(default)]
    pub n: Option<u32>,
    #[serde(default)]
    pub progress: Option<u32>,
}

#[derive(Deserialize, Clone)]
pub struct InitResponse {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub keys_base64: Vec<String>,
    pub root_token: String,
}

impl fmt::Debug for InitResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InitResponse")
            .field("keys", &self.keys.len())
            .field("keys_base64", &self.keys_base64.len())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvMountStatus {
    Ok,
    Missing,
    NotKv,
    NotV2,
}

/// A KV v2 secret with the version it was read at.
#[derive(Clone)]
pub struct KvSecret {
    pub data: serde_json::Value,
    pub version: u64,
}

impl fmt::Debug for KvSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvSecret")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvWrite {
    Written { version: u64 },
    /// Check-and-set rejected the write; someone else got there first.
    CasMismatch,
}

#[derive(Debug, Deserialize)]
struct MountResponse {
    data: MountData,
}

#[derive(Debug, Deserialize)]
struct MountData {
    #[serde(rename = "type")]
    mount_type: String,
    #[serde(default)]
    options: Option<MountOptions>,
}

#[derive(Debug, Deserialize)]
struct MountOptions {
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KvReadResponse {
    data: KvReadData,
}

#[derive(Debug, Deserialize)]
struct KvReadData {
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    metadata: Option<KvMetadata>,
}

#[derive(Debug, Deserialize)]
struct KvMetadata {
    #[serde(default)]
    version: u64,
}

#[derive(Debug, Deserialize)]
struct KvWriteResponse {
    data: KvMetadata,
}

#[derive(Deserialize)]
struct TokenCreateResponse {
    auth: TokenAuth,
}

#[derive(Deserialize)]
struct TokenAuth {
    client_token: String,
}

enum RawResponse {
    Missing,
    Body(String),
}

impl VaultClient {
    /// Builds a client with a fixed per-request timeout.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build secrets backend HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            token: None,
            retry: RetryPolicy::new(1, Duration::ZERO),
        })
    }

    /// Budget used by [`VaultClient::retrying`]. A new client tries once.
    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry = policy;
    }

    /// Runs `call` again while it fails transiently and the retry budget
    /// allows.
    ///
    /// # Errors
    /// Returns the first non-transient error unchanged, or
    /// [`PipelineError::Unreachable`] once every attempt failed transiently.
    pub async fn retrying<T, Call, Fut>(&self, mut call: Call) -> Result<T>
    where
        Call: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let outcome = wait_until_ready(self.retry, |_| {
            let pending = call();
            async move {
                match pending.await {
                    Ok(value) => Attempt::Ready(value),
                    Err(err) if is_transient(&err) => Attempt::Retry(err),
                    Err(err) => Attempt::Fail(err),
                }
            }
        })
        .await;
        match outcome {
            WaitOutcome::Ready(value) => Ok(value),
            WaitOutcome::Error(err) => Err(err),
            WaitOutcome::TimedOut {
                attempts,
                last_error,
            } => Err(PipelineError::Unreachable {
                addr: self.base_url.clone(),
                attempts,
                reason: last_error
                    .map_or_else(|| "no response".to_string(), |err| format!("{err:#}")),
            }
            .into()),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn set_token(&mut self, token: VaultToken) {
        self.token = Some(token);
    }

    /// Queries the health endpoint and classifies the backend state.
    ///
    /// # Errors
    /// Returns an error if the backend does not answer or answers with an
    /// unexpected status code.
    pub async fn health(&self) -> Result<BackendState> {
        let url = self.endpoint("sys/health");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Secrets backend health check failed")?;
        let status = response.status();
        match status.as_u16() {
            200 => Ok(BackendState::Unsealed),
            429 | 472 | 473 => Ok(BackendState::Standby),
            501 => Ok(BackendState::Uninitialized),
            503 => Ok(BackendState::Sealed),
            _ => anyhow::bail!("Secrets backend health check returned unexpected status: {status}"),
        }
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn is_initialized(&self) -> Result<bool> {
        let status: InitStatus = self.get_json("sys/init", false).await?;
        Ok(status.initialized)
    }

    /// Initializes the backend, producing unseal shares and a root token.
    ///
    /// # Errors
    /// Returns an error if the request fails or the backend rejects it.
    pub async fn init(&self, shares: u8, threshold: u8) -> Result<InitResponse> {
        #[derive(Serialize)]
        struct InitRequest {
            secret_shares: u8,
            secret_threshold: u8,
        }
        let url = self.endpoint("sys/init");
        let response = self
            .client
            .put(url)
            .json(&InitRequest {
                secret_shares: shares,
                secret_threshold: threshold,
            })
            .send()
            .await
            .context("Secrets backend init request failed")?;
        Self::parse_response(response).await
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn seal_status(&self) -> Result<SealStatus> {
        self.get_json("sys/seal-status", false).await
    }

    /// Submits one unseal share.
    ///
    /// # Errors
    /// Returns an error if the request fails or the share is rejected.
    pub async fn unseal(&self, key: &str) -> Result<SealStatus> {
        #[derive(Serialize)]
        struct UnsealRequest<'a> {
            key: &'a str,
        }
        let url = self.endpoint("sys/unseal");
        let response = self
            .client
            .put(url)
            .json(&UnsealRequest { key })
            .send()
            .await
            .context("Secrets backend unseal request failed")?;
        Self::parse_response(response).await
    }

    /// # Errors
    /// Returns an error if the mount lookup fails.
    pub async fn kv_mount_status(&self, mount: &str) -> Result<KvMountStatus> {
        let Some(data) = self.get_mount(mount).await? else {
            return Ok(KvMountStatus::Missing);
        };
        if data.mount_type != "kv" {
            return Ok(KvMountStatus::NotKv);
        }
        let version = data.options.and_then(|opt| opt.version);
        if version.as_deref() != Some("2") {
            return Ok(KvMountStatus::NotV2);
        }
        Ok(KvMountStatus::Ok)
    }

    /// Enables a KV v2 mount if absent. Returns `true` when it was created.
    ///
    /// # Errors
    /// Returns an error if the mount exists with another type or version, or
    /// the request fails.
    pub async fn ensure_kv_v2(&self, mount: &str) -> Result<bool> {
        match self.kv_mount_status(mount).await? {
            KvMountStatus::Ok => Ok(false),
            KvMountStatus::NotKv => anyhow::bail!("Mount {mount} exists but is not KV"),
            KvMountStatus::NotV2 => anyhow::bail!("Mount {mount} exists but is not KV v2"),
            KvMountStatus::Missing => {
                self.enable_mount(
                    mount,
                    &serde_json::json!({ "type": "kv", "options": { "version": "2" } }),
                )
                .await?;
                Ok(true)
            }
        }
    }

    /// Enables a secrets engine of `engine` type if absent. Returns `true`
    /// when it was created.
    ///
    /// # Errors
    /// Returns an error if the mount exists with another type, or the request fails.
    pub async fn ensure_mount(
        &self,
        mount: &str,
        engine: &str,
        max_lease_ttl: &str,
    ) -> Result<bool> {
        if let Some(data) = self.get_mount(mount).await? {
            if data.mount_type != engine {
                anyhow::bail!(
                    "Mount {mount} exists with type {} instead of {engine}",
                    data.mount_type
                );
            }
            return Ok(false);
        }
        self.enable_mount(
            mount,
            &serde_json::json!({
                "type": engine,
                "config": { "max_lease_ttl": max_lease_ttl },
            }),
        )
        .await?;
        Ok(true)
    }

    /// Reads a KV v2 secret, `None` when absent or deleted.
    ///
    /// # Errors
    /// Returns an error if the request fails or the response is malformed.
    pub async fn read_kv(&self, mount: &str, path: &str) -> Result<Option<KvSecret>> {
        let raw = self.get_raw(&format!("{mount}/data/{path}"), true).await?;
        let RawResponse::Body(text) = raw else {
            return Ok(None);
        };
        let parsed: KvReadResponse = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse KV response for {mount}/{path}"))?;
        let Some(data) = parsed.data.data.filter(|value| !value.is_null()) else {
            return Ok(None);
        };
        Ok(Some(KvSecret {
            data,
            version: parsed.data.metadata.map_or(0, |meta| meta.version),
        }))
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn kv_exists(&self, mount: &str, path: &str) -> Result<bool> {
        Ok(self.read_kv(mount, path).await?.is_some())
    }

    /// Writes a KV v2 secret. With `cas = Some(0)` the write only succeeds
    /// if the path has never been written.
    ///
    /// # Errors
    /// Returns an error if the request fails for any reason other than a
    /// check-and-set mismatch.
    pub async fn write_kv(
        &self,
        mount: &str,
        path: &str,
        data: serde_json::Value,
        cas: Option<u64>,
    ) -> Result<KvWrite> {
        #[derive(Serialize)]
        struct KvOptions {
            cas: u64,
        }
        #[derive(Serialize)]
        struct KvRequest {
            #[serde(skip_serializing_if = "Option::is_none")]
            options: Option<KvOptions>,
            data: serde_json::Value,
        }
        let full_path = format!("{mount}/data/{path}");
        let token = self.require_token()?;
        let response = self
            .client
            .post(self.endpoint(&full_path))
            .header(VAULT_TOKEN_HEADER, token.expose())
            .json(&KvRequest {
                options: cas.map(|cas| KvOptions { cas }),
                data,
            })
            .send()
            .await
            .with_context(|| format!("Secrets backend request failed: {full_path}"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read KV write response body")?;
        if status == StatusCode::BAD_REQUEST && text.contains(CAS_MISMATCH_MARKER) {
            return Ok(KvWrite::CasMismatch);
        }
        if !status.is_success() {
            return Err(ApiError { status, body: text }.into());
        }
        let version = serde_json::from_str::<KvWriteResponse>(&text)
            .map(|parsed| parsed.data.version)
            .unwrap_or_default();
        Ok(KvWrite::Written { version })
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn policy_exists(&self, name: &str) -> Result<bool> {
        let raw = self
            .get_raw(&format!("sys/policies/acl/{name}"), true)
            .await?;
        Ok(matches!(raw, RawResponse::Body(_)))
    }

    /// # Errors
    /// Returns an error if the request fails.
    pub async fn write_policy(&self, name: &str, policy: &str) -> Result<()> {
        #[derive(Serialize)]
        struct PolicyRequest<'a> {
            policy: &'a str,
        }
        let _: serde_json::Value = self
            .post_json(
                &format!("sys/policies/acl/{name}"),
                &PolicyRequest { policy },
            )
            .await?;
        Ok(())
    }

    /// Creates a token bound to `policies`.
    ///
    /// # Errors
    /// Returns an error if the request fails.
    pub async fn create_token(
        &self,
        policies: &[String],
        ttl: &str,
        display_name: &str,
    ) -> Result<VaultToken> {
        #[derive(Serialize)]
        struct TokenRequest<'a> {
            policies: &'a [String],
            ttl: &'a str,
            display_name: &'a str,
            no_default_policy: bool,
            renewable: bool,
        }
        let response: TokenCreateResponse = self
            .post_json(
                "auth/token/create",
                &TokenRequest {
                    policies,
                    ttl,
                    display_name,
                    no_default_policy: false,
                    renewable: true,
                },
            )
            .await?;
        VaultToken::parse(&response.auth.client_token)
            .map_err(|err| anyhow::anyhow!("Backend returned an unusable token: {err}"))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.base_url)
    }

    fn require_token(&self) -> Result<&VaultToken> {
        self.token
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Secrets backend token is not set"))
    }

    async fn enable_mount(&self, mount: &str, body: &serde_json::Value) -> Result<()> {
        let _: serde_json::Value = self.post_json(&format!("sys/mounts/{mount}"), body).await?;
        Ok(())
    }

    async fn get_mount(&self, mount: &str) -> Result<Option<MountData>> {
        let raw = self.get_raw(&format!("sys/mounts/{mount}"), true).await?;
        let RawResponse::Body(text) = raw else {
            return Ok(None);
        };
        let parsed: MountResponse =
            serde_json::from_str(&text).context("Failed to parse mount response")?;
        Ok(Some(parsed.data))
    }

    /// GET that maps 404 (and the backend's "no such mount" 400) to `Missing`.
    async fn get_raw(&self, path: &str, use_token: bool) -> Result<RawResponse> {
        let mut request = self.client.get(self.endpoint(path));
        if use_token {
            request = request.header(VAULT_TOKEN_HEADER, self.require_token()?.expose());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Secrets backend request failed: {path}"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("Failed to read secrets backend response: {path}"))?;
        if status == StatusCode::NOT_FOUND
            || (status == StatusCode::BAD_REQUEST && text.contains(MISSING_MOUNT_MARKER))
        {
            return Ok(RawResponse::Missing);
        }
        if !status.is_success() {
            return Err(ApiError { status, body: text }.into());
        }
        Ok(RawResponse::Body(text))
    }

    async fn get_json<T: DeserializeOwned + 'static>(
        &self,
        path: &str,
        use_token: bool,
    ) -> Result<T> {
        let url = self.endpoint(path);
        let mut request = self.client.get(url);
        if use_token {
            request = request.header(VAULT_TOKEN_HEADER, self.require_token()?.expose());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Secrets backend request failed: {path}"))?;
        Self::parse_response(response)
            .await
            .with_context(|| format!("Secrets backend response parse failed: {path}"))
    }

    async fn post_json<T: Serialize, R: DeserializeOwned + 'static>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<R> {
        let url = self.endpoint(path);
        let token = self.require_token()?;
        let response = self
            .client
            .post(url)
            .header(VAULT_TOKEN_HEADER, token.expose())
            .json(body)
            .send()
            .await
            .with_context(|| format!("Secrets backend request failed: {path}"))?;
        Self::parse_response(response)
            .await
            .with_context(|| format!("Secrets backend response parse failed: {path}"))
    }

    async fn parse_response<T: DeserializeOwned + 'static>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let text = response
            .text()
            .await
            .context("Failed to read secrets backend response body")?;
        if !status.is_success() {
            return Err(ApiError { status, body: text }.into());
        }
        if text.trim().is_empty() {
            let parsed = serde_json::from_str("null")
                .context("Failed to parse empty secrets backend response")?;
            return Ok(parsed);
        }
        match serde_json::from_str(&text) {
            Ok(parsed) => Ok(parsed),
            Err(err) => {
                if TypeId::of::<T>() == TypeId::of::<()>() {
                    let parsed = serde_json::from_str("null")
                        .context("Failed to parse secrets backend response as unit")?;
                    Ok(parsed)
                } else {
                    Err(err).context("Failed to parse secrets backend response")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_rejects_short_values() {
        let err = VaultToken::parse("hvs.short").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidToken(_)));
    }

    #[test]
    fn test_token_accepts_minimum_length_and_trims() {
        let raw = format!("  {}\n", "a".repeat(MIN_TOKEN_LEN));
        let token = VaultToken::parse(&raw).unwrap();
        assert_eq!(token.expose().len(), MIN_TOKEN_LEN);
    }

    #[test]
    fn test_token_rejects_one_below_minimum() {
        let raw = "a".repeat(MIN_TOKEN_LEN - 1);
        assert!(VaultToken::parse(&raw).is_err());
    }

    #[test]
    fn test_token_rejects_embedded_whitespace() {
        let raw = format!("hvs.{} tail", "x".repeat(MIN_TOKEN_LEN));
        assert!(VaultToken::parse(&raw).is_err());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let token = VaultToken::parse("hvs.CAESIJabcdefghijklmnopqrstuvwxyz").unwrap();
        assert_eq!(format!("{token:?}"), "VaultToken(<redacted>)");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = VaultClient::new("http://vault:8200/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url(), "http://vault:8200");
        assert_eq!(client.endpoint("sys/health"), "http://vault:8200/v1/sys/health");
    }

    #[test]
    fn test_is_transient_only_for_server_errors() {
        let server = anyhow::Error::from(ApiError {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        })
        .context("Secrets backend request failed: secret/data/postgres");
        assert!(is_transient(&server));

        let denied = anyhow::Error::from(ApiError {
            status: StatusCode::FORBIDDEN,
            body: "permission denied".to_string(),
        });
        assert!(!is_transient(&denied));

        let missing = anyhow::Error::from(PipelineError::NotFound {
            what: "credential record",
            location: "secret/postgres".to_string(),
        });
        assert!(!is_transient(&missing));
    }
}
