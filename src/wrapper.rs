//! Credential client: waits for the backend, fetches one service's record,
//! validates its certificate bundle and hands off to the real entrypoint.

pub mod adapters;
pub mod handoff;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::certs::{self, BundlePaths};
use crate::config::{ClientSettings, HandoffMode};
use crate::credentials::CredentialRecord;
use crate::error::{BackendState, PipelineError};
use crate::fs_util;
use crate::seeder::read_credential;
use crate::utils::{Attempt, WaitOutcome, wait_until_ready};
use crate::vault::VaultClient;

use adapters::{AdapterContext, FileContents, LaunchPlan, TlsMaterial};
use handoff::RuntimeUser;

const STAGED_TLS_DIR: &str = "tls";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientPhase {
    WaitingForBackend,
    CredentialsFetched,
    CertsValidated,
    Configured,
    PrivilegeDropped,
    Handoff,
}

impl fmt::Display for ClientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientPhase::WaitingForBackend => "waiting-for-backend",
            ClientPhase::CredentialsFetched => "credentials-fetched",
            ClientPhase::CertsValidated => "certs-validated",
            ClientPhase::Configured => "configured",
            ClientPhase::PrivilegeDropped => "privilege-dropped",
            ClientPhase::Handoff => "handoff",
        };
        f.write_str(label)
    }
}

/// Everything resolved before handoff.
#[derive(Debug)]
pub struct Prepared {
    pub plan: LaunchPlan,
    pub user: Option<RuntimeUser>,
}

pub struct CredentialClient {
    settings: ClientSettings,
    client: VaultClient,
    phase: ClientPhase,
}

impl CredentialClient {
    /// Resolves the token and builds the HTTP client. No request is sent.
    ///
    /// # Errors
    /// Returns [`PipelineError::InvalidToken`] for a missing or malformed
    /// token.
    pub fn new(settings: ClientSettings) -> Result<Self> {
        let token = settings.resolve_token()?;
        let mut client = VaultClient::new(&settings.vault_addr, settings.request_timeout())?;
        client.set_token(token);
        client.set_retry_policy(settings.retry.policy());
        Ok(Self {
            settings,
            client,
            phase: ClientPhase::WaitingForBackend,
        })
    }

    #[must_use]
    pub fn phase(&self) -> ClientPhase {
        self.phase
    }

    fn enter(&mut self, phase: ClientPhase) {
        info!("Credential client phase: {phase}");
        self.phase = phase;
    }

    /// Runs every step up to handoff.
    ///
    /// # Errors
    /// Returns the [`PipelineError`] of the step that failed; the
    /// entrypoint is never started in that case.
    pub async fn prepare(&mut self) -> Result<Prepared> {
        self.enter(ClientPhase::WaitingForBackend);
        self.wait_for_backend().await?;

        let service = self.settings.service.clone();
        let (client, kv_mount) = (&self.client, self.settings.kv_mount.as_str());
        let (_, record) = client
            .retrying(|| read_credential(client, kv_mount, &service))
            .await?;
        self.enter(ClientPhase::CredentialsFetched);

        let user = self
            .settings
            .run_as
            .as_deref()
            .map(RuntimeUser::lookup)
            .transpose()?;
        if let Some(user) = &user {
            handoff::check_can_switch(user)?;
        }

        if self.settings.require_tls && !record.tls_enabled {
            return Err(PipelineError::SchemaMismatch {
                path: format!("{}/{service}", self.settings.kv_mount),
                reason: "tls_enabled is false but this client requires TLS".to_string(),
            }
            .into());
        }
        let tls = if record.tls_enabled {
            let paths = BundlePaths::in_dir(&self.settings.cert_dir);
            validate_bundle(&paths).await?;
            Some(self.stage_bundle(paths, user.as_ref()).await?)
        } else {
            info!("TLS disabled for {service}; skipping certificate checks");
            None
        };
        self.enter(ClientPhase::CertsValidated);

        let plan = self.build_plan(&record, tls.as_ref());
        self.write_files(&plan, user.as_ref()).await?;
        self.enter(ClientPhase::Configured);
        Ok(Prepared { plan, user })
    }

    /// Starts the entrypoint as configured and returns the exit code to
    /// mirror. In exec mode this only returns on failure.
    ///
    /// # Errors
    /// Returns an error if the entrypoint cannot be started.
    pub async fn handoff(&mut self, prepared: &Prepared, command: &[String]) -> Result<i32> {
        if prepared.user.is_some() {
            self.enter(ClientPhase::PrivilegeDropped);
        }
        self.enter(ClientPhase::Handoff);
        match self.settings.handoff {
            HandoffMode::Exec => {
                handoff::exec_entrypoint(command, &prepared.plan, prepared.user.as_ref())?;
                Ok(0)
            }
            HandoffMode::Supervise => {
                handoff::supervise_entrypoint(command, &prepared.plan, prepared.user.as_ref()).await
            }
        }
    }

    async fn wait_for_backend(&self) -> Result<()> {
        let policy = self.settings.retry.policy();
        let client = &self.client;
        let outcome = wait_until_ready(policy, |_| async move {
            match client.health().await {
                Ok(BackendState::Unsealed | BackendState::Standby) => Attempt::Ready(()),
                Ok(BackendState::Sealed) => Attempt::Retry(
                    PipelineError::NotReady {
                        state: BackendState::Sealed,
                        hint: "run `devstack-secrets unseal`",
                    }
                    .into(),
                ),
                Ok(BackendState::Uninitialized) => Attempt::Fail(
                    PipelineError::NotReady {
                        state: BackendState::Uninitialized,
                        hint: "run `devstack-secrets init` and `devstack-secrets bootstrap`",
                    }
                    .into(),
                ),
                Err(err) => Attempt::Retry(err),
            }
        })
        .await;

        match outcome {
            WaitOutcome::Ready(()) => Ok(()),
            WaitOutcome::Error(err) => Err(err),
            WaitOutcome::TimedOut {
                attempts,
                last_error,
            } => match last_error {
                Some(err)
                    if matches!(
                        err.downcast_ref::<PipelineError>(),
                        Some(PipelineError::NotReady { .. })
                    ) =>
                {
                    Err(err)
                }
                other => Err(PipelineError::Unreachable {
                    addr: self.settings.vault_addr.clone(),
                    attempts,
                    reason: other.map_or_else(|| "no response".to_string(), |err| format!("{err:#}")),
                }
                .into()),
            },
        }
    }

    /// Without a user switch the bundle is used in place. With one, a
    /// private copy owned by the runtime user is placed under the runtime
    /// directory.
    async fn stage_bundle(&self, paths: BundlePaths, user: Option<&RuntimeUser>) -> Result<TlsMaterial> {
        let Some(user) = user.filter(|user| user.needs_switch()) else {
            return Ok(TlsMaterial {
                cert: paths.cert,
                key: paths.key,
                ca: paths.ca,
            });
        };
        let staged_dir = self.settings.runtime_dir.join(STAGED_TLS_DIR);
        prepare_runtime_dir(&self.settings.runtime_dir, Some(user)).await?;
        prepare_runtime_dir(&staged_dir, Some(user)).await?;
        let staged = BundlePaths::in_dir(&staged_dir);
        for (from, to) in paths.all().into_iter().zip(staged.all()) {
            let contents = tokio::fs::read(from)
                .await
                .with_context(|| format!("Failed to read {}", from.display()))?;
            fs_util::write_secret_atomic(to, &contents).await?;
            handoff::chown_to(to, user)?;
        }
        info!("Staged certificate bundle for {} in {}", user.name, staged_dir.display());
        Ok(TlsMaterial {
            cert: staged.cert,
            key: staged.key,
            ca: staged.ca,
        })
    }

    fn build_plan(&self, record: &CredentialRecord, tls: Option<&TlsMaterial>) -> LaunchPlan {
        let ctx = AdapterContext {
            record,
            tls,
            require_tls: self.settings.require_tls,
            runtime_dir: &self.settings.runtime_dir,
        };
        adapters::plan_for(self.settings.service_kind(), &ctx)
    }

    async fn write_files(&self, plan: &LaunchPlan, user: Option<&RuntimeUser>) -> Result<()> {
        if plan.files.is_empty() {
            return Ok(());
        }
        let user = user.filter(|user| user.needs_switch());
        prepare_runtime_dir(&self.settings.runtime_dir, user).await?;
        for file in &plan.files {
            let contents = match &file.contents {
                FileContents::Text(text) => text.clone().into_bytes(),
                FileContents::Concat(parts) => concat_files(parts).await?,
            };
            fs_util::write_secret_atomic(&file.path, &contents).await?;
            if let Some(user) = user {
                handoff::chown_to(&file.path, user)?;
            }
        }
        Ok(())
    }
}

/// Cert, key and CA must all exist with an owner-only mode. An expiring
/// certificate only produces a warning.
///
/// # Errors
/// Returns [`PipelineError::NotFound`] or [`PipelineError::PermissionViolation`].
pub async fn validate_bundle(paths: &BundlePaths) -> Result<()> {
    for path in paths.all() {
        fs_util::check_secure_mode(path).await?;
    }
    let cert = tokio::fs::read(&paths.cert)
        .await
        .with_context(|| format!("Failed to read {}", paths.cert.display()))?;
    let not_after = certs::parse_cert_not_after(&cert)?;
    let now = time::OffsetDateTime::now_utc();
    if not_after <= now {
        warn!("Certificate {} expired at {not_after}", paths.cert.display());
    } else if certs::expires_within(not_after, std::time::Duration::from_secs(7 * 86_400), now)? {
        warn!("Certificate {} expires at {not_after}", paths.cert.display());
    }
    Ok(())
}

async fn prepare_runtime_dir(dir: &Path, user: Option<&RuntimeUser>) -> Result<()> {
    fs_util::ensure_secrets_dir(dir).await?;
    if let Some(user) = user {
        handoff::chown_to(dir, user)?;
    }
    Ok(())
}

async fn concat_files(parts: &[PathBuf]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for part in parts {
        let bytes = tokio::fs::read(part)
            .await
            .with_context(|| format!("Failed to read {}", part.display()))?;
        out.extend_from_slice(&bytes);
        if !bytes.ends_with(b"\n") {
            out.push(b'\n');
        }
    }
    Ok(out)
}
