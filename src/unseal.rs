//! Brings a sealed backend to unsealed using the persisted threshold shares.
//!
//! The coordinator is one-shot: once the backend reports unsealed it stops
//! polling and never re-seals or recovers from a later manual seal.

use std::fmt;
use std::future::Future;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::error::{BackendState, PipelineError};
use crate::materials::UnsealKeySet;
use crate::utils::{Attempt, RetryPolicy, WaitOutcome, wait_until_ready};
use crate::vault::VaultClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsealPhase {
    Starting,
    WaitingForHealth,
    AwaitingInitialization,
    SubmittingShares,
    UnsealedIdle,
}

impl fmt::Display for UnsealPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            UnsealPhase::Starting => "starting",
            UnsealPhase::WaitingForHealth => "waiting-for-health",
            UnsealPhase::AwaitingInitialization => "awaiting-initialization",
            UnsealPhase::SubmittingShares => "submitting-shares",
            UnsealPhase::UnsealedIdle => "unsealed-idle",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsealOutcome {
    /// Backend has never been initialized; nothing was done.
    AwaitingInitialization,
    AlreadyUnsealed,
    Unsealed { submitted: u32 },
}

pub struct UnsealCoordinator<'a> {
    client: &'a VaultClient,
    policy: RetryPolicy,
    phase: UnsealPhase,
}

impl<'a> UnsealCoordinator<'a> {
    #[must_use]
    pub fn new(client: &'a VaultClient, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            phase: UnsealPhase::Starting,
        }
    }

    #[must_use]
    pub fn phase(&self) -> UnsealPhase {
        self.phase
    }

    /// Runs the coordinator. `load_keys` is only called when the backend is
    /// sealed, so an uninitialized backend needs no key file.
    ///
    /// # Errors
    /// Returns [`PipelineError::Unreachable`] when health polling exhausts
    /// its budget, [`PipelineError::NotFound`] when the key set holds fewer
    /// shares than still required, and any backend error while unsealing.
    pub async fn run<L, Fut>(&mut self, load_keys: L) -> Result<UnsealOutcome>
    where
        L: FnOnce() -> Fut,
        Fut: Future<Output = Result<UnsealKeySet>>,
    {
        self.enter(UnsealPhase::WaitingForHealth);
        let state = wait_for_health(self.client, self.policy).await?;
        match state {
            BackendState::Uninitialized => {
                self.enter(UnsealPhase::AwaitingInitialization);
                Ok(UnsealOutcome::AwaitingInitialization)
            }
            BackendState::Unsealed | BackendState::Standby => {
                self.enter(UnsealPhase::UnsealedIdle);
                Ok(UnsealOutcome::AlreadyUnsealed)
            }
            BackendState::Sealed => {
                let keys = load_keys().await?;
                self.enter(UnsealPhase::SubmittingShares);
                let submitted = self.submit_shares(&keys).await?;
                self.enter(UnsealPhase::UnsealedIdle);
                Ok(UnsealOutcome::Unsealed { submitted })
            }
        }
    }

    async fn submit_shares(&self, keys: &UnsealKeySet) -> Result<u32> {
        let status = self.client.seal_status().await?;
        if !status.sealed {
            return Ok(0);
        }
        let threshold = status.t.unwrap_or_else(|| keys.threshold());
        let progress = status.progress.unwrap_or(0);
        let needed = threshold.saturating_sub(progress);
        let available = u32::try_from(keys.shares().len()).unwrap_or(u32::MAX);
        if available < needed {
            return Err(PipelineError::NotFound {
                what: "unseal shares",
                location: format!("{available} available, {needed} more required"),
            }
            .into());
        }

        let mut submitted = 0u32;
        let mut last_progress = progress;
        for share in keys.shares() {
            submitted += 1;
            info!("Submitting unseal share {submitted}/{needed}");
            let status = self
                .client
                .unseal(share)
                .await
                .with_context(|| format!("Unseal share {submitted} was rejected"))?;
            if !status.sealed {
                break;
            }
            let current = status.progress.unwrap_or(0);
            if current < last_progress {
                anyhow::bail!("Unseal progress was reset; a share may be invalid");
            }
            if current == last_progress {
                debug!("Share {submitted} did not advance unseal progress");
            }
            last_progress = current;
        }

        let final_status = self.client.seal_status().await?;
        if final_status.sealed {
            return Err(PipelineError::NotReady {
                state: BackendState::Sealed,
                hint: "all available unseal shares were submitted but the backend is still sealed",
            }
            .into());
        }
        info!("Backend unsealed after {submitted} share(s)");
        Ok(submitted)
    }

    fn enter(&mut self, phase: UnsealPhase) {
        debug!("Unseal coordinator: {} -> {phase}", self.phase);
        self.phase = phase;
    }
}

/// Polls health until the backend answers with any known state.
///
/// # Errors
/// Returns [`PipelineError::Unreachable`] when the retry budget runs out.
pub async fn wait_for_health(client: &VaultClient, policy: RetryPolicy) -> Result<BackendState> {
    let outcome = wait_until_ready(policy, |_| async {
        match client.health().await {
            Ok(state) => Attempt::Ready(state),
            Err(err) => Attempt::Retry(err),
        }
    })
    .await;
    match outcome {
        WaitOutcome::Ready(state) => Ok(state),
        WaitOutcome::TimedOut {
            attempts,
            last_error,
        } => Err(PipelineError::Unreachable {
            addr: client.base_url().to_string(),
            attempts,
            reason: last_error.map_or_else(|| "no response".to_string(), |err| format!("{err:#}")),
        }
        .into()),
        WaitOutcome::Error(err) => Err(err),
    }
}
