use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub const EXIT_GENERIC: i32 = 1;
pub const EXIT_SCHEMA_MISMATCH: i32 = 65;
pub const EXIT_NOT_FOUND: i32 = 66;
pub const EXIT_UNREACHABLE: i32 = 69;
pub const EXIT_NOT_READY: i32 = 75;
pub const EXIT_PERMISSION_VIOLATION: i32 = 77;
pub const EXIT_INVALID_TOKEN: i32 = 78;

/// Lifecycle state of the secrets backend as reported by its health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Sealed,
    Standby,
    Unsealed,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendState::Uninitialized => "uninitialized",
            BackendState::Sealed => "sealed",
            BackendState::Standby => "standby",
            BackendState::Unsealed => "unsealed",
        };
        f.write_str(label)
    }
}

/// Failures every pipeline component reports at its own boundary.
///
/// None of these are recovered from by another component; binaries map
/// them to distinct exit codes with [`exit_code_for`].
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("secrets backend at {addr} unreachable after {attempts} attempt(s): {reason}")]
    Unreachable {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("secrets backend is {state}; {hint}")]
    NotReady {
        state: BackendState,
        hint: &'static str,
    },

    #[error("{what} not found: {location}")]
    NotFound { what: &'static str, location: String },

    #[error("{} has mode {mode:03o}; only 600 or 400 is accepted", path.display())]
    PermissionViolation { path: PathBuf, mode: u32 },

    #[error("credential record at {path} is malformed: {reason}")]
    SchemaMismatch { path: String, reason: String },

    #[error("vault token rejected: {0}")]
    InvalidToken(&'static str),
}

impl PipelineError {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Unreachable { .. } => EXIT_UNREACHABLE,
            PipelineError::NotReady { .. } => EXIT_NOT_READY,
            PipelineError::NotFound { .. } => EXIT_NOT_FOUND,
            PipelineError::PermissionViolation { .. } => EXIT_PERMISSION_VIOLATION,
            PipelineError::SchemaMismatch { .. } => EXIT_SCHEMA_MISMATCH,
            PipelineError::InvalidToken(_) => EXIT_INVALID_TOKEN,
        }
    }
}

/// Picks the process exit code for an error chain.
///
/// The first [`PipelineError`] found in the chain wins; anything else maps to 1.
#[must_use]
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map_or(EXIT_GENERIC, PipelineError::exit_code)
}
