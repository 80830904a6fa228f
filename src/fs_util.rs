use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::PipelineError;

pub const KEY_FILE_MODE: u32 = 0o600;
pub const READ_ONLY_KEY_MODE: u32 = 0o400;
pub const SECRETS_DIR_MODE: u32 = 0o700;
pub const PUBLIC_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Written,
    Unchanged,
}

/// Ensures the secrets directory exists and has secure permissions.
///
/// # Errors
/// Returns an error if the directory cannot be created or permissions cannot be set.
pub async fn ensure_secrets_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create secrets dir {}", path.display()))?;
    set_mode(path, SECRETS_DIR_MODE).await
}

/// # Errors
/// Returns an error if permissions cannot be set.
pub async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("Failed to set permissions on {}", path.display()))
}

/// Permission bits of `path`, `None` if it does not exist.
///
/// # Errors
/// Returns an error if metadata cannot be read for another reason.
pub async fn file_mode(path: &Path) -> Result<Option<u32>> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(Some(meta.permissions().mode() & 0o777)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to stat {}", path.display())),
    }
}

/// Accepts only owner-only modes (600 or 400) for key material.
///
/// # Errors
/// Returns [`PipelineError::NotFound`] when the file is missing and
/// [`PipelineError::PermissionViolation`] for any other mode.
pub async fn check_secure_mode(path: &Path) -> Result<()> {
    let Some(mode) = file_mode(path).await? else {
        return Err(PipelineError::NotFound {
            what: "certificate material",
            location: path.display().to_string(),
        }
        .into());
    };
    if mode != KEY_FILE_MODE && mode != READ_ONLY_KEY_MODE {
        return Err(PipelineError::PermissionViolation {
            path: path.to_path_buf(),
            mode,
        }
        .into());
    }
    Ok(())
}

/// Writes `contents` with mode 600 via a temp file and rename, so readers
/// never observe a partial file or a loose mode.
///
/// # Errors
/// Returns an error if the parent cannot be prepared or the write fails.
pub async fn write_secret_atomic(path: &Path, contents: &[u8]) -> Result<WriteStatus> {
    write_atomic(path, contents, KEY_FILE_MODE, true).await
}

/// Writes a world-readable file (CA chains). The parent directory is
/// created but its mode is left alone.
///
/// # Errors
/// Returns an error if the write fails.
pub async fn write_public_file(path: &Path, contents: &[u8]) -> Result<WriteStatus> {
    write_atomic(path, contents, PUBLIC_FILE_MODE, false).await
}

async fn write_atomic(
    path: &Path,
    contents: &[u8],
    mode: u32,
    secure_parent: bool,
) -> Result<WriteStatus> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .ok_or_else(|| anyhow::anyhow!("Path {} has no parent directory", path.display()))?;
    if secure_parent {
        ensure_secrets_dir(parent).await?;
    } else {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create dir {}", parent.display()))?;
    }

    let current = fs::read(path).await.ok();
    if current.as_deref() == Some(contents) {
        set_mode(path, mode).await?;
        return Ok(WriteStatus::Unchanged);
    }

    let temp_path = temp_path_for(path);
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(&temp_path)
        .await
        .with_context(|| format!("Failed to create {}", temp_path.display()))?;
    let written = async {
        file.write_all(contents).await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("Failed to write {}", temp_path.display()));
    }
    // umask may have narrowed the create mode
    set_mode(&temp_path, mode).await?;
    fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(WriteStatus::Written)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let pid = std::process::id();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0);
    let file_name = path.file_name().map_or_else(
        || "secret".to_string(),
        |name| name.to_string_lossy().to_string(),
    );
    path.with_file_name(format!(".{file_name}.tmp.{pid}.{nanos}"))
}
