use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PipelineError;
use crate::fs_util;
use crate::vault::{InitResponse, VaultToken};

const KEYS_FILE: &str = "keys.json";
const ROOT_TOKEN_FILE: &str = "root-token";

/// Threshold shares produced at initialization. Never mutated.
#[derive(Clone)]
pub struct UnsealKeySet {
    shares: Vec<String>,
    threshold: u32,
}

impl UnsealKeySet {
    #[must_use]
    pub fn new(shares: Vec<String>, threshold: u32) -> Self {
        Self { shares, threshold }
    }

    #[must_use]
    pub fn shares(&self) -> &[String] {
        &self.shares
    }

    #[must_use]
    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl fmt::Debug for UnsealKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealKeySet")
            .field("shares", &self.shares.len())
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// Full-privilege backend credential, only for bootstrap commands.
#[derive(Clone)]
pub struct RootToken(VaultToken);

impl RootToken {
    #[must_use]
    pub fn token(&self) -> &VaultToken {
        &self.0
    }
}

impl fmt::Debug for RootToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootToken(<redacted>)")
    }
}

#[derive(Serialize, Deserialize)]
struct KeysFile {
    unseal_keys_b64: Vec<String>,
    #[serde(default)]
    unseal_keys_hex: Vec<String>,
    unseal_shares: u32,
    unseal_threshold: u32,
    root_token: String,
}

/// Host-side key material, loaded once and passed to the components that
/// need it.
#[derive(Debug, Clone)]
pub struct BootstrapMaterials {
    pub unseal_keys: UnsealKeySet,
    pub root_token: RootToken,
    pub keys_dir: PathBuf,
}

impl BootstrapMaterials {
    /// Loads `keys.json` (and `root-token` when present) from `keys_dir`.
    ///
    /// # Errors
    /// Returns [`PipelineError::NotFound`] when the key file is missing, and
    /// an error when it cannot be parsed or holds an unusable token.
    pub async fn load(keys_dir: &Path) -> Result<Self> {
        let keys_path = keys_dir.join(KEYS_FILE);
        let Some(mode) = fs_util::file_mode(&keys_path).await? else {
            return Err(PipelineError::NotFound {
                what: "unseal key file",
                location: keys_path.display().to_string(),
            })
            .context("Run `devstack-secrets init` first");
        };
        if mode & 0o077 != 0 {
            warn!(
                "{} has mode {mode:03o}; expected 600",
                keys_path.display()
            );
        }
        let contents = tokio::fs::read_to_string(&keys_path)
            .await
            .with_context(|| format!("Failed to read {}", keys_path.display()))?;
        let parsed: KeysFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", keys_path.display()))?;

        let shares: Vec<String> = if parsed.unseal_keys_b64.is_empty() {
            parsed.unseal_keys_hex
        } else {
            parsed.unseal_keys_b64
        };
        if shares.is_empty() {
            anyhow::bail!("{} contains no unseal shares", keys_path.display());
        }

        let token_path = keys_dir.join(ROOT_TOKEN_FILE);
        let raw_token = match tokio::fs::read_to_string(&token_path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => parsed.root_token,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read {}", token_path.display()));
            }
        };
        let token = VaultToken::parse(&raw_token)
            .with_context(|| format!("Root token in {} is unusable", keys_dir.display()))?;

        Ok(Self {
            unseal_keys: UnsealKeySet::new(shares, parsed.unseal_threshold),
            root_token: RootToken(token),
            keys_dir: keys_dir.to_path_buf(),
        })
    }

    /// Persists a fresh initialization result as `keys.json` and `root-token`.
    ///
    /// # Errors
    /// Returns an error if `keys.json` already exists or a write fails.
    pub async fn persist(
        keys_dir: &Path,
        init: &InitResponse,
        shares: u32,
        threshold: u32,
    ) -> Result<Self> {
        let keys_path = keys_dir.join(KEYS_FILE);
        if fs_util::file_mode(&keys_path).await?.is_some() {
            anyhow::bail!(
                "{} already exists; refusing to overwrite unseal keys",
                keys_path.display()
            );
        }
        let token = VaultToken::parse(&init.root_token)
            .context("Backend returned an unusable root token")?;
        let file = KeysFile {
            unseal_keys_b64: init.keys_base64.clone(),
            unseal_keys_hex: init.keys.clone(),
            unseal_shares: shares,
            unseal_threshold: threshold,
            root_token: init.root_token.clone(),
        };
        let payload = serde_json::to_vec_pretty(&file).context("Failed to serialize keys")?;

        fs_util::ensure_secrets_dir(keys_dir).await?;
        fs_util::write_secret_atomic(&keys_path, &payload).await?;
        fs_util::write_secret_atomic(
            &keys_dir.join(ROOT_TOKEN_FILE),
            format!("{}\n", token.expose()).as_bytes(),
        )
        .await?;

        let shares_list = if file.unseal_keys_b64.is_empty() {
            file.unseal_keys_hex
        } else {
            file.unseal_keys_b64
        };
        Ok(Self {
            unseal_keys: UnsealKeySet::new(shares_list, threshold),
            root_token: RootToken(token),
            keys_dir: keys_dir.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    const TOKEN: &str = "hvs.rootrootrootrootroot";

    fn init_response() -> InitResponse {
        serde_json::from_value(serde_json::json!({
            "keys": ["aa01", "aa02", "aa03", "aa04", "aa05"],
            "keys_base64": ["qgE=", "qgI=", "qgM=", "qgQ=", "qgU="],
            "root_token": TOKEN,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let dir = tempdir().unwrap();
        let keys_dir = dir.path().join("vault");

        BootstrapMaterials::persist(&keys_dir, &init_response(), 5, 3)
            .await
            .unwrap();
        let loaded = BootstrapMaterials::load(&keys_dir).await.unwrap();

        assert_eq!(loaded.unseal_keys.shares().len(), 5);
        assert_eq!(loaded.unseal_keys.shares()[0], "qgE=");
        assert_eq!(loaded.unseal_keys.threshold(), 3);
        assert_eq!(loaded.root_token.token().expose(), TOKEN);

        for name in [KEYS_FILE, ROOT_TOKEN_FILE] {
            let mode = std::fs::metadata(keys_dir.join(name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(mode, 0o600, "{name}");
        }
        let dir_mode = std::fs::metadata(&keys_dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[tokio::test]
    async fn test_persist_refuses_existing_keys() {
        let dir = tempdir().unwrap();
        BootstrapMaterials::persist(dir.path(), &init_response(), 5, 3)
            .await
            .unwrap();
        let err = BootstrapMaterials::persist(dir.path(), &init_response(), 5, 3)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let err = BootstrapMaterials::load(dir.path()).await.unwrap_err();
        assert_eq!(
            crate::error::exit_code_for(&err),
            crate::error::EXIT_NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_root_token_file_wins_over_keys_json() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(KEYS_FILE),
            serde_json::json!({
                "unseal_keys_b64": ["k1", "k2", "k3"],
                "unseal_shares": 3,
                "unseal_threshold": 2,
                "root_token": "hvs.stalestalestalestalestale",
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(dir.path().join(ROOT_TOKEN_FILE), format!("{TOKEN}\n")).unwrap();

        let loaded = BootstrapMaterials::load(dir.path()).await.unwrap();
        assert_eq!(loaded.root_token.token().expose(), TOKEN);
    }

    #[test]
    fn test_debug_hides_shares() {
        let keys = UnsealKeySet::new(vec!["secret-share".to_string()], 1);
        assert!(!format!("{keys:?}").contains("secret-share"));
    }
}
