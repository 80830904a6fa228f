use std::fmt;

use anyhow::Result;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::PipelineError;
use crate::services::ServiceSpec;

/// 32 random bytes, 43 base64-url characters.
pub const PASSWORD_BYTES: usize = 32;

/// Credentials for one managed service as stored in the KV store.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(default, alias = "admin_user")]
    pub user: Option<String>,
    #[serde(alias = "admin_password")]
    pub password: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default, alias = "admin_email")]
    pub email: Option<String>,
    #[serde(deserialize_with = "deserialize_tls_flag")]
    pub tls_enabled: bool,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("email", &self.email)
            .field("tls_enabled", &self.tls_enabled)
            .finish()
    }
}

impl CredentialRecord {
    /// Builds a record following the service's naming conventions.
    #[must_use]
    pub fn for_service(spec: &ServiceSpec, password: String, tls_enabled: bool) -> Self {
        Self {
            user: spec.user.clone(),
            password,
            database: spec.database.clone(),
            email: spec.email.clone(),
            tls_enabled,
        }
    }

    /// Parses a KV payload read from `path`.
    ///
    /// # Errors
    /// Returns [`PipelineError::SchemaMismatch`] when a required field is
    /// missing, has the wrong type, or the password is empty.
    pub fn from_value(path: &str, value: serde_json::Value) -> Result<Self, PipelineError> {
        let record: Self =
            serde_json::from_value(value).map_err(|err| PipelineError::SchemaMismatch {
                path: path.to_string(),
                reason: describe_serde_error(&err),
            })?;
        if record.password.is_empty() {
            return Err(PipelineError::SchemaMismatch {
                path: path.to_string(),
                reason: "password is empty".to_string(),
            });
        }
        Ok(record)
    }

    /// # Errors
    /// Returns an error if serialization fails.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Generates a URL-safe random password.
///
/// # Errors
/// Returns an error if the system RNG fails.
pub fn generate_password() -> Result<String> {
    let mut buffer = [0u8; PASSWORD_BYTES];
    SystemRandom::new()
        .fill(&mut buffer)
        .map_err(|_| anyhow::anyhow!("Failed to generate random password"))?;
    Ok(URL_SAFE_NO_PAD.encode(buffer))
}

// serde_json error text can quote the offending value; keep only the shape.
fn describe_serde_error(err: &serde_json::Error) -> String {
    let text = err.to_string();
    if let Some(field) = text
        .strip_prefix("missing field `")
        .and_then(|rest| rest.split('`').next())
    {
        return format!("missing field {field}");
    }
    match text.find("expected") {
        Some(index) => format!("invalid value, {}", &text[index..]),
        None => "invalid record".to_string(),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TlsFlag {
    Bool(bool),
    Text(String),
}

fn deserialize_tls_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match TlsFlag::deserialize(deserializer)? {
        TlsFlag::Bool(value) => Ok(value),
        TlsFlag::Text(text) => match text.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(serde::de::Error::custom(
                "tls_enabled expected a boolean or \"true\"/\"false\"",
            )),
        },
    }
}
