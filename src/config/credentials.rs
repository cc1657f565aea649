use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Local credential cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialsConfig {
    /// Directory holding `{user}_{account}_accessKeys.csv` files.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Unix permission bits for cache files.
    #[serde(default = "default_file_mode")]
    pub file_mode: u32,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            file_mode: default_file_mode(),
        }
    }
}

impl CredentialsConfig {
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.file_mode & 0o077 != 0 {
            return Err(format!(
                "credentials.file_mode {:o} grants access beyond the owner; secret keys must be owner-only",
                self.file_mode
            ));
        }
        if self.file_mode & 0o600 != 0o600 {
            return Err(format!(
                "credentials.file_mode {:o} must allow the owner to read and write",
                self.file_mode
            ));
        }
        Ok(())
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_file_mode() -> u32 {
    0o600
}
