//! Identity backend selection.

use serde::{Deserialize, Serialize};

/// Which identity backend provisioning requests run against.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// AWS IAM, STS and IAM Identity Center. Requires the `backend-aws` feature.
    #[cfg(feature = "backend-aws")]
    Aws(AwsBackendConfig),

    /// In-process backend that keeps all state in memory. Nothing leaves the process;
    /// useful for rehearsing a provisioning run.
    Memory(MemoryBackendConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        #[cfg(feature = "backend-aws")]
        {
            BackendConfig::Aws(AwsBackendConfig::default())
        }
        #[cfg(not(feature = "backend-aws"))]
        {
            BackendConfig::Memory(MemoryBackendConfig::default())
        }
    }
}

impl BackendConfig {
    pub fn partition(&self) -> &str {
        match self {
            #[cfg(feature = "backend-aws")]
            BackendConfig::Aws(aws) => &aws.partition,
            BackendConfig::Memory(memory) => &memory.partition,
        }
    }

    /// Explicitly configured account id, if any.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            #[cfg(feature = "backend-aws")]
            BackendConfig::Aws(aws) => aws.account_id.as_deref(),
            BackendConfig::Memory(memory) => Some(&memory.account_id),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.partition().trim().is_empty() {
            return Err("backend.partition must not be empty".into());
        }
        if let Some(account_id) = self.account_id()
            && !(account_id.len() == 12 && account_id.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(format!(
                "backend.account_id '{account_id}' is not a 12-digit AWS account id"
            ));
        }
        Ok(())
    }
}

/// AWS backend configuration.
///
/// Credentials come from the standard AWS provider chain (environment, shared
/// profile, SSO, instance metadata).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsBackendConfig {
    /// AWS region. Falls back to the provider chain when unset.
    #[serde(default)]
    pub region: Option<String>,

    /// Named profile from the shared config files.
    #[serde(default)]
    pub profile: Option<String>,

    /// Custom endpoint URL for all clients (LocalStack and similar).
    #[serde(default)]
    pub endpoint_url: Option<String>,

    /// ARN partition ("aws", "aws-cn", "aws-us-gov").
    #[serde(default = "default_partition")]
    pub partition: String,

    /// Account id used for ARNs and credential cache file names.
    /// Looked up with STS GetCallerIdentity when unset.
    #[serde(default)]
    pub account_id: Option<String>,
}

impl Default for AwsBackendConfig {
    fn default() -> Self {
        Self {
            region: None,
            profile: None,
            endpoint_url: None,
            partition: default_partition(),
            account_id: None,
        }
    }
}

/// In-memory backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryBackendConfig {
    #[serde(default = "default_memory_account_id")]
    pub account_id: String,

    #[serde(default = "default_partition")]
    pub partition: String,

    /// Identity Center instance to pre-create, if any.
    #[serde(default)]
    pub sso_instance_arn: Option<String>,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            account_id: default_memory_account_id(),
            partition: default_partition(),
            sso_instance_arn: None,
        }
    }
}

fn default_partition() -> String {
    "aws".to_string()
}

fn default_memory_account_id() -> String {
    "123456789012".to_string()
}
