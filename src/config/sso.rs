use serde::{Deserialize, Serialize};

/// IAM Identity Center configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SsoConfig {
    /// Instance to operate on. When unset, the first instance the backend
    /// reports is used.
    #[serde(default)]
    pub instance_arn: Option<String>,
}
