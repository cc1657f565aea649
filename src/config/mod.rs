//! Configuration for iam-provision.
//!
//! The tool is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [backend]
//! type = "aws"
//! region = "us-east-1"
//! profile = "${AWS_PROFILE}"
//!
//! [credentials]
//! cache_dir = "/var/lib/iam-provision/keys"
//!
//! [sso]
//! instance_arn = "arn:aws:sso:::instance/ssoins-1234567890abcdef"
//! ```

mod backend;
mod credentials;
mod observability;
mod sso;

use std::path::Path;

pub use backend::*;
pub use credentials::*;
pub use observability::*;
use serde::{Deserialize, Serialize};
pub use sso::*;

/// Root configuration.
///
/// All sections are optional with sensible defaults, so an empty file is a
/// valid configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionerConfig {
    /// Identity backend the provisioning requests run against.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Local access key cache.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// IAM Identity Center settings.
    #[serde(default)]
    pub sso: SsoConfig,

    /// Observability configuration (logging).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ProvisionerConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;

        // Pre-check: detect feature-gated backend types before typed deserialization
        // so the error names the missing feature instead of an unknown variant
        let raw: toml::Value = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        check_disabled_features(&raw)?;

        let config: ProvisionerConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.backend.validate().map_err(ConfigError::Validation)?;
        self.credentials
            .validate()
            .map_err(ConfigError::Validation)?;

        if let Some(arn) = &self.sso.instance_arn
            && !arn.contains(":instance/")
        {
            return Err(ConfigError::Validation(format!(
                "sso.instance_arn '{arn}' is not an Identity Center instance ARN"
            )));
        }

        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Check for feature-gated configuration values before typed deserialization.
fn check_disabled_features(raw: &toml::Value) -> Result<(), ConfigError> {
    let mut issues: Vec<(String, &str)> = Vec::new();

    if let Some(type_val) = raw
        .get("backend")
        .and_then(|v| v.get("type"))
        .and_then(|v| v.as_str())
    {
        check_backend_feature(type_val, &mut issues);
    }

    if issues.is_empty() {
        return Ok(());
    }

    let details = issues
        .iter()
        .map(|(msg, _)| msg.as_str())
        .collect::<Vec<_>>()
        .join("\n  - ");
    let features = issues
        .iter()
        .map(|(_, feat)| *feat)
        .collect::<Vec<_>>()
        .join(",");

    Err(ConfigError::Validation(format!(
        "Configuration requires features not compiled in this build:\n  \
         - {details}\n\n\
         Rebuild with: cargo build --features {features}\n\
         Or use the 'full' profile: cargo build --features full"
    )))
}

fn check_backend_feature(type_val: &str, _issues: &mut Vec<(String, &str)>) {
    match type_val {
        #[cfg(not(feature = "backend-aws"))]
        "aws" => _issues.push((
            "backend type 'aws' requires the 'backend-aws' feature".into(),
            "backend-aws",
        )),
        _ => {}
    }
}

/// Expand environment variables in the format `${VAR_NAME}`.
/// Skips commented lines (lines where content before the variable is a comment).
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            // Skip if this variable is inside a comment
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

/// Starter configuration written by `iam-provision init`.
pub const DEFAULT_CONFIG: &str = r#"# iam-provision configuration

[backend]
type = "aws"
# region = "us-east-1"
# profile = "default"
# account_id = "123456789012"

[credentials]
cache_dir = "."
file_mode = 0o600

[sso]
# instance_arn = "arn:aws:sso:::instance/ssoins-1234567890abcdef"

[observability.logging]
level = "info"
format = "compact"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config = ProvisionerConfig::from_str("").unwrap();
        assert_eq!(config.backend.partition(), "aws");
        assert_eq!(config.credentials.file_mode, 0o600);
        assert!(config.sso.instance_arn.is_none());
    }

    #[test]
    fn test_memory_config() {
        let config = ProvisionerConfig::from_str(
            r#"
            [backend]
            type = "memory"
            account_id = "111122223333"

            [credentials]
            cache_dir = "/tmp/keys"

            [sso]
            instance_arn = "arn:aws:sso:::instance/ssoins-1111111111111111"

            [observability.logging]
            format = "json"
        "#,
        )
        .unwrap();

        assert_eq!(config.backend.account_id(), Some("111122223333"));
        assert_eq!(config.credentials.cache_dir, std::path::PathBuf::from("/tmp/keys"));
        assert_eq!(config.observability.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_default_config_parses() {
        let config = ProvisionerConfig::from_str(DEFAULT_CONFIG);
        #[cfg(feature = "backend-aws")]
        assert!(config.is_ok(), "{:?}", config.err());
        #[cfg(not(feature = "backend-aws"))]
        assert!(config.is_err());
    }

    #[test]
    fn test_unknown_section_rejected() {
        let err = ProvisionerConfig::from_str("[server]\nport = 8080").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_invalid_instance_arn() {
        let err = ProvisionerConfig::from_str(
            r#"
            [backend]
            type = "memory"

            [sso]
            instance_arn = "ssoins-1111"
        "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_world_readable_cache_rejected() {
        let err = ProvisionerConfig::from_str(
            r#"
            [backend]
            type = "memory"

            [credentials]
            file_mode = 0o644
        "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("owner"));
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("TEST_AWS_PROFILE", Some("prod-admin"), || {
            let result = expand_env_vars("profile = \"${TEST_AWS_PROFILE}\"").unwrap();
            assert_eq!(result, "profile = \"prod-admin\"");
        });
    }

    #[test]
    fn test_missing_env_var() {
        temp_env::with_var_unset("TEST_UNSET_ACCOUNT", || {
            let err = ProvisionerConfig::from_str(
                "[backend]\ntype = \"memory\"\naccount_id = \"${TEST_UNSET_ACCOUNT}\"",
            )
            .unwrap_err();
            assert!(matches!(
                err,
                ConfigError::EnvVarNotFound(ref name) if name == "TEST_UNSET_ACCOUNT"
            ));
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let result = expand_env_vars("# profile = \"${NONEXISTENT_VAR}\"").unwrap();
        assert_eq!(result, "# profile = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_env_var_after_comment_ignored() {
        let result = expand_env_vars("region = \"eu-west-1\" # ${NONEXISTENT_VAR}").unwrap();
        assert_eq!(result, "region = \"eu-west-1\" # ${NONEXISTENT_VAR}");
    }

    #[test]
    fn test_multiline_with_comments() {
        temp_env::with_var("TEST_MULTI_REGION", Some("ap-south-1"), || {
            let input = r#"region = "${TEST_MULTI_REGION}"
# profile = "${NONEXISTENT}"
partition = "aws""#;
            let result = expand_env_vars(input).unwrap();
            assert_eq!(
                result,
                r#"region = "ap-south-1"
# profile = "${NONEXISTENT}"
partition = "aws""#
            );
        });
    }

    #[test]
    #[cfg(not(feature = "backend-aws"))]
    fn test_disabled_aws_backend_error() {
        let err = ProvisionerConfig::from_str("[backend]\ntype = \"aws\"").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("backend-aws"), "should mention the required feature: {msg}");
        assert!(
            msg.contains("cargo build --features"),
            "should include rebuild instructions: {msg}"
        );
    }

    #[test]
    fn test_enabled_features_pass_check() {
        let raw: toml::Value = toml::from_str("[backend]\ntype = \"memory\"").unwrap();
        assert!(check_disabled_features(&raw).is_ok());
    }
}
