//! Policy sources and their mutual exclusivity.

use std::path::PathBuf;

use super::{ParsedDocument, ValidationError, validate, validate_file};
use crate::error::{ProvisionError, ProvisionResult};

/// Where the policy for an attachment comes from. Exactly one per attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicySource {
    /// AWS managed policy, by short name (`ReadOnlyAccess`) or full ARN.
    Managed(String),
    /// Policy JSON supplied inline.
    InlineJson(String),
    /// Policy JSON read from a file.
    FileJson(PathBuf),
}

impl PolicySource {
    /// Load (for files) and validate a custom document. Managed sources carry no document.
    pub fn document(&self) -> Result<Option<ParsedDocument>, ValidationError> {
        match self {
            PolicySource::Managed(_) => Ok(None),
            PolicySource::InlineJson(json) => validate(json).map(Some),
            PolicySource::FileJson(path) => validate_file(path).map(Some),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PolicySource::Managed(_) => "managed",
            PolicySource::InlineJson(_) => "inline",
            PolicySource::FileJson(_) => "file",
        }
    }
}

/// The raw, possibly conflicting, policy options a caller supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PolicySourceOptions {
    pub managed: Option<String>,
    pub inline: Option<String>,
    pub file: Option<PathBuf>,
}

impl PolicySourceOptions {
    /// Resolve to at most one source. Supplying more than one is a configuration error.
    pub fn resolve(self) -> ProvisionResult<Option<PolicySource>> {
        let mut sources: Vec<PolicySource> = Vec::with_capacity(3);
        if let Some(name) = self.managed {
            sources.push(PolicySource::Managed(name));
        }
        if let Some(json) = self.inline {
            sources.push(PolicySource::InlineJson(json));
        }
        if let Some(path) = self.file {
            sources.push(PolicySource::FileJson(path));
        }

        if sources.len() > 1 {
            let kinds = sources
                .iter()
                .map(PolicySource::kind)
                .collect::<Vec<_>>()
                .join(", ");
            return Err(ProvisionError::Configuration(format!(
                "policy sources are mutually exclusive, got: {kinds}"
            )));
        }

        Ok(sources.pop())
    }

    /// Resolve to exactly one source.
    pub fn resolve_required(self) -> ProvisionResult<PolicySource> {
        self.resolve()?.ok_or_else(|| {
            ProvisionError::Configuration(
                "one of a managed policy name, inline policy JSON or policy file is required"
                    .to_string(),
            )
        })
    }
}

/// Canonical ARN of an AWS managed policy. Full ARNs pass through unchanged.
pub fn managed_policy_arn(partition: &str, name: &str) -> String {
    if name.starts_with("arn:") {
        return name.to_string();
    }
    format!(
        "arn:{partition}:iam::aws:policy/{}",
        name.trim_start_matches('/')
    )
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn options(managed: bool, inline: bool, file: bool) -> PolicySourceOptions {
        PolicySourceOptions {
            managed: managed.then(|| "ReadOnlyAccess".to_string()),
            inline: inline.then(|| r#"{"Version":"2012-10-17","Statement":[]}"#.to_string()),
            file: file.then(|| PathBuf::from("policy.json")),
        }
    }

    #[rstest]
    #[case::managed_and_inline(true, true, false)]
    #[case::managed_and_file(true, false, true)]
    #[case::inline_and_file(false, true, true)]
    #[case::all_three(true, true, true)]
    fn test_multiple_sources_are_a_configuration_error(
        #[case] managed: bool,
        #[case] inline: bool,
        #[case] file: bool,
    ) {
        let err = options(managed, inline, file).resolve().unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)), "{err:?}");
    }

    #[rstest]
    #[case::managed(true, false, false, "managed")]
    #[case::inline(false, true, false, "inline")]
    #[case::file(false, false, true, "file")]
    fn test_single_source_resolves(
        #[case] managed: bool,
        #[case] inline: bool,
        #[case] file: bool,
        #[case] kind: &str,
    ) {
        let source = options(managed, inline, file).resolve().unwrap().unwrap();
        assert_eq!(source.kind(), kind);
    }

    #[test]
    fn test_no_source() {
        assert_eq!(PolicySourceOptions::default().resolve().unwrap(), None);
        assert!(matches!(
            PolicySourceOptions::default().resolve_required(),
            Err(ProvisionError::Configuration(_))
        ));
    }

    #[test]
    fn test_managed_policy_arn() {
        assert_eq!(
            managed_policy_arn("aws", "ReadOnlyAccess"),
            "arn:aws:iam::aws:policy/ReadOnlyAccess"
        );
        assert_eq!(
            managed_policy_arn("aws", "service-role/AWSLambdaBasicExecutionRole"),
            "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"
        );
        assert_eq!(
            managed_policy_arn("aws-us-gov", "ReadOnlyAccess"),
            "arn:aws-us-gov:iam::aws:policy/ReadOnlyAccess"
        );
        let arn = "arn:aws:iam::123456789012:policy/Custom";
        assert_eq!(managed_policy_arn("aws", arn), arn);
    }

    #[test]
    fn test_inline_document_is_validated() {
        let bad = PolicySource::InlineJson("{not json".to_string());
        assert!(bad.document().is_err());
        assert!(PolicySource::Managed("ReadOnlyAccess".into()).document().unwrap().is_none());
    }
}
