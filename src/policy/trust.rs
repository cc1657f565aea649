//! Assume-role trust documents synthesized from a role archetype.
//!
//! Synthesis is pure: no backend calls. Identical archetypes always produce
//! byte-identical JSON, since documents are built from typed structs with a fixed
//! field order.

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use super::{POLICY_VERSION, to_compact_json, validate, validate_file};
use crate::{
    backend::CreateServiceLinkedRole,
    error::{ProvisionError, ProvisionResult},
};

/// Where a custom trust document comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDocumentSource {
    Inline(String),
    File(PathBuf),
}

/// Role archetype. Fixed when the role is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustArchetype {
    Ec2,
    Lambda,
    CrossAccount {
        trust_account_id: Option<String>,
        external_id: Option<String>,
    },
    ServiceLinked {
        service_name: String,
        custom_suffix: Option<String>,
    },
    Custom {
        document: Option<TrustDocumentSource>,
    },
}

/// Role type names as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleType {
    Ec2,
    Lambda,
    CrossAccount,
    ServiceLinked,
    Custom,
}

impl FromStr for RoleType {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ec2" => Ok(RoleType::Ec2),
            "lambda" => Ok(RoleType::Lambda),
            "cross-account" => Ok(RoleType::CrossAccount),
            "service-linked" => Ok(RoleType::ServiceLinked),
            "custom" => Ok(RoleType::Custom),
            other => Err(ProvisionError::Configuration(format!(
                "unknown role type '{other}' (expected ec2, lambda, cross-account, service-linked or custom)"
            ))),
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RoleType::Ec2 => "ec2",
            RoleType::Lambda => "lambda",
            RoleType::CrossAccount => "cross-account",
            RoleType::ServiceLinked => "service-linked",
            RoleType::Custom => "custom",
        })
    }
}

/// Archetype-specific parameters, as collected from flags.
#[derive(Debug, Clone, Default)]
pub struct ArchetypeParams {
    pub trust_account_id: Option<String>,
    pub external_id: Option<String>,
    pub service_name: Option<String>,
    pub custom_suffix: Option<String>,
    pub trust_policy_json: Option<String>,
    pub trust_policy_file: Option<PathBuf>,
}

impl TrustArchetype {
    /// Assemble an archetype from a role type and loose parameters.
    ///
    /// Fails when parameters belonging to a different archetype are supplied, or
    /// when a custom trust document is given both inline and as a file.
    pub fn from_params(role_type: RoleType, params: ArchetypeParams) -> ProvisionResult<Self> {
        let mut stray = Vec::new();
        let mut check = |present: bool, flag: &'static str, allowed: bool| {
            if present && !allowed {
                stray.push(flag);
            }
        };
        let cross = role_type == RoleType::CrossAccount;
        let linked = role_type == RoleType::ServiceLinked;
        let custom = role_type == RoleType::Custom;
        check(params.trust_account_id.is_some(), "trust account id", cross);
        check(params.external_id.is_some(), "external id", cross);
        check(params.service_name.is_some(), "service name", linked);
        check(params.custom_suffix.is_some(), "custom suffix", linked);
        check(params.trust_policy_json.is_some(), "trust policy JSON", custom);
        check(params.trust_policy_file.is_some(), "trust policy file", custom);
        if !stray.is_empty() {
            return Err(ProvisionError::Configuration(format!(
                "{} cannot be used with role type '{role_type}'",
                stray.join(", ")
            )));
        }

        Ok(match role_type {
            RoleType::Ec2 => TrustArchetype::Ec2,
            RoleType::Lambda => TrustArchetype::Lambda,
            RoleType::CrossAccount => TrustArchetype::CrossAccount {
                trust_account_id: params.trust_account_id,
                external_id: params.external_id,
            },
            RoleType::ServiceLinked => TrustArchetype::ServiceLinked {
                service_name: params.service_name.unwrap_or_default(),
                custom_suffix: params.custom_suffix,
            },
            RoleType::Custom => {
                let document = match (params.trust_policy_json, params.trust_policy_file) {
                    (Some(_), Some(_)) => {
                        return Err(ProvisionError::Configuration(
                            "trust policy JSON and trust policy file are mutually exclusive"
                                .to_string(),
                        ));
                    }
                    (Some(json), None) => Some(TrustDocumentSource::Inline(json)),
                    (None, Some(path)) => Some(TrustDocumentSource::File(path)),
                    (None, None) => None,
                };
                TrustArchetype::Custom { document }
            }
        })
    }

    pub fn role_type(&self) -> RoleType {
        match self {
            TrustArchetype::Ec2 => RoleType::Ec2,
            TrustArchetype::Lambda => RoleType::Lambda,
            TrustArchetype::CrossAccount { .. } => RoleType::CrossAccount,
            TrustArchetype::ServiceLinked { .. } => RoleType::ServiceLinked,
            TrustArchetype::Custom { .. } => RoleType::Custom,
        }
    }
}

/// Output of trust synthesis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustDocument {
    /// Assume-role policy JSON to create the role with.
    Document(String),
    /// No document: the backend's service-linked role primitive owns the trust policy.
    ServiceLinked(CreateServiceLinkedRole),
}

impl TrustDocument {
    pub fn as_json(&self) -> Option<&str> {
        match self {
            TrustDocument::Document(json) => Some(json),
            TrustDocument::ServiceLinked(_) => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TrustPolicy {
    version: &'static str,
    statement: Vec<TrustStatement>,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TrustStatement {
    effect: &'static str,
    principal: TrustPrincipal,
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    condition: Option<TrustCondition>,
}

#[derive(Serialize)]
enum TrustPrincipal {
    Service(&'static str),
    #[serde(rename = "AWS")]
    Aws(String),
}

#[derive(Serialize)]
struct TrustCondition {
    #[serde(rename = "StringEquals")]
    string_equals: ExternalIdCondition,
}

#[derive(Serialize)]
struct ExternalIdCondition {
    #[serde(rename = "sts:ExternalId")]
    external_id: String,
}

fn single_statement(principal: TrustPrincipal, condition: Option<TrustCondition>) -> String {
    to_compact_json(&TrustPolicy {
        version: POLICY_VERSION,
        statement: vec![TrustStatement {
            effect: "Allow",
            principal,
            action: "sts:AssumeRole",
            condition,
        }],
    })
}

fn is_account_id(id: &str) -> bool {
    id.len() == 12 && id.chars().all(|c| c.is_ascii_digit())
}

/// Build the trust document for an archetype.
pub fn synthesize(archetype: &TrustArchetype, partition: &str) -> ProvisionResult<TrustDocument> {
    match archetype {
        TrustArchetype::Ec2 => Ok(TrustDocument::Document(single_statement(
            TrustPrincipal::Service("ec2.amazonaws.com"),
            None,
        ))),
        TrustArchetype::Lambda => Ok(TrustDocument::Document(single_statement(
            TrustPrincipal::Service("lambda.amazonaws.com"),
            None,
        ))),
        TrustArchetype::CrossAccount {
            trust_account_id,
            external_id,
        } => {
            let account = trust_account_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    ProvisionError::InvalidArchetypeParameters(
                        "cross-account roles require a trust account id".to_string(),
                    )
                })?;
            if !is_account_id(account) {
                return Err(ProvisionError::InvalidArchetypeParameters(format!(
                    "trust account id '{account}' is not a 12-digit AWS account id"
                )));
            }
            // The external id is the only confused-deputy guard for cross-account trust;
            // it is emitted exactly as given.
            let condition = external_id.as_ref().map(|id| TrustCondition {
                string_equals: ExternalIdCondition {
                    external_id: id.clone(),
                },
            });
            Ok(TrustDocument::Document(single_statement(
                TrustPrincipal::Aws(format!("arn:{partition}:iam::{account}:root")),
                condition,
            )))
        }
        TrustArchetype::ServiceLinked {
            service_name,
            custom_suffix,
        } => {
            if service_name.trim().is_empty() {
                return Err(ProvisionError::InvalidArchetypeParameters(
                    "service-linked roles require a service name".to_string(),
                ));
            }
            Ok(TrustDocument::ServiceLinked(CreateServiceLinkedRole {
                service_name: service_name.clone(),
                custom_suffix: custom_suffix.clone(),
                description: None,
            }))
        }
        TrustArchetype::Custom { document } => {
            let parsed = match document {
                Some(TrustDocumentSource::Inline(json)) => validate(json)?,
                Some(TrustDocumentSource::File(path)) => validate_file(path)?,
                None => {
                    return Err(ProvisionError::InvalidArchetypeParameters(
                        "custom roles require a trust policy document or file".to_string(),
                    ));
                }
            };
            Ok(TrustDocument::Document(parsed.to_json()))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn json(doc: &TrustDocument) -> Value {
        serde_json::from_str(doc.as_json().unwrap()).unwrap()
    }

    #[test]
    fn test_ec2_document() {
        let doc = synthesize(&TrustArchetype::Ec2, "aws").unwrap();
        assert_eq!(
            doc.as_json().unwrap(),
            r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Principal":{"Service":"ec2.amazonaws.com"},"Action":"sts:AssumeRole"}]}"#
        );
        let text = doc.as_json().unwrap();
        assert!(!text.contains("ExternalId"));
        assert!(!text.contains(":root"));
    }

    #[test]
    fn test_lambda_document() {
        let doc = json(&synthesize(&TrustArchetype::Lambda, "aws").unwrap());
        assert_eq!(doc["Statement"][0]["Principal"]["Service"], "lambda.amazonaws.com");
        assert_eq!(doc["Statement"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_cross_account_with_external_id_is_deterministic() {
        let archetype = TrustArchetype::CrossAccount {
            trust_account_id: Some("123456789012".to_string()),
            external_id: Some("x".to_string()),
        };
        let first = synthesize(&archetype, "aws").unwrap();
        let second = synthesize(&archetype, "aws").unwrap();
        assert_eq!(first, second);

        let doc = json(&first);
        let statement = &doc["Statement"][0];
        assert_eq!(statement["Principal"]["AWS"], "arn:aws:iam::123456789012:root");
        assert_eq!(statement["Condition"]["StringEquals"]["sts:ExternalId"], "x");
    }

    #[test]
    fn test_cross_account_without_external_id_has_no_condition() {
        let archetype = TrustArchetype::CrossAccount {
            trust_account_id: Some("999988887777".to_string()),
            external_id: None,
        };
        let doc = json(&synthesize(&archetype, "aws").unwrap());
        let statement = &doc["Statement"][0];
        assert_eq!(statement["Principal"]["AWS"], "arn:aws:iam::999988887777:root");
        assert!(statement.get("Condition").is_none());
    }

    #[test]
    fn test_cross_account_requires_account_id() {
        for trust_account_id in [None, Some(String::new()), Some("12345".to_string())] {
            let err = synthesize(
                &TrustArchetype::CrossAccount {
                    trust_account_id,
                    external_id: None,
                },
                "aws",
            )
            .unwrap_err();
            assert!(matches!(err, ProvisionError::InvalidArchetypeParameters(_)));
        }
    }

    #[test]
    fn test_service_linked_delegates() {
        let doc = synthesize(
            &TrustArchetype::ServiceLinked {
                service_name: "autoscaling.amazonaws.com".to_string(),
                custom_suffix: Some("fleet".to_string()),
            },
            "aws",
        )
        .unwrap();
        assert!(doc.as_json().is_none());
        match doc {
            TrustDocument::ServiceLinked(request) => {
                assert_eq!(request.service_name, "autoscaling.amazonaws.com");
                assert_eq!(request.custom_suffix.as_deref(), Some("fleet"));
            }
            other => panic!("expected service-linked delegation, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_requires_source_and_valid_json() {
        let err = synthesize(&TrustArchetype::Custom { document: None }, "aws").unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidArchetypeParameters(_)));

        let err = synthesize(
            &TrustArchetype::Custom {
                document: Some(TrustDocumentSource::Inline("{\"Version\":".to_string())),
            },
            "aws",
        )
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));

        let doc = synthesize(
            &TrustArchetype::Custom {
                document: Some(TrustDocumentSource::Inline(
                    r#"{ "Version": "2012-10-17", "Statement": [] }"#.to_string(),
                )),
            },
            "aws",
        )
        .unwrap();
        assert_eq!(json(&doc)["Version"], "2012-10-17");
    }

    #[test]
    fn test_from_params_rejects_stray_flags() {
        let err = TrustArchetype::from_params(
            RoleType::Ec2,
            ArchetypeParams {
                external_id: Some("x".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));

        let archetype = TrustArchetype::from_params(
            RoleType::CrossAccount,
            ArchetypeParams {
                trust_account_id: Some("999988887777".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(archetype.role_type(), RoleType::CrossAccount);
    }

    #[test]
    fn test_role_type_parse() {
        assert_eq!("cross-account".parse::<RoleType>().unwrap(), RoleType::CrossAccount);
        assert_eq!("EC2".parse::<RoleType>().unwrap(), RoleType::Ec2);
        assert!("ecs".parse::<RoleType>().is_err());
    }
}
