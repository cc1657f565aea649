//! IAM Identity Center permission sets and account assignments.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::{
    backend::{
        AccountAssignment, AssignmentStatus, CreatePermissionSet, PermissionSet, SsoBackend,
        SsoInstance, SsoPrincipalType,
    },
    error::{ProvisionError, ProvisionResult},
    policy::{PolicySource, managed_policy_arn},
};

/// How a caller names a permission set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionSetRef {
    Name(String),
    Arn(String),
}

impl PermissionSetRef {
    /// Treat anything shaped like a permission set ARN as an ARN, otherwise a name.
    pub fn parse(value: &str) -> Self {
        if value.starts_with("arn:") && value.contains(":permissionSet/") {
            PermissionSetRef::Arn(value.to_string())
        } else {
            PermissionSetRef::Name(value.to_string())
        }
    }
}

/// An SSO user or group, by identity store id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoPrincipal {
    pub principal_type: SsoPrincipalType,
    pub id: String,
}

/// Parameters for [`SsoAssignmentOrchestrator::ensure_permission_set`].
#[derive(Debug, Clone, Default)]
pub struct PermissionSetSpec {
    pub name: String,
    pub description: Option<String>,
    pub session_duration: Option<String>,
    pub policy: Option<PolicySource>,
}

/// Resolves SSO instances and permission sets and creates account assignments.
#[derive(Clone)]
pub struct SsoAssignmentOrchestrator {
    backend: Arc<dyn SsoBackend>,
    partition: String,
    /// Pinned instance; when unset the first instance reported by the backend is used.
    instance_arn: Option<String>,
}

impl SsoAssignmentOrchestrator {
    pub fn new(
        backend: Arc<dyn SsoBackend>,
        partition: impl Into<String>,
        instance_arn: Option<String>,
    ) -> Self {
        Self {
            backend,
            partition: partition.into(),
            instance_arn,
        }
    }

    pub async fn resolve_instance(&self) -> ProvisionResult<SsoInstance> {
        let instances = self.backend.list_instances().await?;
        let instance = match &self.instance_arn {
            Some(arn) => instances.into_iter().find(|i| &i.instance_arn == arn),
            None => instances.into_iter().next(),
        };
        let instance = instance.ok_or(ProvisionError::NoSsoInstance)?;
        debug!(instance_arn = %instance.instance_arn, "Resolved SSO instance");
        Ok(instance)
    }

    /// Find a permission set by exact name. `Ok(None)` when nothing matches.
    async fn find_by_name(
        &self,
        instance_arn: &str,
        name: &str,
    ) -> ProvisionResult<Option<PermissionSet>> {
        let mut matches = Vec::new();
        for arn in self.backend.list_permission_sets(instance_arn).await? {
            let permission_set = self
                .backend
                .describe_permission_set(instance_arn, &arn)
                .await?;
            if permission_set.name == name {
                matches.push(permission_set);
            }
        }

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            _ => Err(ProvisionError::AmbiguousPermissionSet {
                name: name.to_string(),
                matches: matches.into_iter().map(|ps| ps.arn).collect(),
            }),
        }
    }

    /// Resolve a permission set reference to its ARN.
    pub async fn resolve_permission_set(
        &self,
        instance_arn: &str,
        reference: &PermissionSetRef,
    ) -> ProvisionResult<String> {
        match reference {
            PermissionSetRef::Arn(arn) => Ok(arn.clone()),
            PermissionSetRef::Name(name) => self
                .find_by_name(instance_arn, name)
                .await?
                .map(|ps| ps.arn)
                .ok_or_else(|| ProvisionError::PermissionSetNotFound(name.clone())),
        }
    }

    /// Create the permission set if no set with that exact name exists, then attach its policy.
    #[instrument(skip(self, spec), fields(name = %spec.name))]
    pub async fn ensure_permission_set(
        &self,
        spec: &PermissionSetSpec,
    ) -> ProvisionResult<(PermissionSet, bool)> {
        // Validate before any mutation
        let document = match &spec.policy {
            Some(source) => source.document()?,
            None => None,
        };

        let instance = self.resolve_instance().await?;
        let (permission_set, created) =
            match self.find_by_name(&instance.instance_arn, &spec.name).await? {
                Some(existing) => {
                    info!(arn = %existing.arn, "Permission set already exists, skipping creation");
                    (existing, false)
                }
                None => {
                    let created = self
                        .backend
                        .create_permission_set(
                            &instance.instance_arn,
                            &CreatePermissionSet {
                                name: spec.name.clone(),
                                description: spec.description.clone(),
                                session_duration: spec.session_duration.clone(),
                            },
                        )
                        .await?;
                    info!(arn = %created.arn, "Created permission set");
                    (created, true)
                }
            };

        match (&spec.policy, document) {
            (Some(PolicySource::Managed(name)), _) => {
                let policy_arn = managed_policy_arn(&self.partition, name);
                self.backend
                    .attach_managed_policy_to_permission_set(
                        &instance.instance_arn,
                        &permission_set.arn,
                        &policy_arn,
                    )
                    .await?;
                info!(policy_arn, "Attached managed policy to permission set");
            }
            (Some(_), Some(document)) => {
                self.backend
                    .put_inline_policy_to_permission_set(
                        &instance.instance_arn,
                        &permission_set.arn,
                        &document.to_json(),
                    )
                    .await?;
                info!("Put inline policy on permission set");
            }
            _ => {}
        }

        Ok((permission_set, created))
    }

    /// Submit an account assignment. Provisioning completes asynchronously on the
    /// backend; this only confirms the request was accepted.
    #[instrument(skip(self))]
    pub async fn assign(
        &self,
        principal: &SsoPrincipal,
        permission_set: &PermissionSetRef,
        target_account_id: &str,
    ) -> ProvisionResult<AssignmentStatus> {
        let instance = self.resolve_instance().await?;
        let permission_set_arn = self
            .resolve_permission_set(&instance.instance_arn, permission_set)
            .await?;

        let assignment = AccountAssignment {
            permission_set_arn,
            principal_type: principal.principal_type,
            principal_id: principal.id.clone(),
            target_account_id: target_account_id.to_string(),
        };
        let status = self
            .backend
            .create_account_assignment(&instance.instance_arn, &assignment)
            .await?;
        info!(
            principal_type = %principal.principal_type,
            principal_id = %principal.id,
            permission_set_arn = %assignment.permission_set_arn,
            target_account_id,
            status = %status.status,
            request_id = ?status.request_id,
            "Account assignment requested"
        );
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    const INSTANCE: &str = "arn:aws:sso:::instance/ssoins-1111111111111111";

    fn setup() -> (Arc<InMemoryBackend>, SsoAssignmentOrchestrator) {
        let backend = Arc::new(InMemoryBackend::new("123456789012").with_sso_instance(INSTANCE));
        let orchestrator = SsoAssignmentOrchestrator::new(backend.clone(), "aws", None);
        (backend, orchestrator)
    }

    fn spec(name: &str) -> PermissionSetSpec {
        PermissionSetSpec {
            name: name.to_string(),
            policy: Some(PolicySource::Managed("ReadOnlyAccess".into())),
            ..Default::default()
        }
    }

    fn user(id: &str) -> SsoPrincipal {
        SsoPrincipal {
            principal_type: SsoPrincipalType::User,
            id: id.to_string(),
        }
    }

    #[test]
    fn test_permission_set_ref_parse() {
        assert_eq!(
            PermissionSetRef::parse("ReadOnly"),
            PermissionSetRef::Name("ReadOnly".into())
        );
        let arn = "arn:aws:sso:::permissionSet/ssoins-1111111111111111/ps-2222222222222222";
        assert_eq!(PermissionSetRef::parse(arn), PermissionSetRef::Arn(arn.into()));
    }

    #[tokio::test]
    async fn test_ensure_permission_set_is_idempotent() {
        let (backend, orchestrator) = setup();
        let (first, created) = orchestrator
            .ensure_permission_set(&spec("ReadOnly"))
            .await
            .unwrap();
        assert!(created);
        let (second, created) = orchestrator
            .ensure_permission_set(&spec("ReadOnly"))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.arn, second.arn);
        assert_eq!(backend.call_counts().create_permission_set, 1);

        let (managed, _) = backend.permission_set_policies(&first.arn).unwrap();
        assert_eq!(managed, vec!["arn:aws:iam::aws:policy/ReadOnlyAccess"]);
    }

    #[tokio::test]
    async fn test_inline_permission_set_policy() {
        let (backend, orchestrator) = setup();
        let (ps, _) = orchestrator
            .ensure_permission_set(&PermissionSetSpec {
                name: "Deployers".into(),
                session_duration: Some("PT4H".into()),
                policy: Some(PolicySource::InlineJson(
                    r#"{"Version":"2012-10-17","Statement":[]}"#.into(),
                )),
                ..Default::default()
            })
            .await
            .unwrap();
        let (managed, inline) = backend.permission_set_policies(&ps.arn).unwrap();
        assert!(managed.is_empty());
        let inline: serde_json::Value = serde_json::from_str(&inline.unwrap()).unwrap();
        assert_eq!(inline["Version"], "2012-10-17");
    }

    #[tokio::test]
    async fn test_assign_by_exact_name_not_substring() {
        let (backend, orchestrator) = setup();
        let (admin, _) = orchestrator.ensure_permission_set(&spec("Admin")).await.unwrap();
        orchestrator
            .ensure_permission_set(&spec("AdminReadOnly"))
            .await
            .unwrap();

        orchestrator
            .assign(&user("u-1"), &PermissionSetRef::Name("Admin".into()), "210987654321")
            .await
            .unwrap();

        let assignments = backend.assignments();
        assert_eq!(assignments.len(), 1);
        assert_eq!(assignments[0].permission_set_arn, admin.arn);
        assert_eq!(assignments[0].target_account_id, "210987654321");
    }

    #[tokio::test]
    async fn test_substring_alone_does_not_match() {
        let (_, orchestrator) = setup();
        orchestrator
            .ensure_permission_set(&spec("AdminReadOnly"))
            .await
            .unwrap();

        let err = orchestrator
            .assign(&user("u-1"), &PermissionSetRef::Name("Admin".into()), "210987654321")
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::PermissionSetNotFound(name) if name == "Admin"));
    }

    #[tokio::test]
    async fn test_duplicate_names_are_ambiguous() {
        let (backend, orchestrator) = setup();
        let first = backend.seed_permission_set(INSTANCE, "Ops");
        let second = backend.seed_permission_set(INSTANCE, "Ops");

        let err = orchestrator
            .resolve_permission_set(INSTANCE, &PermissionSetRef::Name("Ops".into()))
            .await
            .unwrap_err();
        match err {
            ProvisionError::AmbiguousPermissionSet { name, matches } => {
                assert_eq!(name, "Ops");
                assert_eq!(matches, vec![first, second]);
            }
            other => panic!("expected AmbiguousPermissionSet, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_assign_by_arn_skips_lookup() {
        let (backend, orchestrator) = setup();
        let (ps, _) = orchestrator.ensure_permission_set(&spec("Billing")).await.unwrap();

        let status = orchestrator
            .assign(
                &SsoPrincipal {
                    principal_type: SsoPrincipalType::Group,
                    id: "g-1".into(),
                },
                &PermissionSetRef::Arn(ps.arn.clone()),
                "210987654321",
            )
            .await
            .unwrap();
        assert_eq!(status.status, "IN_PROGRESS");
        assert_eq!(backend.assignments()[0].principal_type, SsoPrincipalType::Group);
    }

    #[tokio::test]
    async fn test_no_instance() {
        let backend = Arc::new(InMemoryBackend::new("123456789012"));
        let orchestrator = SsoAssignmentOrchestrator::new(backend, "aws", None);
        let err = orchestrator.resolve_instance().await.unwrap_err();
        assert!(matches!(err, ProvisionError::NoSsoInstance));
    }
}
