//! Provisioning pipelines.
//!
//! Each request runs strictly in order: existence check, document construction,
//! attachment, then (optionally) credential issuance. Every stage skips work that
//! is already done, so a failed pipeline can be re-run from the top. The one
//! exception is key rotation, which deletes a key before creating its replacement.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::{
    Attached, CredentialCache, CredentialLifecycleManager, Ensured, IssueMode, IssuedKey,
    PermissionSetRef, PermissionSetSpec, PolicyAttachmentManager, PrincipalResolver,
    SsoAssignmentOrchestrator, SsoPrincipal, inline_policy_name,
};
use crate::{
    backend::{
        AssignmentStatus, AssumeRole, AttachTarget, BackendClient, BackendError, CreateRole,
        CreateServiceLinkedRole, IdentityBackend, PermissionSet, Principal, PrincipalKind,
        TemporaryCredentials,
    },
    error::{ProvisionError, ProvisionResult},
    policy::{PolicySource, TrustArchetype, TrustDocument, synthesize},
};

/// Default name of the break-glass group.
pub const EMERGENCY_GROUP_NAME: &str = "EmergencyAccess";
/// Policy granted to the break-glass group when none is given.
pub const EMERGENCY_MANAGED_POLICY: &str = "AdministratorAccess";

/// Create a user and place it in a group, creating the group and its policy as needed.
#[derive(Debug, Clone)]
pub struct CreateUserInGroup {
    pub user_name: String,
    pub group_name: String,
    pub policy: Option<PolicySource>,
    /// Inline policy name suffix: `{group}{suffix}Policy`.
    pub policy_suffix: String,
    /// Issue an access key for the user after provisioning.
    pub access_key: Option<IssueMode>,
}

#[derive(Debug, Clone)]
pub struct UserInGroupProvisioned {
    pub user: Ensured,
    pub group: Ensured,
    pub policy: Option<Attached>,
    pub added_to_group: bool,
    pub access_key: Option<IssuedKey>,
}

#[derive(Debug, Clone)]
pub struct CreateRoleRequest {
    pub role_name: String,
    pub archetype: TrustArchetype,
    pub description: Option<String>,
    pub max_session_duration: Option<i32>,
    pub policy: Option<PolicySource>,
}

#[derive(Debug, Clone)]
pub struct RoleProvisioned {
    pub role: Ensured,
    pub policy: Option<Attached>,
    /// Instance profile name, for EC2 roles.
    pub instance_profile: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmergencyGroupRequest {
    pub group_name: String,
    pub policy: PolicySource,
    pub members: Vec<String>,
}

impl Default for EmergencyGroupRequest {
    fn default() -> Self {
        Self {
            group_name: EMERGENCY_GROUP_NAME.to_string(),
            policy: PolicySource::Managed(EMERGENCY_MANAGED_POLICY.to_string()),
            members: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmergencyGroupProvisioned {
    pub group: Ensured,
    pub policy: Attached,
    pub added_members: Vec<String>,
}

/// Entry point for every provisioning request.
pub struct Provisioner {
    identity: Arc<dyn IdentityBackend>,
    partition: String,
    account_id: String,
    resolver: PrincipalResolver,
    attachments: PolicyAttachmentManager,
    credentials: CredentialLifecycleManager,
    sso: SsoAssignmentOrchestrator,
}

impl Provisioner {
    pub fn new(
        client: BackendClient,
        cache: CredentialCache,
        sso_instance_arn: Option<String>,
    ) -> Self {
        let BackendClient {
            identity,
            sso,
            partition,
            account_id,
        } = client;
        Self {
            resolver: PrincipalResolver::new(identity.clone()),
            attachments: PolicyAttachmentManager::new(identity.clone(), partition.clone()),
            credentials: CredentialLifecycleManager::new(identity.clone(), cache),
            sso: SsoAssignmentOrchestrator::new(sso, partition.clone(), sso_instance_arn),
            identity,
            partition,
            account_id,
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn resolver(&self) -> &PrincipalResolver {
        &self.resolver
    }

    /// Add the user to the group unless already a member. Returns whether a change was made.
    async fn ensure_membership(&self, user: &str, group: &str) -> ProvisionResult<bool> {
        let groups = self.identity.list_groups_for_user(user).await?;
        if groups.iter().any(|g| g == group) {
            info!(user, group, "Already a member, skipping");
            return Ok(false);
        }
        self.identity.add_user_to_group(user, group).await?;
        info!(user, group, "Added user to group");
        Ok(true)
    }

    #[instrument(
        skip(self, request),
        fields(user = %request.user_name, group = %request.group_name)
    )]
    pub async fn create_user_in_group(
        &self,
        request: &CreateUserInGroup,
    ) -> ProvisionResult<UserInGroupProvisioned> {
        if let Some(source) = &request.policy {
            source.document()?;
        }

        let group = self
            .resolver
            .ensure(PrincipalKind::Group, &request.group_name, || {
                self.identity.create_group(&request.group_name)
            })
            .await?;

        let policy = match &request.policy {
            Some(source) => Some(
                self.attachments
                    .attach(
                        AttachTarget::Group,
                        &request.group_name,
                        source,
                        &inline_policy_name(&request.group_name, Some(&request.policy_suffix)),
                    )
                    .await?,
            ),
            None => None,
        };

        let user = self
            .resolver
            .ensure(PrincipalKind::User, &request.user_name, || {
                self.identity.create_user(&request.user_name)
            })
            .await?;

        let added_to_group = self
            .ensure_membership(&request.user_name, &request.group_name)
            .await?;

        let access_key = match request.access_key {
            Some(mode) => Some(
                self.credentials
                    .issue(&request.user_name, &self.account_id, mode)
                    .await?,
            ),
            None => None,
        };

        Ok(UserInGroupProvisioned {
            user,
            group,
            policy,
            added_to_group,
            access_key,
        })
    }

    #[instrument(
        skip(self, request),
        fields(role = %request.role_name, role_type = %request.archetype.role_type())
    )]
    pub async fn create_role(
        &self,
        request: &CreateRoleRequest,
    ) -> ProvisionResult<RoleProvisioned> {
        // Local checks first: nothing touches the backend until documents are valid
        let trust = synthesize(&request.archetype, &self.partition)?;
        if let Some(source) = &request.policy {
            if matches!(trust, TrustDocument::ServiceLinked(_)) {
                return Err(ProvisionError::Configuration(
                    "service-linked roles carry service-defined permissions; \
                     a policy cannot be attached"
                        .to_string(),
                ));
            }
            source.document()?;
        }

        let role = match trust {
            TrustDocument::Document(trust_document) => {
                let create = CreateRole {
                    name: request.role_name.clone(),
                    trust_document,
                    description: request.description.clone(),
                    max_session_duration: request.max_session_duration,
                };
                self.resolver
                    .ensure(PrincipalKind::Role, &request.role_name, || {
                        self.identity.create_role(&create)
                    })
                    .await?
            }
            TrustDocument::ServiceLinked(mut linked) => {
                linked.description = request.description.clone();
                self.ensure_service_linked_role(&request.role_name, &linked)
                    .await?
            }
        };

        let policy = match &request.policy {
            Some(source) => Some(
                self.attachments
                    .attach(
                        AttachTarget::Role,
                        &request.role_name,
                        source,
                        &inline_policy_name(&request.role_name, None),
                    )
                    .await?,
            ),
            None => None,
        };

        let instance_profile = if matches!(request.archetype, TrustArchetype::Ec2) {
            self.ensure_instance_profile(&request.role_name).await?;
            Some(request.role_name.clone())
        } else {
            None
        };

        Ok(RoleProvisioned {
            role,
            policy,
            instance_profile,
        })
    }

    /// IAM picks the name of a service-linked role, which may differ from the
    /// requested one. Both names are checked, and only roles under the
    /// `aws-service-role/` path count.
    async fn ensure_service_linked_role(
        &self,
        requested_name: &str,
        linked: &CreateServiceLinkedRole,
    ) -> ProvisionResult<Ensured> {
        let mut candidates = vec![requested_name.to_string(), linked.role_name()];
        candidates.dedup();

        if let Some(existing) = self.find_service_linked_role(&candidates).await? {
            info!(arn = %existing.arn, "Service-linked role already exists, skipping creation");
            return Ok(Ensured::Existing(existing));
        }

        match self.identity.create_service_linked_role(linked).await {
            Ok(principal) => {
                info!(arn = %principal.arn, name = %principal.name, "Created service-linked role");
                Ok(Ensured::Created(principal))
            }
            Err(BackendError::Rejected { code, message })
                if code == "InvalidInput" && message.contains("has been taken") =>
            {
                match self.find_service_linked_role(&candidates).await? {
                    Some(existing) => {
                        info!(
                            arn = %existing.arn,
                            "Service-linked role already exists, skipping creation"
                        );
                        Ok(Ensured::Existing(existing))
                    }
                    // Taken under a name we cannot derive; report IAM's answer as is
                    None => Err(ProvisionError::BackendRejection { code, message }),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find_service_linked_role(
        &self,
        names: &[String],
    ) -> ProvisionResult<Option<Principal>> {
        for name in names {
            if let Some(role) = self.resolver.find(PrincipalKind::Role, name).await?
                && role.arn.contains(":role/aws-service-role/")
            {
                return Ok(Some(role));
            }
        }
        Ok(None)
    }

    /// Instance profile named after the role, holding the role.
    async fn ensure_instance_profile(&self, role: &str) -> ProvisionResult<()> {
        match self.identity.create_instance_profile(role).await {
            Ok(()) => info!(profile = role, "Created instance profile"),
            Err(BackendError::AlreadyExists(_)) => {
                info!(profile = role, "Instance profile already exists, skipping creation")
            }
            Err(e) => return Err(e.into()),
        }

        // A profile holds a single role
        let held = self.identity.list_instance_profile_roles(role).await?;
        if held.iter().any(|r| r == role) {
            info!(profile = role, role, "Instance profile already holds the role, skipping");
            return Ok(());
        }
        if let Some(other) = held.first() {
            return Err(ProvisionError::BackendRejection {
                code: "LimitExceeded".to_string(),
                message: format!(
                    "Instance profile {role} already holds role {other} and cannot take {role}"
                ),
            });
        }

        self.identity.add_role_to_instance_profile(role, role).await?;
        info!(profile = role, role, "Added role to instance profile");
        Ok(())
    }

    #[instrument(skip(self, request), fields(group = %request.group_name))]
    pub async fn create_emergency_group(
        &self,
        request: &EmergencyGroupRequest,
    ) -> ProvisionResult<EmergencyGroupProvisioned> {
        request.policy.document()?;

        let group = self
            .resolver
            .ensure(PrincipalKind::Group, &request.group_name, || {
                self.identity.create_group(&request.group_name)
            })
            .await?;

        let policy = self
            .attachments
            .attach(
                AttachTarget::Group,
                &request.group_name,
                &request.policy,
                &inline_policy_name(&request.group_name, Some("Emergency")),
            )
            .await?;

        let mut added_members = Vec::new();
        for member in &request.members {
            if !self.resolver.exists(PrincipalKind::User, member).await? {
                return Err(ProvisionError::BackendRejection {
                    code: "NoSuchEntity".to_string(),
                    message: format!("The user with name {member} cannot be found."),
                });
            }
            if self.ensure_membership(member, &request.group_name).await? {
                added_members.push(member.clone());
            }
        }

        warn!(
            group = %request.group_name,
            members = request.members.len(),
            "Emergency access group is in place; audit its membership regularly"
        );

        Ok(EmergencyGroupProvisioned {
            group,
            policy,
            added_members,
        })
    }

    /// Issue (or reuse) access keys for an existing user.
    pub async fn issue_access_key(
        &self,
        user: &str,
        mode: IssueMode,
    ) -> ProvisionResult<IssuedKey> {
        self.credentials.issue(user, &self.account_id, mode).await
    }

    pub async fn create_sso_permission_set(
        &self,
        spec: &PermissionSetSpec,
    ) -> ProvisionResult<(PermissionSet, bool)> {
        self.sso.ensure_permission_set(spec).await
    }

    pub async fn assign_sso(
        &self,
        principal: &SsoPrincipal,
        permission_set: &PermissionSetRef,
        target_account_id: &str,
    ) -> ProvisionResult<AssignmentStatus> {
        self.sso
            .assign(principal, permission_set, target_account_id)
            .await
    }

    pub async fn assume_role(
        &self,
        request: &AssumeRole,
    ) -> ProvisionResult<TemporaryCredentials> {
        let credentials = self.identity.assume_role(request).await?;
        info!(role_arn = %request.role_arn, session = %request.session_name, "Assumed role");
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{
        backend::{InMemoryBackend, SsoPrincipalType},
        policy::trust::TrustDocumentSource,
    };

    const ACCOUNT: &str = "123456789012";
    const INSTANCE: &str = "arn:aws:sso:::instance/ssoins-1111111111111111";

    fn setup() -> (TempDir, Arc<InMemoryBackend>, Provisioner) {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::new(ACCOUNT).with_sso_instance(INSTANCE));
        let client = BackendClient::from_backend(backend.clone(), "aws", ACCOUNT);
        let provisioner = Provisioner::new(client, CredentialCache::new(dir.path(), 0o600), None);
        (dir, backend, provisioner)
    }

    fn user_request(access_key: Option<IssueMode>) -> CreateUserInGroup {
        CreateUserInGroup {
            user_name: "alice".into(),
            group_name: "developers".into(),
            policy: Some(PolicySource::Managed("ReadOnlyAccess".into())),
            policy_suffix: "Group".into(),
            access_key,
        }
    }

    #[tokio::test]
    async fn test_create_user_in_group_twice_is_idempotent() {
        let (_dir, backend, provisioner) = setup();

        let first = provisioner.create_user_in_group(&user_request(None)).await.unwrap();
        assert!(first.user.was_created());
        assert!(first.group.was_created());
        assert!(first.added_to_group);

        let second = provisioner.create_user_in_group(&user_request(None)).await.unwrap();
        assert!(!second.user.was_created());
        assert!(!second.group.was_created());
        assert!(!second.added_to_group);

        assert_eq!(backend.user_count(), 1);
        assert_eq!(backend.group_count(), 1);
        let counts = backend.call_counts();
        assert_eq!(counts.create_user, 1);
        assert_eq!(counts.create_group, 1);
    }

    #[tokio::test]
    async fn test_alice_key_scenario() {
        let (dir, backend, provisioner) = setup();

        let first = provisioner
            .create_user_in_group(&user_request(Some(IssueMode::ReuseIfPresent)))
            .await
            .unwrap();
        let key = first.access_key.unwrap();
        let cache = std::fs::read_to_string(dir.path().join("alice_123456789012_accessKeys.csv"))
            .unwrap();
        assert!(cache.contains(&key.record.access_key_id));

        let again = provisioner
            .issue_access_key("alice", IssueMode::ReuseIfPresent)
            .await
            .unwrap();
        assert_eq!(again.record.access_key_id, key.record.access_key_id);
        assert_eq!(backend.call_counts().create_access_key, 1);
    }

    #[tokio::test]
    async fn test_invalid_policy_fails_before_backend() {
        let (_dir, backend, provisioner) = setup();
        let mut request = user_request(None);
        request.policy = Some(PolicySource::InlineJson("{oops".into()));

        let err = provisioner.create_user_in_group(&request).await.unwrap_err();
        assert!(err.is_local());
        assert_eq!(backend.call_counts(), Default::default());
    }

    #[tokio::test]
    async fn test_group_inline_policy_name() {
        let (_dir, backend, provisioner) = setup();
        let mut request = user_request(None);
        request.policy = Some(PolicySource::InlineJson(
            r#"{"Version":"2012-10-17","Statement":[]}"#.into(),
        ));
        provisioner.create_user_in_group(&request).await.unwrap();

        let (_, inline) = backend.policies(AttachTarget::Group, "developers");
        assert_eq!(inline, vec!["developersGroupPolicy"]);
    }

    #[tokio::test]
    async fn test_create_ec2_role_with_instance_profile() {
        let (_dir, backend, provisioner) = setup();
        let request = CreateRoleRequest {
            role_name: "web".into(),
            archetype: TrustArchetype::Ec2,
            description: None,
            max_session_duration: None,
            policy: Some(PolicySource::Managed("AmazonS3ReadOnlyAccess".into())),
        };

        let first = provisioner.create_role(&request).await.unwrap();
        assert!(first.role.was_created());
        assert_eq!(first.instance_profile.as_deref(), Some("web"));
        assert_eq!(backend.instance_profile_roles("web").unwrap(), vec!["web"]);

        let second = provisioner.create_role(&request).await.unwrap();
        assert!(!second.role.was_created());
        assert_eq!(backend.role_count(), 1);
        assert_eq!(backend.call_counts().create_role, 1);
    }

    #[tokio::test]
    async fn test_cross_account_role_trust() {
        let (_dir, backend, provisioner) = setup();
        provisioner
            .create_role(&CreateRoleRequest {
                role_name: "auditor".into(),
                archetype: TrustArchetype::CrossAccount {
                    trust_account_id: Some("999988887777".into()),
                    external_id: None,
                },
                description: Some("Third-party audit".into()),
                max_session_duration: Some(3600),
                policy: Some(PolicySource::InlineJson(
                    r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":"s3:ListAllMyBuckets","Resource":"*"}]}"#.into(),
                )),
            })
            .await
            .unwrap();

        let trust: serde_json::Value =
            serde_json::from_str(&backend.role_trust_document("auditor").unwrap()).unwrap();
        assert_eq!(
            trust["Statement"][0]["Principal"]["AWS"],
            "arn:aws:iam::999988887777:root"
        );
        assert!(trust["Statement"][0].get("Condition").is_none());

        let (_, inline) = backend.policies(AttachTarget::Role, "auditor");
        assert_eq!(inline, vec!["auditorCustomPolicy"]);
    }

    #[tokio::test]
    async fn test_missing_archetype_params_fail_locally() {
        let (_dir, backend, provisioner) = setup();
        let err = provisioner
            .create_role(&CreateRoleRequest {
                role_name: "partner".into(),
                archetype: TrustArchetype::CrossAccount {
                    trust_account_id: None,
                    external_id: Some("x".into()),
                },
                description: None,
                max_session_duration: None,
                policy: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidArchetypeParameters(_)));
        assert_eq!(backend.call_counts().get_principal, 0);

        let err = provisioner
            .create_role(&CreateRoleRequest {
                role_name: "custom".into(),
                archetype: TrustArchetype::Custom {
                    document: Some(TrustDocumentSource::Inline("not json".into())),
                },
                description: None,
                max_session_duration: None,
                policy: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
    }

    #[tokio::test]
    async fn test_service_linked_role_is_idempotent() {
        let (_dir, backend, provisioner) = setup();
        let request = CreateRoleRequest {
            role_name: "AWSServiceRoleForAutoscaling".into(),
            archetype: TrustArchetype::ServiceLinked {
                service_name: "autoscaling.amazonaws.com".into(),
                custom_suffix: None,
            },
            description: None,
            max_session_duration: None,
            policy: None,
        };
        assert!(provisioner.create_role(&request).await.unwrap().role.was_created());
        assert!(!provisioner.create_role(&request).await.unwrap().role.was_created());
        assert_eq!(backend.call_counts().create_service_linked_role, 1);
    }

    fn service_linked_request(role_name: &str) -> CreateRoleRequest {
        CreateRoleRequest {
            role_name: role_name.into(),
            archetype: TrustArchetype::ServiceLinked {
                service_name: "autoscaling.amazonaws.com".into(),
                custom_suffix: None,
            },
            description: None,
            max_session_duration: None,
            policy: None,
        }
    }

    #[tokio::test]
    async fn test_service_linked_role_found_under_assigned_name() {
        let (_dir, backend, provisioner) = setup();
        let request = service_linked_request("asg-linked");

        let first = provisioner.create_role(&request).await.unwrap();
        assert!(first.role.was_created());
        assert_eq!(first.role.principal().name, "AWSServiceRoleForAutoscaling");

        let second = provisioner.create_role(&request).await.unwrap();
        assert!(!second.role.was_created());
        assert_eq!(second.role.principal(), first.role.principal());
        assert!(
            second
                .role
                .principal()
                .arn
                .ends_with(":role/aws-service-role/autoscaling.amazonaws.com/AWSServiceRoleForAutoscaling")
        );
        assert_eq!(backend.call_counts().create_service_linked_role, 1);
    }

    #[tokio::test]
    async fn test_plain_role_is_not_taken_for_service_linked() {
        let (_dir, backend, provisioner) = setup();
        backend
            .create_role(&CreateRole {
                name: "asg-linked".into(),
                trust_document: r#"{"Version":"2012-10-17","Statement":[]}"#.into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let provisioned = provisioner
            .create_role(&service_linked_request("asg-linked"))
            .await
            .unwrap();
        assert!(provisioned.role.was_created());
        assert_eq!(provisioned.role.principal().name, "AWSServiceRoleForAutoscaling");
        assert_eq!(backend.role_count(), 2);
    }

    #[tokio::test]
    async fn test_instance_profile_held_by_other_role_fails() {
        let (_dir, backend, provisioner) = setup();
        backend
            .create_role(&CreateRole {
                name: "other".into(),
                trust_document: r#"{"Version":"2012-10-17","Statement":[]}"#.into(),
                ..Default::default()
            })
            .await
            .unwrap();
        backend.create_instance_profile("web").await.unwrap();
        backend
            .add_role_to_instance_profile("web", "other")
            .await
            .unwrap();

        let err = provisioner
            .create_role(&CreateRoleRequest {
                role_name: "web".into(),
                archetype: TrustArchetype::Ec2,
                description: None,
                max_session_duration: None,
                policy: None,
            })
            .await
            .unwrap_err();
        assert!(
            matches!(err, ProvisionError::BackendRejection { ref code, .. } if code == "LimitExceeded"),
            "unexpected error: {err}"
        );
        assert_eq!(backend.instance_profile_roles("web").unwrap(), vec!["other"]);
    }

    #[tokio::test]
    async fn test_service_linked_role_rejects_policy() {
        let (_dir, _backend, provisioner) = setup();
        let err = provisioner
            .create_role(&CreateRoleRequest {
                role_name: "AWSServiceRoleForAutoscaling".into(),
                archetype: TrustArchetype::ServiceLinked {
                    service_name: "autoscaling.amazonaws.com".into(),
                    custom_suffix: None,
                },
                description: None,
                max_session_duration: None,
                policy: Some(PolicySource::Managed("ReadOnlyAccess".into())),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_emergency_group() {
        let (_dir, backend, provisioner) = setup();
        backend.create_user("oncall").await.unwrap();

        let request = EmergencyGroupRequest {
            members: vec!["oncall".into()],
            ..Default::default()
        };
        let first = provisioner.create_emergency_group(&request).await.unwrap();
        assert!(first.group.was_created());
        assert_eq!(first.added_members, vec!["oncall"]);
        assert_eq!(
            first.policy,
            Attached::Managed {
                policy_arn: "arn:aws:iam::aws:policy/AdministratorAccess".into()
            }
        );

        let second = provisioner.create_emergency_group(&request).await.unwrap();
        assert!(!second.group.was_created());
        assert!(second.added_members.is_empty());
    }

    #[tokio::test]
    async fn test_emergency_group_unknown_member() {
        let (_dir, _backend, provisioner) = setup();
        let err = provisioner
            .create_emergency_group(&EmergencyGroupRequest {
                members: vec!["ghost".into()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::BackendRejection { .. }));
    }

    #[tokio::test]
    async fn test_sso_pipeline() {
        let (_dir, backend, provisioner) = setup();
        let (ps, created) = provisioner
            .create_sso_permission_set(&PermissionSetSpec {
                name: "ReadOnly".into(),
                description: Some("Read-only access".into()),
                session_duration: Some("PT8H".into()),
                policy: Some(PolicySource::Managed("ReadOnlyAccess".into())),
            })
            .await
            .unwrap();
        assert!(created);

        provisioner
            .assign_sso(
                &SsoPrincipal {
                    principal_type: SsoPrincipalType::User,
                    id: "9067c8b4-1111-2222-3333-444455556666".into(),
                },
                &PermissionSetRef::Name("ReadOnly".into()),
                "210987654321",
            )
            .await
            .unwrap();
        assert_eq!(backend.assignments()[0].permission_set_arn, ps.arn);
    }

    #[tokio::test]
    async fn test_assume_role_with_external_id() {
        let (_dir, _backend, provisioner) = setup();
        let role = provisioner
            .create_role(&CreateRoleRequest {
                role_name: "partner".into(),
                archetype: TrustArchetype::CrossAccount {
                    trust_account_id: Some("999988887777".into()),
                    external_id: Some("shared-secret".into()),
                },
                description: None,
                max_session_duration: None,
                policy: None,
            })
            .await
            .unwrap();

        let mut request = AssumeRole {
            role_arn: role.role.principal().arn.clone(),
            session_name: "audit".into(),
            external_id: None,
            duration_seconds: None,
        };
        assert!(provisioner.assume_role(&request).await.is_err());

        request.external_id = Some("shared-secret".into());
        let credentials = provisioner.assume_role(&request).await.unwrap();
        assert!(credentials.access_key_id.starts_with("ASIA"));
    }
}
