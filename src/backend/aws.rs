//! AWS identity backend.
//!
//! Talks to IAM, STS and IAM Identity Center (SSO admin) through the AWS SDK for
//! Rust, using the standard credential chain (environment, profile, instance
//! profile, etc.). Service errors are classified into [`BackendError`] so the
//! core can tell "not found" apart from a genuine rejection.

use async_trait::async_trait;
use aws_sdk_iam::{
    Client as IamClient,
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
};
use aws_sdk_ssoadmin::{
    Client as SsoAdminClient,
    types::{PrincipalType, TargetType},
};
use aws_sdk_sts::Client as StsClient;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use super::{
    AccessKeyMetadata, AccessKeyRecord, AccountAssignment, AssignmentStatus, AssumeRole,
    AttachTarget, BackendError, BackendResult, CreatePermissionSet, CreateRole,
    CreateServiceLinkedRole, IdentityBackend, PermissionSet, Principal, PrincipalKind, SsoBackend,
    SsoInstance, SsoPrincipalType, TemporaryCredentials,
};
use crate::config::AwsBackendConfig;

/// Identity backend backed by the AWS control plane.
pub struct AwsIdentityBackend {
    iam: IamClient,
    sts: StsClient,
    sso: SsoAdminClient,
}

impl AwsIdentityBackend {
    /// Create SDK clients from the given configuration.
    pub async fn new(config: &AwsBackendConfig) -> BackendResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());

        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }

        if let Some(profile) = &config.profile {
            loader = loader.profile_name(profile);
        }

        let sdk_config = loader.load().await;

        let mut iam_config = aws_sdk_iam::config::Builder::from(&sdk_config);
        let mut sts_config = aws_sdk_sts::config::Builder::from(&sdk_config);
        let mut sso_config = aws_sdk_ssoadmin::config::Builder::from(&sdk_config);

        // Custom endpoint, useful for localstack testing
        if let Some(endpoint_url) = &config.endpoint_url {
            iam_config = iam_config.endpoint_url(endpoint_url);
            sts_config = sts_config.endpoint_url(endpoint_url);
            sso_config = sso_config.endpoint_url(endpoint_url);
        }

        Ok(Self {
            iam: IamClient::from_conf(iam_config.build()),
            sts: StsClient::from_conf(sts_config.build()),
            sso: SsoAdminClient::from_conf(sso_config.build()),
        })
    }
}

/// Classify an SDK error. Transport, timeout and credential failures are
/// `Unavailable`; service responses are mapped by their error code.
fn classify<E, R>(context: &str, err: SdkError<E, R>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::ServiceError(service) => {
            let service_error = service.err();
            let code = service_error.code().unwrap_or("Unknown").to_string();
            let message = service_error
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| format!("{context} failed"));
            match code.as_str() {
                "NoSuchEntity" | "ResourceNotFoundException" => BackendError::NotFound(message),
                "EntityAlreadyExists" => BackendError::AlreadyExists(message),
                "LimitExceeded" => BackendError::LimitExceeded(message),
                "ServiceUnavailable" | "ServiceFailure" | "Throttling" | "ThrottlingException"
                | "InternalServerException" => {
                    BackendError::Unavailable(format!("{context}: {code}: {message}"))
                }
                _ => BackendError::Rejected { code, message },
            }
        }
        _ => BackendError::Unavailable(format!("{context}: {}", DisplayErrorContext(&err))),
    }
}

fn to_chrono(ts: &aws_smithy_types::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}

fn missing(context: &str, field: &str) -> BackendError {
    BackendError::Unavailable(format!("{context}: response missing {field}"))
}

#[async_trait]
impl IdentityBackend for AwsIdentityBackend {
    async fn caller_account_id(&self) -> BackendResult<String> {
        let output = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| classify("sts:GetCallerIdentity", e))?;
        output
            .account()
            .map(str::to_string)
            .ok_or_else(|| missing("sts:GetCallerIdentity", "Account"))
    }

    #[instrument(skip(self))]
    async fn get_principal(&self, kind: PrincipalKind, name: &str) -> BackendResult<Principal> {
        let arn = match kind {
            PrincipalKind::User => {
                let output = self
                    .iam
                    .get_user()
                    .user_name(name)
                    .send()
                    .await
                    .map_err(|e| classify("iam:GetUser", e))?;
                output
                    .user()
                    .map(|u| u.arn().to_string())
                    .ok_or_else(|| missing("iam:GetUser", "User"))?
            }
            PrincipalKind::Group => {
                let output = self
                    .iam
                    .get_group()
                    .group_name(name)
                    .send()
                    .await
                    .map_err(|e| classify("iam:GetGroup", e))?;
                output
                    .group()
                    .map(|g| g.arn().to_string())
                    .ok_or_else(|| missing("iam:GetGroup", "Group"))?
            }
            PrincipalKind::Role => {
                let output = self
                    .iam
                    .get_role()
                    .role_name(name)
                    .send()
                    .await
                    .map_err(|e| classify("iam:GetRole", e))?;
                output
                    .role()
                    .map(|r| r.arn().to_string())
                    .ok_or_else(|| missing("iam:GetRole", "Role"))?
            }
        };
        debug!(%kind, name, arn, "Principal found");
        Ok(Principal {
            kind,
            name: name.to_string(),
            arn,
        })
    }

    async fn create_user(&self, name: &str) -> BackendResult<Principal> {
        let output = self
            .iam
            .create_user()
            .user_name(name)
            .send()
            .await
            .map_err(|e| classify("iam:CreateUser", e))?;
        let arn = output
            .user()
            .map(|u| u.arn().to_string())
            .ok_or_else(|| missing("iam:CreateUser", "User"))?;
        Ok(Principal {
            kind: PrincipalKind::User,
            name: name.to_string(),
            arn,
        })
    }

    async fn create_group(&self, name: &str) -> BackendResult<Principal> {
        let output = self
            .iam
            .create_group()
            .group_name(name)
            .send()
            .await
            .map_err(|e| classify("iam:CreateGroup", e))?;
        let arn = output
            .group()
            .map(|g| g.arn().to_string())
            .ok_or_else(|| missing("iam:CreateGroup", "Group"))?;
        Ok(Principal {
            kind: PrincipalKind::Group,
            name: name.to_string(),
            arn,
        })
    }

    async fn add_user_to_group(&self, user: &str, group: &str) -> BackendResult<()> {
        self.iam
            .add_user_to_group()
            .user_name(user)
            .group_name(group)
            .send()
            .await
            .map_err(|e| classify("iam:AddUserToGroup", e))?;
        Ok(())
    }

    async fn list_groups_for_user(&self, user: &str) -> BackendResult<Vec<String>> {
        let mut groups = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let output = self
                .iam
                .list_groups_for_user()
                .user_name(user)
                .set_marker(marker.take())
                .send()
                .await
                .map_err(|e| classify("iam:ListGroupsForUser", e))?;
            groups.extend(output.groups().iter().map(|g| g.group_name().to_string()));
            match output.marker() {
                Some(next) if output.is_truncated() => marker = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(groups)
    }

    async fn create_role(&self, request: &CreateRole) -> BackendResult<Principal> {
        let output = self
            .iam
            .create_role()
            .role_name(&request.name)
            .assume_role_policy_document(&request.trust_document)
            .set_description(request.description.clone())
            .set_max_session_duration(request.max_session_duration)
            .send()
            .await
            .map_err(|e| classify("iam:CreateRole", e))?;
        let arn = output
            .role()
            .map(|r| r.arn().to_string())
            .ok_or_else(|| missing("iam:CreateRole", "Role"))?;
        Ok(Principal {
            kind: PrincipalKind::Role,
            name: request.name.clone(),
            arn,
        })
    }

    async fn create_service_linked_role(
        &self,
        request: &CreateServiceLinkedRole,
    ) -> BackendResult<Principal> {
        let output = self
            .iam
            .create_service_linked_role()
            .aws_service_name(&request.service_name)
            .set_custom_suffix(request.custom_suffix.clone())
            .set_description(request.description.clone())
            .send()
            .await
            .map_err(|e| classify("iam:CreateServiceLinkedRole", e))?;
        let role = output
            .role()
            .ok_or_else(|| missing("iam:CreateServiceLinkedRole", "Role"))?;
        Ok(Principal {
            kind: PrincipalKind::Role,
            name: role.role_name().to_string(),
            arn: role.arn().to_string(),
        })
    }

    async fn create_instance_profile(&self, name: &str) -> BackendResult<()> {
        self.iam
            .create_instance_profile()
            .instance_profile_name(name)
            .send()
            .await
            .map_err(|e| classify("iam:CreateInstanceProfile", e))?;
        Ok(())
    }

    async fn list_instance_profile_roles(&self, profile: &str) -> BackendResult<Vec<String>> {
        let output = self
            .iam
            .get_instance_profile()
            .instance_profile_name(profile)
            .send()
            .await
            .map_err(|e| classify("iam:GetInstanceProfile", e))?;
        let instance_profile = output
            .instance_profile()
            .ok_or_else(|| missing("iam:GetInstanceProfile", "InstanceProfile"))?;
        Ok(instance_profile
            .roles()
            .iter()
            .map(|role| role.role_name().to_string())
            .collect())
    }

    async fn add_role_to_instance_profile(
        &self,
        profile: &str,
        role: &str,
    ) -> BackendResult<()> {
        self.iam
            .add_role_to_instance_profile()
            .instance_profile_name(profile)
            .role_name(role)
            .send()
            .await
            .map_err(|e| classify("iam:AddRoleToInstanceProfile", e))?;
        Ok(())
    }

    async fn attach_policy(
        &self,
        target: AttachTarget,
        target_name: &str,
        policy_arn: &str,
    ) -> BackendResult<()> {
        match target {
            AttachTarget::Group => {
                self.iam
                    .attach_group_policy()
                    .group_name(target_name)
                    .policy_arn(policy_arn)
                    .send()
                    .await
                    .map_err(|e| classify("iam:AttachGroupPolicy", e))?;
            }
            AttachTarget::Role => {
                self.iam
                    .attach_role_policy()
                    .role_name(target_name)
                    .policy_arn(policy_arn)
                    .send()
                    .await
                    .map_err(|e| classify("iam:AttachRolePolicy", e))?;
            }
        }
        Ok(())
    }

    async fn put_policy(
        &self,
        target: AttachTarget,
        target_name: &str,
        policy_name: &str,
        document: &str,
    ) -> BackendResult<()> {
        match target {
            AttachTarget::Group => {
                self.iam
                    .put_group_policy()
                    .group_name(target_name)
                    .policy_name(policy_name)
                    .policy_document(document)
                    .send()
                    .await
                    .map_err(|e| classify("iam:PutGroupPolicy", e))?;
            }
            AttachTarget::Role => {
                self.iam
                    .put_role_policy()
                    .role_name(target_name)
                    .policy_name(policy_name)
                    .policy_document(document)
                    .send()
                    .await
                    .map_err(|e| classify("iam:PutRolePolicy", e))?;
            }
        }
        Ok(())
    }

    async fn list_access_keys(&self, user: &str) -> BackendResult<Vec<AccessKeyMetadata>> {
        let output = self
            .iam
            .list_access_keys()
            .user_name(user)
            .send()
            .await
            .map_err(|e| classify("iam:ListAccessKeys", e))?;
        Ok(output
            .access_key_metadata()
            .iter()
            .filter_map(|meta| {
                Some(AccessKeyMetadata {
                    access_key_id: meta.access_key_id()?.to_string(),
                    created_at: meta.create_date().and_then(to_chrono),
                })
            })
            .collect())
    }

    async fn create_access_key(&self, user: &str) -> BackendResult<AccessKeyRecord> {
        let output = self
            .iam
            .create_access_key()
            .user_name(user)
            .send()
            .await
            .map_err(|e| classify("iam:CreateAccessKey", e))?;
        let key = output
            .access_key()
            .ok_or_else(|| missing("iam:CreateAccessKey", "AccessKey"))?;
        Ok(AccessKeyRecord {
            access_key_id: key.access_key_id().to_string(),
            secret_access_key: key.secret_access_key().to_string(),
            created_at: key.create_date().and_then(to_chrono),
        })
    }

    async fn delete_access_key(&self, user: &str, access_key_id: &str) -> BackendResult<()> {
        self.iam
            .delete_access_key()
            .user_name(user)
            .access_key_id(access_key_id)
            .send()
            .await
            .map_err(|e| classify("iam:DeleteAccessKey", e))?;
        Ok(())
    }

    async fn assume_role(&self, request: &AssumeRole) -> BackendResult<TemporaryCredentials> {
        let output = self
            .sts
            .assume_role()
            .role_arn(&request.role_arn)
            .role_session_name(&request.session_name)
            .set_external_id(request.external_id.clone())
            .set_duration_seconds(request.duration_seconds)
            .send()
            .await
            .map_err(|e| classify("sts:AssumeRole", e))?;
        let credentials = output
            .credentials()
            .ok_or_else(|| missing("sts:AssumeRole", "Credentials"))?;
        Ok(TemporaryCredentials {
            access_key_id: credentials.access_key_id().to_string(),
            secret_access_key: credentials.secret_access_key().to_string(),
            session_token: credentials.session_token().to_string(),
            expiration: to_chrono(credentials.expiration()),
        })
    }
}

#[async_trait]
impl SsoBackend for AwsIdentityBackend {
    async fn list_instances(&self) -> BackendResult<Vec<SsoInstance>> {
        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .sso
                .list_instances()
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| classify("sso:ListInstances", e))?;
            instances.extend(output.instances().iter().filter_map(|i| {
                Some(SsoInstance {
                    instance_arn: i.instance_arn()?.to_string(),
                    identity_store_id: i.identity_store_id().map(str::to_string),
                })
            }));
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(instances)
    }

    async fn list_permission_sets(&self, instance_arn: &str) -> BackendResult<Vec<String>> {
        let mut arns = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let output = self
                .sso
                .list_permission_sets()
                .instance_arn(instance_arn)
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| classify("sso:ListPermissionSets", e))?;
            arns.extend(output.permission_sets().iter().cloned());
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(arns)
    }

    async fn describe_permission_set(
        &self,
        instance_arn: &str,
        permission_set_arn: &str,
    ) -> BackendResult<PermissionSet> {
        let output = self
            .sso
            .describe_permission_set()
            .instance_arn(instance_arn)
            .permission_set_arn(permission_set_arn)
            .send()
            .await
            .map_err(|e| classify("sso:DescribePermissionSet", e))?;
        let ps = output
            .permission_set()
            .ok_or_else(|| missing("sso:DescribePermissionSet", "PermissionSet"))?;
        Ok(PermissionSet {
            arn: ps
                .permission_set_arn()
                .unwrap_or(permission_set_arn)
                .to_string(),
            name: ps.name().unwrap_or_default().to_string(),
            description: ps.description().map(str::to_string),
        })
    }

    async fn create_permission_set(
        &self,
        instance_arn: &str,
        request: &CreatePermissionSet,
    ) -> BackendResult<PermissionSet> {
        let output = self
            .sso
            .create_permission_set()
            .instance_arn(instance_arn)
            .name(&request.name)
            .set_description(request.description.clone())
            .set_session_duration(request.session_duration.clone())
            .send()
            .await
            .map_err(|e| classify("sso:CreatePermissionSet", e))?;
        let ps = output
            .permission_set()
            .ok_or_else(|| missing("sso:CreatePermissionSet", "PermissionSet"))?;
        Ok(PermissionSet {
            arn: ps
                .permission_set_arn()
                .ok_or_else(|| missing("sso:CreatePermissionSet", "PermissionSetArn"))?
                .to_string(),
            name: ps.name().unwrap_or(&request.name).to_string(),
            description: ps.description().map(str::to_string),
        })
    }

    async fn attach_managed_policy_to_permission_set(
        &self,
        instance_arn: &str,
        permission_set_arn: &str,
        policy_arn: &str,
    ) -> BackendResult<()> {
        match self
            .sso
            .attach_managed_policy_to_permission_set()
            .instance_arn(instance_arn)
            .permission_set_arn(permission_set_arn)
            .managed_policy_arn(policy_arn)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err) => match classify("sso:AttachManagedPolicyToPermissionSet", err) {
                // Already attached: the call is idempotent from our point of view
                BackendError::Rejected { code, .. } if code == "ConflictException" => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn put_inline_policy_to_permission_set(
        &self,
        instance_arn: &str,
        permission_set_arn: &str,
        document: &str,
    ) -> BackendResult<()> {
        self.sso
            .put_inline_policy_to_permission_set()
            .instance_arn(instance_arn)
            .permission_set_arn(permission_set_arn)
            .inline_policy(document)
            .send()
            .await
            .map_err(|e| classify("sso:PutInlinePolicyToPermissionSet", e))?;
        Ok(())
    }

    async fn create_account_assignment(
        &self,
        instance_arn: &str,
        assignment: &AccountAssignment,
    ) -> BackendResult<AssignmentStatus> {
        let principal_type = match assignment.principal_type {
            SsoPrincipalType::User => PrincipalType::User,
            SsoPrincipalType::Group => PrincipalType::Group,
        };
        let output = self
            .sso
            .create_account_assignment()
            .instance_arn(instance_arn)
            .target_id(&assignment.target_account_id)
            .target_type(TargetType::AwsAccount)
            .permission_set_arn(&assignment.permission_set_arn)
            .principal_type(principal_type)
            .principal_id(&assignment.principal_id)
            .send()
            .await
            .map_err(|e| classify("sso:CreateAccountAssignment", e))?;
        let status = output.account_assignment_creation_status();
        Ok(AssignmentStatus {
            request_id: status.and_then(|s| s.request_id()).map(str::to_string),
            status: status
                .and_then(|s| s.status())
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|| "UNKNOWN".to_string()),
        })
    }
}
