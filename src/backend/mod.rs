//! Identity backend abstraction.
//!
//! The provisioning core never talks to the cloud control plane directly. It
//! depends on two traits describing the request/response contracts it needs:
//!
//! - [`IdentityBackend`]: IAM principals, policies, access keys and STS
//! - [`SsoBackend`]: IAM Identity Center instances, permission sets and
//!   account assignments
//!
//! Implementations:
//! - In-memory (rehearsals and tests)
//! - AWS SDK for Rust - requires the `backend-aws` feature

#[cfg(feature = "backend-aws")]
mod aws;
mod memory;

use std::{fmt, sync::Arc};

use async_trait::async_trait;
#[cfg(feature = "backend-aws")]
pub use aws::AwsIdentityBackend;
use chrono::{DateTime, Utc};
pub use memory::{BackendCallCounts, InMemoryBackend};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{instrument, warn};

use crate::config::BackendConfig;

/// Errors reported by an identity backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    /// The entity named in the request does not exist.
    #[error("Entity not found: {0}")]
    NotFound(String),

    /// The entity the request would create already exists.
    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    /// A quota such as the two-key ceiling would be exceeded.
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// The backend understood the request and refused it.
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },

    /// The backend could not be reached, or the caller could not authenticate.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Kind of IAM principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Group,
    Role,
}

impl PrincipalKind {
    /// Resource type segment used in IAM ARNs.
    pub fn arn_segment(&self) -> &'static str {
        match self {
            PrincipalKind::User => "user",
            PrincipalKind::Group => "group",
            PrincipalKind::Role => "role",
        }
    }
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.arn_segment())
    }
}

/// An IAM user, group or role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub name: String,
    pub arn: String,
}

impl Principal {
    /// Build a principal whose ARN is derived from the account and partition.
    pub fn new(
        kind: PrincipalKind,
        name: impl Into<String>,
        partition: &str,
        account_id: &str,
    ) -> Self {
        let name = name.into();
        let arn = format!(
            "arn:{partition}:iam::{account_id}:{}/{name}",
            kind.arn_segment()
        );
        Self { kind, name, arn }
    }
}

/// Principals that policies can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachTarget {
    Group,
    Role,
}

impl From<AttachTarget> for PrincipalKind {
    fn from(target: AttachTarget) -> Self {
        match target {
            AttachTarget::Group => PrincipalKind::Group,
            AttachTarget::Role => PrincipalKind::Role,
        }
    }
}

impl fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        PrincipalKind::from(*self).fmt(f)
    }
}

/// Parameters for creating an IAM role.
#[derive(Debug, Clone, Default)]
pub struct CreateRole {
    pub name: String,
    pub trust_document: String,
    pub description: Option<String>,
    pub max_session_duration: Option<i32>,
}

/// Parameters for the backend's service-linked role primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateServiceLinkedRole {
    pub service_name: String,
    pub custom_suffix: Option<String>,
    pub description: Option<String>,
}

impl CreateServiceLinkedRole {
    /// Name IAM gives the role: `AWSServiceRoleFor{Service}[_{suffix}]`, where
    /// `{Service}` is the first label of the service principal in PascalCase.
    ///
    /// A few services register an irregular name (`AWSServiceRoleForAutoScaling`),
    /// so callers should treat this as the expected name, not a guarantee.
    pub fn role_name(&self) -> String {
        let service: String = self
            .service_name
            .split('.')
            .next()
            .unwrap_or_default()
            .split('-')
            .map(|part| {
                let mut chars = part.chars();
                chars
                    .next()
                    .map(|c| c.to_uppercase().chain(chars).collect::<String>())
                    .unwrap_or_default()
            })
            .collect();
        match &self.custom_suffix {
            Some(suffix) => format!("AWSServiceRoleFor{service}_{suffix}"),
            None => format!("AWSServiceRoleFor{service}"),
        }
    }
}

/// Metadata for an access key as returned by list-access-keys. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessKeyMetadata {
    pub access_key_id: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// A freshly issued (or cached) access key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessKeyRecord {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for AccessKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKeyRecord")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"****")
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Parameters for sts:AssumeRole.
#[derive(Debug, Clone)]
pub struct AssumeRole {
    pub role_arn: String,
    pub session_name: String,
    pub external_id: Option<String>,
    pub duration_seconds: Option<i32>,
}

/// Temporary credentials returned by sts:AssumeRole.
#[derive(Clone)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: Option<DateTime<Utc>>,
}

impl fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("expiration", &self.expiration)
            .finish_non_exhaustive()
    }
}

/// IAM and STS operations consumed by the provisioning core.
#[async_trait]
pub trait IdentityBackend: Send + Sync {
    /// Account id of the caller (sts:GetCallerIdentity).
    async fn caller_account_id(&self) -> BackendResult<String>;

    /// Look up a principal. Returns [`BackendError::NotFound`] when absent.
    async fn get_principal(&self, kind: PrincipalKind, name: &str) -> BackendResult<Principal>;

    async fn create_user(&self, name: &str) -> BackendResult<Principal>;

    async fn create_group(&self, name: &str) -> BackendResult<Principal>;

    async fn add_user_to_group(&self, user: &str, group: &str) -> BackendResult<()>;

    /// Names of the groups the user belongs to.
    async fn list_groups_for_user(&self, user: &str) -> BackendResult<Vec<String>>;

    async fn create_role(&self, request: &CreateRole) -> BackendResult<Principal>;

    async fn create_service_linked_role(
        &self,
        request: &CreateServiceLinkedRole,
    ) -> BackendResult<Principal>;

    async fn create_instance_profile(&self, name: &str) -> BackendResult<()>;

    /// Names of the roles held by an instance profile (at most one).
    async fn list_instance_profile_roles(&self, profile: &str) -> BackendResult<Vec<String>>;

    async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> BackendResult<()>;

    /// Attach a managed policy by ARN.
    async fn attach_policy(
        &self,
        target: AttachTarget,
        target_name: &str,
        policy_arn: &str,
    ) -> BackendResult<()>;

    /// Create or overwrite an inline policy.
    async fn put_policy(
        &self,
        target: AttachTarget,
        target_name: &str,
        policy_name: &str,
        document: &str,
    ) -> BackendResult<()>;

    async fn list_access_keys(&self, user: &str) -> BackendResult<Vec<AccessKeyMetadata>>;

    async fn create_access_key(&self, user: &str) -> BackendResult<AccessKeyRecord>;

    async fn delete_access_key(&self, user: &str, access_key_id: &str) -> BackendResult<()>;

    async fn assume_role(&self, request: &AssumeRole) -> BackendResult<TemporaryCredentials>;
}

/// An IAM Identity Center instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsoInstance {
    pub instance_arn: String,
    pub identity_store_id: Option<String>,
}

/// A permission set as described by the SSO admin API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionSet {
    pub arn: String,
    pub name: String,
    pub description: Option<String>,
}

/// Parameters for creating a permission set.
#[derive(Debug, Clone, Default)]
pub struct CreatePermissionSet {
    pub name: String,
    pub description: Option<String>,
    /// ISO-8601 duration, e.g. `PT8H`.
    pub session_duration: Option<String>,
}

/// Kind of SSO principal an assignment is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SsoPrincipalType {
    User,
    Group,
}

impl fmt::Display for SsoPrincipalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SsoPrincipalType::User => f.write_str("USER"),
            SsoPrincipalType::Group => f.write_str("GROUP"),
        }
    }
}

/// An account assignment request. Assignments are created, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountAssignment {
    pub permission_set_arn: String,
    pub principal_type: SsoPrincipalType,
    pub principal_id: String,
    pub target_account_id: String,
}

/// Status of an accepted create-account-assignment request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssignmentStatus {
    pub request_id: Option<String>,
    pub status: String,
}

/// IAM Identity Center operations consumed by the provisioning core.
#[async_trait]
pub trait SsoBackend: Send + Sync {
    async fn list_instances(&self) -> BackendResult<Vec<SsoInstance>>;

    /// ARNs of every permission set in the instance.
    async fn list_permission_sets(&self, instance_arn: &str) -> BackendResult<Vec<String>>;

    async fn describe_permission_set(
        &self,
        instance_arn: &str,
        permission_set_arn: &str,
    ) -> BackendResult<PermissionSet>;

    async fn create_permission_set(
        &self,
        instance_arn: &str,
        request: &CreatePermissionSet,
    ) -> BackendResult<PermissionSet>;

    async fn attach_managed_policy_to_permission_set(
        &self,
        instance_arn: &str,
        permission_set_arn: &str,
        policy_arn: &str,
    ) -> BackendResult<()>;

    async fn put_inline_policy_to_permission_set(
        &self,
        instance_arn: &str,
        permission_set_arn: &str,
        document: &str,
    ) -> BackendResult<()>;

    async fn create_account_assignment(
        &self,
        instance_arn: &str,
        assignment: &AccountAssignment,
    ) -> BackendResult<AssignmentStatus>;
}

/// A connected backend: both trait objects plus the partition and account every
/// ARN and cache file is built from. Passed explicitly to the provisioning core.
#[derive(Clone)]
pub struct BackendClient {
    pub identity: Arc<dyn IdentityBackend>,
    pub sso: Arc<dyn SsoBackend>,
    pub partition: String,
    pub account_id: String,
}

impl BackendClient {
    /// Wrap a single object implementing both backend traits.
    pub fn from_backend<B>(backend: Arc<B>, partition: &str, account_id: &str) -> Self
    where
        B: IdentityBackend + SsoBackend + 'static,
    {
        Self {
            identity: backend.clone(),
            sso: backend,
            partition: partition.to_string(),
            account_id: account_id.to_string(),
        }
    }

    /// Build the configured backend. The account id falls back to the caller
    /// identity when the configuration does not pin one.
    #[instrument(skip(config))]
    pub async fn connect(config: &BackendConfig) -> BackendResult<Self> {
        let partition = config.partition();
        match config {
            #[cfg(feature = "backend-aws")]
            BackendConfig::Aws(aws_config) => {
                let backend = Arc::new(AwsIdentityBackend::new(aws_config).await?);
                let account_id = match &aws_config.account_id {
                    Some(account_id) => account_id.clone(),
                    None => backend.caller_account_id().await?,
                };
                tracing::info!(%account_id, partition, "Connected to AWS");
                Ok(Self::from_backend(backend, partition, &account_id))
            }
            BackendConfig::Memory(memory) => {
                let mut backend =
                    InMemoryBackend::new(&memory.account_id).with_partition(partition);
                if let Some(instance_arn) = &memory.sso_instance_arn {
                    backend = backend.with_sso_instance(instance_arn);
                }
                warn!(
                    account_id = %memory.account_id,
                    "Using the in-memory backend; nothing is provisioned in AWS"
                );
                Ok(Self::from_backend(
                    Arc::new(backend),
                    partition,
                    &memory.account_id,
                ))
            }
        }
    }
}
