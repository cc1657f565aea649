//! In-memory identity backend.
//!
//! Mirrors the IAM behaviors the provisioning core relies on (not-found and
//! already-exists errors, the two-key ceiling, unknown managed policies) so that
//! pipelines can be rehearsed and tested without an AWS account.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    AccessKeyMetadata, AccessKeyRecord, AccountAssignment, AssignmentStatus, AssumeRole,
    AttachTarget, BackendError, BackendResult, CreatePermissionSet, CreateRole,
    CreateServiceLinkedRole, IdentityBackend, PermissionSet, Principal, PrincipalKind, SsoBackend,
    SsoInstance, TemporaryCredentials,
};

/// Maximum number of access keys IAM allows per user.
const MAX_ACCESS_KEYS: usize = 2;

const DEFAULT_MANAGED_POLICIES: &[&str] = &[
    "AdministratorAccess",
    "PowerUserAccess",
    "ReadOnlyAccess",
    "IAMUserChangePassword",
    "AmazonS3ReadOnlyAccess",
    "AmazonEC2ReadOnlyAccess",
    "service-role/AWSLambdaBasicExecutionRole",
];

/// Number of calls made against the backend, per operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendCallCounts {
    pub get_principal: usize,
    pub create_user: usize,
    pub create_group: usize,
    pub create_role: usize,
    pub create_service_linked_role: usize,
    pub create_instance_profile: usize,
    pub attach_policy: usize,
    pub put_policy: usize,
    pub list_access_keys: usize,
    pub create_access_key: usize,
    pub delete_access_key: usize,
    pub create_permission_set: usize,
    pub create_account_assignment: usize,
}

#[derive(Debug, Clone)]
struct StoredKey {
    access_key_id: String,
    secret_access_key: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PolicyHolder {
    attached: BTreeSet<String>,
    inline: BTreeMap<String, String>,
}

#[derive(Debug)]
struct StoredPermissionSet {
    instance_arn: String,
    permission_set: PermissionSet,
    policies: PolicyHolder,
}

#[derive(Debug, Default)]
struct State {
    unavailable: bool,
    users: HashMap<String, Vec<StoredKey>>,
    memberships: BTreeSet<(String, String)>,
    groups: HashMap<String, PolicyHolder>,
    roles: HashMap<String, (Principal, String, PolicyHolder)>,
    instance_profiles: HashMap<String, BTreeSet<String>>,
    managed_policies: BTreeSet<String>,
    sso_instances: Vec<SsoInstance>,
    permission_sets: Vec<StoredPermissionSet>,
    assignments: Vec<AccountAssignment>,
    key_sequence: i64,
    counts: BackendCallCounts,
}

/// In-memory identity backend (for rehearsals and testing).
pub struct InMemoryBackend {
    account_id: String,
    partition: String,
    epoch: DateTime<Utc>,
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new(account_id: impl Into<String>) -> Self {
        let state = State {
            managed_policies: DEFAULT_MANAGED_POLICIES
                .iter()
                .map(|name| name.to_string())
                .collect(),
            ..Default::default()
        };
        Self {
            account_id: account_id.into(),
            partition: "aws".to_string(),
            epoch: Utc
                .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .unwrap_or_else(Utc::now),
            state: Mutex::new(state),
        }
    }

    /// Set the ARN partition (e.g. `aws-cn`).
    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    /// Register an IAM Identity Center instance.
    pub fn with_sso_instance(self, instance_arn: impl Into<String>) -> Self {
        self.state.lock().sso_instances.push(SsoInstance {
            instance_arn: instance_arn.into(),
            identity_store_id: Some("d-0000000000".to_string()),
        });
        self
    }

    /// Register an additional AWS managed policy by its name (path included).
    pub fn with_managed_policy(self, name: impl Into<String>) -> Self {
        self.state.lock().managed_policies.insert(name.into());
        self
    }

    /// Simulate the backend becoming unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub fn call_counts(&self) -> BackendCallCounts {
        self.state.lock().counts.clone()
    }

    /// Insert an access key directly, bypassing the ceiling, with an explicit creation time.
    pub fn seed_access_key(&self, user: &str, access_key_id: &str, created_at: DateTime<Utc>) {
        let mut state = self.state.lock();
        state
            .users
            .entry(user.to_string())
            .or_default()
            .push(StoredKey {
                access_key_id: access_key_id.to_string(),
                secret_access_key: format!("secret-{access_key_id}"),
                created_at,
            });
    }

    /// Access key ids currently live for the user.
    pub fn access_key_ids(&self, user: &str) -> Vec<String> {
        self.state
            .lock()
            .users
            .get(user)
            .map(|keys| keys.iter().map(|k| k.access_key_id.clone()).collect())
            .unwrap_or_default()
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().users.len()
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    pub fn role_count(&self) -> usize {
        self.state.lock().roles.len()
    }

    /// Trust document the role was created with.
    pub fn role_trust_document(&self, role: &str) -> Option<String> {
        self.state.lock().roles.get(role).map(|(_, doc, _)| doc.clone())
    }

    /// Managed policy ARNs and inline policy names on a group or role.
    pub fn policies(&self, target: AttachTarget, name: &str) -> (Vec<String>, Vec<String>) {
        let state = self.state.lock();
        let holder = match target {
            AttachTarget::Group => state.groups.get(name),
            AttachTarget::Role => state.roles.get(name).map(|(_, _, holder)| holder),
        };
        holder
            .map(|h| {
                (
                    h.attached.iter().cloned().collect(),
                    h.inline.keys().cloned().collect(),
                )
            })
            .unwrap_or_default()
    }

    /// Inline policy document stored under the given name.
    pub fn inline_policy(&self, target: AttachTarget, name: &str, policy: &str) -> Option<String> {
        let state = self.state.lock();
        let holder = match target {
            AttachTarget::Group => state.groups.get(name),
            AttachTarget::Role => state.roles.get(name).map(|(_, _, holder)| holder),
        };
        holder.and_then(|h| h.inline.get(policy).cloned())
    }

    pub fn instance_profile_roles(&self, profile: &str) -> Option<Vec<String>> {
        self.state
            .lock()
            .instance_profiles
            .get(profile)
            .map(|roles| roles.iter().cloned().collect())
    }

    pub fn assignments(&self) -> Vec<AccountAssignment> {
        self.state.lock().assignments.clone()
    }

    /// Insert a permission set without the per-instance name uniqueness check. Returns its ARN.
    pub fn seed_permission_set(&self, instance_arn: &str, name: &str) -> String {
        let mut state = self.state.lock();
        let arn = format!(
            "arn:{}:sso:::permissionSet/seeded/ps-{:016}",
            self.partition,
            state.permission_sets.len()
        );
        state.permission_sets.push(StoredPermissionSet {
            instance_arn: instance_arn.to_string(),
            permission_set: PermissionSet {
                arn: arn.clone(),
                name: name.to_string(),
                description: None,
            },
            policies: PolicyHolder::default(),
        });
        arn
    }

    /// Managed policy ARNs and the inline document of a permission set.
    pub fn permission_set_policies(&self, arn: &str) -> Option<(Vec<String>, Option<String>)> {
        self.state
            .lock()
            .permission_sets
            .iter()
            .find(|ps| ps.permission_set.arn == arn)
            .map(|ps| {
                (
                    ps.policies.attached.iter().cloned().collect(),
                    ps.policies.inline.get("inline").cloned(),
                )
            })
    }

    fn lock_available(&self) -> BackendResult<parking_lot::MutexGuard<'_, State>> {
        let state = self.state.lock();
        if state.unavailable {
            return Err(BackendError::Unavailable(
                "in-memory backend marked unavailable".to_string(),
            ));
        }
        Ok(state)
    }

    fn managed_policy_name<'a>(&self, policy_arn: &'a str) -> Option<&'a str> {
        let prefix = format!("arn:{}:iam::aws:policy/", self.partition);
        policy_arn.strip_prefix(prefix.as_str())
    }

    fn check_managed_policy(&self, state: &State, policy_arn: &str) -> BackendResult<()> {
        match self.managed_policy_name(policy_arn) {
            Some(name) if state.managed_policies.contains(name) => Ok(()),
            _ => Err(BackendError::NotFound(format!(
                "Policy {policy_arn} does not exist or is not attachable."
            ))),
        }
    }
}

fn not_found(kind: PrincipalKind, name: &str) -> BackendError {
    BackendError::NotFound(format!("The {kind} with name {name} cannot be found."))
}

fn already_exists(kind: PrincipalKind, name: &str) -> BackendError {
    BackendError::AlreadyExists(format!("{kind} with name {name} already exists."))
}

fn policy_holder<'a>(
    state: &'a mut State,
    target: AttachTarget,
    name: &str,
) -> BackendResult<&'a mut PolicyHolder> {
    match target {
        AttachTarget::Group => state
            .groups
            .get_mut(name)
            .ok_or_else(|| not_found(PrincipalKind::Group, name)),
        AttachTarget::Role => state
            .roles
            .get_mut(name)
            .map(|(_, _, holder)| holder)
            .ok_or_else(|| not_found(PrincipalKind::Role, name)),
    }
}

fn generate_key_id() -> String {
    let suffix: String = Uuid::new_v4()
        .simple()
        .to_string()
        .to_uppercase()
        .chars()
        .take(16)
        .collect();
    format!("AKIA{suffix}")
}

#[async_trait]
impl IdentityBackend for InMemoryBackend {
    async fn caller_account_id(&self) -> BackendResult<String> {
        drop(self.lock_available()?);
        Ok(self.account_id.clone())
    }

    async fn get_principal(&self, kind: PrincipalKind, name: &str) -> BackendResult<Principal> {
        let mut state = self.lock_available()?;
        state.counts.get_principal += 1;
        let exists = match kind {
            PrincipalKind::User => state.users.contains_key(name),
            PrincipalKind::Group => state.groups.contains_key(name),
            PrincipalKind::Role => {
                if let Some((principal, _, _)) = state.roles.get(name) {
                    return Ok(principal.clone());
                }
                false
            }
        };
        if exists {
            Ok(Principal::new(kind, name, &self.partition, &self.account_id))
        } else {
            Err(not_found(kind, name))
        }
    }

    async fn create_user(&self, name: &str) -> BackendResult<Principal> {
        let mut state = self.lock_available()?;
        state.counts.create_user += 1;
        if state.users.contains_key(name) {
            return Err(already_exists(PrincipalKind::User, name));
        }
        state.users.insert(name.to_string(), Vec::new());
        Ok(Principal::new(PrincipalKind::User, name, &self.partition, &self.account_id))
    }

    async fn create_group(&self, name: &str) -> BackendResult<Principal> {
        let mut state = self.lock_available()?;
        state.counts.create_group += 1;
        if state.groups.contains_key(name) {
            return Err(already_exists(PrincipalKind::Group, name));
        }
        state.groups.insert(name.to_string(), PolicyHolder::default());
        Ok(Principal::new(PrincipalKind::Group, name, &self.partition, &self.account_id))
    }

    async fn add_user_to_group(&self, user: &str, group: &str) -> BackendResult<()> {
        let mut state = self.lock_available()?;
        if !state.users.contains_key(user) {
            return Err(not_found(PrincipalKind::User, user));
        }
        if !state.groups.contains_key(group) {
            return Err(not_found(PrincipalKind::Group, group));
        }
        state
            .memberships
            .insert((user.to_string(), group.to_string()));
        Ok(())
    }

    async fn list_groups_for_user(&self, user: &str) -> BackendResult<Vec<String>> {
        let state = self.lock_available()?;
        if !state.users.contains_key(user) {
            return Err(not_found(PrincipalKind::User, user));
        }
        Ok(state
            .memberships
            .iter()
            .filter(|(u, _)| u == user)
            .map(|(_, g)| g.clone())
            .collect())
    }

    async fn create_role(&self, request: &CreateRole) -> BackendResult<Principal> {
        let mut state = self.lock_available()?;
        state.counts.create_role += 1;
        if state.roles.contains_key(&request.name) {
            return Err(already_exists(PrincipalKind::Role, &request.name));
        }
        if serde_json::from_str::<serde_json::Value>(&request.trust_document).is_err() {
            return Err(BackendError::Rejected {
                code: "MalformedPolicyDocument".to_string(),
                message: "This policy contains invalid Json".to_string(),
            });
        }
        let principal = Principal::new(
            PrincipalKind::Role,
            &request.name,
            &self.partition,
            &self.account_id,
        );
        state.roles.insert(
            request.name.clone(),
            (
                principal.clone(),
                request.trust_document.clone(),
                PolicyHolder::default(),
            ),
        );
        Ok(principal)
    }

    async fn create_service_linked_role(
        &self,
        request: &CreateServiceLinkedRole,
    ) -> BackendResult<Principal> {
        let mut state = self.lock_available()?;
        state.counts.create_service_linked_role += 1;
        let name = request.role_name();
        if state.roles.contains_key(&name) {
            return Err(BackendError::Rejected {
                code: "InvalidInput".to_string(),
                message: format!(
                    "Service role name {name} has been taken in this account, please try a different suffix."
                ),
            });
        }
        let principal = Principal {
            kind: PrincipalKind::Role,
            arn: format!(
                "arn:{}:iam::{}:role/aws-service-role/{}/{name}",
                self.partition, self.account_id, request.service_name
            ),
            name: name.clone(),
        };
        state
            .roles
            .insert(name, (principal.clone(), String::new(), PolicyHolder::default()));
        Ok(principal)
    }

    async fn create_instance_profile(&self, name: &str) -> BackendResult<()> {
        let mut state = self.lock_available()?;
        state.counts.create_instance_profile += 1;
        if state.instance_profiles.contains_key(name) {
            return Err(BackendError::AlreadyExists(format!(
                "Instance Profile {name} already exists."
            )));
        }
        state
            .instance_profiles
            .insert(name.to_string(), BTreeSet::new());
        Ok(())
    }

    async fn list_instance_profile_roles(&self, profile: &str) -> BackendResult<Vec<String>> {
        let state = self.lock_available()?;
        state
            .instance_profiles
            .get(profile)
            .map(|roles| roles.iter().cloned().collect())
            .ok_or_else(|| {
                BackendError::NotFound(format!("Instance Profile {profile} cannot be found."))
            })
    }

    async fn add_role_to_instance_profile(
        &self,
        profile: &str,
        role: &str,
    ) -> BackendResult<()> {
        let mut state = self.lock_available()?;
        if !state.roles.contains_key(role) {
            return Err(not_found(PrincipalKind::Role, role));
        }
        let roles = state.instance_profiles.get_mut(profile).ok_or_else(|| {
            BackendError::NotFound(format!("Instance Profile {profile} cannot be found."))
        })?;
        if !roles.is_empty() {
            return Err(BackendError::LimitExceeded(format!(
                "Cannot exceed quota for InstanceSessionsPerInstanceProfile: 1 ({profile})"
            )));
        }
        roles.insert(role.to_string());
        Ok(())
    }

    async fn attach_policy(
        &self,
        target: AttachTarget,
        target_name: &str,
        policy_arn: &str,
    ) -> BackendResult<()> {
        let mut state = self.lock_available()?;
        state.counts.attach_policy += 1;
        self.check_managed_policy(&state, policy_arn)?;
        policy_holder(&mut state, target, target_name)?
            .attached
            .insert(policy_arn.to_string());
        Ok(())
    }

    async fn put_policy(
        &self,
        target: AttachTarget,
        target_name: &str,
        policy_name: &str,
        document: &str,
    ) -> BackendResult<()> {
        let mut state = self.lock_available()?;
        state.counts.put_policy += 1;
        policy_holder(&mut state, target, target_name)?
            .inline
            .insert(policy_name.to_string(), document.to_string());
        Ok(())
    }

    async fn list_access_keys(&self, user: &str) -> BackendResult<Vec<AccessKeyMetadata>> {
        let mut state = self.lock_available()?;
        state.counts.list_access_keys += 1;
        let keys = state
            .users
            .get(user)
            .ok_or_else(|| not_found(PrincipalKind::User, user))?;
        Ok(keys
            .iter()
            .map(|k| AccessKeyMetadata {
                access_key_id: k.access_key_id.clone(),
                created_at: Some(k.created_at),
            })
            .collect())
    }

    async fn create_access_key(&self, user: &str) -> BackendResult<AccessKeyRecord> {
        let mut state = self.lock_available()?;
        state.counts.create_access_key += 1;
        state.key_sequence += 1;
        let created_at = self.epoch + Duration::seconds(state.key_sequence);
        let keys = state
            .users
            .get_mut(user)
            .ok_or_else(|| not_found(PrincipalKind::User, user))?;
        if keys.len() >= MAX_ACCESS_KEYS {
            return Err(BackendError::LimitExceeded(format!(
                "Cannot exceed quota for AccessKeysPerUser: {MAX_ACCESS_KEYS}"
            )));
        }
        let key = StoredKey {
            access_key_id: generate_key_id(),
            secret_access_key: Uuid::new_v4().simple().to_string(),
            created_at,
        };
        keys.push(key.clone());
        Ok(AccessKeyRecord {
            access_key_id: key.access_key_id,
            secret_access_key: key.secret_access_key,
            created_at: Some(key.created_at),
        })
    }

    async fn delete_access_key(&self, user: &str, access_key_id: &str) -> BackendResult<()> {
        let mut state = self.lock_available()?;
        state.counts.delete_access_key += 1;
        let keys = state
            .users
            .get_mut(user)
            .ok_or_else(|| not_found(PrincipalKind::User, user))?;
        let before = keys.len();
        keys.retain(|k| k.access_key_id != access_key_id);
        if keys.len() == before {
            return Err(BackendError::NotFound(format!(
                "The Access Key with id {access_key_id} cannot be found."
            )));
        }
        Ok(())
    }

    async fn assume_role(&self, request: &AssumeRole) -> BackendResult<TemporaryCredentials> {
        let state = self.lock_available()?;
        let role_name = request.role_arn.rsplit('/').next().unwrap_or_default();
        let trust = match state.roles.get(role_name) {
            Some((principal, trust, _)) if principal.arn == request.role_arn => trust.clone(),
            _ => {
                return Err(BackendError::Rejected {
                    code: "AccessDenied".to_string(),
                    message: format!(
                        "Not authorized to perform sts:AssumeRole on {}",
                        request.role_arn
                    ),
                });
            }
        };
        // Enforce an external id condition when the trust document carries one.
        if let Ok(doc) = serde_json::from_str::<serde_json::Value>(&trust) {
            let required = doc
                .pointer("/Statement/0/Condition/StringEquals/sts:ExternalId")
                .and_then(|v| v.as_str());
            if required.is_some() && required != request.external_id.as_deref() {
                return Err(BackendError::Rejected {
                    code: "AccessDenied".to_string(),
                    message: "External id does not match the role trust policy".to_string(),
                });
            }
        }
        let duration = request.duration_seconds.unwrap_or(3600);
        Ok(TemporaryCredentials {
            access_key_id: format!("ASIA{}", &generate_key_id()[4..]),
            secret_access_key: Uuid::new_v4().simple().to_string(),
            session_token: Uuid::new_v4().to_string(),
            expiration: Some(Utc::now() + Duration::seconds(i64::from(duration))),
        })
    }
}

#[async_trait]
impl SsoBackend for InMemoryBackend {
    async fn list_instances(&self) -> BackendResult<Vec<SsoInstance>> {
        Ok(self.lock_available()?.sso_instances.clone())
    }

    async fn list_permission_sets(&self, instance_arn: &str) -> BackendResult<Vec<String>> {
        let state = self.lock_available()?;
        Ok(state
            .permission_sets
            .iter()
            .filter(|ps| ps.instance_arn == instance_arn)
            .map(|ps| ps.permission_set.arn.clone())
            .collect())
    }

    async fn describe_permission_set(
        &self,
        instance_arn: &str,
        permission_set_arn: &str,
    ) -> BackendResult<PermissionSet> {
        let state = self.lock_available()?;
        state
            .permission_sets
            .iter()
            .find(|ps| {
                ps.instance_arn == instance_arn && ps.permission_set.arn == permission_set_arn
            })
            .map(|ps| ps.permission_set.clone())
            .ok_or_else(|| {
                BackendError::NotFound(format!("Permission set {permission_set_arn} not found"))
            })
    }

    async fn create_permission_set(
        &self,
        instance_arn: &str,
        request: &CreatePermissionSet,
    ) -> BackendResult<PermissionSet> {
        let mut state = self.lock_available()?;
        state.counts.create_permission_set += 1;
        if state
            .permission_sets
            .iter()
            .any(|ps| ps.instance_arn == instance_arn && ps.permission_set.name == request.name)
        {
            return Err(BackendError::AlreadyExists(format!(
                "Permission set with name {} already exists",
                request.name
            )));
        }
        let instance_id = instance_arn.rsplit('/').next().unwrap_or("ssoins-0000000000000000");
        let suffix: String = Uuid::new_v4().simple().to_string().chars().take(16).collect();
        let permission_set = PermissionSet {
            arn: format!("arn:{}:sso:::permissionSet/{instance_id}/ps-{suffix}", self.partition),
            name: request.name.clone(),
            description: request.description.clone(),
        };
        state.permission_sets.push(StoredPermissionSet {
            instance_arn: instance_arn.to_string(),
            permission_set: permission_set.clone(),
            policies: PolicyHolder::default(),
        });
        Ok(permission_set)
    }

    async fn attach_managed_policy_to_permission_set(
        &self,
        instance_arn: &str,
        permission_set_arn: &str,
        policy_arn: &str,
    ) -> BackendResult<()> {
        let mut state = self.lock_available()?;
        self.check_managed_policy(&state, policy_arn)?;
        let ps = state
            .permission_sets
            .iter_mut()
            .find(|ps| {
                ps.instance_arn == instance_arn && ps.permission_set.arn == permission_set_arn
            })
            .ok_or_else(|| {
                BackendError::NotFound(format!("Permission set {permission_set_arn} not found"))
            })?;
        ps.policies.attached.insert(policy_arn.to_string());
        Ok(())
    }

    async fn put_inline_policy_to_permission_set(
        &self,
        instance_arn: &str,
        permission_set_arn: &str,
        document: &str,
    ) -> BackendResult<()> {
        let mut state = self.lock_available()?;
        let ps = state
            .permission_sets
            .iter_mut()
            .find(|ps| {
                ps.instance_arn == instance_arn && ps.permission_set.arn == permission_set_arn
            })
            .ok_or_else(|| {
                BackendError::NotFound(format!("Permission set {permission_set_arn} not found"))
            })?;
        // A permission set carries a single inline policy.
        ps.policies
            .inline
            .insert("inline".to_string(), document.to_string());
        Ok(())
    }

    async fn create_account_assignment(
        &self,
        instance_arn: &str,
        assignment: &AccountAssignment,
    ) -> BackendResult<AssignmentStatus> {
        let mut state = self.lock_available()?;
        state.counts.create_account_assignment += 1;
        let known = state.permission_sets.iter().any(|ps| {
            ps.instance_arn == instance_arn
                && ps.permission_set.arn == assignment.permission_set_arn
        });
        if !known {
            return Err(BackendError::NotFound(format!(
                "Permission set {} not found",
                assignment.permission_set_arn
            )));
        }
        state.assignments.push(assignment.clone());
        Ok(AssignmentStatus {
            request_id: Some(Uuid::new_v4().to_string()),
            status: "IN_PROGRESS".to_string(),
        })
    }
}
