mod attachment;
mod credentials;
mod principals;
mod provisioning;
mod sso;

pub use attachment::{Attached, PolicyAttachmentManager, inline_policy_name};
pub use credentials::{
    CredentialCache, CredentialLifecycleManager, IssueMode, IssuedKey, KeyOrigin,
    MAX_ACCESS_KEYS,
};
pub use principals::{Ensured, PrincipalResolver};
pub use provisioning::{
    CreateRoleRequest, CreateUserInGroup, EMERGENCY_GROUP_NAME, EMERGENCY_MANAGED_POLICY,
    EmergencyGroupProvisioned, EmergencyGroupRequest, Provisioner, RoleProvisioned,
    UserInGroupProvisioned,
};
pub use sso::{PermissionSetRef, PermissionSetSpec, SsoAssignmentOrchestrator, SsoPrincipal};
