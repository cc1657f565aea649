//! Policy attachment to groups and roles.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::{
    backend::{AttachTarget, IdentityBackend},
    error::{ProvisionError, ProvisionResult},
    policy::{PolicySource, managed_policy_arn},
};

/// Deterministic inline policy name for a target.
///
/// With a suffix: `{target}{suffix}Policy`; without: `{target}CustomPolicy`.
/// Re-submitting under the same name overwrites the previous document.
pub fn inline_policy_name(target_name: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("{target_name}{suffix}Policy"),
        None => format!("{target_name}CustomPolicy"),
    }
}

/// What an attachment did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attached {
    Managed { policy_arn: String },
    Inline { policy_name: String },
}

/// Attaches a single resolved policy source to a group or role.
///
/// Exclusivity between sources is the caller's responsibility; see
/// [`crate::policy::PolicySourceOptions::resolve`].
#[derive(Clone)]
pub struct PolicyAttachmentManager {
    backend: Arc<dyn IdentityBackend>,
    partition: String,
}

impl PolicyAttachmentManager {
    pub fn new(backend: Arc<dyn IdentityBackend>, partition: impl Into<String>) -> Self {
        Self {
            backend,
            partition: partition.into(),
        }
    }

    #[instrument(skip(self, source), fields(source = source.kind()))]
    pub async fn attach(
        &self,
        target: AttachTarget,
        target_name: &str,
        source: &PolicySource,
        policy_name: &str,
    ) -> ProvisionResult<Attached> {
        match source {
            PolicySource::Managed(name) => {
                let policy_arn = managed_policy_arn(&self.partition, name);
                // Unknown managed policies come back as not-found; that is fatal here.
                self.backend
                    .attach_policy(target, target_name, &policy_arn)
                    .await
                    .map_err(ProvisionError::from)?;
                info!(%target, target_name, policy_arn, "Attached managed policy");
                Ok(Attached::Managed { policy_arn })
            }
            PolicySource::InlineJson(_) | PolicySource::FileJson(_) => {
                let document = source.document()?.ok_or_else(|| {
                    ProvisionError::Configuration("custom policy source has no document".into())
                })?;
                self.backend
                    .put_policy(target, target_name, policy_name, &document.to_json())
                    .await?;
                info!(%target, target_name, policy_name, "Put inline policy");
                Ok(Attached::Inline {
                    policy_name: policy_name.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;

    const POLICY: &str = r#"{"Version":"2012-10-17","Statement":[{"Effect":"Allow","Action":"s3:ListBucket","Resource":"*"}]}"#;

    async fn setup() -> (Arc<InMemoryBackend>, PolicyAttachmentManager) {
        let backend = Arc::new(InMemoryBackend::new("123456789012"));
        backend.create_group("devs").await.unwrap();
        let manager = PolicyAttachmentManager::new(backend.clone(), "aws");
        (backend, manager)
    }

    #[test]
    fn test_inline_policy_name() {
        assert_eq!(inline_policy_name("devs", Some("Group")), "devsGroupPolicy");
        assert_eq!(inline_policy_name("builder", None), "builderCustomPolicy");
    }

    #[tokio::test]
    async fn test_attach_managed() {
        let (backend, manager) = setup().await;
        let attached = manager
            .attach(
                AttachTarget::Group,
                "devs",
                &PolicySource::Managed("ReadOnlyAccess".into()),
                "unused",
            )
            .await
            .unwrap();
        assert_eq!(
            attached,
            Attached::Managed {
                policy_arn: "arn:aws:iam::aws:policy/ReadOnlyAccess".into()
            }
        );
        let (managed, inline) = backend.policies(AttachTarget::Group, "devs");
        assert_eq!(managed, vec!["arn:aws:iam::aws:policy/ReadOnlyAccess"]);
        assert!(inline.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_managed_policy_is_rejected() {
        let (_, manager) = setup().await;
        let err = manager
            .attach(
                AttachTarget::Group,
                "devs",
                &PolicySource::Managed("NotARealPolicy".into()),
                "unused",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::BackendRejection { .. }));
    }

    #[tokio::test]
    async fn test_inline_resubmission_overwrites() {
        let (backend, manager) = setup().await;
        let name = inline_policy_name("devs", None);
        let source = PolicySource::InlineJson(POLICY.into());

        manager.attach(AttachTarget::Group, "devs", &source, &name).await.unwrap();
        manager.attach(AttachTarget::Group, "devs", &source, &name).await.unwrap();

        let (_, inline) = backend.policies(AttachTarget::Group, "devs");
        assert_eq!(inline, vec!["devsCustomPolicy"]);
    }

    #[tokio::test]
    async fn test_file_source() {
        let (backend, manager) = setup().await;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("devs.json");
        std::fs::write(&path, POLICY).unwrap();

        manager
            .attach(
                AttachTarget::Group,
                "devs",
                &PolicySource::FileJson(path),
                "devsGroupPolicy",
            )
            .await
            .unwrap();
        let stored = backend
            .inline_policy(AttachTarget::Group, "devs", "devsGroupPolicy")
            .unwrap();
        assert!(stored.contains("s3:ListBucket"));
    }

    #[tokio::test]
    async fn test_malformed_json_never_reaches_backend() {
        let (backend, manager) = setup().await;
        let err = manager
            .attach(
                AttachTarget::Group,
                "devs",
                &PolicySource::InlineJson("{\"Statement\": [".into()),
                "devsCustomPolicy",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
        assert_eq!(backend.call_counts().put_policy, 0);
    }
}
