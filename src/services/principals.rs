//! Principal existence checks.

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    backend::{BackendError, IdentityBackend, Principal, PrincipalKind},
    error::ProvisionResult,
};

/// Answers "does this user/group/role already exist?" against the backend.
///
/// Nothing is cached: every call goes to the backend, which is the single
/// source of truth.
#[derive(Clone)]
pub struct PrincipalResolver {
    backend: Arc<dyn IdentityBackend>,
}

impl PrincipalResolver {
    pub fn new(backend: Arc<dyn IdentityBackend>) -> Self {
        Self { backend }
    }

    /// Look up a principal. `Ok(None)` when the backend reports it does not exist.
    pub async fn find(
        &self,
        kind: PrincipalKind,
        name: &str,
    ) -> ProvisionResult<Option<Principal>> {
        match self.backend.get_principal(kind, name).await {
            Ok(principal) => Ok(Some(principal)),
            Err(BackendError::NotFound(_)) => {
                debug!(%kind, name, "Principal does not exist");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, kind: PrincipalKind, name: &str) -> ProvisionResult<bool> {
        Ok(self.find(kind, name).await?.is_some())
    }

    /// Create a principal unless it already exists.
    ///
    /// An existing principal is logged and returned rather than treated as an error,
    /// which makes creation safe to retry. The closure runs only when the lookup
    /// reports the principal missing.
    pub async fn ensure<F, Fut>(
        &self,
        kind: PrincipalKind,
        name: &str,
        create: F,
    ) -> ProvisionResult<Ensured>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Principal, BackendError>>,
    {
        if let Some(existing) = self.find(kind, name).await? {
            info!(%kind, name, arn = %existing.arn, "Already exists, skipping creation");
            return Ok(Ensured::Existing(existing));
        }

        match create().await {
            Ok(principal) => {
                info!(%kind, name, arn = %principal.arn, "Created");
                Ok(Ensured::Created(principal))
            }
            // Lost a race with a concurrent creator: the end state is what we wanted
            Err(BackendError::AlreadyExists(_)) => {
                info!(%kind, name, "Created concurrently by another caller, skipping");
                let principal = self.find(kind, name).await?.ok_or_else(|| {
                    BackendError::NotFound(format!("{kind} {name} vanished after creation"))
                })?;
                Ok(Ensured::Existing(principal))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Outcome of an idempotent create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ensured {
    Created(Principal),
    Existing(Principal),
}

impl Ensured {
    pub fn principal(&self) -> &Principal {
        match self {
            Ensured::Created(p) | Ensured::Existing(p) => p,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Ensured::Created(_))
    }
}
