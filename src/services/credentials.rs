//! Access key issuance, rotation and the local credential cache.
//!
//! IAM allows at most two access keys per user. Issuance follows the live key
//! count `n`:
//!
//! - `n = 0` or `n = 1`: create a key, persist it, return it
//! - `n = 2`: delete the oldest key, then create, persist and return
//!
//! The most recently issued pair is written to a per-(user, account) CSV file in
//! the same layout the AWS console uses for downloaded keys.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    backend::{AccessKeyRecord, BackendError, IdentityBackend},
    error::{ProvisionError, ProvisionResult},
};

/// IAM's per-user access key ceiling.
pub const MAX_ACCESS_KEYS: usize = 2;

const CSV_HEADER: [&str; 2] = ["Access key ID", "Secret access key"];

/// How issuance treats an existing cache file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueMode {
    /// Return the cached pair without touching the backend when a cache file exists.
    #[default]
    ReuseIfPresent,
    /// Ignore the cache and issue a new key, rotating if the user is at the ceiling.
    ForceRotate,
}

/// Where an issued key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Cache,
    Backend,
}

/// Result of an issuance.
#[derive(Debug, Clone)]
pub struct IssuedKey {
    pub record: AccessKeyRecord,
    pub origin: KeyOrigin,
    /// Key ids deleted to make room under the ceiling.
    pub rotated_out: Vec<String>,
    pub cache_path: PathBuf,
}

/// Per-(user, account) CSV files holding the most recently issued key pair.
///
/// The file reflects what this tool issued last, not necessarily what is live in
/// the backend: keys revoked out-of-band leave a stale file behind.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    dir: PathBuf,
    file_mode: u32,
}

impl CredentialCache {
    pub fn new(dir: impl Into<PathBuf>, file_mode: u32) -> Self {
        Self {
            dir: dir.into(),
            file_mode,
        }
    }

    pub fn path(&self, user: &str, account_id: &str) -> PathBuf {
        self.dir.join(format!("{user}_{account_id}_accessKeys.csv"))
    }

    fn cache_error(path: &Path, message: impl std::fmt::Display) -> ProvisionError {
        ProvisionError::CredentialCache {
            path: path.display().to_string(),
            message: message.to_string(),
        }
    }

    /// Read the cached pair, if the file exists.
    pub async fn load(
        &self,
        user: &str,
        account_id: &str,
    ) -> ProvisionResult<Option<AccessKeyRecord>> {
        let path = self.path(user, account_id);
        let contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Self::cache_error(&path, e)),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(contents.as_slice());

        let headers = reader
            .headers()
            .map_err(|e| Self::cache_error(&path, e))?
            .clone();
        if headers.iter().map(str::trim).ne(CSV_HEADER) {
            return Err(Self::cache_error(&path, "unexpected CSV header"));
        }

        let rows = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Self::cache_error(&path, e))?;
        let [row] = rows.as_slice() else {
            return Err(Self::cache_error(
                &path,
                format!("expected exactly one data row, found {}", rows.len()),
            ));
        };

        match (row.get(0), row.get(1)) {
            (Some(id), Some(secret)) if !id.trim().is_empty() && !secret.trim().is_empty() => {
                Ok(Some(AccessKeyRecord {
                    access_key_id: id.trim().to_string(),
                    secret_access_key: secret.trim().to_string(),
                    created_at: None,
                }))
            }
            _ => Err(Self::cache_error(&path, "data row is missing a field")),
        }
    }

    /// Write the pair, replacing any previous file.
    ///
    /// Content goes to a uniquely named sibling created owner-only, which is then
    /// renamed over the target, so readers never see a partial file.
    pub async fn store(
        &self,
        user: &str,
        account_id: &str,
        record: &AccessKeyRecord,
    ) -> ProvisionResult<PathBuf> {
        let path = self.path(user, account_id);

        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(CSV_HEADER)
            .map_err(|e| Self::cache_error(&path, e))?;
        writer
            .write_record([
                record.access_key_id.as_str(),
                record.secret_access_key.as_str(),
            ])
            .map_err(|e| Self::cache_error(&path, e))?;
        let contents = writer
            .into_inner()
            .map_err(|e| Self::cache_error(&path, e.error()))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Self::cache_error(&path, e))?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp_path = self
            .dir
            .join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

        if let Err(e) = self.write_private(&temp_path, &contents).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Self::cache_error(&path, e));
        }

        if let Err(e) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(Self::cache_error(&path, e));
        }

        debug!(path = %path.display(), "Credential cache written");
        Ok(path)
    }

    async fn write_private(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(self.file_mode);

        let mut file = options.open(path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;

        // Creation mode is filtered by the umask; pin the exact permissions
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(self.file_mode))
                .await?;
        }

        Ok(())
    }
}

/// Issues and rotates access keys, enforcing the two-key ceiling.
pub struct CredentialLifecycleManager {
    backend: Arc<dyn IdentityBackend>,
    cache: CredentialCache,
    /// Serializes issuance per (account, user) within this process.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CredentialLifecycleManager {
    pub fn new(backend: Arc<dyn IdentityBackend>, cache: CredentialCache) -> Self {
        Self {
            backend,
            cache,
            locks: DashMap::new(),
        }
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    fn user_lock(&self, user: &str, account_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(format!("{account_id}/{user}"))
            .or_default()
            .clone()
    }

    /// Return usable credentials for the user, issuing a key when needed.
    #[instrument(skip(self))]
    pub async fn issue(
        &self,
        user: &str,
        account_id: &str,
        mode: IssueMode,
    ) -> ProvisionResult<IssuedKey> {
        let lock = self.user_lock(user, account_id);
        let _guard = lock.lock().await;

        if mode == IssueMode::ReuseIfPresent
            && let Some(record) = self.cache.load(user, account_id).await?
        {
            let cache_path = self.cache.path(user, account_id);
            info!(
                user,
                access_key_id = %record.access_key_id,
                path = %cache_path.display(),
                "Reusing cached access key"
            );
            return Ok(IssuedKey {
                record,
                origin: KeyOrigin::Cache,
                rotated_out: Vec::new(),
                cache_path,
            });
        }

        let mut keys = self.backend.list_access_keys(user).await?;
        keys.sort_by_key(|k| k.created_at);
        debug!(user, live_keys = keys.len(), "Listed access keys");

        let mut rotated_out = Vec::new();
        while keys.len() >= MAX_ACCESS_KEYS {
            let oldest = keys.remove(0);
            warn!(
                user,
                access_key_id = %oldest.access_key_id,
                created_at = ?oldest.created_at,
                "Key limit reached, deleting oldest access key"
            );
            match self
                .backend
                .delete_access_key(user, &oldest.access_key_id)
                .await
            {
                Ok(()) => {}
                // Another rotator got there first; the slot is free either way
                Err(BackendError::NotFound(_)) => {
                    debug!(user, access_key_id = %oldest.access_key_id, "Key already deleted");
                }
                Err(e) => return Err(e.into()),
            }
            rotated_out.push(oldest.access_key_id);
        }

        let record = match self.backend.create_access_key(user).await {
            Ok(record) => record,
            Err(BackendError::LimitExceeded(_)) => {
                return Err(ProvisionError::KeyLimitRaceCondition {
                    user: user.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        info!(user, access_key_id = %record.access_key_id, "Created access key");

        let cache_path = match self.cache.store(user, account_id, &record).await {
            Ok(path) => path,
            Err(e) => {
                error!(
                    user,
                    access_key_id = %record.access_key_id,
                    error = %e,
                    "Access key was created but could not be persisted; delete it or store it manually"
                );
                return Err(e);
            }
        };

        Ok(IssuedKey {
            record,
            origin: KeyOrigin::Backend,
            rotated_out,
            cache_path,
        })
    }
}
