//! Credential persistence.
//!
//! Credentials are keyed by `"{host}:{database}"`. Each connection receives a
//! store at construction; there is no process-global cache.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use spacelink_domain::Credentials;
use tokio::sync::{Mutex, RwLock};

use crate::error::ClientError;
use crate::settings::CREDENTIALS_FILE;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Credentials>, ClientError>;

    async fn store(&self, key: &str, credentials: &Credentials) -> Result<(), ClientError>;

    async fn remove(&self, key: &str) -> Result<(), ClientError>;
}

// =============================================================================
// In-memory store
// =============================================================================

/// Process-local store, useful for tests and short-lived tools.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self, key: &str) -> Result<Option<Credentials>, ClientError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn store(&self, key: &str, credentials: &Credentials) -> Result<(), ClientError> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), credentials.clone());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ClientError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

// =============================================================================
// File store
// =============================================================================

/// JSON file store: `{ "host:db": { "identity", "auth_token", "issued_at" } }`.
///
/// Writes go to a temporary sibling and are renamed into place, so two
/// writers for the same key never leave a torn file; the last rename wins.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCredentialStore {
    /// Store at `dir/credentials.json`
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, ClientError> {
        Self::with_file_name(dir, CREDENTIALS_FILE)
    }

    /// Store at `dir/file_name`. `file_name` must be a single plain path
    /// component; anything that could resolve outside `dir` is rejected.
    pub fn with_file_name(dir: impl AsRef<Path>, file_name: &str) -> Result<Self, ClientError> {
        let dir = dir.as_ref();
        validate_file_name(file_name)?;

        std::fs::create_dir_all(dir).map_err(|e| {
            ClientError::credentials(format!("cannot create {}: {e}", dir.display()))
        })?;
        let dir = dir.canonicalize().map_err(|e| {
            ClientError::credentials(format!("cannot resolve {}: {e}", dir.display()))
        })?;

        let path = dir.join(file_name);
        if path.parent() != Some(dir.as_path()) {
            return Err(ClientError::credentials(format!(
                "credential file {} escapes {}",
                path.display(),
                dir.display()
            )));
        }

        tracing::debug!("Credential store initialized at: {:?}", path);
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, Credentials>, ClientError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(data) if data.trim().is_empty() => Ok(HashMap::new()),
            Ok(data) => serde_json::from_str(&data).map_err(|e| {
                ClientError::credentials(format!("corrupt {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(ClientError::credentials(format!(
                "cannot read {}: {e}",
                self.path.display()
            ))),
        }
    }

    async fn write_all(&self, entries: &HashMap<String, Credentials>) -> Result<(), ClientError> {
        let data = serde_json::to_string_pretty(entries)?;
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));

        tokio::fs::write(&tmp, data).await.map_err(|e| {
            ClientError::credentials(format!("cannot write {}: {e}", tmp.display()))
        })?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(ClientError::credentials(format!(
                "cannot replace {}: {e}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

fn validate_file_name(file_name: &str) -> Result<(), ClientError> {
    let mut components = Path::new(file_name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(ClientError::credentials(format!(
            "invalid credential file name '{file_name}'"
        ))),
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self, key: &str) -> Result<Option<Credentials>, ClientError> {
        Ok(self.read_all().await?.remove(key))
    }

    async fn store(&self, key: &str, credentials: &Credentials) -> Result<(), ClientError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        entries.insert(key.to_string(), credentials.clone());
        self.write_all(&entries).await?;
        tracing::debug!(key, "Stored credentials");
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), ClientError> {
        let _guard = self.write_lock.lock().await;
        let mut entries = self.read_all().await?;
        if entries.remove(key).is_some() {
            self.write_all(&entries).await?;
        }
        Ok(())
    }
}
