//! Abstract blob storage for CA material. The host platform's keychain is
//! behind this trait; the engine only ever sees named byte blobs.

use std::{collections::HashMap, io, path::PathBuf, sync::Mutex};

use async_trait::async_trait;

use crate::errors::ProxyError;

#[async_trait]
pub trait SecretStore: Send + Sync {
  async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), ProxyError>;
  async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, ProxyError>;
  async fn delete(&self, name: &str) -> Result<(), ProxyError>;
}

/// Secrets as files under a state directory, owner-readable only.
pub struct FsSecretStore {
  dir: PathBuf,
}

impl FsSecretStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self { Self { dir: dir.into() } }

  fn path_for(&self, name: &str) -> PathBuf { self.dir.join(name) }
}

fn persistence(e: io::Error) -> ProxyError { ProxyError::Persistence(e.to_string()) }

#[async_trait]
impl SecretStore for FsSecretStore {
  async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), ProxyError> {
    tokio::fs::create_dir_all(&self.dir).await.map_err(persistence)?;
    let path = self.path_for(name);
    tokio::fs::write(&path, bytes).await.map_err(persistence)?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))
        .await
        .map_err(persistence)?;
    }
    Ok(())
  }

  async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, ProxyError> {
    match tokio::fs::read(self.path_for(name)).await {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(persistence(e)),
    }
  }

  async fn delete(&self, name: &str) -> Result<(), ProxyError> {
    match tokio::fs::remove_file(self.path_for(name)).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(persistence(e)),
    }
  }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemorySecretStore {
  entries: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl SecretStore for MemorySecretStore {
  async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), ProxyError> {
    self.entries.lock().unwrap().insert(name.to_string(), bytes.to_vec());
    Ok(())
  }

  async fn get(&self, name: &str) -> Result<Option<Vec<u8>>, ProxyError> {
    Ok(self.entries.lock().unwrap().get(name).cloned())
  }

  async fn delete(&self, name: &str) -> Result<(), ProxyError> {
    self.entries.lock().unwrap().remove(name);
    Ok(())
  }
}
