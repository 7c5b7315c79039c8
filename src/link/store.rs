//! Blob storage for link artifacts
//!
//! The link service writes two kinds of small blobs: the rendered agent
//! manifest the installation scripts fetch, and email-verification tokens.
//! Production deployments put these behind an object store; the trait keeps
//! that collaborator swappable and the filesystem implementation is enough
//! for single-node hubs and development.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{Error, Result};

/// Minimal blob store interface the link service depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether a blob exists at the given path
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Write a blob, creating parents and overwriting any previous content
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Delete a blob; deleting a missing blob is not an error
    async fn delete(&self, path: &str) -> Result<()>;
}

/// Filesystem-backed blob store rooted at a directory
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        // Blob paths are internal, but a traversal guard costs nothing.
        if Path::new(path)
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::BlobStore(format!("invalid blob path {path:?}")));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        let path = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&path)
            .await
            .map_err(|e| Error::BlobStore(format!("{}: {e}", path.display())))?)
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::BlobStore(format!("{}: {e}", parent.display())))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| Error::BlobStore(format!("{}: {e}", path.display())))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = self.resolve(path)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::BlobStore(format!("{}: {e}", path.display()))),
        }
    }
}

/// In-memory blob store for tests
#[derive(Default)]
pub struct MemBlobStore {
    files: DashMap<String, Vec<u8>>,
}

impl MemBlobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back a blob, if present
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.files.get(path).map(|v| v.clone())
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether the store holds no blobs
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemBlobStore {
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.files.contains_key(path))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        self.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.files.remove(path);
        Ok(())
    }
}

// =============================================================================
// Email verification paths
// =============================================================================

/// The domain part of an email address
pub fn domain(email: &str) -> &str {
    match email.rfind('@') {
        Some(idx) => &email[idx + 1..],
        None => "_missing_domain_",
    }
}

/// Blob path marking an email address as seen/verified
pub fn email_verified_path(domain: &str, email: &str) -> String {
    format!("domains/{domain}/emails/{email}/verified")
}

/// Blob path of one email-verification token
pub fn email_token_path(domain: &str, email: &str, token: &str) -> String {
    format!("domains/{domain}/emails/{email}/tokens/{token}")
}
