//! On-disk storage for artifact bytes
//!
//! Records keep a path relative to the store root. Dataset and chart bytes
//! live under `datasets/<id>/` and `charts/<id>/` so a record deletion can
//! drop its whole tree.

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a stored blob
    pub fn path(&self, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::InvalidPath(format!(
                "blob path escapes the store: {}",
                relative
            )));
        }
        Ok(self.root.join(rel))
    }

    pub async fn write(&self, relative: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, bytes).await?;
        Ok(path)
    }

    /// Copy a local file into the store, returning the byte count
    pub async fn copy_in(&self, relative: &str, source: &Path) -> Result<u64> {
        let path = self.path(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(fs::copy(source, &path).await?)
    }

    pub async fn read(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.path(relative)?;
        fs::read(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::NotFound(format!("blob {}", relative)),
                _ => Error::Io(e),
            })
    }

    /// Remove one blob; missing blobs are ignored
    pub async fn remove(&self, relative: &str) -> Result<()> {
        let path = self.path(relative)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a directory tree; missing trees are ignored
    pub async fn remove_tree(&self, relative: &str) -> Result<()> {
        let path = self.path(relative)?;
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Total bytes stored under a prefix
    pub fn tree_size(&self, relative: &str) -> Result<u64> {
        let path = self.path(relative)?;
        Ok(WalkDir::new(path)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum())
    }
}
