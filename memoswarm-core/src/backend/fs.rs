//! A [`StorageBackend`] over a local or shared directory.
//!
//! Keys map onto relative paths. Writes go to a hidden temporary file in the
//! destination directory and are then renamed into place, so readers in other
//! processes only ever see complete values. Concurrent writers of the same key
//! write identical bytes; whichever rename lands last wins.
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;

use super::StorageBackend;
use crate::common::random_id;

#[derive(Clone, Debug)]
pub struct FsBackend {
    root: Arc<PathBuf>,
}

impl FsBackend {
    /// Opens (creating if needed) a backend rooted at `root`.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("creating storage root {}", root.display()))?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.as_ref().clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment.starts_with('.') {
                bail!("invalid storage key {key:?}");
            }
            path.push(segment);
        }
        Ok(path)
    }
}

#[async_trait]
impl StorageBackend for FsBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let path = self.path_of(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        let path = self.path_of(key)?;
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            bail!("invalid storage key {key:?}");
        };
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;

        let tmp = parent.join(format!(".{}.{}.tmp", name.to_string_lossy(), random_id()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e).with_context(|| format!("renaming into {}", path.display()));
        }
        Ok(())
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let path = self.path_of(key)?;
        tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))
    }

    async fn iterate_keys(&self, prefix: &str) -> Result<Vec<String>> {
        // Walk only the deepest directory fully named by the prefix.
        let base = match prefix.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir,
            _ => "",
        };
        let start = if base.is_empty() {
            self.root.as_ref().clone()
        } else {
            self.path_of(base)?
        };

        let mut keys = Vec::new();
        let mut pending = vec![(start, base.to_string())];
        while let Some((dir, key_prefix)) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let key = if key_prefix.is_empty() {
                    name
                } else {
                    format!("{key_prefix}/{name}")
                };
                if entry.file_type().await?.is_dir() {
                    pending.push((entry.path(), key));
                } else if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_of(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}
