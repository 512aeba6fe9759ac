use std::{
    fs,
    io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use data_model::{ContentDigest, ContentLocation};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::MountHost;

/// [`MountHost`] over the local filesystem. Only locations on `host_name`
/// are reachable.
#[derive(Debug, Clone)]
pub struct LocalMountHost {
    host_name: String,
}

impl LocalMountHost {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
        }
    }

    fn local_path(&self, location: &ContentLocation) -> Result<PathBuf> {
        if location.host != self.host_name {
            return Err(anyhow!(
                "host {} is not reachable from {}",
                location.host,
                self.host_name
            ));
        }
        Ok(location.path.clone())
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

fn digest_dir(root: &Path) -> Result<ContentDigest> {
    let mut files = Vec::new();
    collect_files(root, &mut files)
        .with_context(|| format!("listing {}", root.display()))?;

    let mut digest = ContentDigest::new();
    for file in files {
        let bytes = fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
        let relative = file
            .strip_prefix(root)
            .with_context(|| format!("{} is outside {}", file.display(), root.display()))?;
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        digest.insert(key, hex::encode(Sha256::digest(&bytes)));
    }
    Ok(digest)
}

fn clear_dir(root: &Path) -> io::Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[async_trait]
impl MountHost for LocalMountHost {
    async fn exists(&self, location: &ContentLocation) -> Result<bool> {
        let path = self.local_path(location)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn is_cleared(&self, location: &ContentLocation) -> Result<bool> {
        let path = self.local_path(location)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(true);
        }
        let mut entries = tokio::fs::read_dir(&path).await?;
        Ok(entries.next_entry().await?.is_none())
    }

    async fn digest(&self, location: &ContentLocation) -> Result<ContentDigest> {
        let path = self.local_path(location)?;
        let digest = tokio::task::spawn_blocking(move || digest_dir(&path)).await??;
        debug!(%location, files = digest.len(), "computed content digest");
        Ok(digest)
    }

    async fn clear(&self, location: &ContentLocation) -> Result<()> {
        let path = self.local_path(location)?;
        tokio::task::spawn_blocking(move || clear_dir(&path))
            .await?
            .with_context(|| format!("clearing {}", location))?;
        Ok(())
    }
}
