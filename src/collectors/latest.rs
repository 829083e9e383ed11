//! Stable "latest" alias for downloaded feeds

use std::ffi::OsStr;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Point `<dir of saved>/<alias_name>` at `saved`.
///
/// Any existing file or symlink with the alias name is removed first. The
/// alias is a relative symlink to the saved file's name where the platform
/// allows it, otherwise a byte copy.
pub async fn publish_latest(saved: &Path, alias_name: &str) -> Result<PathBuf> {
    let file_name = saved
        .file_name()
        .with_context(|| format!("{} has no file name", saved.display()))?;
    let alias = saved
        .parent()
        .map(|dir| dir.join(alias_name))
        .unwrap_or_else(|| PathBuf::from(alias_name));

    if file_name == OsStr::new(alias_name) {
        return Ok(alias);
    }

    match tokio::fs::symlink_metadata(&alias).await {
        Ok(_) => tokio::fs::remove_file(&alias)
            .await
            .with_context(|| format!("Failed to remove old alias {}", alias.display()))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to inspect {}", alias.display()));
        }
    }

    if let Err(e) = symlink(Path::new(file_name), &alias).await {
        tracing::debug!(error = %e, alias = %alias.display(), "Symlink unavailable, copying instead");
        tokio::fs::copy(saved, &alias)
            .await
            .with_context(|| format!("Failed to copy {} to {}", saved.display(), alias.display()))?;
    }

    Ok(alias)
}

#[cfg(unix)]
async fn symlink(target: &Path, alias: &Path) -> io::Result<()> {
    tokio::fs::symlink(target, alias).await
}

#[cfg(windows)]
async fn symlink(target: &Path, alias: &Path) -> io::Result<()> {
    tokio::fs::symlink_file(target, alias).await
}

#[cfg(not(any(unix, windows)))]
async fn symlink(_target: &Path, _alias: &Path) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "symlinks not supported"))
}
