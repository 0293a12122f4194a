use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs;

/// Copy `src` (file or directory tree) to `dest`, preserving symlinks and
/// permission bits.
pub async fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let mut pending = vec![(src.to_path_buf(), dest.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        let meta = fs::symlink_metadata(&from)
            .await
            .with_context(|| format!("Failed to stat {:?}", from))?;

        if meta.file_type().is_symlink() {
            let target = fs::read_link(&from)
                .await
                .with_context(|| format!("Failed to read link {:?}", from))?;
            fs::symlink(&target, &to)
                .await
                .with_context(|| format!("Failed to link {:?} -> {:?}", to, target))?;
        } else if meta.is_dir() {
            fs::create_dir_all(&to)
                .await
                .with_context(|| format!("Failed to create {:?}", to))?;
            fs::set_permissions(&to, meta.permissions())
                .await
                .with_context(|| format!("Failed to set permissions on {:?}", to))?;

            let mut entries = fs::read_dir(&from)
                .await
                .with_context(|| format!("Failed to list {:?}", from))?;
            while let Some(entry) = entries.next_entry().await? {
                pending.push((entry.path(), to.join(entry.file_name())));
            }
        } else {
            fs::copy(&from, &to)
                .await
                .with_context(|| format!("Failed to copy {:?} to {:?}", from, to))?;
        }
    }

    Ok(())
}

/// Set mode 0775 on `root` and everything beneath it (symlinks untouched).
pub async fn open_permissions(root: &Path) -> Result<()> {
    for path in walk(root).await? {
        let meta = fs::symlink_metadata(&path).await?;
        if meta.file_type().is_symlink() {
            continue;
        }
        fs::set_permissions(&path, std::fs::Permissions::from_mode(0o775))
            .await
            .with_context(|| format!("Failed to chmod {:?}", path))?;
    }
    Ok(())
}

/// Hex SHA-256 over a file, or over every file of a directory tree in path
/// order (relative names are part of the digest).
pub async fn digest_path(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut paths = walk(root).await?;
    paths.sort();

    for path in paths {
        let meta = fs::symlink_metadata(&path).await?;
        if !meta.is_file() {
            continue;
        }
        let relative = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        let content = fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {:?} for digest", path))?;
        hasher.update(&content);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// All paths under `root`, `root` included. Symlinked directories are not
/// followed.
async fn walk(root: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(path) = pending.pop() {
        let meta = fs::symlink_metadata(&path)
            .await
            .with_context(|| format!("Failed to stat {:?}", path))?;
        if meta.is_dir() {
            let mut entries = fs::read_dir(&path).await?;
            while let Some(entry) = entries.next_entry().await? {
                pending.push(entry.path());
            }
        }
        found.push(path);
    }

    Ok(found)
}
