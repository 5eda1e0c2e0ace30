//! Receiving half of the tree stream.
//!
//! Every incoming path is validated against the destination root. Files are
//! written to a temporary sibling and renamed into place once complete.
//! After TREE_END, anything under the root that the stream did not mention
//! is removed, so the destination mirrors the source.

use crate::error::MigrationError;
use crate::fallback::wire::{Attrs, Data, DataEnd, Entry, Mkdir, Symlink, TreeEnd};
use crate::fallback::TransferStats;
use crate::operation::{Operation, ProgressTracker, FS_PROGRESS};
use crate::protocol::MigrationControl;
use crate::transport::{Channel, MessageType, WireMessage};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tempfile::TempPath;
use tokio::fs::{self, File};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};

/// Validate that a relative path is safe and doesn't escape the root.
/// Returns the full path if valid.
pub(crate) fn validate_path(root: &Path, relative: &Path) -> Result<PathBuf> {
    if relative.as_os_str().is_empty() {
        anyhow::bail!("Empty path not allowed");
    }

    if relative.is_absolute() {
        anyhow::bail!("Absolute paths not allowed: {}", relative.display());
    }

    for component in relative.components() {
        match component {
            Component::ParentDir => {
                anyhow::bail!("Path traversal not allowed: {}", relative.display());
            }
            Component::Prefix(_) => {
                anyhow::bail!("Prefix paths not allowed: {}", relative.display());
            }
            _ => {}
        }
    }

    let full = normalize_path(&root.join(relative));
    if !full.starts_with(normalize_path(root)) {
        anyhow::bail!("Path escapes root directory: {}", relative.display());
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

/// Relative symlink targets must resolve inside the root. Absolute targets
/// are kept as-is; they resolve against the instance's own root at runtime.
fn validate_symlink_target(root: &Path, link_path: &Path, target: &Path) -> Result<()> {
    if target.as_os_str().is_empty() {
        anyhow::bail!("Empty symlink target: {}", link_path.display());
    }
    if target.is_absolute() {
        return Ok(());
    }

    if let Some(link_parent) = link_path.parent() {
        let resolved = normalize_path(&link_parent.join(target));
        if !resolved.starts_with(normalize_path(root)) {
            anyhow::bail!(
                "Symlink target escapes root: {} -> {}",
                link_path.display(),
                target.display()
            );
        }
    }

    Ok(())
}

/// Best-effort ownership. Unprivileged receivers keep their own IDs.
fn apply_owner(path: &Path, attrs: &Attrs) {
    use std::os::unix::fs::MetadataExt;

    let current = match std::fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return,
    };
    if current.uid() == attrs.uid && current.gid() == attrs.gid {
        return;
    }
    if let Err(e) = std::os::unix::fs::lchown(path, Some(attrs.uid), Some(attrs.gid)) {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            tracing::debug!(path = %path.display(), "Not permitted to change ownership");
        } else {
            tracing::warn!("Failed to chown {}: {}", path.display(), e);
        }
    }
}

async fn apply_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;

    let perms = std::fs::Permissions::from_mode(mode & 0o7777);
    if let Err(e) = fs::set_permissions(path, perms).await {
        tracing::warn!("Failed to set permissions on {}: {}", path.display(), e);
    }
}

/// Remove whatever is at `path` unless it is a directory.
async fn remove_non_dir(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display())),
        _ => Ok(()),
    }
}

/// Remove whatever is at `path`, directory trees included.
async fn remove_any(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display())),
        Ok(_) => fs::remove_file(path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display())),
        Err(_) => Ok(()),
    }
}

struct PendingFile {
    entry: Entry,
    full_path: PathBuf,
    file: File,
    temp: TempPath,
}

pub struct TreeReceiver<'a> {
    fs: &'a Channel,
    root: PathBuf,
    pending: Option<PendingFile>,
    seen: HashSet<PathBuf>,
    dir_times: Vec<(PathBuf, i64)>,
    progress: ProgressTracker,
    stats: TransferStats,
}

impl<'a> TreeReceiver<'a> {
    pub fn new(fs: &'a Channel, op: &Operation, root: &Path, name: &str) -> Self {
        Self {
            fs,
            root: normalize_path(root),
            pending: None,
            seen: HashSet::new(),
            dir_times: Vec::new(),
            progress: op.progress(FS_PROGRESS, name),
            stats: TransferStats::default(),
        }
    }

    /// Receive one complete tree into the root.
    pub async fn receive_tree(mut self) -> Result<TransferStats> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create {}", self.root.display()))?;

        loop {
            if self.progress.operation().is_cancelled() {
                return Err(MigrationError::Cancelled.into());
            }

            let (msg_type, payload) = self.fs.recv_frame().await?;
            if msg_type == MessageType::TreeEnd {
                let end = TreeEnd::decode(payload)?;
                if end.files != self.stats.files {
                    tracing::warn!(
                        expected = end.files,
                        received = self.stats.files,
                        "Tree file count mismatch"
                    );
                }
                break;
            }
            self.handle_message(msg_type, payload).await?;
        }

        if let Some(pending) = self.pending.take() {
            anyhow::bail!("Tree ended inside file {}", pending.entry.path);
        }

        self.remove_stale().await?;
        self.apply_dir_times().await;
        self.progress.finish();

        tracing::debug!(
            root = %self.root.display(),
            files = self.stats.files,
            bytes = self.stats.bytes,
            deleted = self.stats.deleted,
            "Tree received"
        );
        Ok(self.stats)
    }

    async fn handle_message(&mut self, msg_type: MessageType, payload: Bytes) -> Result<()> {
        match msg_type {
            MessageType::Mkdir => self.handle_mkdir(Mkdir::decode(payload)?).await,
            MessageType::Symlink => self.handle_symlink(Symlink::decode(payload)?).await,
            MessageType::Entry => self.handle_entry(Entry::decode(payload)?).await,
            MessageType::Data => self.handle_data(Data::decode(payload)?).await,
            MessageType::DataEnd => self.handle_data_end(DataEnd::decode(payload)?).await,
            MessageType::Control => {
                let control = MigrationControl::decode(payload)?;
                if control.success {
                    anyhow::bail!("Unexpected success control inside tree stream");
                }
                Err(MigrationError::Remote(control.message).into())
            }
            other => anyhow::bail!("Unexpected {:?} frame in tree stream", other),
        }
    }

    async fn handle_mkdir(&mut self, mkdir: Mkdir) -> Result<()> {
        let full_path = validate_path(&self.root, mkdir.path.as_path())?;
        remove_non_dir(&full_path).await?;
        fs::create_dir_all(&full_path)
            .await
            .with_context(|| format!("Failed to create {}", full_path.display()))?;

        apply_mode(&full_path, mkdir.attrs.mode).await;
        apply_owner(&full_path, &mkdir.attrs);

        self.dir_times.push((full_path.clone(), mkdir.attrs.mtime));
        self.seen.insert(full_path);
        self.stats.dirs += 1;
        Ok(())
    }

    async fn handle_symlink(&mut self, symlink: Symlink) -> Result<()> {
        let full_path = validate_path(&self.root, symlink.path.as_path())?;
        validate_symlink_target(&self.root, &full_path, symlink.target.as_path())?;

        remove_any(&full_path).await?;
        fs::symlink(symlink.target.as_path(), &full_path)
            .await
            .with_context(|| format!("Failed to create symlink {}", full_path.display()))?;

        apply_owner(&full_path, &symlink.attrs);
        let mtime = filetime::FileTime::from_unix_time(symlink.attrs.mtime, 0);
        if let Err(e) = filetime::set_symlink_file_times(&full_path, mtime, mtime) {
            tracing::warn!("Failed to set mtime on {}: {}", full_path.display(), e);
        }

        self.seen.insert(full_path);
        self.stats.symlinks += 1;
        Ok(())
    }

    async fn handle_entry(&mut self, entry: Entry) -> Result<()> {
        if let Some(pending) = &self.pending {
            anyhow::bail!(
                "File {} started before {} finished",
                entry.path,
                pending.entry.path
            );
        }

        let full_path = validate_path(&self.root, entry.path.as_path())?;
        let parent = full_path
            .parent()
            .with_context(|| format!("No parent directory for {}", entry.path))?;
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let (file, temp) = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?
            .into_parts();

        self.pending = Some(PendingFile {
            entry,
            full_path,
            file: File::from_std(file),
            temp,
        });
        Ok(())
    }

    async fn handle_data(&mut self, data: Data) -> Result<()> {
        let pending = match self.pending.as_mut() {
            Some(p) if p.entry.path == data.path => p,
            _ => anyhow::bail!("No pending file for {}", data.path),
        };

        pending.file.seek(SeekFrom::Start(data.offset)).await?;
        pending
            .file
            .write_all(&data.data)
            .await
            .with_context(|| format!("Failed to write {}", pending.entry.path))?;

        self.stats.bytes += data.data.len() as u64;
        self.progress.add(data.data.len() as u64);
        Ok(())
    }

    async fn handle_data_end(&mut self, end: DataEnd) -> Result<()> {
        let PendingFile {
            entry,
            full_path,
            mut file,
            temp,
        } = match self.pending.take() {
            Some(p) if p.entry.path == end.path => p,
            _ => anyhow::bail!("No pending file for {}", end.path),
        };

        // Keep any existing copy when the sender could not read the file
        self.seen.insert(full_path.clone());
        if end.status != DataEnd::STATUS_OK {
            tracing::warn!(path = %entry.path, "Sender failed to read file, keeping previous copy");
            self.stats.files_err += 1;
            return Ok(());
        }

        // Skipped zero chunks leave holes; restore the length
        file.set_len(entry.size).await?;
        file.flush().await?;
        drop(file);

        // rename() replaces files and links but not directories
        if let Ok(meta) = fs::symlink_metadata(&full_path).await {
            if meta.is_dir() {
                remove_any(&full_path).await?;
            }
        }
        temp.persist(&full_path)
            .with_context(|| format!("Failed to rename into {}", full_path.display()))?;

        apply_mode(&full_path, entry.attrs.mode).await;
        apply_owner(&full_path, &entry.attrs);
        let mtime = filetime::FileTime::from_unix_time(entry.attrs.mtime, 0);
        if let Err(e) = filetime::set_file_mtime(&full_path, mtime) {
            tracing::warn!("Failed to set mtime on {}: {}", full_path.display(), e);
        }

        self.stats.files += 1;
        Ok(())
    }

    /// Delete everything under the root the stream did not mention.
    async fn remove_stale(&mut self) -> Result<()> {
        let root = self.root.clone();
        let on_disk = tokio::task::spawn_blocking(move || -> Result<Vec<PathBuf>> {
            let walker = ignore::WalkBuilder::new(&root)
                .standard_filters(false)
                .follow_links(false)
                .build();
            let mut paths = Vec::new();
            for entry in walker {
                let entry = entry.context("Failed to walk destination tree")?;
                paths.push(normalize_path(entry.path()));
            }
            Ok(paths)
        })
        .await??;

        // Walk order is depth first with parents first, so the descendants of
        // a removed directory directly follow it
        let mut removed: Option<PathBuf> = None;
        for path in on_disk {
            if path == self.root || self.seen.contains(&path) {
                continue;
            }
            if removed.as_ref().map_or(false, |r| path.starts_with(r)) {
                continue;
            }
            remove_any(&path).await?;
            tracing::debug!(path = %path.display(), "Removed stale entry");
            self.stats.deleted += 1;
            removed = Some(path);
        }
        Ok(())
    }

    /// Directory mtimes last, deepest first, since writing children bumps them.
    async fn apply_dir_times(&mut self) {
        for (path, mtime) in self.dir_times.drain(..).rev() {
            let mtime = filetime::FileTime::from_unix_time(mtime, 0);
            if let Err(e) = filetime::set_file_mtime(&path, mtime) {
                tracing::warn!("Failed to set mtime on {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_path() {
        let root = Path::new("/var/lib/c1/rootfs");
        let check = |rel: &str| validate_path(root, Path::new(rel));
        assert_eq!(
            check("etc/hosts").unwrap(),
            PathBuf::from("/var/lib/c1/rootfs/etc/hosts")
        );
        assert_eq!(check(".").unwrap(), PathBuf::from(root));
        assert!(check("").is_err());
        assert!(check("/etc/passwd").is_err());
        assert!(check("../c2/rootfs").is_err());
        assert!(check("etc/../../x").is_err());
    }

    #[test]
    fn test_validate_symlink_target() {
        let root = Path::new("/r");
        let link = Path::new("/r/etc/localtime");
        let check = |target: &str| validate_symlink_target(root, link, Path::new(target));
        assert!(check("/usr/share/zoneinfo/UTC").is_ok());
        assert!(check("../usr/share/zoneinfo/UTC").is_ok());
        assert!(check("../../../etc/shadow").is_err());
        assert!(check("").is_err());
    }
}
