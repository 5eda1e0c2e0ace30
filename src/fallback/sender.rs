//! Sending half of the tree stream.
//!
//! Walks the tree once, then emits records in walk order so parents precede
//! their children. File content goes out in fixed-size DATA chunks; all-zero
//! chunks are skipped when sparse preservation is on.

use crate::error::MigrationError;
use crate::fallback::limit::{BandwidthLimit, Throttle};
use crate::fallback::wire::{Attrs, Data, DataEnd, Entry, Mkdir, Symlink, TreeEnd, WirePath};
use crate::fallback::TransferStats;
use crate::operation::{Operation, ProgressTracker, FS_PROGRESS};
use crate::transport::Channel;
use anyhow::{Context, Result};
use bytes::Bytes;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug)]
enum ScanKind {
    Dir,
    File { size: u64 },
    Symlink { target: WirePath },
}

#[derive(Debug)]
struct ScanEntry {
    relative: WirePath,
    full: PathBuf,
    kind: ScanKind,
    attrs: Attrs,
}

/// Walk `root` without following links. The root itself is reported as ".".
fn scan(root: &Path) -> Result<Vec<ScanEntry>> {
    let walker = ignore::WalkBuilder::new(root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_name(|a, b| a.cmp(b))
        .build();

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.context("Failed to walk source tree")?;
        let full = entry.path().to_path_buf();
        let meta = match std::fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            // Vanished while a running container kept writing
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", full.display()))
            }
        };

        let relative = full
            .strip_prefix(root)
            .context("Walked outside the source root")?;
        let relative = if relative.as_os_str().is_empty() {
            WirePath::new(".")?
        } else {
            WirePath::new(relative)?
        };

        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            ScanKind::Dir
        } else if file_type.is_file() {
            ScanKind::File { size: meta.len() }
        } else if file_type.is_symlink() {
            let target = std::fs::read_link(&full)
                .with_context(|| format!("Failed to read link {}", full.display()))?;
            ScanKind::Symlink {
                target: WirePath::new(target)?,
            }
        } else {
            tracing::debug!(path = %full.display(), "Skipping special file");
            continue;
        };

        entries.push(ScanEntry {
            relative,
            full,
            kind,
            attrs: Attrs {
                mode: meta.mode(),
                mtime: meta.mtime(),
                uid: meta.uid(),
                gid: meta.gid(),
            },
        });
    }
    Ok(entries)
}

/// Fill `buf` from `reader`, stopping early only at EOF.
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

pub struct TreeSender<'a> {
    fs: &'a Channel,
    op: &'a Operation,
    chunk_size: usize,
    preserve_sparse: bool,
    throttle: Throttle,
}

impl<'a> TreeSender<'a> {
    pub fn new(
        fs: &'a Channel,
        op: &'a Operation,
        chunk_size: usize,
        preserve_sparse: bool,
        bwlimit: Option<BandwidthLimit>,
    ) -> Self {
        Self {
            fs,
            op,
            chunk_size,
            preserve_sparse,
            throttle: Throttle::new(bwlimit),
        }
    }

    /// Stream the tree under `root`. Progress is published under `name`.
    pub async fn send_tree(mut self, root: &Path, name: &str) -> Result<TransferStats> {
        let root_owned = root.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || scan(&root_owned)).await??;
        tracing::debug!(name, entries = entries.len(), "Sending tree");

        let mut progress = self.op.progress(FS_PROGRESS, name);
        let mut stats = TransferStats::default();

        for entry in entries {
            if self.op.is_cancelled() {
                return Err(MigrationError::Cancelled.into());
            }

            match entry.kind {
                ScanKind::Dir => {
                    let msg = Mkdir {
                        path: entry.relative,
                        attrs: entry.attrs,
                    };
                    self.fs.send(&msg).await?;
                    stats.dirs += 1;
                }
                ScanKind::Symlink { target } => {
                    let msg = Symlink {
                        path: entry.relative,
                        target,
                        attrs: entry.attrs,
                    };
                    self.fs.send(&msg).await?;
                    stats.symlinks += 1;
                }
                ScanKind::File { size } => {
                    self.send_file(
                        &entry.full,
                        entry.relative,
                        size,
                        entry.attrs,
                        &mut progress,
                        &mut stats,
                    )
                    .await?;
                }
            }
        }

        self.fs
            .send(&TreeEnd {
                files: stats.files,
                bytes: stats.bytes,
            })
            .await?;
        progress.finish();

        tracing::debug!(
            name,
            files = stats.files,
            bytes = stats.bytes,
            sparse = stats.sparse_bytes,
            "Tree sent"
        );
        Ok(stats)
    }

    async fn send_file(
        &mut self,
        full: &Path,
        relative: WirePath,
        size: u64,
        attrs: Attrs,
        progress: &mut ProgressTracker,
        stats: &mut TransferStats,
    ) -> Result<()> {
        let file = match File::open(full).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %full.display(), "File vanished before transfer");
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open {}", full.display()))
            }
        };

        self.fs
            .send(&Entry {
                path: relative.clone(),
                size,
                attrs,
            })
            .await?;

        // Length as scanned; later growth is picked up by the next pass
        let mut reader = file.take(size);
        let mut buf = vec![0u8; self.chunk_size];
        let mut offset = 0u64;
        let mut status = DataEnd::STATUS_OK;

        loop {
            if self.op.is_cancelled() {
                return Err(MigrationError::Cancelled.into());
            }

            let n = match read_chunk(&mut reader, &mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!("Failed to read {}: {}", full.display(), e);
                    status = DataEnd::STATUS_ERROR;
                    break;
                }
            };

            let chunk = &buf[..n];
            if self.preserve_sparse && chunk.iter().all(|b| *b == 0) {
                stats.sparse_bytes += n as u64;
            } else {
                self.throttle.consume(n as u64).await;
                let msg = Data {
                    path: relative.clone(),
                    offset,
                    data: Bytes::copy_from_slice(chunk),
                };
                self.fs.send(&msg).await?;
                stats.bytes += n as u64;
                progress.add(n as u64);
            }
            offset += n as u64;
        }

        self.fs
            .send(&DataEnd {
                path: relative,
                status,
            })
            .await?;

        if status == DataEnd::STATUS_OK {
            stats.files += 1;
        } else {
            stats.files_err += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scan_orders_parents_first() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("b/c")).unwrap();
        std::fs::write(tmp.path().join("b/c/f"), "x").unwrap();
        std::fs::write(tmp.path().join("a"), "y").unwrap();
        std::os::unix::fs::symlink("a", tmp.path().join("link")).unwrap();

        let entries = scan(tmp.path()).unwrap();
        let paths: Vec<_> = entries.iter().map(|e| e.relative.to_string()).collect();
        assert_eq!(paths, vec![".", "a", "b", "b/c", "b/c/f", "link"]);
        assert!(
            matches!(entries[5].kind, ScanKind::Symlink { ref target } if target.as_path() == Path::new("a"))
        );
    }

    #[test]
    fn test_scan_keeps_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = TempDir::new().unwrap();
        let name = OsStr::from_bytes(b"caf\xe9.txt");
        std::fs::write(tmp.path().join(name), "x").unwrap();
        std::os::unix::fs::symlink(name, tmp.path().join("link")).unwrap();

        let entries = scan(tmp.path()).unwrap();
        assert_eq!(entries[1].relative.as_bytes(), b"caf\xe9.txt");
        assert!(matches!(entries[2].kind, ScanKind::Symlink { ref target } if target.as_bytes() == b"caf\xe9.txt"));
    }

    #[tokio::test]
    async fn test_read_chunk_fills_buffer() {
        let data = vec![7u8; 10];
        let mut reader = &data[..];
        let mut buf = [0u8; 4];
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 4);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 4);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 2);
        assert_eq!(read_chunk(&mut reader, &mut buf).await.unwrap(), 0);
    }
}
