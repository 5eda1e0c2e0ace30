//! Identity maps and ownership shifting.
//!
//! When source and sink map container IDs to different host ranges, the
//! received tree must be re-owned: each host ID is translated back into the
//! container namespace with the source map, then out again with the sink map.

use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdmapEntry {
    pub is_uid: bool,
    pub is_gid: bool,
    /// First host ID of the range
    pub host_id: i64,
    /// First namespace ID of the range
    pub ns_id: i64,
    pub map_range: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IdmapSet {
    pub entries: Vec<IdmapEntry>,
}

impl IdmapSet {
    pub fn new(entries: Vec<IdmapEntry>) -> Self {
        Self { entries }
    }

    /// A single uid+gid range, the common container layout.
    pub fn single_range(host_id: i64, map_range: i64) -> Self {
        Self::new(vec![IdmapEntry {
            is_uid: true,
            is_gid: true,
            host_id,
            ns_id: 0,
            map_range,
        }])
    }

    /// Namespace ID -> host ID.
    pub fn to_host(&self, id: i64, is_uid: bool) -> Option<i64> {
        self.entries
            .iter()
            .filter(|e| if is_uid { e.is_uid } else { e.is_gid })
            .find(|e| id >= e.ns_id && id < e.ns_id + e.map_range)
            .map(|e| e.host_id + (id - e.ns_id))
    }

    /// Host ID -> namespace ID.
    pub fn to_ns(&self, id: i64, is_uid: bool) -> Option<i64> {
        self.entries
            .iter()
            .filter(|e| if is_uid { e.is_uid } else { e.is_gid })
            .find(|e| id >= e.host_id && id < e.host_id + e.map_range)
            .map(|e| e.ns_id + (id - e.host_id))
    }

    /// Compare two optional maps, treating `None` as the empty map.
    pub fn equivalent(a: Option<&IdmapSet>, b: Option<&IdmapSet>) -> bool {
        let empty = IdmapSet::default();
        a.unwrap_or(&empty) == b.unwrap_or(&empty)
    }
}

/// Re-owns a tree from one identity map to another.
#[async_trait]
pub trait IdmapShifter: Send + Sync {
    async fn shift(
        &self,
        path: &Path,
        from: Option<&IdmapSet>,
        to: Option<&IdmapSet>,
    ) -> anyhow::Result<()>;
}

/// Shift `path` only when the two maps differ. Returns whether a shift ran.
pub async fn shift_if_necessary(
    path: &Path,
    src: Option<&IdmapSet>,
    dst: Option<&IdmapSet>,
    shifter: &dyn IdmapShifter,
) -> Result<bool> {
    if IdmapSet::equivalent(src, dst) {
        return Ok(false);
    }

    tracing::debug!(path = %path.display(), "Shifting ownership to destination idmap");
    shifter
        .shift(path, src, dst)
        .await
        .map_err(|e| MigrationError::backend(path.display().to_string(), e))?;
    Ok(true)
}

/// Walks the tree and `lchown`s every entry.
#[derive(Debug, Default, Clone, Copy)]
pub struct TreeShifter;

impl TreeShifter {
    fn translate(id: u32, is_uid: bool, from: Option<&IdmapSet>, to: Option<&IdmapSet>) -> u32 {
        let ns = match from {
            Some(map) => map.to_ns(id as i64, is_uid).unwrap_or(id as i64),
            None => id as i64,
        };
        let host = match to {
            Some(map) => map.to_host(ns, is_uid).unwrap_or(ns),
            None => ns,
        };
        host as u32
    }
}

#[async_trait]
impl IdmapShifter for TreeShifter {
    async fn shift(
        &self,
        path: &Path,
        from: Option<&IdmapSet>,
        to: Option<&IdmapSet>,
    ) -> anyhow::Result<()> {
        let root = path.to_path_buf();
        let from = from.cloned();
        let to = to.cloned();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            use std::os::unix::fs::MetadataExt;

            let walker = ignore::WalkBuilder::new(&root)
                .standard_filters(false)
                .follow_links(false)
                .build();
            for entry in walker {
                let entry = entry?;
                let meta = std::fs::symlink_metadata(entry.path())?;
                let uid = Self::translate(meta.uid(), true, from.as_ref(), to.as_ref());
                let gid = Self::translate(meta.gid(), false, from.as_ref(), to.as_ref());
                if uid != meta.uid() || gid != meta.gid() {
                    std::os::unix::fs::lchown(entry.path(), Some(uid), Some(gid)).map_err(
                        |e| anyhow::anyhow!("Failed to chown {}: {}", entry.path().display(), e),
                    )?;
                }
            }
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingShifter(AtomicUsize);

    #[async_trait]
    impl IdmapShifter for CountingShifter {
        async fn shift(
            &self,
            _path: &Path,
            _from: Option<&IdmapSet>,
            _to: Option<&IdmapSet>,
        ) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_translation() {
        let map = IdmapSet::single_range(100_000, 65_536);
        assert_eq!(map.to_host(0, true), Some(100_000));
        assert_eq!(map.to_host(1000, false), Some(101_000));
        assert_eq!(map.to_ns(101_000, true), Some(1000));
        assert_eq!(map.to_host(65_536, true), None);
    }

    #[test]
    fn test_uid_only_entry() {
        let map = IdmapSet::new(vec![IdmapEntry {
            is_uid: true,
            is_gid: false,
            host_id: 1000,
            ns_id: 0,
            map_range: 1,
        }]);
        assert_eq!(map.to_host(0, true), Some(1000));
        assert_eq!(map.to_host(0, false), None);
    }

    #[test]
    fn test_tree_shifter_translate() {
        let src = IdmapSet::single_range(100_000, 65_536);
        let dst = IdmapSet::single_range(200_000, 65_536);
        assert_eq!(
            TreeShifter::translate(100_033, true, Some(&src), Some(&dst)),
            200_033
        );
        // IDs outside the source range pass through
        assert_eq!(TreeShifter::translate(5, true, Some(&src), Some(&dst)), 200_005);
    }

    #[test]
    fn test_none_equals_empty() {
        assert!(IdmapSet::equivalent(None, Some(&IdmapSet::default())));
        assert!(!IdmapSet::equivalent(
            None,
            Some(&IdmapSet::single_range(100_000, 65_536))
        ));
    }

    #[tokio::test]
    async fn test_shift_only_when_maps_differ() {
        let shifter = CountingShifter(AtomicUsize::new(0));
        let map = IdmapSet::single_range(100_000, 65_536);

        let ran = shift_if_necessary(Path::new("/x"), Some(&map), Some(&map), &shifter)
            .await
            .unwrap();
        assert!(!ran);

        let other = IdmapSet::single_range(200_000, 65_536);
        let ran = shift_if_necessary(Path::new("/x"), Some(&map), Some(&other), &shifter)
            .await
            .unwrap();
        assert!(ran);
        assert_eq!(shifter.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tree_shifter_noop_on_identity() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("f"), "x").unwrap();
        TreeShifter.shift(tmp.path(), None, None).await.unwrap();
    }
}
