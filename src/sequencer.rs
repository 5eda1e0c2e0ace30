//! Sink-side snapshot replay.
//!
//! Rebuilds the snapshot chain from the ordered stream of payloads: every
//! historical snapshot in creation order, then the live filesystem, then
//! the post-checkpoint delta for live migrations.

use crate::error::{MigrationError, Result};
use crate::idmap::{shift_if_necessary, IdmapShifter};
use crate::operation::Operation;
use crate::protocol::{Devices, MigrationHeader, SnapshotDescriptor};
use crate::revert::Reverter;
use crate::storage::{InstanceTarget, MountGuard, StorageDriver, TransferPhase};
use crate::transport::Channel;
use std::collections::BTreeMap;
use std::future::Future;

fn is_root_disk(device: &BTreeMap<String, String>) -> bool {
    device.get("type").map(String::as_str) == Some("disk")
        && device.get("path").map(String::as_str) == Some("/")
        && device.get("source").map_or(true, |s| s.is_empty())
}

/// Key of the root disk device, if any.
pub fn root_disk_key(devices: &Devices) -> Result<Option<&str>> {
    let mut found = None;
    for (key, device) in devices {
        if is_root_disk(device) {
            if found.is_some() {
                return Err(MigrationError::Validation(
                    "More than one root device found".to_string(),
                ));
            }
            found = Some(key.as_str());
        }
    }
    Ok(found)
}

/// The pool named by the destination's root disk.
pub fn resolve_root_pool(devices: &Devices) -> Result<String> {
    root_disk_key(devices)?
        .and_then(|key| devices.get(key))
        .and_then(|device| device.get("pool"))
        .filter(|pool| !pool.is_empty())
        .cloned()
        .ok_or_else(|| {
            MigrationError::Validation(
                "a container's root device must specify a storage pool".to_string(),
            )
        })
}

/// Point the snapshot's own root disk, if it has one, at `pool`.
///
/// A snapshot whose root disk comes from a profile is left alone.
pub fn rebind_root_disk(snapshot: &mut SnapshotDescriptor, pool: &str) -> Result<bool> {
    let key = match root_disk_key(&snapshot.devices)? {
        Some(key) => key.to_string(),
        None => return Ok(false),
    };
    if let Some(device) = snapshot.devices.get_mut(&key) {
        device.insert("pool".to_string(), pool.to_string());
    }
    Ok(true)
}

/// Ascending creation time. Stable, so ties keep declaration order.
pub fn order_snapshots(snapshots: &mut [SnapshotDescriptor]) {
    snapshots.sort_by_key(|s| s.creation_date);
}

/// One receive performed by the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassKind {
    Snapshot(String),
    Live,
    CheckpointDelta,
}

pub struct Sequencer<'a> {
    target: &'a dyn InstanceTarget,
    shifter: &'a dyn IdmapShifter,
    pool: String,
    native_snapshots: bool,
    passes: Vec<PassKind>,
}

impl<'a> Sequencer<'a> {
    /// Validate the destination. Runs before any network activity.
    pub fn prepare(
        target: &'a dyn InstanceTarget,
        native_snapshots: bool,
        shifter: &'a dyn IdmapShifter,
    ) -> Result<Self> {
        let pool = resolve_root_pool(&target.expanded_devices())?;
        Ok(Self {
            target,
            shifter,
            pool,
            native_snapshots,
            passes: Vec::new(),
        })
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    /// Receives performed so far, in order.
    pub fn passes(&self) -> &[PassKind] {
        &self.passes
    }

    /// Replay every payload announced by `header`, unless `interrupt`
    /// resolves first. On failure or interruption the snapshots created so
    /// far are deleted again, newest first.
    pub async fn run<I>(
        &mut self,
        fs: &Channel,
        op: &Operation,
        driver: &dyn StorageDriver,
        header: &MigrationHeader,
        observer: &mut (dyn FnMut(TransferPhase) + Send),
        interrupt: I,
    ) -> Result<()>
    where
        I: Future<Output = MigrationError>,
    {
        let target = self.target;
        let guard = MountGuard::acquire(target, target.name())?;

        let mut created = Reverter::new();
        let result = {
            let replay = self.replay(fs, op, driver, header, observer, &mut created);
            tokio::select! {
                biased;
                e = interrupt => Err(e),
                res = replay => res,
            }
        };

        match result {
            Ok(()) => {
                created.commit();
                guard.release()
            }
            Err(e) => {
                drop(guard);
                let failed = created
                    .unwind(|name: String| async move { target.delete_snapshot(&name).await })
                    .await;
                if failed > 0 {
                    tracing::warn!(failed, "Some received snapshots could not be removed");
                }
                Err(e)
            }
        }
    }

    async fn replay(
        &mut self,
        fs: &Channel,
        op: &Operation,
        driver: &dyn StorageDriver,
        header: &MigrationHeader,
        observer: &mut (dyn FnMut(TransferPhase) + Send),
        created: &mut Reverter<String>,
    ) -> Result<()> {
        let target = self.target;
        let src_idmap = header.idmap.as_ref();
        let dst_idmap = target.idmap();
        let container_path = target.path();

        if !header.volume_only() {
            let mut snapshots = header.snapshots.clone();
            order_snapshots(&mut snapshots);

            for mut snapshot in snapshots {
                op.check()?;
                rebind_root_disk(&mut snapshot, &self.pool)?;
                let full_name = snapshot.full_name(target.name());
                observer(TransferPhase::Snapshot(snapshot.name.clone()));

                if self.native_snapshots {
                    driver
                        .receive_payload(fs, op, &container_path, &full_name)
                        .await?;
                    shift_if_necessary(&container_path, src_idmap, dst_idmap.as_ref(), self.shifter)
                        .await?;
                    target
                        .create_as_snapshot(&snapshot)
                        .await
                        .map_err(|e| MigrationError::backend(full_name.as_str(), e))?;
                    created.record(full_name.clone());
                } else {
                    let path = target
                        .create_empty_snapshot(&snapshot)
                        .await
                        .map_err(|e| MigrationError::backend(full_name.as_str(), e))?;
                    created.record(full_name.clone());
                    driver.receive_payload(fs, op, &path, &full_name).await?;
                    shift_if_necessary(&path, src_idmap, dst_idmap.as_ref(), self.shifter).await?;
                }

                tracing::debug!(snapshot = %full_name, "Snapshot received");
                self.passes.push(PassKind::Snapshot(snapshot.name));
            }
        }

        op.check()?;
        observer(TransferPhase::Live);
        driver
            .receive_payload(fs, op, &container_path, target.name())
            .await?;
        self.passes.push(PassKind::Live);

        if header.is_live() {
            op.check()?;
            observer(TransferPhase::CheckpointDelta);
            driver
                .receive_payload(fs, op, &container_path, target.name())
                .await?;
            self.passes.push(PassKind::CheckpointDelta);
        }

        shift_if_necessary(&container_path, src_idmap, dst_idmap.as_ref(), self.shifter).await?;
        Ok(())
    }
}
