//! Fallback transfer: a generic directory-tree stream over the filesystem
//! channel, used whenever the two ends cannot agree on a native type.

pub mod limit;
pub mod receiver;
pub mod sender;
pub mod wire;

pub use limit::{BandwidthLimit, Throttle};
pub use receiver::TreeReceiver;
pub use sender::TreeSender;

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::operation::Operation;
use crate::protocol::TransferType;
use crate::storage::{
    InstanceSource, MountGuard, StorageDriver, TransferPhase, Volume,
};
use crate::transport::Channel;
use async_trait::async_trait;
use std::path::Path;

/// Counters for one tree transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Regular files completed
    pub files: u64,

    /// Files the sender could not read
    pub files_err: u64,

    pub dirs: u64,

    pub symlinks: u64,

    /// Content bytes on the wire
    pub bytes: u64,

    /// Zero bytes skipped instead of sent
    pub sparse_bytes: u64,

    /// Stale destination entries removed
    pub deleted: u64,
}

/// Generic driver understood by every backend.
#[derive(Debug, Clone)]
pub struct FallbackDriver {
    chunk_size: usize,
    preserve_sparse: bool,
}

impl FallbackDriver {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            chunk_size: config.transport.chunk_size,
            preserve_sparse: config.fallback.preserve_sparse,
        }
    }

    async fn send_path(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        path: &Path,
        name: &str,
    ) -> Result<TransferStats> {
        TreeSender::new(fs, op, self.chunk_size, self.preserve_sparse, bwlimit)
            .send_tree(path, name)
            .await
            .map_err(|e| MigrationError::backend(name, e))
    }

    async fn send_instance(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        instance: &dyn InstanceSource,
    ) -> Result<()> {
        let guard = MountGuard::acquire(instance, instance.name())?;
        self.send_path(fs, op, bwlimit, &instance.path(), instance.name())
            .await?;
        guard.release()
    }
}

#[async_trait]
impl StorageDriver for FallbackDriver {
    fn transfer_type(&self) -> TransferType {
        TransferType::Fallback
    }

    async fn send_volume(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        volume: &dyn Volume,
    ) -> Result<()> {
        let name = volume.info().name.clone();
        let guard = MountGuard::acquire(volume, name.as_str())?;
        let stats = self
            .send_path(fs, op, bwlimit, &volume.mount_point(), &name)
            .await?;
        guard.release()?;

        tracing::info!(volume = %name, files = stats.files, bytes = stats.bytes, "Sent storage volume");
        Ok(())
    }

    async fn send_while_running(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        instance: &dyn InstanceSource,
        container_only: bool,
        observer: &mut (dyn FnMut(TransferPhase) + Send),
    ) -> Result<()> {
        if !container_only {
            let mut snapshots = instance
                .snapshots()
                .map_err(|e| MigrationError::backend(instance.name(), e))?;
            snapshots.sort_by_key(|s| s.descriptor().creation_date);

            for snap in &snapshots {
                observer(TransferPhase::Snapshot(snap.name().to_string()));
                let guard = MountGuard::acquire(snap.as_ref(), snap.name())?;
                self.send_path(fs, op, bwlimit, &snap.path(), snap.name())
                    .await?;
                guard.release()?;
            }
        }

        observer(TransferPhase::Live);
        self.send_instance(fs, op, bwlimit, instance).await
    }

    async fn send_after_checkpoint(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        instance: &dyn InstanceSource,
    ) -> Result<()> {
        self.send_instance(fs, op, bwlimit, instance).await
    }

    async fn receive(&self, fs: &Channel, op: &Operation, volume: &dyn Volume) -> Result<()> {
        let name = volume.info().name.clone();
        volume
            .create()
            .map_err(|e| MigrationError::backend(name.as_str(), e.context("Failed to create volume")))?;

        let guard = MountGuard::acquire(volume, name.as_str())?;
        self.receive_payload(fs, op, &volume.mount_point(), &name)
            .await?;
        guard.release()
    }

    async fn receive_payload(
        &self,
        fs: &Channel,
        op: &Operation,
        dest: &Path,
        name: &str,
    ) -> Result<()> {
        let stats = TreeReceiver::new(fs, op, dest, name)
            .receive_tree()
            .await
            .map_err(|e| MigrationError::backend(name, e))?;
        tracing::debug!(name, files = stats.files, deleted = stats.deleted, "Received payload");
        Ok(())
    }

    fn cleanup(&self) {
        // Nothing is staged outside the destination tree
        tracing::debug!("Fallback driver cleanup");
    }
}
