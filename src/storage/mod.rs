//! Storage driver boundary.
//!
//! Pools, volumes and instances are accessors provided by the storage layer.
//! A [`StorageDriver`] moves their contents over the filesystem channel and
//! is chosen once per session by [`select_driver`], after negotiation.

pub mod mount;

pub use mount::{MountGuard, Mountable};

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::fallback::{BandwidthLimit, FallbackDriver};
use crate::idmap::IdmapSet;
use crate::operation::Operation;
use crate::protocol::{Devices, SnapshotDescriptor, TransferType};
use crate::transport::Channel;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Pool configuration key carrying the fallback bandwidth cap
pub const BWLIMIT_KEY: &str = "rsync.bwlimit";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoragePool {
    pub name: String,
    /// Backend name, e.g. "btrfs" or "dir"
    pub driver: String,
    pub config: BTreeMap<String, String>,
}

impl StoragePool {
    /// Bandwidth cap for fallback transfers out of this pool.
    ///
    /// The pool's own `rsync.bwlimit` wins over the configured default.
    pub fn fallback_bwlimit(&self, config: &MigrationConfig) -> Result<Option<BandwidthLimit>> {
        match self.config.get(BWLIMIT_KEY) {
            Some(value) => BandwidthLimit::parse(value),
            None => match &config.fallback.default_bwlimit {
                Some(value) => BandwidthLimit::parse(value),
                None => Ok(None),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VolumeInfo {
    pub name: String,
    pub pool: String,
    pub config: BTreeMap<String, String>,
}

impl VolumeInfo {
    /// Merge `other` into this config. Later values replace earlier ones.
    pub fn merge_config(&mut self, other: &BTreeMap<String, String>) {
        for (k, v) in other {
            self.config.insert(k.clone(), v.clone());
        }
    }
}

/// A custom storage volume.
pub trait Volume: Mountable {
    fn info(&self) -> &VolumeInfo;
    fn pool(&self) -> &StoragePool;
    fn mount_point(&self) -> PathBuf;
    /// Create the (empty) volume on this host.
    fn create(&self) -> anyhow::Result<()>;
}

/// Anything with a root filesystem: a container or one of its snapshots.
pub trait Instance: Mountable {
    fn name(&self) -> &str;
    fn path(&self) -> PathBuf;
}

pub trait SnapshotSource: Instance {
    fn descriptor(&self) -> SnapshotDescriptor;
}

/// A container being migrated away from this host.
pub trait InstanceSource: Instance {
    fn pool(&self) -> &StoragePool;
    /// Historical snapshots, in any order.
    fn snapshots(&self) -> anyhow::Result<Vec<Box<dyn SnapshotSource>>>;
    fn idmap(&self) -> Option<IdmapSet>;
}

/// The container being recreated on this host.
#[async_trait]
pub trait InstanceTarget: Instance {
    /// Devices after profile expansion; the root disk names the pool.
    fn expanded_devices(&self) -> Devices;
    fn idmap(&self) -> Option<IdmapSet>;
    /// Create an empty snapshot record and return its filesystem path.
    async fn create_empty_snapshot(&self, snapshot: &SnapshotDescriptor) -> anyhow::Result<PathBuf>;
    /// Capture the container's current filesystem as a snapshot.
    async fn create_as_snapshot(&self, snapshot: &SnapshotDescriptor) -> anyhow::Result<()>;
    async fn delete_snapshot(&self, full_name: &str) -> anyhow::Result<()>;
}

/// The storage backend of one endpoint.
pub trait StorageBackend: Send + Sync {
    /// Native transfer type advertised in the header.
    fn transfer_type(&self) -> TransferType;
    /// Whether the backend can snapshot a live container in place.
    fn has_native_snapshots(&self) -> bool;
    fn native_driver(&self) -> anyhow::Result<Box<dyn StorageDriver>>;
}

/// Reported by the source driver as each pass starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPhase {
    Snapshot(String),
    Live,
    CheckpointDelta,
}

#[async_trait]
pub trait StorageDriver: Send + Sync {
    fn transfer_type(&self) -> TransferType;

    async fn send_volume(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        volume: &dyn Volume,
    ) -> Result<()>;

    /// Stream each snapshot (unless `container_only`), then the live
    /// filesystem, while the container keeps running.
    async fn send_while_running(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        instance: &dyn InstanceSource,
        container_only: bool,
        observer: &mut (dyn FnMut(TransferPhase) + Send),
    ) -> Result<()>;

    /// Stream the changes made since the last pass, after the checkpoint.
    async fn send_after_checkpoint(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        instance: &dyn InstanceSource,
    ) -> Result<()>;

    /// Create `volume` and receive its contents.
    async fn receive(&self, fs: &Channel, op: &Operation, volume: &dyn Volume) -> Result<()>;

    /// Receive one payload into an existing path.
    async fn receive_payload(
        &self,
        fs: &Channel,
        op: &Operation,
        dest: &Path,
        name: &str,
    ) -> Result<()>;

    /// Release anything a failed transfer left behind.
    fn cleanup(&self);
}

/// Pick the driver for the negotiated transfer type.
///
/// Native drivers are only requested when both ends agreed on the native
/// type; every other outcome uses the fallback tree stream.
pub fn select_driver(
    backend: &dyn StorageBackend,
    negotiated: TransferType,
    config: &MigrationConfig,
) -> Result<Box<dyn StorageDriver>> {
    if !negotiated.is_native() {
        return Ok(Box::new(FallbackDriver::new(config)));
    }

    let driver = backend
        .native_driver()
        .map_err(|e| MigrationError::backend(negotiated.to_string(), e))?;
    if driver.transfer_type() != negotiated {
        return Err(MigrationError::Negotiation(format!(
            "Backend provided a {} driver for a {} transfer",
            driver.transfer_type(),
            negotiated
        )));
    }
    Ok(driver)
}
