#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use volmove::fallback::{BandwidthLimit, FallbackDriver};
use volmove::idmap::IdmapSet;
use volmove::protocol::{Devices, SnapshotDescriptor};
use volmove::storage::{
    Instance, InstanceSource, InstanceTarget, Mountable, SnapshotSource, StorageBackend,
    StorageDriver, StoragePool, TransferPhase, Volume, VolumeInfo,
};
use volmove::transport::{BoxedStream, Dialer, Listener, Secret};
use volmove::{Channel, MigrationConfig, MigrationError, Operation, Result, TransferType};

/// Mount and unmount calls across every fake sharing it.
#[derive(Debug, Default)]
pub struct MountLedger {
    pub mounts: AtomicUsize,
    pub unmounts: AtomicUsize,
}

impl MountLedger {
    pub fn balanced(&self) -> bool {
        self.mounts.load(Ordering::SeqCst) == self.unmounts.load(Ordering::SeqCst)
    }

    pub fn mounts(&self) -> usize {
        self.mounts.load(Ordering::SeqCst)
    }
}

/// One mountable thing, recording into a shared ledger.
#[derive(Debug)]
pub struct MountState {
    ledger: Arc<MountLedger>,
    mounted: AtomicBool,
}

impl MountState {
    pub fn new(ledger: &Arc<MountLedger>) -> Self {
        Self {
            ledger: ledger.clone(),
            mounted: AtomicBool::new(false),
        }
    }

    fn mount(&self) -> anyhow::Result<bool> {
        if self.mounted.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        self.ledger.mounts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    fn unmount(&self) -> anyhow::Result<bool> {
        if !self.mounted.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        self.ledger.unmounts.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Backend whose native driver is the fallback stream under a native tag.
pub struct FakeBackend {
    pub transfer_type: TransferType,
    pub native_snapshots: bool,
    pub native_calls: AtomicUsize,
    /// Payload the native driver gives up on after its first frame
    pub fail_payload: Option<String>,
}

impl FakeBackend {
    pub fn new(transfer_type: TransferType, native_snapshots: bool) -> Arc<Self> {
        Arc::new(Self {
            transfer_type,
            native_snapshots,
            native_calls: AtomicUsize::new(0),
            fail_payload: None,
        })
    }

    pub fn failing_payload(
        transfer_type: TransferType,
        native_snapshots: bool,
        payload: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            transfer_type,
            native_snapshots,
            native_calls: AtomicUsize::new(0),
            fail_payload: Some(payload.to_string()),
        })
    }

    pub fn native_calls(&self) -> usize {
        self.native_calls.load(Ordering::SeqCst)
    }
}

impl StorageBackend for FakeBackend {
    fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    fn has_native_snapshots(&self) -> bool {
        self.native_snapshots
    }

    fn native_driver(&self) -> anyhow::Result<Box<dyn StorageDriver>> {
        self.native_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TaggedDriver {
            tag: self.transfer_type,
            inner: FallbackDriver::new(&MigrationConfig::default()),
            fail_payload: self.fail_payload.clone(),
        }))
    }
}

struct TaggedDriver {
    tag: TransferType,
    inner: FallbackDriver,
    fail_payload: Option<String>,
}

#[async_trait]
impl StorageDriver for TaggedDriver {
    fn transfer_type(&self) -> TransferType {
        self.tag
    }

    async fn send_volume(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        volume: &dyn Volume,
    ) -> Result<()> {
        self.inner.send_volume(fs, op, bwlimit, volume).await
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
        self.inner
            .send_while_running(fs, op, bwlimit, instance, container_only, observer)
            .await
    }

    async fn send_after_checkpoint(
        &self,
        fs: &Channel,
        op: &Operation,
        bwlimit: Option<BandwidthLimit>,
        instance: &dyn InstanceSource,
    ) -> Result<()> {
        self.inner
            .send_after_checkpoint(fs, op, bwlimit, instance)
            .await
    }

    async fn receive(&self, fs: &Channel, op: &Operation, volume: &dyn Volume) -> Result<()> {
        self.inner.receive(fs, op, volume).await
    }

    async fn receive_payload(
        &self,
        fs: &Channel,
        op: &Operation,
        dest: &Path,
        name: &str,
    ) -> Result<()> {
        if self.fail_payload.as_deref() == Some(name) {
            fs.recv_frame().await?;
            return Err(MigrationError::backend(
                name,
                anyhow::anyhow!("disk quota exceeded"),
            ));
        }
        self.inner.receive_payload(fs, op, dest, name).await
    }

    fn cleanup(&self) {
        self.inner.cleanup()
    }
}

pub struct FakeVolume {
    pub info: VolumeInfo,
    pub pool: StoragePool,
    pub dir: PathBuf,
    pub mount: MountState,
}

impl FakeVolume {
    pub fn new(name: &str, dir: &Path, ledger: &Arc<MountLedger>) -> Self {
        Self {
            info: VolumeInfo {
                name: name.to_string(),
                pool: "default".to_string(),
                config: BTreeMap::new(),
            },
            pool: StoragePool {
                name: "default".to_string(),
                driver: "dir".to_string(),
                config: BTreeMap::new(),
            },
            dir: dir.to_path_buf(),
            mount: MountState::new(ledger),
        }
    }
}

impl Mountable for FakeVolume {
    fn mount(&self) -> anyhow::Result<bool> {
        self.mount.mount()
    }
    fn unmount(&self) -> anyhow::Result<bool> {
        self.mount.unmount()
    }
}

impl Volume for FakeVolume {
    fn info(&self) -> &VolumeInfo {
        &self.info
    }
    fn pool(&self) -> &StoragePool {
        &self.pool
    }
    fn mount_point(&self) -> PathBuf {
        self.dir.clone()
    }
    fn create(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

pub struct FakeSnapshot {
    name: String,
    descriptor: SnapshotDescriptor,
    dir: PathBuf,
    mount: MountState,
}

impl Mountable for FakeSnapshot {
    fn mount(&self) -> anyhow::Result<bool> {
        self.mount.mount()
    }
    fn unmount(&self) -> anyhow::Result<bool> {
        self.mount.unmount()
    }
}

impl Instance for FakeSnapshot {
    fn name(&self) -> &str {
        &self.name
    }
    fn path(&self) -> PathBuf {
        self.dir.clone()
    }
}

impl SnapshotSource for FakeSnapshot {
    fn descriptor(&self) -> SnapshotDescriptor {
        self.descriptor.clone()
    }
}

/// A container on disk: `<root>/container` plus `<root>/snapshots/<name>`,
/// each holding a `marker` file naming its state.
pub struct FakeContainer {
    pub name: String,
    pub root: PathBuf,
    pub pool: StoragePool,
    pub snapshots: Vec<(SnapshotDescriptor, PathBuf)>,
    pub fail_listing: bool,
    ledger: Arc<MountLedger>,
    mount: MountState,
}

impl FakeContainer {
    pub fn new(name: &str, root: &Path, ledger: &Arc<MountLedger>) -> Self {
        let dir = root.join("container");
        std::fs::create_dir_all(dir.join("etc")).unwrap();
        std::fs::write(dir.join("marker"), "live").unwrap();
        std::fs::write(dir.join("etc/hostname"), name).unwrap();
        Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            pool: StoragePool::default(),
            snapshots: Vec::new(),
            fail_listing: false,
            ledger: ledger.clone(),
            mount: MountState::new(ledger),
        }
    }

    /// Add a snapshot taken at unix time `at`.
    pub fn with_snapshot(mut self, name: &str, at: i64) -> Self {
        let dir = self.root.join("snapshots").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("marker"), name).unwrap();
        let descriptor = SnapshotDescriptor::new(name, Utc.timestamp_opt(at, 0).unwrap());
        self.snapshots.push((descriptor, dir));
        self
    }
}

impl Mountable for FakeContainer {
    fn mount(&self) -> anyhow::Result<bool> {
        self.mount.mount()
    }
    fn unmount(&self) -> anyhow::Result<bool> {
        self.mount.unmount()
    }
}

impl Instance for FakeContainer {
    fn name(&self) -> &str {
        &self.name
    }
    fn path(&self) -> PathBuf {
        self.root.join("container")
    }
}

impl InstanceSource for FakeContainer {
    fn pool(&self) -> &StoragePool {
        &self.pool
    }

    fn snapshots(&self) -> anyhow::Result<Vec<Box<dyn SnapshotSource>>> {
        if self.fail_listing {
            anyhow::bail!("snapshot listing failed");
        }
        Ok(self
            .snapshots
            .iter()
            .map(|(descriptor, dir)| {
                Box::new(FakeSnapshot {
                    name: descriptor.full_name(&self.name),
                    descriptor: descriptor.clone(),
                    dir: dir.clone(),
                    mount: MountState::new(&self.ledger),
                }) as Box<dyn SnapshotSource>
            })
            .collect())
    }

    fn idmap(&self) -> Option<IdmapSet> {
        None
    }
}

/// Destination container recording every snapshot operation.
pub struct FakeTarget {
    pub name: String,
    pub root: PathBuf,
    pub devices: Devices,
    pub events: Mutex<Vec<String>>,
    pub fail_snapshot: Option<String>,
    mount: MountState,
}

impl FakeTarget {
    pub fn new(name: &str, root: &Path, pool: Option<&str>, ledger: &Arc<MountLedger>) -> Self {
        std::fs::create_dir_all(root.join("container")).unwrap();
        let mut disk = BTreeMap::from([
            ("type".to_string(), "disk".to_string()),
            ("path".to_string(), "/".to_string()),
        ]);
        if let Some(pool) = pool {
            disk.insert("pool".to_string(), pool.to_string());
        }
        Self {
            name: name.to_string(),
            root: root.to_path_buf(),
            devices: Devices::from([("root".to_string(), disk)]),
            events: Mutex::new(Vec::new()),
            fail_snapshot: None,
            mount: MountState::new(ledger),
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.root.join("snapshots").join(name)
    }

    pub fn marker(&self) -> String {
        std::fs::read_to_string(self.path().join("marker")).unwrap_or_default()
    }

    fn check_fail(&self, name: &str) -> anyhow::Result<()> {
        if self.fail_snapshot.as_deref() == Some(name) {
            anyhow::bail!("no space left for {}", name);
        }
        Ok(())
    }
}

impl Mountable for FakeTarget {
    fn mount(&self) -> anyhow::Result<bool> {
        self.mount.mount()
    }
    fn unmount(&self) -> anyhow::Result<bool> {
        self.mount.unmount()
    }
}

impl Instance for FakeTarget {
    fn name(&self) -> &str {
        &self.name
    }
    fn path(&self) -> PathBuf {
        self.root.join("container")
    }
}

#[async_trait]
impl InstanceTarget for FakeTarget {
    fn expanded_devices(&self) -> Devices {
        self.devices.clone()
    }

    fn idmap(&self) -> Option<IdmapSet> {
        None
    }

    async fn create_empty_snapshot(
        &self,
        snapshot: &SnapshotDescriptor,
    ) -> anyhow::Result<PathBuf> {
        self.check_fail(&snapshot.name)?;
        let dir = self.snapshot_dir(&snapshot.name);
        std::fs::create_dir_all(&dir)?;
        self.events
            .lock()
            .unwrap()
            .push(format!("create_empty {}", snapshot.name));
        Ok(dir)
    }

    async fn create_as_snapshot(&self, snapshot: &SnapshotDescriptor) -> anyhow::Result<()> {
        self.check_fail(&snapshot.name)?;
        // Records what the container held when the snapshot was taken
        let marker = self.marker();
        self.events
            .lock()
            .unwrap()
            .push(format!("snapshot {} {}", snapshot.name, marker));
        Ok(())
    }

    async fn delete_snapshot(&self, full_name: &str) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(format!("delete {}", full_name));
        Ok(())
    }
}

/// Poll until `target` records `event`.
pub async fn wait_for_event(target: &FakeTarget, event: &str) {
    let wait = async {
        while !target.events().iter().any(|e| e == event) {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(10), wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {:?}", event));
}

/// Every snapshot created was deleted again, newest first.
pub fn assert_unwound(events: &[String]) {
    let created: Vec<&str> = events
        .iter()
        .filter_map(|e| e.strip_prefix("create_empty "))
        .collect();
    let deleted: Vec<&str> = events
        .iter()
        .filter_map(|e| e.strip_prefix("delete c1/"))
        .collect();
    let mut expected = created.clone();
    expected.reverse();
    assert_eq!(deleted, expected, "events: {:?}", events);
}

/// Dials straight into a listener over in-memory pipes.
pub struct PipeDialer {
    pub listener: Listener,
    pub dials: AtomicUsize,
}

impl PipeDialer {
    pub fn new(listener: Listener) -> Arc<Self> {
        Arc::new(Self {
            listener,
            dials: AtomicUsize::new(0),
        })
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for PipeDialer {
    async fn dial(&self, secret: &Secret) -> Result<BoxedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        let (ours, theirs) = tokio::io::duplex(256 * 1024);
        self.listener.accept(secret.as_str(), theirs)?;
        Ok(Box::new(ours))
    }
}

