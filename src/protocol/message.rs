//! Control-channel messages.
//!
//! Field semantics are fixed; the payload encoding is bincode inside a
//! standard frame.

use crate::idmap::IdmapSet;
use crate::transport::frame::{encode_frame, MessageType, WireMessage};
use anyhow::{Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Device name -> device properties
pub type Devices = BTreeMap<String, BTreeMap<String, String>>;

/// Filesystem transfer capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    /// Generic directory-tree stream, understood by every backend
    Fallback,
    Btrfs,
    Zfs,
    Lvm,
    Ceph,
}

impl TransferType {
    pub fn is_native(&self) -> bool {
        !matches!(self, TransferType::Fallback)
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferType::Fallback => "fallback",
            TransferType::Btrfs => "btrfs",
            TransferType::Zfs => "zfs",
            TransferType::Lvm => "lvm",
            TransferType::Ceph => "ceph",
        };
        f.write_str(name)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct HeaderFlags: u32 {
        /// Transfer the volume or container only, no snapshots
        const VOLUME_ONLY = 1 << 0;
        /// Refresh an existing copy on the sink
        const REFRESH = 1 << 1;
        /// Stateful live migration: expect a post-checkpoint delta
        const LIVE = 1 << 2;
    }
}

/// Historical snapshot metadata, replayed on the sink.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    /// Snapshot name without the parent prefix
    pub name: String,
    pub creation_date: Option<DateTime<Utc>>,
    pub last_used_date: Option<DateTime<Utc>>,
    pub config: BTreeMap<String, String>,
    pub devices: Devices,
    pub profiles: Vec<String>,
    pub architecture: i32,
    pub ephemeral: bool,
    pub stateful: bool,
}

impl SnapshotDescriptor {
    pub fn new(name: impl Into<String>, creation_date: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            creation_date: Some(creation_date),
            ..Default::default()
        }
    }

    /// `<parent>/<name>`
    pub fn full_name(&self, parent: &str) -> String {
        format!("{}/{}", parent, self.name)
    }
}

/// Capability header; exactly one is sent and one received per direction
/// before any payload flows.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MigrationHeader {
    /// Advertised transfer type; unset means fallback
    pub fs: Option<TransferType>,
    pub flags: HeaderFlags,
    /// Snapshots in replay order (empty when `VOLUME_ONLY`)
    pub snapshots: Vec<SnapshotDescriptor>,
    /// The sender's identity map
    pub idmap: Option<IdmapSet>,
}

impl MigrationHeader {
    pub fn new(fs: TransferType, flags: HeaderFlags) -> Self {
        Self {
            fs: Some(fs),
            flags,
            ..Default::default()
        }
    }

    pub fn transfer_type(&self) -> TransferType {
        self.fs.unwrap_or(TransferType::Fallback)
    }

    pub fn volume_only(&self) -> bool {
        self.flags.contains(HeaderFlags::VOLUME_ONLY)
    }

    pub fn is_live(&self) -> bool {
        self.flags.contains(HeaderFlags::LIVE)
    }
}

impl WireMessage for MigrationHeader {
    const TYPE: MessageType = MessageType::Header;

    fn encode(&self) -> Bytes {
        // Plain data with no maps keyed by non-strings; serialisation cannot fail
        let payload = bincode::serialize(self).unwrap_or_default();
        encode_frame(Self::TYPE, &payload)
    }

    fn decode(payload: Bytes) -> Result<Self> {
        bincode::deserialize(&payload).context("Invalid migration header")
    }
}

/// Terminal session signal. Sent once on success, or at any point to abort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationControl {
    pub success: bool,
    pub message: String,
}

impl MigrationControl {
    pub fn success() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

impl WireMessage for MigrationControl {
    const TYPE: MessageType = MessageType::Control;

    fn encode(&self) -> Bytes {
        let payload = bincode::serialize(self).unwrap_or_default();
        encode_frame(Self::TYPE, &payload)
    }

    fn decode(payload: Bytes) -> Result<Self> {
        bincode::deserialize(&payload).context("Invalid migration control message")
    }
}
