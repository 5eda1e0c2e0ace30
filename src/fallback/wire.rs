//! Tree stream messages carried on the filesystem channel.
//!
//! Paths are raw bytes with a u16 length prefix, so names that are not
//! UTF-8 travel unchanged. One tree is a sequence of
//! MKDIR / SYMLINK / (ENTRY, DATA*, DATA_END) records closed by TREE_END.
//! Parents always precede their children.

use crate::transport::frame::{MessageType, WireMessage, FRAME_HEADER_LEN};
use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// A path that fits the stream's u16 length prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WirePath(PathBuf);

impl WirePath {
    pub const MAX_LEN: usize = u16::MAX as usize;

    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let len = path.as_os_str().len();
        if len > Self::MAX_LEN {
            anyhow::bail!(
                "Path of {} bytes exceeds the tree stream limit of {}: {}",
                len,
                Self::MAX_LEN,
                path.display()
            );
        }
        Ok(Self(path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_os_str().as_bytes()
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl fmt::Display for WirePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

fn put_path(buf: &mut BytesMut, path: &WirePath) {
    // Bounded by WirePath::new
    buf.put_u16(path.len() as u16);
    buf.put_slice(path.as_bytes());
}

fn get_path(payload: &mut Bytes, what: &str) -> Result<WirePath> {
    if payload.remaining() < 2 {
        anyhow::bail!("{} length truncated", what);
    }
    let len = payload.get_u16() as usize;
    if payload.remaining() < len {
        anyhow::bail!(
            "{} truncated: expected {} bytes, got {}",
            what,
            len,
            payload.remaining()
        );
    }
    let raw = payload.copy_to_bytes(len);
    Ok(WirePath(PathBuf::from(OsStr::from_bytes(&raw))))
}

fn frame(msg_type: MessageType, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload_len);
    buf.put_u32(payload_len as u32);
    buf.put_u8(msg_type as u8);
    buf
}

/// Ownership and timestamp shared by every record kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attrs {
    pub mode: u32,
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
}

impl Attrs {
    const LEN: usize = 4 + 8 + 4 + 4;

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.mode);
        buf.put_i64(self.mtime);
        buf.put_u32(self.uid);
        buf.put_u32(self.gid);
    }

    fn get(payload: &mut Bytes, what: &str) -> Result<Self> {
        if payload.remaining() < Self::LEN {
            anyhow::bail!("{} attributes truncated", what);
        }
        Ok(Self {
            mode: payload.get_u32(),
            mtime: payload.get_i64(),
            uid: payload.get_u32(),
            gid: payload.get_u32(),
        })
    }
}

// =============================================================================
// ENTRY (0x10)
// =============================================================================

/// Regular file header; its content follows as DATA frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub path: WirePath,
    /// Final length, restored after sparse chunks were skipped
    pub size: u64,
    pub attrs: Attrs,
}

impl WireMessage for Entry {
    const TYPE: MessageType = MessageType::Entry;

    fn encode(&self) -> Bytes {
        let payload_len = 2 + self.path.len() + 8 + Attrs::LEN;
        let mut buf = frame(Self::TYPE, payload_len);
        put_path(&mut buf, &self.path);
        buf.put_u64(self.size);
        self.attrs.put(&mut buf);
        buf.freeze()
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_path(&mut payload, "Entry path")?;
        if payload.remaining() < 8 {
            anyhow::bail!("Entry payload truncated");
        }
        let size = payload.get_u64();
        let attrs = Attrs::get(&mut payload, "Entry")?;
        Ok(Self { path, size, attrs })
    }
}

// =============================================================================
// DATA (0x11)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub path: WirePath,
    pub offset: u64,
    pub data: Bytes,
}

impl WireMessage for Data {
    const TYPE: MessageType = MessageType::Data;

    fn encode(&self) -> Bytes {
        let payload_len = 2 + self.path.len() + 8 + 4 + self.data.len();
        let mut buf = frame(Self::TYPE, payload_len);
        put_path(&mut buf, &self.path);
        buf.put_u64(self.offset);
        buf.put_u32(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_path(&mut payload, "Data path")?;
        if payload.remaining() < 12 {
            anyhow::bail!("Data payload truncated");
        }
        let offset = payload.get_u64();
        let data_len = payload.get_u32() as usize;
        if payload.remaining() < data_len {
            anyhow::bail!("Data content truncated");
        }
        let data = payload.copy_to_bytes(data_len);
        Ok(Self { path, offset, data })
    }
}

// =============================================================================
// DATA_END (0x12)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataEnd {
    pub path: WirePath,
    pub status: u8,
}

impl DataEnd {
    pub const STATUS_OK: u8 = 0;
    /// The sender could not finish reading the file
    pub const STATUS_ERROR: u8 = 1;
}

impl WireMessage for DataEnd {
    const TYPE: MessageType = MessageType::DataEnd;

    fn encode(&self) -> Bytes {
        let payload_len = 2 + self.path.len() + 1;
        let mut buf = frame(Self::TYPE, payload_len);
        put_path(&mut buf, &self.path);
        buf.put_u8(self.status);
        buf.freeze()
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_path(&mut payload, "DataEnd path")?;
        if payload.remaining() < 1 {
            anyhow::bail!("DataEnd payload truncated");
        }
        Ok(Self {
            path,
            status: payload.get_u8(),
        })
    }
}

// =============================================================================
// MKDIR (0x13)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mkdir {
    /// "." for the tree root
    pub path: WirePath,
    pub attrs: Attrs,
}

impl WireMessage for Mkdir {
    const TYPE: MessageType = MessageType::Mkdir;

    fn encode(&self) -> Bytes {
        let payload_len = 2 + self.path.len() + Attrs::LEN;
        let mut buf = frame(Self::TYPE, payload_len);
        put_path(&mut buf, &self.path);
        self.attrs.put(&mut buf);
        buf.freeze()
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_path(&mut payload, "Mkdir path")?;
        let attrs = Attrs::get(&mut payload, "Mkdir")?;
        Ok(Self { path, attrs })
    }
}

// =============================================================================
// SYMLINK (0x14)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symlink {
    pub path: WirePath,
    pub target: WirePath,
    pub attrs: Attrs,
}

impl WireMessage for Symlink {
    const TYPE: MessageType = MessageType::Symlink;

    fn encode(&self) -> Bytes {
        let payload_len = 2 + self.path.len() + 2 + self.target.len() + Attrs::LEN;
        let mut buf = frame(Self::TYPE, payload_len);
        put_path(&mut buf, &self.path);
        put_path(&mut buf, &self.target);
        self.attrs.put(&mut buf);
        buf.freeze()
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        let path = get_path(&mut payload, "Symlink path")?;
        let target = get_path(&mut payload, "Symlink target")?;
        let attrs = Attrs::get(&mut payload, "Symlink")?;
        Ok(Self {
            path,
            target,
            attrs,
        })
    }
}

// =============================================================================
// TREE_END (0x15)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeEnd {
    pub files: u64,
    pub bytes: u64,
}

impl WireMessage for TreeEnd {
    const TYPE: MessageType = MessageType::TreeEnd;

    fn encode(&self) -> Bytes {
        let mut buf = frame(Self::TYPE, 16);
        buf.put_u64(self.files);
        buf.put_u64(self.bytes);
        buf.freeze()
    }

    fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < 16 {
            anyhow::bail!("TreeEnd payload too short");
        }
        Ok(Self {
            files: payload.get_u64(),
            bytes: payload.get_u64(),
        })
    }
}
