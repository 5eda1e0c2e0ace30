//! Live migration of storage volumes and containers between hosts.
//!
//! A migration session pairs a *source* and a *sink* over two authenticated
//! channels: a control channel carrying the negotiation header and the
//! terminal [`protocol::MigrationControl`], and a filesystem channel carrying
//! the payload.
//!
//! # Architecture
//!
//! ```text
//! +-----------------+   header / control   +-----------------+
//! | MigrationSource | <------------------> |  MigrationSink  |
//! |  (driver send)  | -------------------> | (sequencer recv)|
//! +-----------------+     fs payload       +-----------------+
//! ```
//!
//! Both ends advertise their native transfer type. If they match, the
//! backend's native driver moves the data; otherwise both sides switch to
//! the [`fallback::FallbackDriver`], a generic directory-tree stream.

pub mod config;
pub mod error;
pub mod fallback;
pub mod idmap;
pub mod logging;
pub mod operation;
pub mod protocol;
pub mod revert;
pub mod sequencer;
pub mod sink;
pub mod source;
pub mod storage;
pub mod transport;

pub use config::MigrationConfig;
pub use error::{ErrorKind, MigrationError, Result};
pub use operation::Operation;
pub use protocol::{HeaderFlags, MigrationControl, MigrationHeader, SnapshotDescriptor, TransferType};
pub use sink::{MigrationSink, SinkArgs, SinkState};
pub use source::{InstanceOptions, MigrationSource, SourceState};
pub use transport::{Channel, Role, SessionChannels};
