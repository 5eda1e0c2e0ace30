//! Migration protocol: header and control messages, and the negotiation
//! that picks native or fallback transfer.

pub mod message;
pub mod negotiate;

pub use message::{
    Devices, HeaderFlags, MigrationControl, MigrationHeader, SnapshotDescriptor, TransferType,
};
pub use negotiate::{initiate, negotiate, report, respond};
