//! Authenticated transport between the two endpoints of a session.

pub mod channel;
pub mod frame;
pub mod secret;
pub mod session;

pub use channel::{AsyncStream, BoxedStream, Channel, ChannelKind};
pub use frame::{read_frame, write_frame, MessageType, WireMessage, MAX_FRAME_SIZE};
pub use secret::{Secret, SecretRegistry};
pub use session::{Connector, Dialer, Listener, Role, SessionChannels, SessionSecrets};
