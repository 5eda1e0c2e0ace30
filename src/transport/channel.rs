//! Authenticated duplex channel carrying framed messages.
//!
//! A [`Channel`] wraps one connected byte stream. Sends and receives are
//! serialised per direction; [`Channel::disconnect`] is idempotent and wakes
//! any in-flight operation with a transport error.

use crate::error::{MigrationError, Result};
use crate::protocol::MigrationControl;
use crate::transport::frame::{read_frame, write_frame, MessageType, WireMessage, MAX_FRAME_SIZE};
use bytes::Bytes;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};

/// Byte stream a channel can be built on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Header and terminal success/failure signalling
    Control,
    /// Volume and container payload
    Fs,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Control => f.write_str("control"),
            ChannelKind::Fs => f.write_str("fs"),
        }
    }
}

pub struct Channel {
    kind: ChannelKind,
    reader: Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: Mutex<Option<WriteHalf<BoxedStream>>>,
    closed: watch::Sender<bool>,
    max_frame_size: u32,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Channel {
    pub fn new<S>(kind: ChannelKind, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_boxed(kind, Box::new(stream))
    }

    pub fn from_boxed(kind: ChannelKind, stream: BoxedStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Self {
            kind,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Send a pre-encoded frame.
    pub async fn send_frame(&self, frame: &Bytes) -> Result<()> {
        let mut guard = self.writer.lock().await;
        if self.is_closed() {
            guard.take();
            return Err(self.closed_error("send"));
        }
        let writer = match guard.as_mut() {
            Some(w) => w,
            None => return Err(self.closed_error("send")),
        };

        let res = tokio::select! {
            res = write_frame(writer, frame) => Some(res),
            _ = wait_closed(self.closed.subscribe()) => None,
        };
        match res {
            Some(res) => res.map_err(|e| {
                MigrationError::Transport(format!("{} channel: {:#}", self.kind, e))
            }),
            None => {
                // Interrupted by disconnect, which could not take the half
                guard.take();
                Err(self.closed_error("send"))
            }
        }
    }

    /// Receive the next frame.
    pub async fn recv_frame(&self) -> Result<(MessageType, Bytes)> {
        let mut guard = self.reader.lock().await;
        if self.is_closed() {
            guard.take();
            return Err(self.closed_error("recv"));
        }
        let reader = match guard.as_mut() {
            Some(r) => r,
            None => return Err(self.closed_error("recv")),
        };

        let res = tokio::select! {
            res = read_frame(reader, self.max_frame_size) => Some(res),
            _ = wait_closed(self.closed.subscribe()) => None,
        };
        match res {
            Some(res) => res.map_err(|e| {
                MigrationError::Transport(format!("{} channel: {:#}", self.kind, e))
            }),
            None => {
                guard.take();
                Err(self.closed_error("recv"))
            }
        }
    }

    pub async fn send<M: WireMessage>(&self, msg: &M) -> Result<()> {
        self.send_frame(&msg.encode()).await
    }

    /// Receive a message of type `M`.
    ///
    /// A failure control message arriving instead surfaces as
    /// [`MigrationError::Remote`].
    pub async fn recv<M: WireMessage>(&self) -> Result<M> {
        let (msg_type, payload) = self.recv_frame().await?;
        if msg_type == M::TYPE {
            return M::decode(payload).map_err(|e| {
                MigrationError::Transport(format!(
                    "{} channel: malformed {:?} frame: {:#}",
                    self.kind, msg_type, e
                ))
            });
        }

        if msg_type == MessageType::Control {
            if let Ok(control) = MigrationControl::decode(payload) {
                if !control.success {
                    return Err(MigrationError::Remote(control.message));
                }
            }
        }

        Err(MigrationError::Transport(format!(
            "{} channel: expected {:?} frame, got {:?}",
            self.kind,
            M::TYPE,
            msg_type
        )))
    }

    /// Close the channel. Returns `true` only for the call that performed the
    /// release; later calls are no-ops.
    pub fn disconnect(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }

        // A half held by an in-flight operation is dropped by that operation
        // once it observes the close
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }

        tracing::debug!(channel = %self.kind, "Disconnected migration channel");
        true
    }

    fn closed_error(&self, what: &str) -> MigrationError {
        MigrationError::Transport(format!(
            "{} channel disconnected during {}",
            self.kind, what
        ))
    }
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
