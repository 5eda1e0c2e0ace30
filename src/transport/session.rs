//! Session setup: pairing one control and one filesystem channel.
//!
//! The listening end owns the secrets and blocks until the counterpart has
//! connected both channels. The dialing end connects out with secrets it was
//! handed. Which end listens is decided once, by [`Role`], when the session
//! is created.

use crate::error::{MigrationError, Result};
use crate::operation::Operation;
use crate::protocol::MigrationControl;
use crate::transport::channel::{BoxedStream, Channel, ChannelKind};
use crate::transport::secret::{Secret, SecretRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// Which endpoint dials the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The sink connects out to the source
    Pull,
    /// The source connects out to the sink
    Push,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Pull => f.write_str("pull"),
            Role::Push => f.write_str("push"),
        }
    }
}

/// The pair of secrets for one session.
#[derive(Debug, Clone)]
pub struct SessionSecrets {
    pub control: Secret,
    pub fs: Secret,
}

impl SessionSecrets {
    pub fn generate() -> Result<Self> {
        let control = Secret::generate().map_err(|e| {
            tracing::error!("Failed to create migration secret for control channel");
            e
        })?;
        let fs = Secret::generate().map_err(|e| {
            tracing::error!("Failed to create migration secret for filesystem channel");
            e
        })?;
        Ok(Self { control, fs })
    }

    /// Parse the `{"control": .., "fs": ..}` map handed out by the control plane.
    pub fn from_map(secrets: &HashMap<String, String>) -> Result<Self> {
        let control = secrets
            .get("control")
            .ok_or_else(|| MigrationError::Validation("Missing control secret".to_string()))?;
        let fs = secrets
            .get("fs")
            .ok_or_else(|| MigrationError::Validation("Missing fs secret".to_string()))?;
        Ok(Self {
            control: Secret::from_token(control.as_str())?,
            fs: Secret::from_token(fs.as_str())?,
        })
    }

    pub fn to_map(&self) -> HashMap<String, String> {
        HashMap::from([
            ("control".to_string(), self.control.as_str().to_string()),
            ("fs".to_string(), self.fs.as_str().to_string()),
        ])
    }
}

/// Both channels of an established session.
#[derive(Debug)]
pub struct SessionChannels {
    pub control: Channel,
    pub fs: Channel,
}

impl SessionChannels {
    /// Disconnect both channels. Returns `true` if anything was released.
    pub fn disconnect(&self) -> bool {
        let control = self.control.disconnect();
        let fs = self.fs.disconnect();
        control || fs
    }
}

/// Connects out to the counterpart, presenting a secret.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, secret: &Secret) -> Result<BoxedStream>;
}

/// Accepting end of a session.
///
/// Cloned handles are given to whatever serves incoming connections; the
/// orchestrator waits on [`Listener::wait_all_connected`].
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    registry: SecretRegistry,
    slots: Mutex<Slots>,
    all_connected_tx: mpsc::Sender<()>,
    all_connected_rx: tokio::sync::Mutex<mpsc::Receiver<()>>,
    max_frame_size: u32,
}

#[derive(Default)]
struct Slots {
    control: Option<Channel>,
    fs: Option<Channel>,
}

impl Listener {
    pub fn new(secrets: &SessionSecrets, max_frame_size: u32) -> Self {
        let registry = SecretRegistry::new();
        registry.register(&secrets.control, ChannelKind::Control);
        registry.register(&secrets.fs, ChannelKind::Fs);

        // Single slot: fires once when both channels are in
        let (all_connected_tx, all_connected_rx) = mpsc::channel(1);

        Self {
            inner: Arc::new(ListenerInner {
                registry,
                slots: Mutex::new(Slots::default()),
                all_connected_tx,
                all_connected_rx: tokio::sync::Mutex::new(all_connected_rx),
                max_frame_size,
            }),
        }
    }

    /// Attach an incoming connection presenting `token`.
    pub fn accept<S>(&self, token: &str, stream: S) -> Result<ChannelKind>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let kind = self.inner.registry.consume(token).map_err(|e| {
            tracing::warn!("Rejected migration connection with invalid secret");
            e
        })?;
        let channel =
            Channel::new(kind, stream).with_max_frame_size(self.inner.max_frame_size);

        let mut slots = self
            .inner
            .slots
            .lock()
            .map_err(|_| MigrationError::Transport("Session slots poisoned".to_string()))?;
        match kind {
            ChannelKind::Control => slots.control = Some(channel),
            ChannelKind::Fs => slots.fs = Some(channel),
        }
        tracing::debug!(channel = %kind, "Migration channel connected");

        if slots.control.is_some() && slots.fs.is_some() {
            let _ = self.inner.all_connected_tx.try_send(());
        }
        Ok(kind)
    }

    /// Block until both channels are connected, or the operation is cancelled.
    pub async fn wait_all_connected(&self, op: &Operation) -> Result<SessionChannels> {
        {
            let mut rx = self.inner.all_connected_rx.lock().await;
            tokio::select! {
                signal = rx.recv() => {
                    if signal.is_none() {
                        return Err(MigrationError::Transport(
                            "Session closed before both channels connected".to_string(),
                        ));
                    }
                }
                _ = op.cancelled() => return Err(MigrationError::Cancelled),
            }
        }

        let mut slots = self
            .inner
            .slots
            .lock()
            .map_err(|_| MigrationError::Transport("Session slots poisoned".to_string()))?;
        match (slots.control.take(), slots.fs.take()) {
            (Some(control), Some(fs)) => Ok(SessionChannels { control, fs }),
            _ => Err(MigrationError::Transport(
                "Session channels already taken".to_string(),
            )),
        }
    }
}

/// How this endpoint obtains its channels. Chosen once per session.
pub enum Connector {
    /// Wait for the counterpart to connect with the secrets we issued
    Listen(Listener),
    /// Connect out with the counterpart's secrets
    Dial {
        dialer: Arc<dyn Dialer>,
        secrets: SessionSecrets,
        max_frame_size: u32,
    },
}

impl Connector {
    pub async fn establish(&self, op: &Operation) -> Result<SessionChannels> {
        match self {
            Connector::Listen(listener) => listener.wait_all_connected(op).await,
            Connector::Dial {
                dialer,
                secrets,
                max_frame_size,
            } => {
                let control = dial(dialer.as_ref(), &secrets.control, op)
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to connect migration control channel: {}", e);
                        e
                    })?;
                let control = Channel::from_boxed(ChannelKind::Control, control)
                    .with_max_frame_size(*max_frame_size);

                let fs = match dial(dialer.as_ref(), &secrets.fs, op).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::error!("Failed to connect migration filesystem channel: {}", e);
                        let _ = control.send(&MigrationControl::failure(e.to_string())).await;
                        control.disconnect();
                        return Err(e);
                    }
                };
                let fs = Channel::from_boxed(ChannelKind::Fs, fs)
                    .with_max_frame_size(*max_frame_size);

                Ok(SessionChannels { control, fs })
            }
        }
    }
}

async fn dial(dialer: &dyn Dialer, secret: &Secret, op: &Operation) -> Result<BoxedStream> {
    tokio::select! {
        res = dialer.dial(secret) => res,
        _ = op.cancelled() => Err(MigrationError::Cancelled),
    }
}
