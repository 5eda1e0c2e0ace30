//! Sending endpoint of a migration session.
//!
//! One call drives one session: establish both channels, exchange headers,
//! pick a driver, stream, then wait for the sink's verdict. Any failure
//! cleans up the driver, tells the peer, and leaves the session `Aborted`.
//! Both channels are disconnected on every exit path.

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::fallback::BandwidthLimit;
use crate::operation::Operation;
use crate::protocol::{initiate, HeaderFlags, MigrationControl, MigrationHeader};
use crate::sequencer::order_snapshots;
use crate::storage::{
    select_driver, InstanceSource, MountGuard, StorageBackend, StorageDriver, StoragePool,
    TransferPhase, Volume,
};
use crate::transport::{
    Channel, Connector, Dialer, Listener, Role, SessionChannels, SessionSecrets,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    HeaderSent,
    Native,
    Fallback,
    TransferringSnapshots,
    TransferringLive,
    TransferringCheckpointDelta,
    Done,
    Aborted,
}

/// Current state plus every state entered, in order.
#[derive(Debug, Clone)]
pub(crate) struct StateHistory<S> {
    current: S,
    history: Vec<S>,
}

impl<S: Copy + PartialEq + fmt::Debug> StateHistory<S> {
    pub(crate) fn new(initial: S) -> Self {
        Self {
            current: initial,
            history: vec![initial],
        }
    }

    pub(crate) fn enter(&mut self, next: S) {
        if self.current != next {
            tracing::debug!(from = ?self.current, to = ?next, "Migration state change");
            self.current = next;
            self.history.push(next);
        }
    }

    pub(crate) fn current(&self) -> S {
        self.current
    }

    pub(crate) fn history(&self) -> &[S] {
        &self.history
    }
}

/// Options for a container migration.
#[derive(Debug, Default)]
pub struct InstanceOptions {
    /// Skip historical snapshots
    pub container_only: bool,
    /// Stateful migration: one more pass after the checkpoint
    pub live: bool,
    /// Fires once the container has been checkpointed. `None` means the
    /// checkpoint is already done.
    pub checkpoint: Option<oneshot::Receiver<()>>,
}

pub struct MigrationSource {
    backend: Arc<dyn StorageBackend>,
    connector: Connector,
    secrets: Option<SessionSecrets>,
    config: MigrationConfig,
    states: StateHistory<SourceState>,
}

impl MigrationSource {
    /// Sink connects to us: issue secrets and listen.
    pub fn pull(backend: Arc<dyn StorageBackend>, config: MigrationConfig) -> Result<Self> {
        config.validate()?;
        let secrets = SessionSecrets::generate()?;
        let listener = Listener::new(&secrets, config.transport.max_frame_size);
        Ok(Self {
            backend,
            connector: Connector::Listen(listener),
            secrets: Some(secrets),
            config,
            states: StateHistory::new(SourceState::Idle),
        })
    }

    /// We connect to the sink with the secrets it issued.
    pub fn push(
        backend: Arc<dyn StorageBackend>,
        dialer: Arc<dyn Dialer>,
        secrets: SessionSecrets,
        config: MigrationConfig,
    ) -> Result<Self> {
        config.validate()?;
        let max_frame_size = config.transport.max_frame_size;
        Ok(Self {
            backend,
            connector: Connector::Dial {
                dialer,
                secrets,
                max_frame_size,
            },
            secrets: None,
            config,
            states: StateHistory::new(SourceState::Idle),
        })
    }

    pub fn role(&self) -> Role {
        match self.connector {
            Connector::Listen(_) => Role::Pull,
            Connector::Dial { .. } => Role::Push,
        }
    }

    /// Secrets to hand to the sink (pull mode only).
    pub fn secrets(&self) -> Option<&SessionSecrets> {
        self.secrets.as_ref()
    }

    /// Handle for attaching incoming connections (pull mode only).
    pub fn listener(&self) -> Option<Listener> {
        match &self.connector {
            Connector::Listen(listener) => Some(listener.clone()),
            Connector::Dial { .. } => None,
        }
    }

    pub fn state(&self) -> SourceState {
        self.states.current()
    }

    pub fn history(&self) -> &[SourceState] {
        self.states.history()
    }

    /// Migrate a custom storage volume.
    pub async fn migrate_volume(&mut self, op: &Operation, volume: &dyn Volume) -> Result<()> {
        let channels = match self.connector.establish(op).await {
            Ok(channels) => channels,
            Err(e) => return self.setup_failed(op, e),
        };
        let result = self.volume_session(&channels, op, volume).await;
        let result = self.conclude(&channels, result).await;
        op.finish(&result);
        result
    }

    /// Migrate a container and, unless `container_only`, its snapshots.
    pub async fn migrate_instance(
        &mut self,
        op: &Operation,
        instance: &dyn InstanceSource,
        options: InstanceOptions,
    ) -> Result<()> {
        let channels = match self.connector.establish(op).await {
            Ok(channels) => channels,
            Err(e) => return self.setup_failed(op, e),
        };
        let result = self
            .instance_session(&channels, op, instance, options)
            .await;
        let result = self.conclude(&channels, result).await;
        op.finish(&result);
        result
    }

    async fn volume_session(
        &mut self,
        channels: &SessionChannels,
        op: &Operation,
        volume: &dyn Volume,
    ) -> Result<()> {
        let name = volume.info().name.clone();
        // Held for the whole session
        let mount = MountGuard::acquire(volume, name.as_str()).map_err(|e| {
            tracing::error!("Failed to mount storage volume");
            e
        })?;

        let offer = MigrationHeader::new(self.backend.transfer_type(), HeaderFlags::VOLUME_ONLY);
        let (driver, bwlimit) = self
            .negotiate(&channels.control, &offer, volume.pool())
            .await?;

        self.states.enter(SourceState::TransferringLive);
        let transfer = driver.send_volume(&channels.fs, op, bwlimit, volume);
        if let Err(e) = until_peer_verdict(&channels.control, transfer).await {
            tracing::error!(volume = %name, "Failed to send storage volume: {}", e);
            driver.cleanup();
            return Err(e);
        }

        mount.release()?;
        tracing::debug!(volume = %name, "Migration source finished transferring storage volume");
        Ok(())
    }

    async fn instance_session(
        &mut self,
        channels: &SessionChannels,
        op: &Operation,
        instance: &dyn InstanceSource,
        options: InstanceOptions,
    ) -> Result<()> {
        let mut flags = HeaderFlags::empty();
        if options.container_only {
            flags |= HeaderFlags::VOLUME_ONLY;
        }
        if options.live {
            flags |= HeaderFlags::LIVE;
        }

        let mut offer = MigrationHeader::new(self.backend.transfer_type(), flags);
        offer.idmap = instance.idmap();
        if !options.container_only {
            let snapshots = instance
                .snapshots()
                .map_err(|e| MigrationError::backend(instance.name(), e))?;
            offer.snapshots = snapshots.iter().map(|s| s.descriptor()).collect();
            order_snapshots(&mut offer.snapshots);
        }

        let (driver, bwlimit) = self
            .negotiate(&channels.control, &offer, instance.pool())
            .await?;

        let states = &mut self.states;
        let driver_ref = driver.as_ref();
        let InstanceOptions {
            container_only,
            live,
            checkpoint,
        } = options;

        let transfer = async move {
            driver_ref
                .send_while_running(
                    &channels.fs,
                    op,
                    bwlimit,
                    instance,
                    container_only,
                    &mut |phase: TransferPhase| states.enter(phase_state(&phase)),
                )
                .await?;

            if live {
                if let Some(checkpoint) = checkpoint {
                    wait_checkpoint(op, checkpoint).await?;
                }
                states.enter(SourceState::TransferringCheckpointDelta);
                driver_ref
                    .send_after_checkpoint(&channels.fs, op, bwlimit, instance)
                    .await?;
            }
            Ok(())
        };

        if let Err(e) = until_peer_verdict(&channels.control, transfer).await {
            tracing::error!(instance = %instance.name(), "Failed to send instance: {}", e);
            driver.cleanup();
            return Err(e);
        }

        tracing::debug!(instance = %instance.name(), "Migration source finished transferring instance");
        Ok(())
    }

    /// Header exchange and driver selection, decided once.
    ///
    /// The fallback bandwidth cap is resolved before the driver is selected,
    /// so every failure after selection goes through the driver's cleanup.
    async fn negotiate(
        &mut self,
        control: &Channel,
        offer: &MigrationHeader,
        pool: &StoragePool,
    ) -> Result<(Box<dyn StorageDriver>, Option<BandwidthLimit>)> {
        self.states.enter(SourceState::HeaderSent);
        let negotiated = initiate(control, offer).await?;
        self.states.enter(if negotiated.is_native() {
            SourceState::Native
        } else {
            SourceState::Fallback
        });

        let bwlimit = if negotiated.is_native() {
            None
        } else {
            pool.fallback_bwlimit(&self.config)?
        };
        let driver = select_driver(self.backend.as_ref(), negotiated, &self.config)?;
        Ok((driver, bwlimit))
    }

    fn setup_failed(&mut self, op: &Operation, err: MigrationError) -> Result<()> {
        tracing::error!("Failed to establish migration channels: {}", err);
        self.states.enter(SourceState::Aborted);
        let result = Err(err);
        op.finish(&result);
        result
    }

    async fn conclude(&mut self, channels: &SessionChannels, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => self.states.enter(SourceState::Done),
            Err(e) => {
                // Header exchange failures were already reported
                let reported = self.states.current() == SourceState::HeaderSent;
                if !reported && !matches!(e, MigrationError::Remote(_)) {
                    send_failure(&channels.control, e).await;
                }
                self.states.enter(SourceState::Aborted);
            }
        }
        channels.disconnect();
        result
    }
}

fn phase_state(phase: &TransferPhase) -> SourceState {
    match phase {
        TransferPhase::Snapshot(_) => SourceState::TransferringSnapshots,
        TransferPhase::Live => SourceState::TransferringLive,
        TransferPhase::CheckpointDelta => SourceState::TransferringCheckpointDelta,
    }
}

async fn wait_checkpoint(op: &Operation, checkpoint: oneshot::Receiver<()>) -> Result<()> {
    tokio::select! {
        res = checkpoint => res.map_err(|_| {
            MigrationError::Validation("Checkpoint signal dropped before firing".to_string())
        }),
        _ = op.cancelled() => Err(MigrationError::Cancelled),
    }
}

pub(crate) async fn send_failure(control: &Channel, err: &MigrationError) {
    if let Err(e) = control.send(&MigrationControl::failure(err.to_string())).await {
        tracing::warn!("Failed to send migration failure to peer: {}", e);
    }
}

/// Run `transfer` while listening for the peer's control message, then
/// require a success verdict.
///
/// An early failure from the peer aborts the transfer. An early success is
/// held until the transfer finishes.
async fn until_peer_verdict<F>(control: &Channel, transfer: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let verdict = control.recv::<MigrationControl>();
    tokio::pin!(transfer, verdict);

    // The peer's verdict is polled first so its failure wins over the
    // broken pipe it causes locally
    let msg = tokio::select! {
        biased;
        msg = &mut verdict => {
            let msg = msg?;
            if !msg.success {
                return Err(MigrationError::Remote(msg.message));
            }
            transfer.await?;
            msg
        }
        res = &mut transfer => {
            res?;
            verdict.await?
        }
    };

    if !msg.success {
        return Err(MigrationError::Remote(msg.message));
    }
    Ok(())
}
