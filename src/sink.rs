//! Receiving endpoint of a migration session.

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::idmap::IdmapShifter;
use crate::operation::Operation;
use crate::protocol::{respond, MigrationControl, MigrationHeader};
use crate::sequencer::Sequencer;
use crate::source::{send_failure, StateHistory};
use crate::storage::{
    select_driver, InstanceTarget, StorageBackend, StorageDriver, TransferPhase, Volume,
};
use crate::transport::{
    Channel, Connector, Dialer, Listener, Role, SessionChannels, SessionSecrets,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Idle,
    HeaderReceived,
    Native,
    Fallback,
    ReceivingSnapshots,
    ReceivingLive,
    ReceivingCheckpointDelta,
    Done,
    Aborted,
}

/// How the sink joins the session.
pub struct SinkArgs {
    pub role: Role,
    /// `control` and `fs` secrets issued by the source (pull mode)
    pub secrets: HashMap<String, String>,
    /// Connects to the source (pull mode)
    pub dialer: Option<Arc<dyn Dialer>>,
    pub config: MigrationConfig,
}

impl SinkArgs {
    pub fn pull(
        secrets: HashMap<String, String>,
        dialer: Arc<dyn Dialer>,
        config: MigrationConfig,
    ) -> Self {
        Self {
            role: Role::Pull,
            secrets,
            dialer: Some(dialer),
            config,
        }
    }

    pub fn push(config: MigrationConfig) -> Self {
        Self {
            role: Role::Push,
            secrets: HashMap::new(),
            dialer: None,
            config,
        }
    }
}

pub struct MigrationSink {
    backend: Arc<dyn StorageBackend>,
    connector: Connector,
    secrets: Option<SessionSecrets>,
    config: MigrationConfig,
    states: StateHistory<SinkState>,
}

impl MigrationSink {
    /// Validates the configuration and secrets up front; nothing is dialed
    /// here.
    pub fn new(backend: Arc<dyn StorageBackend>, args: SinkArgs) -> Result<Self> {
        args.config.validate()?;
        let max_frame_size = args.config.transport.max_frame_size;
        let (connector, secrets) = match args.role {
            Role::Pull => {
                let secrets = SessionSecrets::from_map(&args.secrets)?;
                let dialer = args.dialer.ok_or_else(|| {
                    MigrationError::Validation("Pull migration requires a dialer".to_string())
                })?;
                let connector = Connector::Dial {
                    dialer,
                    secrets,
                    max_frame_size,
                };
                (connector, None)
            }
            Role::Push => {
                let secrets = SessionSecrets::generate()?;
                let listener = Listener::new(&secrets, max_frame_size);
                (Connector::Listen(listener), Some(secrets))
            }
        };

        Ok(Self {
            backend,
            connector,
            secrets,
            config: args.config,
            states: StateHistory::new(SinkState::Idle),
        })
    }

    pub fn role(&self) -> Role {
        match self.connector {
            Connector::Listen(_) => Role::Push,
            Connector::Dial { .. } => Role::Pull,
        }
    }

    /// Secrets to hand to the source (push mode only).
    pub fn secrets(&self) -> Option<&SessionSecrets> {
        self.secrets.as_ref()
    }

    pub fn listener(&self) -> Option<Listener> {
        match &self.connector {
            Connector::Listen(listener) => Some(listener.clone()),
            Connector::Dial { .. } => None,
        }
    }

    pub fn state(&self) -> SinkState {
        self.states.current()
    }

    pub fn history(&self) -> &[SinkState] {
        self.states.history()
    }

    /// Create `volume` here and fill it from the source.
    pub async fn receive_volume(&mut self, op: &Operation, volume: &dyn Volume) -> Result<()> {
        let channels = match self.connector.establish(op).await {
            Ok(channels) => channels,
            Err(e) => return self.setup_failed(op, e),
        };
        let result = self.volume_session(&channels, op, volume).await;
        let result = self.conclude(&channels, result).await;
        op.finish(&result);
        result
    }

    /// Recreate a container, replaying its snapshots first.
    ///
    /// The destination's root disk is checked before anything is dialed.
    pub async fn receive_instance(
        &mut self,
        op: &Operation,
        target: &dyn InstanceTarget,
        shifter: &dyn IdmapShifter,
    ) -> Result<()> {
        let sequencer = match Sequencer::prepare(target, self.backend.has_native_snapshots(), shifter)
        {
            Ok(sequencer) => sequencer,
            Err(e) => return self.setup_failed(op, e),
        };
        let channels = match self.connector.establish(op).await {
            Ok(channels) => channels,
            Err(e) => return self.setup_failed(op, e),
        };
        let result = self
            .instance_session(&channels, op, target, sequencer)
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
        let (driver, _) = self.negotiate(&channels.control).await?;

        self.states.enter(SinkState::ReceivingLive);
        let transfer = driver.receive(&channels.fs, op, volume);
        if let Err(e) = while_peer_silent(&channels.control, transfer).await {
            tracing::error!(volume = %name, "Failed to receive storage volume: {}", e);
            driver.cleanup();
            return Err(e);
        }

        channels.control.send(&MigrationControl::success()).await?;
        tracing::debug!(volume = %name, "Migration sink finished receiving storage volume");
        Ok(())
    }

    async fn instance_session(
        &mut self,
        channels: &SessionChannels,
        op: &Operation,
        target: &dyn InstanceTarget,
        mut sequencer: Sequencer<'_>,
    ) -> Result<()> {
        let (driver, header) = self.negotiate(&channels.control).await?;
        tracing::debug!(
            instance = %target.name(),
            pool = %sequencer.pool(),
            snapshots = header.snapshots.len(),
            live = header.is_live(),
            "Receiving instance"
        );

        // The sequencer races the peer's abort itself and unwinds either way
        let states = &mut self.states;
        let mut observer = |phase: TransferPhase| states.enter(phase_state(&phase));
        let result = sequencer
            .run(
                &channels.fs,
                op,
                driver.as_ref(),
                &header,
                &mut observer,
                peer_abort(&channels.control),
            )
            .await;
        if let Err(e) = result {
            tracing::error!(instance = %target.name(), "Failed to receive instance: {}", e);
            driver.cleanup();
            return Err(e);
        }

        channels.control.send(&MigrationControl::success()).await?;
        tracing::debug!(
            instance = %target.name(),
            passes = sequencer.passes().len(),
            "Migration sink finished receiving instance"
        );
        Ok(())
    }

    /// Answer the source's header and pick the driver.
    async fn negotiate(
        &mut self,
        control: &Channel,
    ) -> Result<(Box<dyn StorageDriver>, MigrationHeader)> {
        let (header, negotiated) = respond(control, self.backend.transfer_type()).await?;
        self.states.enter(SinkState::HeaderReceived);
        self.states.enter(if negotiated.is_native() {
            SinkState::Native
        } else {
            SinkState::Fallback
        });

        let driver = select_driver(self.backend.as_ref(), negotiated, &self.config)?;
        Ok((driver, header))
    }

    fn setup_failed(&mut self, op: &Operation, err: MigrationError) -> Result<()> {
        tracing::error!("Failed to set up migration sink: {}", err);
        self.states.enter(SinkState::Aborted);
        let result = Err(err);
        op.finish(&result);
        result
    }

    async fn conclude(&mut self, channels: &SessionChannels, result: Result<()>) -> Result<()> {
        match &result {
            Ok(()) => self.states.enter(SinkState::Done),
            Err(e) => {
                // Still idle means the header exchange failed and was reported there
                if self.states.current() != SinkState::Idle {
                    send_failure(&channels.control, e).await;
                }
                self.states.enter(SinkState::Aborted);
            }
        }
        channels.disconnect();
        result
    }
}

fn phase_state(phase: &TransferPhase) -> SinkState {
    match phase {
        TransferPhase::Snapshot(_) => SinkState::ReceivingSnapshots,
        TransferPhase::Live => SinkState::ReceivingLive,
        TransferPhase::CheckpointDelta => SinkState::ReceivingCheckpointDelta,
    }
}

/// Resolves once the source speaks on the control channel.
///
/// The source only speaks mid-transfer to abort, so any message ends the
/// session.
async fn peer_abort(control: &Channel) -> MigrationError {
    match control.recv::<MigrationControl>().await {
        Ok(msg) if msg.success => MigrationError::Negotiation(
            "Source reported success before the transfer completed".to_string(),
        ),
        Ok(msg) => MigrationError::Remote(msg.message),
        Err(e) => e,
    }
}

/// Run `transfer` unless the source reports a failure first.
async fn while_peer_silent<F>(control: &Channel, transfer: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        biased;
        e = peer_abort(control) => Err(e),
        res = transfer => res,
    }
}
