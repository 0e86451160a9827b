//! Control loop and command bus
//!
//! A single task owns the [`ControlPlane`]. It waits on the completion queue
//! and the command mailbox at the same time, so every registry mutation,
//! whether triggered by a user command or by a worker's acknowledgment,
//! happens on that one task. [`ControlHandle`] is the cloneable client side.

use crate::control::completion::CompletionReceiver;
use crate::control::notification::Notification;
use crate::control::plane::ControlPlane;
use crate::domain::audio::{
    Connection, CrossfaderId, Domain, DomainId, DomainState, Gateway, HotSink, MainConnection,
    MainConnectionId, MainVolume, MuteState, RampType, RoutingError, Sink, SinkId, SoundProperty,
    Source, SourceId, SourceState, Volume,
};
use crate::domain::handle::Handle;
use crate::domain::router::{Hop, Route};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Depth of the command mailbox
const COMMAND_CAPACITY: usize = 64;

/// Command types accepted by the control loop
#[derive(Debug, Clone)]
pub enum Command {
    Connect {
        source: SourceId,
        sink: SinkId,
    },
    Disconnect {
        main: MainConnectionId,
    },
    SetVolume {
        sink: SinkId,
        volume: MainVolume,
    },
    SetMute {
        sink: SinkId,
        state: MuteState,
    },
    SetSinkSoundProperty {
        sink: SinkId,
        property: SoundProperty,
    },
    SetSourceSoundProperty {
        source: SourceId,
        property: SoundProperty,
    },
    SetSourceState {
        source: SourceId,
        state: SourceState,
    },
    SetSourceVolume {
        source: SourceId,
        volume: Volume,
        ramp: RampType,
        time_ms: u16,
    },
    SetDomainState {
        domain: DomainId,
        state: DomainState,
    },
    ConnectHop {
        hop: Hop,
    },
    CrossFade {
        crossfader: CrossfaderId,
        hot_sink: HotSink,
    },
    Abort {
        handle: Handle,
    },
    ResolveRoutes {
        source: SourceId,
        sink: SinkId,
    },
    ListMainConnections,
    ListConnections,
    ListHandles,
    Topology,
    Shutdown,
}

/// Read-only view of everything registered
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologySnapshot {
    pub domains: Vec<Domain>,
    pub sources: Vec<Source>,
    pub sinks: Vec<Sink>,
    pub gateways: Vec<Gateway>,
}

/// Result of command execution
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Ok,
    MainConnection(MainConnectionId),
    /// `None` when the request was satisfied without an adapter round trip
    Dispatched(Option<Handle>),
    Routes(Vec<Route>),
    MainConnections(Vec<MainConnection>),
    Connections(Vec<Connection>),
    Handles(Vec<Handle>),
    Topology(TopologySnapshot),
    Error(RoutingError),
}

impl CommandResult {
    pub fn into_result(self) -> std::result::Result<Self, RoutingError> {
        match self {
            CommandResult::Error(err) => Err(err),
            other => Ok(other),
        }
    }
}

impl<T: Into<CommandResult>> From<std::result::Result<T, RoutingError>> for CommandResult {
    fn from(result: std::result::Result<T, RoutingError>) -> Self {
        match result {
            Ok(value) => value.into(),
            Err(err) => CommandResult::Error(err),
        }
    }
}

impl From<()> for CommandResult {
    fn from(_: ()) -> Self {
        CommandResult::Ok
    }
}

impl From<Handle> for CommandResult {
    fn from(handle: Handle) -> Self {
        CommandResult::Dispatched(Some(handle))
    }
}

impl From<Option<Handle>> for CommandResult {
    fn from(handle: Option<Handle>) -> Self {
        CommandResult::Dispatched(handle)
    }
}

impl From<MainConnectionId> for CommandResult {
    fn from(id: MainConnectionId) -> Self {
        CommandResult::MainConnection(id)
    }
}

impl From<Vec<Route>> for CommandResult {
    fn from(routes: Vec<Route>) -> Self {
        CommandResult::Routes(routes)
    }
}

/// Trait for command execution
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: Command) -> CommandResult;
}

type Envelope = (Command, oneshot::Sender<CommandResult>);

/// Cloneable client of a running control loop
#[derive(Debug, Clone)]
pub struct ControlHandle {
    commands: mpsc::Sender<Envelope>,
    notifications: broadcast::Sender<Notification>,
}

impl ControlHandle {
    /// Observe committed changes
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }
}

#[async_trait::async_trait]
impl CommandExecutor for ControlHandle {
    async fn execute(&self, command: Command) -> CommandResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send((command, reply_tx)).await.is_err() {
            return CommandResult::Error(RoutingError::NotPossible("control loop stopped".to_string()));
        }
        reply_rx.await.unwrap_or_else(|_| {
            CommandResult::Error(RoutingError::NotPossible("control loop dropped the command".to_string()))
        })
    }
}

/// Owner of the control plane on its task
pub struct ControlLoop {
    plane: ControlPlane,
    completions: CompletionReceiver,
    commands: mpsc::Receiver<Envelope>,
}

impl ControlLoop {
    pub fn new(plane: ControlPlane, completions: CompletionReceiver) -> (Self, ControlHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let handle = ControlHandle {
            commands: commands_tx,
            notifications: plane.notifier(),
        };
        (
            Self {
                plane,
                completions,
                commands,
            },
            handle,
        )
    }

    /// Run until `Shutdown` or until every handle is dropped
    ///
    /// Completions are drained before commands so acknowledgments already
    /// queued are applied before the next request looks at the registry.
    pub async fn run(mut self) -> ControlPlane {
        info!("Control loop started");

        loop {
            tokio::select! {
                biased;

                Some(completion) = self.completions.recv() => {
                    self.plane.handle_completion(completion);
                }
                envelope = self.commands.recv() => {
                    let Some((command, reply)) = envelope else {
                        debug!("All control handles dropped");
                        break;
                    };
                    if matches!(command, Command::Shutdown) {
                        let _ = reply.send(CommandResult::Ok);
                        break;
                    }
                    let result = execute(&mut self.plane, command);
                    if reply.send(result).is_err() {
                        warn!("Command caller went away before the reply");
                    }
                }
            }
        }

        info!(outstanding = self.plane.list_handles().len(), "Control loop stopped");
        self.plane
    }
}

/// Execute one command against the plane
pub fn execute(plane: &mut ControlPlane, command: Command) -> CommandResult {
    debug!(?command, "Executing command");
    match command {
        Command::Connect { source, sink } => plane.request_connect(source, sink).into(),
        Command::Disconnect { main } => plane.request_disconnect(main).into(),
        Command::SetVolume { sink, volume } => plane.request_volume(sink, volume).into(),
        Command::SetMute { sink, state } => plane.request_mute(sink, state).into(),
        Command::SetSinkSoundProperty { sink, property } => {
            plane.request_sink_sound_property(sink, property).into()
        }
        Command::SetSourceSoundProperty { source, property } => {
            plane.request_source_sound_property(source, property).into()
        }
        Command::SetSourceState { source, state } => plane.set_source_state(source, state).into(),
        Command::SetSourceVolume {
            source,
            volume,
            ramp,
            time_ms,
        } => plane.set_source_volume(source, volume, ramp, time_ms).into(),
        Command::SetDomainState { domain, state } => plane.set_domain_state(domain, state).into(),
        Command::ConnectHop { hop } => plane.connect(&hop).into(),
        Command::CrossFade {
            crossfader,
            hot_sink,
        } => {
            let ramp_ms = plane.settings().default_ramp_time_ms;
            plane
                .cross_fade(crossfader, hot_sink, RampType::Linear, ramp_ms)
                .into()
        }
        Command::Abort { handle } => plane.abort(handle).into(),
        Command::ResolveRoutes { source, sink } => {
            let only_free = plane.settings().only_free_gateways;
            plane.resolve(source, sink, only_free).into()
        }
        Command::ListMainConnections => CommandResult::MainConnections(
            plane.registry().main_connections().into_iter().cloned().collect(),
        ),
        Command::ListConnections => {
            CommandResult::Connections(plane.registry().connections().into_iter().cloned().collect())
        }
        Command::ListHandles => CommandResult::Handles(plane.list_handles()),
        Command::Topology => {
            let registry = plane.registry();
            CommandResult::Topology(TopologySnapshot {
                domains: registry.domains().into_iter().cloned().collect(),
                sources: registry.sources().into_iter().cloned().collect(),
                sinks: registry.sinks().into_iter().cloned().collect(),
                gateways: registry.gateways().into_iter().cloned().collect(),
            })
        }
        Command::Shutdown => CommandResult::Ok,
    }
}
