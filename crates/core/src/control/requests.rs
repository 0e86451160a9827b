//! Policy-level user requests
//!
//! These turn user intent into low-level actions: a connect request becomes
//! one connect per hop of the best route, a volume request becomes a ramped
//! sink volume change, and so on. Their progress is tracked per main
//! connection and settled in the acknowledgment path.

use crate::control::notification::Notification;
use crate::control::plane::{ControlPlane, MainOp, MainProgress};
use crate::domain::audio::{
    volume, ConnectionId, ConnectionState, MainConnectionId, MainVolume, MuteState, RampType, Result,
    RoutingError, SinkId, SoundProperty, SourceId,
};
use crate::domain::handle::{Handle, HandleData, MainSinkChange};
use tracing::{debug, info, warn};

impl ControlPlane {
    /// Connect a source to a sink over the best free route
    ///
    /// Returns once every hop has been dispatched. The main connection moves
    /// to `Connected` when all hops are acknowledged, or is torn down if any
    /// hop fails.
    pub fn request_connect(&mut self, source: SourceId, sink: SinkId) -> Result<MainConnectionId> {
        if !self.registry.source_exists(source) {
            return Err(RoutingError::NotFound(format!("source {source}")));
        }
        if !self.registry.sink_exists(sink) {
            return Err(RoutingError::NotFound(format!("sink {sink}")));
        }
        if let Some(existing) = self.registry.main_connection_between(source, sink) {
            return Err(RoutingError::AlreadyExists(format!("main connection {}", existing.id)));
        }

        let route = self
            .resolve(source, sink, self.settings.only_free_gateways)?
            .into_iter()
            .next()
            .ok_or_else(|| RoutingError::NotPossible(format!("no route {source} -> {sink}")))?;

        let main = self.registry.enter_main_connection(source, sink)?;
        self.notify(Notification::MainConnectionState {
            id: main,
            state: ConnectionState::Connecting,
        });

        let mut dispatched: Vec<(Handle, ConnectionId)> = Vec::with_capacity(route.hops.len());
        let mut failure = None;
        for hop in &route.hops {
            match self.dispatch_connect(hop, Some(main)) {
                Ok(pair) => dispatched.push(pair),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        let connections = dispatched.iter().map(|(_, connection)| *connection).collect();
        if let Err(err) = self.registry.change_main_connection_route(main, connections) {
            warn!(main_connection = %main, error = %err, "Failed to store main connection route");
        }

        if let Some(err) = failure {
            warn!(main_connection = %main, error = %err, "Hop dispatch failed");
            if dispatched.is_empty() {
                self.remove_main(main);
                return Err(err);
            }

            // Hops already in flight are aborted; their acks drive the tear down
            self.progress.insert(
                main,
                MainProgress {
                    op: MainOp::Connect,
                    pending: dispatched.len(),
                    failed: true,
                },
            );
            for handle in self.main_connection_handles(main) {
                if let Err(abort_err) = self.abort(handle) {
                    debug!(%handle, error = %abort_err, "Abort not accepted");
                }
            }
            return Err(err);
        }

        info!(
            main_connection = %main,
            %source,
            %sink,
            hops = route.hops.len(),
            "Main connection requested"
        );
        self.progress.insert(
            main,
            MainProgress {
                op: MainOp::Connect,
                pending: dispatched.len(),
                failed: false,
            },
        );
        Ok(main)
    }

    /// Disconnect every hop of a main connection and remove it
    pub fn request_disconnect(&mut self, main: MainConnectionId) -> Result<()> {
        let record = self
            .registry
            .main_connection(main)
            .ok_or_else(|| RoutingError::NotFound(format!("main connection {main}")))?
            .clone();

        if self.progress.contains_key(&main)
            || !matches!(record.state, ConnectionState::Connected | ConnectionState::Suspended)
        {
            return Err(RoutingError::NotPossible(format!(
                "main connection {main} is {:?}",
                record.state
            )));
        }

        self.set_main_state(main, ConnectionState::Disconnecting);

        let mut dispatched = 0;
        let mut failed = false;
        for connection in record.connections {
            if !self.registry.connection_exists(connection) {
                continue;
            }
            match self.dispatch_disconnect(connection, Some(main)) {
                Ok(_) => dispatched += 1,
                Err(err) => {
                    warn!(main_connection = %main, %connection, error = %err, "Hop disconnect failed");
                    failed = true;
                }
            }
        }

        if dispatched == 0 {
            if failed {
                self.set_main_state(main, ConnectionState::Suspended);
                return Err(RoutingError::NotPossible(format!(
                    "no hop of main connection {main} could be disconnected"
                )));
            }
            self.set_main_state(main, ConnectionState::Disconnected);
            self.remove_main(main);
            return Ok(());
        }

        self.progress.insert(
            main,
            MainProgress {
                op: MainOp::Disconnect,
                pending: dispatched,
                failed,
            },
        );
        Ok(())
    }

    /// Change the user-facing volume of a sink
    ///
    /// A muted sink only records the new main volume. Otherwise the sink is
    /// ramped to it and the main volume is committed on acknowledgment.
    /// Returns `None` when nothing had to be dispatched.
    pub fn request_volume(&mut self, sink: SinkId, main_volume: MainVolume) -> Result<Option<Handle>> {
        let record = self
            .registry
            .sink(sink)
            .ok_or_else(|| RoutingError::NotFound(format!("sink {sink}")))?;
        if volume::clamp(main_volume) != main_volume {
            return Err(RoutingError::NotPossible(format!("volume {main_volume} out of range")));
        }
        if record.main_volume == main_volume {
            return Err(RoutingError::NoChange);
        }

        let muting = record.mute_state == MuteState::Muted || self.pending_mute(sink).is_some();
        if muting || record.volume == main_volume {
            self.registry.change_sink_main_volume(sink, main_volume)?;
            self.notify(Notification::SinkMainVolume {
                sink,
                volume: main_volume,
            });
            return Ok(None);
        }

        let ramp_ms = self.settings.default_ramp_time_ms;
        self.dispatch_sink_volume(
            sink,
            main_volume,
            RampType::Linear,
            ramp_ms,
            Some(MainSinkChange::Volume(main_volume)),
        )
        .map(Some)
    }

    /// Mute or unmute a sink
    ///
    /// Muting ramps the sink to the minimum volume, unmuting ramps it back to
    /// its main volume.
    pub fn request_mute(&mut self, sink: SinkId, state: MuteState) -> Result<Option<Handle>> {
        let record = self
            .registry
            .sink(sink)
            .ok_or_else(|| RoutingError::NotFound(format!("sink {sink}")))?;
        if record.mute_state == state || self.pending_mute(sink) == Some(state) {
            return Err(RoutingError::NoChange);
        }

        let target = match state {
            MuteState::Muted => volume::MUTED,
            MuteState::Unmuted => record.main_volume,
        };
        if record.volume == target {
            self.registry.change_sink_mute_state(sink, state)?;
            self.notify(Notification::SinkMute { sink, state });
            return Ok(None);
        }

        let ramp_ms = self.settings.default_ramp_time_ms;
        self.dispatch_sink_volume(sink, target, RampType::Linear, ramp_ms, Some(MainSinkChange::Mute(state)))
            .map(Some)
    }

    /// Change a user-facing sink sound property
    pub fn request_sink_sound_property(&mut self, sink: SinkId, property: SoundProperty) -> Result<Handle> {
        self.dispatch_sink_sound_property(sink, property, true)
    }

    /// Change a user-facing source sound property
    pub fn request_source_sound_property(
        &mut self,
        source: SourceId,
        property: SoundProperty,
    ) -> Result<Handle> {
        self.dispatch_source_sound_property(source, property, true)
    }

    /// Mute change still waiting for its acknowledgment on `sink`
    pub(crate) fn pending_mute(&self, sink: SinkId) -> Option<MuteState> {
        self.handles.iter().find_map(|action| match action.data {
            HandleData::SinkVolume {
                sink: target,
                main: Some(MainSinkChange::Mute(state)),
                ..
            } if target == sink => Some(state),
            _ => None,
        })
    }

    /// Ramp a sink back to what its mute state and main volume call for
    ///
    /// Only runs once no other volume action is in flight on the sink, so the
    /// last user-facing acknowledgment decides.
    pub(crate) fn realign_sink(&mut self, sink: SinkId) {
        let busy = self
            .handles
            .iter()
            .any(|action| matches!(action.data, HandleData::SinkVolume { sink: target, .. } if target == sink));
        if busy {
            return;
        }
        let Some(record) = self.registry.sink(sink) else {
            return;
        };
        let wanted = match record.mute_state {
            MuteState::Muted => volume::MUTED,
            MuteState::Unmuted => record.main_volume,
        };
        if record.volume == wanted {
            return;
        }

        let ramp_ms = self.settings.default_ramp_time_ms;
        match self.dispatch_sink_volume(sink, wanted, RampType::Linear, ramp_ms, None) {
            Ok(handle) => debug!(%handle, %sink, volume = wanted, "Sink volume realigned"),
            Err(err) => warn!(%sink, error = %err, "Sink volume could not be realigned"),
        }
    }

    /// Handles of the hop actions still outstanding for a main connection
    pub fn main_connection_handles(&self, main: MainConnectionId) -> Vec<Handle> {
        self.handles
            .iter()
            .filter(|action| match action.data {
                HandleData::Connect { main: Some(m), .. } | HandleData::Disconnect { main: Some(m), .. } => m == main,
                _ => false,
            })
            .map(|action| action.handle)
            .collect()
    }
}
