//! Acknowledgment replay on the control loop
//!
//! Every completion popped from the queue ends up here. Terminal
//! acknowledgments remove their handle exactly once and either commit the
//! action's effect to the registry or roll the provisional state back.

use crate::control::completion::Completion;
use crate::control::notification::Notification;
use crate::control::plane::{ControlPlane, MainOp, MainProgress};
use crate::domain::audio::{
    ConnectionId, ConnectionState, HotSink, MainConnectionId, Result, RoutingError, Volume,
};
use crate::domain::handle::{Handle, HandleData, MainSinkChange, PendingAction};
use tracing::{debug, error, info, trace, warn};

impl ControlPlane {
    /// Apply one completion from the queue
    pub fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::ConnectAck { handle, result } => self.on_connect_ack(handle, result),
            Completion::DisconnectAck { handle, result } => self.on_disconnect_ack(handle, result),
            Completion::SinkVolumeAck {
                handle,
                volume,
                result,
            } => self.on_sink_volume_ack(handle, volume, result),
            Completion::SourceVolumeAck {
                handle,
                volume,
                result,
            } => self.on_source_volume_ack(handle, volume, result),
            Completion::SourceStateAck { handle, result } => self.on_source_state_ack(handle, result),
            Completion::SinkSoundPropertyAck { handle, result }
            | Completion::SourceSoundPropertyAck { handle, result } => {
                self.on_sound_property_ack(handle, result)
            }
            Completion::CrossFadeAck {
                handle,
                hot_sink,
                result,
            } => self.on_cross_fade_ack(handle, hot_sink, result),
            Completion::SinkVolumeTick {
                handle,
                sink,
                volume,
            } => {
                if self.tick_matches(handle) {
                    if let Err(err) = self.registry.change_sink_volume(sink, volume) {
                        warn!(%handle, %sink, error = %err, "Failed to apply volume tick");
                        return;
                    }
                    self.notify(Notification::SinkVolumeTick {
                        handle,
                        sink,
                        volume,
                    });
                }
            }
            Completion::SourceVolumeTick {
                handle,
                source,
                volume,
            } => {
                if self.tick_matches(handle) {
                    if let Err(err) = self.registry.change_source_volume(source, volume) {
                        warn!(%handle, %source, error = %err, "Failed to apply volume tick");
                        return;
                    }
                    self.notify(Notification::SourceVolumeTick {
                        handle,
                        source,
                        volume,
                    });
                }
            }
            Completion::SinkAvailability { sink, availability } => {
                match self.registry.change_sink_availability(sink, availability) {
                    Ok(()) => self.notify(Notification::SinkAvailability { sink, availability }),
                    Err(err) => warn!(%sink, error = %err, "Availability for unknown sink"),
                }
            }
            Completion::SourceAvailability {
                source,
                availability,
            } => match self.registry.change_source_availability(source, availability) {
                Ok(()) => self.notify(Notification::SourceAvailability {
                    source,
                    availability,
                }),
                Err(err) => warn!(%source, error = %err, "Availability for unknown source"),
            },
            Completion::InterruptState { source, state } => {
                match self.registry.change_source_interrupt_state(source, state) {
                    Ok(()) => self.notify(Notification::InterruptState { source, state }),
                    Err(err) => warn!(%source, error = %err, "Interrupt state for unknown source"),
                }
            }
            Completion::DomainState { domain, state } => {
                match self.registry.change_domain_state(domain, state) {
                    Ok(()) => {
                        info!(%domain, ?state, "Domain state changed");
                        self.notify(Notification::DomainState { domain, state });
                    }
                    Err(err) => warn!(%domain, error = %err, "State for unknown domain"),
                }
            }
            Completion::ConnectionDelay { connection, delay } => self.on_connection_delay(connection, delay),
        }
    }

    /// Remove a handle for a terminal acknowledgment
    ///
    /// Unknown handles are ignored so a late or duplicated acknowledgment can
    /// never be applied twice.
    fn take(&mut self, handle: Handle) -> Option<PendingAction> {
        let action = self.handles.remove(handle);
        if action.is_none() {
            warn!(%handle, "Acknowledgment for unknown handle ignored");
        }
        action
    }

    fn tick_matches(&self, handle: Handle) -> bool {
        let live = self.handles.contains(handle);
        if !live {
            trace!(%handle, "Tick for closed handle ignored");
        }
        live
    }

    fn acknowledged(&self, handle: Handle, result: &Result<()>) {
        self.notify(Notification::Acknowledged {
            handle,
            result: result.clone(),
        });
    }

    fn on_connect_ack(&mut self, handle: Handle, result: Result<()>) {
        let Some(action) = self.take(handle) else {
            return;
        };
        let HandleData::Connect { connection, main } = action.data else {
            return;
        };

        match &result {
            Ok(()) => match self.registry.change_connection_final(connection) {
                Ok(()) => info!(%handle, %connection, "Connection committed"),
                Err(err) => error!(%handle, %connection, error = %err, "Failed to commit connection"),
            },
            Err(err) => {
                warn!(%handle, %connection, error = %err, "Connect failed, rolling back");
                self.discard_connection(connection);
            }
        }

        self.controller.on_connect_ack(handle, &result);
        self.acknowledged(handle, &result);
        if let Some(main) = main {
            self.main_hop_settled(main, result.is_ok());
        }
    }

    fn on_disconnect_ack(&mut self, handle: Handle, result: Result<()>) {
        let Some(action) = self.take(handle) else {
            return;
        };
        let HandleData::Disconnect { connection, main } = action.data else {
            return;
        };

        match &result {
            Ok(()) => {
                info!(%handle, %connection, "Connection released");
                self.discard_connection(connection);
            }
            Err(err) => warn!(%handle, %connection, error = %err, "Disconnect failed, connection kept"),
        }

        self.controller.on_disconnect_ack(handle, &result);
        self.acknowledged(handle, &result);
        if let Some(main) = main {
            self.main_hop_settled(main, result.is_ok());
        }
    }

    fn on_sink_volume_ack(&mut self, handle: Handle, volume: Volume, result: Result<()>) {
        let Some(action) = self.take(handle) else {
            return;
        };
        let HandleData::SinkVolume {
            sink,
            previous,
            main,
            ..
        } = action.data
        else {
            return;
        };

        let committed = self.committed_sink_volumes.get(&sink).copied().unwrap_or(previous);
        let settled = settled_volume(volume, committed, &result);
        self.committed_sink_volumes.insert(sink, settled);
        match self.registry.change_sink_volume(sink, settled) {
            Ok(()) => self.notify(Notification::SinkVolume {
                sink,
                volume: settled,
            }),
            Err(err) => error!(%handle, %sink, error = %err, "Failed to store sink volume"),
        }

        if result.is_ok() {
            match main {
                Some(MainSinkChange::Volume(main_volume)) => {
                    if self.registry.change_sink_main_volume(sink, main_volume).is_ok() {
                        self.notify(Notification::SinkMainVolume {
                            sink,
                            volume: main_volume,
                        });
                    }
                }
                Some(MainSinkChange::Mute(state)) => {
                    if self.registry.change_sink_mute_state(sink, state).is_ok() {
                        self.notify(Notification::SinkMute { sink, state });
                    }
                }
                None => {}
            }
        }

        debug!(%handle, %sink, volume = settled, ok = result.is_ok(), "Sink volume acknowledged");
        self.controller.on_volume_ack(handle, settled, &result);
        self.acknowledged(handle, &result);
        if main.is_some() && result.is_ok() {
            self.realign_sink(sink);
        }
    }

    fn on_source_volume_ack(&mut self, handle: Handle, volume: Volume, result: Result<()>) {
        let Some(action) = self.take(handle) else {
            return;
        };
        let HandleData::SourceVolume {
            source, previous, ..
        } = action.data
        else {
            return;
        };

        let committed = self.committed_source_volumes.get(&source).copied().unwrap_or(previous);
        let settled = settled_volume(volume, committed, &result);
        self.committed_source_volumes.insert(source, settled);
        match self.registry.change_source_volume(source, settled) {
            Ok(()) => self.notify(Notification::SourceVolume {
                source,
                volume: settled,
            }),
            Err(err) => error!(%handle, %source, error = %err, "Failed to store source volume"),
        }

        self.controller.on_volume_ack(handle, settled, &result);
        self.acknowledged(handle, &result);
    }

    fn on_source_state_ack(&mut self, handle: Handle, result: Result<()>) {
        let Some(action) = self.take(handle) else {
            return;
        };
        let HandleData::SourceState { source, target } = action.data else {
            return;
        };

        if result.is_ok() {
            match self.registry.change_source_state(source, target) {
                Ok(()) => self.notify(Notification::SourceState {
                    source,
                    state: target,
                }),
                Err(err) => error!(%handle, %source, error = %err, "Failed to store source state"),
            }
        }

        self.controller.on_source_state_ack(handle, &result);
        self.acknowledged(handle, &result);
    }

    fn on_sound_property_ack(&mut self, handle: Handle, result: Result<()>) {
        let Some(action) = self.take(handle) else {
            return;
        };

        if result.is_ok() {
            let stored = match action.data {
                HandleData::SinkSoundProperty { sink, property, main } => {
                    let stored = self.registry.change_sink_sound_property(sink, property);
                    if stored.is_ok() {
                        self.notify(Notification::SinkSoundProperty { sink, property });
                    }
                    if main && self.registry.change_sink_main_sound_property(sink, property).is_ok() {
                        self.notify(Notification::SinkMainSoundProperty { sink, property });
                    }
                    stored
                }
                HandleData::SourceSoundProperty {
                    source,
                    property,
                    main,
                } => {
                    let stored = self.registry.change_source_sound_property(source, property);
                    if stored.is_ok() {
                        self.notify(Notification::SourceSoundProperty { source, property });
                    }
                    if main && self.registry.change_source_main_sound_property(source, property).is_ok() {
                        self.notify(Notification::SourceMainSoundProperty { source, property });
                    }
                    stored
                }
                _ => Ok(()),
            };
            if let Err(err) = stored {
                error!(%handle, error = %err, "Failed to store sound property");
            }
        }

        self.controller.on_sound_property_ack(handle, &result);
        self.acknowledged(handle, &result);
    }

    fn on_cross_fade_ack(&mut self, handle: Handle, hot_sink: HotSink, result: Result<()>) {
        let Some(action) = self.take(handle) else {
            return;
        };
        let HandleData::CrossFade { crossfader, .. } = action.data else {
            return;
        };

        if result.is_ok() && self.registry.change_crossfader_hot_sink(crossfader, hot_sink).is_ok() {
            self.notify(Notification::HotSink {
                crossfader,
                hot_sink,
            });
        }

        self.controller.on_cross_fade_ack(handle, &result);
        self.acknowledged(handle, &result);
    }

    fn on_connection_delay(&mut self, connection: ConnectionId, delay: i16) {
        if let Err(err) = self.registry.change_connection_delay(connection, Some(delay)) {
            warn!(%connection, error = %err, "Delay for unknown connection");
            return;
        }

        let affected: Vec<MainConnectionId> = self
            .registry
            .main_connections()
            .into_iter()
            .filter(|main| main.state == ConnectionState::Connected && main.connections.contains(&connection))
            .map(|main| main.id)
            .collect();
        for main in affected {
            self.refresh_main_delay(main);
        }
    }

    /// Book one hop acknowledgment against its main connection
    fn main_hop_settled(&mut self, main: MainConnectionId, ok: bool) {
        let Some(progress) = self.progress.get_mut(&main) else {
            return;
        };
        progress.pending = progress.pending.saturating_sub(1);
        progress.failed |= !ok;
        if progress.pending > 0 {
            return;
        }

        let MainProgress { op, failed, .. } = *progress;
        self.progress.remove(&main);

        match (op, failed) {
            (MainOp::Connect, false) => {
                self.set_main_state(main, ConnectionState::Connected);
                self.refresh_main_delay(main);
            }
            (MainOp::Connect, true) => self.tear_down(main),
            (MainOp::Disconnect, false) => {
                self.set_main_state(main, ConnectionState::Disconnected);
                self.remove_main(main);
            }
            (MainOp::Disconnect, true) => self.set_main_state(main, ConnectionState::Suspended),
            (MainOp::TearDown, failed) => {
                if failed {
                    warn!(main_connection = %main, "Some hops could not be released");
                }
                self.remove_main(main);
            }
        }
    }

    /// Release the committed hops of a main connection whose connect failed
    pub(crate) fn tear_down(&mut self, main: MainConnectionId) {
        self.set_main_state(main, ConnectionState::Disconnected);

        let committed: Vec<ConnectionId> = self
            .registry
            .main_connection(main)
            .map(|record| {
                record
                    .connections
                    .iter()
                    .copied()
                    .filter(|c| self.registry.connection(*c).is_some_and(|c| c.committed))
                    .collect()
            })
            .unwrap_or_default();

        let mut dispatched = 0;
        for connection in committed {
            match self.dispatch_disconnect(connection, Some(main)) {
                Ok(_) => dispatched += 1,
                Err(err) => warn!(main_connection = %main, %connection, error = %err, "Hop release failed"),
            }
        }

        if dispatched == 0 {
            self.remove_main(main);
        } else {
            self.progress.insert(
                main,
                MainProgress {
                    op: MainOp::TearDown,
                    pending: dispatched,
                    failed: false,
                },
            );
        }
    }
}

/// Volume to store once a volume action terminates
///
/// Success and abort keep the value the adapter settled at, any other
/// failure restores the value from before the request.
/// Value a volume action leaves behind
///
/// A failed action falls back to the last committed value, which may have
/// been written by another handle after this one was dispatched.
fn settled_volume(reported: Volume, committed: Volume, result: &Result<()>) -> Volume {
    match result {
        Ok(()) | Err(RoutingError::Aborted) => reported,
        Err(_) => committed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settled_volume() {
        assert_eq!(settled_volume(40, 0, &Ok(())), 40);
        assert_eq!(settled_volume(25, 0, &Err(RoutingError::Aborted)), 25);
        assert_eq!(
            settled_volume(25, 0, &Err(RoutingError::NotPossible("hw".to_string()))),
            0
        );
    }
}
